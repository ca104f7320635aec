//! File-backed logging for the CLI.
//!
//! The binary runs from shell hooks, so nothing may reach the user's
//! terminal; logs go to `~/.local/state/heimdall/cli.log` instead. Logging
//! being unavailable is never a reason to fail the command.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn init() -> Option<WorkerGuard> {
    let dir = dirs::home_dir()?
        .join(".local")
        .join("state")
        .join("heimdall");
    fs_err::create_dir_all(&dir).ok()?;
    let appender = tracing_appender::rolling::never(dir, "cli.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
