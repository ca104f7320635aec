//! heimdall: CLI and shell hook client for the heimdall daemon.
//!
//! The same binary serves two audiences: shell hooks (`start`/`end`, wired
//! up by `source <(heimdall sh)`) and humans (`list`, `wait`, `cache`,
//! `notify`). All state lives in the daemon; this binary is a thin client.

mod daemon_client;
mod logging;

use std::io::Write;

use clap::{Parser, Subcommand};
use serde_json::json;

use daemon_client::Client;
use heimdall_core::config;
use heimdall_daemon_protocol::{
    CacheCommandReply, Method, RunningCommandInfo, DEFAULT_CACHE_WITHIN_SECS,
};

const FORCE_NOTIFY_ENV: &str = "HEIMDALL_FORCE_NOTIFY";

#[derive(Parser)]
#[command(name = "heimdall")]
#[command(about = "Watches over your shell commands")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the shell integration script (source <(heimdall sh))
    Sh,

    /// Record the start of a command (called by the shell hook); prints its id
    Start {
        /// Start time, seconds since the epoch (defaults to the daemon clock)
        #[arg(long)]
        time: Option<i64>,

        /// Client-supplied id, e.g. when re-sending after a crash
        #[arg(long)]
        id: Option<String>,

        /// The command line as entered
        #[arg(value_name = "CMD")]
        command: String,
    },

    /// Record the end of a command; may trigger a notification
    End {
        /// Id printed by `heimdall start`
        #[arg(long)]
        id: String,

        /// Return code of the command
        #[arg(long)]
        code: i32,

        /// Start time fallback, used if the daemon lost the entry
        #[arg(long)]
        start_time: Option<i64>,

        /// The command line as entered
        #[arg(value_name = "CMD")]
        command: Option<String>,
    },

    /// List currently running heimdall-aware commands
    List,

    /// Block until a command finishes
    Wait {
        /// Id of the command (from start or list)
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Pass-through execute a command, serving a cached run when fresh enough
    ///
    /// Doesn't work with compound commands or shell aliases; wrap those in
    /// your shell: heimdall cache zsh -ic 'echo hello && echo world'
    Cache {
        /// Acceptable age of a cached run, in seconds
        #[arg(long, default_value_t = DEFAULT_CACHE_WITHIN_SECS)]
        within: u32,

        /// Accept failed runs too (only successful runs by default)
        #[arg(long)]
        any: bool,

        /// Command and arguments to run
        #[arg(value_name = "CMD", trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Send a message to the configured chat
    Notify {
        #[arg(value_name = "MESSAGE", required = true)]
        message: Vec<String>,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sh => {
            print!("{}", include_str!("heimdall.sh"));
            Ok(())
        }
        Commands::Start { time, id, command } => start(time, id, command),
        Commands::End {
            id,
            code,
            start_time,
            command,
        } => end(id, code, start_time, command),
        Commands::List => list(),
        Commands::Wait { id } => wait(id),
        Commands::Cache {
            within,
            any,
            command,
        } => cache(within, any, command),
        Commands::Notify { message } => notify(message.join(" ")),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "heimdall command failed");
        eprintln!("heimdall: {}", err);
        std::process::exit(1);
    }
}

fn start(time: Option<i64>, id: Option<String>, command: String) -> Result<(), String> {
    let data = Client::from_config().call_with_retry(
        Method::CommandStart,
        json!({
            "command": command,
            "id": id,
            "start_time": time,
        }),
    )?;
    let id = data
        .get("id")
        .and_then(|value| value.as_str())
        .ok_or_else(|| "Daemon response carried no id".to_string())?;
    println!("{}", id);
    Ok(())
}

fn end(
    id: String,
    code: i32,
    start_time: Option<i64>,
    command: Option<String>,
) -> Result<(), String> {
    Client::from_config().call_with_retry(
        Method::CommandEnd,
        json!({
            "id": id.trim(),
            "command": command,
            "start_time": start_time,
            "return_code": code,
            "last_interaction_time": stdin_last_accessed(),
            "force_notify": config::env_flag(FORCE_NOTIFY_ENV),
        }),
    )?;
    Ok(())
}

fn list() -> Result<(), String> {
    let data = Client::from_config().call(Method::ListCommands, json!({}))?;
    let mut commands: Vec<RunningCommandInfo> = data
        .get("commands")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|err| format!("Malformed list response: {}", err))?
        .unwrap_or_default();
    commands.sort_by_key(|command| command.start_time);
    for command in commands {
        println!(
            "[{}: {}] $ {}",
            kitchen_time(command.start_time),
            command.id,
            command.command
        );
    }
    Ok(())
}

fn wait(id: String) -> Result<(), String> {
    Client::from_config().call_blocking(
        Method::WaitForCommand,
        json!({ "id": id.trim() }),
    )?;
    Ok(())
}

fn cache(within: u32, any: bool, command: Vec<String>) -> Result<(), String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| "please pass a command to be run, see --help".to_string())?;
    let data = Client::from_config().call_blocking(
        Method::CacheCommand,
        json!({
            "command": program,
            "args": args,
            "within_secs": within,
            "any": any,
        }),
    )?;
    let reply: CacheCommandReply =
        serde_json::from_value(data).map_err(|err| format!("Malformed cache response: {}", err))?;

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let _ = stdout.write_all(reply.stdout.as_bytes());
    let _ = stderr.write_all(reply.stderr.as_bytes());
    let _ = stdout.flush();
    let _ = stderr.flush();
    std::process::exit(reply.return_code);
}

fn notify(message: String) -> Result<(), String> {
    Client::from_config().call(Method::Notify, json!({ "message": message }))?;
    Ok(())
}

/// When stdin was last read — a proxy for the user having interacted with
/// the command. The daemon compares it against the command's start time.
fn stdin_last_accessed() -> Option<i64> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(libc::STDIN_FILENO, stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    Some(stat.st_atime)
}

/// Kitchen-clock rendering of an epoch timestamp, e.g. `3:04PM`.
fn kitchen_time(epoch_secs: i64) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_opt(epoch_secs, 0).single() {
        Some(time) => time.format("%-I:%M%p").to_string(),
        None => "?".to_string(),
    }
}
