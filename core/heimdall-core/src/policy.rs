//! Decides whether a finished command is worth announcing.
//!
//! Pure: given the command's outcome and the configured prefix lists, either
//! produce the notification message or decline. Dispatch is the caller's
//! concern and happens off the RPC path.

use chrono::{DateTime, Local, Utc};
use std::time::Duration;

/// Return code a shell reports for a user interrupt (128 + SIGINT).
pub const INTERRUPT_RETURN_CODE: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct PolicySettings {
    /// Command-line prefixes that always notify (beats `never_notify`).
    pub always_notify: Vec<String>,
    /// Command-line prefixes that never notify.
    pub never_notify: Vec<String>,
    /// Commands quiet for less than this are not announced.
    pub quiet_period: Duration,
}

/// Everything known about a command at the moment it ended.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// When the command's stdin was last accessed, if known.
    pub last_interaction: Option<DateTime<Utc>>,
    pub return_code: i32,
    pub force_notify: bool,
}

/// Applies the policy; `Some(message)` means notify.
///
/// Order matters and short-circuits: interrupt suppression beats force,
/// always/force beats never, and the quiet-period check comes last.
pub fn evaluate(settings: &PolicySettings, outcome: &CommandOutcome) -> Option<String> {
    if outcome.return_code == INTERRUPT_RETURN_CODE {
        return None;
    }

    let matches_prefix =
        |prefixes: &[String]| prefixes.iter().any(|p| outcome.command.starts_with(p.as_str()));

    if !outcome.force_notify && !matches_prefix(&settings.always_notify) {
        if matches_prefix(&settings.never_notify) {
            return None;
        }
        if quiet_measure(outcome) < settings.quiet_period {
            return None;
        }
    }

    Some(compose_message(outcome))
}

/// Time since the user last "touched" the command: its start, or a later
/// stdin access if there was one.
fn quiet_measure(outcome: &CommandOutcome) -> Duration {
    let mut latest = outcome.start_time;
    if let Some(interaction) = outcome.last_interaction {
        if interaction > latest {
            latest = interaction;
        }
    }
    (outcome.end_time - latest).to_std().unwrap_or_default()
}

/// `` ```[3:04PM + 1m30s -> 0] $ cmd``` `` — start time, elapsed, exit code,
/// command line, fenced for chat.
fn compose_message(outcome: &CommandOutcome) -> String {
    let start = outcome.start_time.with_timezone(&Local).format("%-I:%M%p");
    let elapsed = (outcome.end_time - outcome.start_time)
        .to_std()
        .unwrap_or_default();
    format!(
        "```[{} + {} -> {}] $ {}```",
        start,
        format_elapsed(elapsed),
        outcome.return_code,
        outcome.command
    )
}

fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
