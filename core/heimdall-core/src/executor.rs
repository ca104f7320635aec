//! Process execution seam.
//!
//! The cache talks to a [`CommandExecutor`] rather than the OS directly so
//! tests can count and script executions. A launch failure (the process
//! could not be started at all) is an error; a non-zero exit is a normal
//! [`ExecutionRecord`].

use std::process::Command;
use std::time::Instant;

use crate::error::CoreError;

/// One finished execution of an external command.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub completed_at: Instant,
}

pub trait CommandExecutor: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<ExecutionRecord, CoreError>;
}

/// Executor backed by `std::process::Command`, capturing both streams.
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn run(&self, program: &str, args: &[String]) -> Result<ExecutionRecord, CoreError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CoreError::Launch {
                program: program.to_string(),
                source: err,
            })?;
        Ok(ExecutionRecord {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // None means the process was killed by a signal; -1 mirrors what
            // shells report in that case.
            return_code: output.status.code().unwrap_or(-1),
            completed_at: Instant::now(),
        })
    }
}
