//! Error types for heimdall-core operations.

use std::path::PathBuf;

/// All errors that can occur in heimdall-core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration read failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The executor could not start the process at all (missing binary,
    /// permissions). Distinct from a non-zero exit, which is a normal result.
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Notification delivery failed: {0}")]
    Notify(String),
}
