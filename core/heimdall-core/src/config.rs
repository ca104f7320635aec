//! Daemon configuration, loaded from `~/.config/heimdall.toml`.
//!
//! A missing file is not an error; every field has a default so the daemon
//! runs usefully out of the box (notifications are logged locally until a
//! chat webhook is configured).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::CoreError;

pub const CONFIG_FILE_NAME: &str = "heimdall.toml";
pub const CONFIG_DIR_ENV: &str = "HEIMDALL_CONFIG_DIR";
pub const PORT_ENV: &str = "HEIMDALL_PORT";

const DEFAULT_QUIET_SECS: u64 = 42;
const DEFAULT_MIN_REFRESH_SECS: u64 = 4;

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bifrost: BifrostConfig,
    pub chat: ChatConfig,
    pub commands: CommandListsConfig,
    pub notify: NotifyConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BifrostConfig {
    /// Loopback TCP port the daemon listens on.
    pub port: u16,
}

impl Default for BifrostConfig {
    fn default() -> Self {
        Self {
            port: heimdall_daemon_protocol::DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ChatConfig {
    /// Chat webhook URL for notifications. Absent means log-only.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CommandListsConfig {
    /// Command-line prefixes that always trigger a notification.
    pub always_notify: Vec<String>,
    /// Command-line prefixes that never trigger a notification.
    pub never_notify: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    /// Commands quiet for less than this many seconds are not announced.
    pub quiet_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            quiet_secs: DEFAULT_QUIET_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Floor on the per-key refresh cadence; callers cannot tighten a
    /// cache entry's TTL below this.
    pub min_refresh_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_refresh_secs: DEFAULT_MIN_REFRESH_SECS,
        }
    }
}

impl Config {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.notify.quiet_secs)
    }

    pub fn ttl_floor(&self) -> Duration {
        Duration::from_secs(self.cache.min_refresh_secs)
    }

    /// Effective port: `HEIMDALL_PORT` overrides the config file.
    pub fn port(&self) -> u16 {
        env_port().unwrap_or(self.bifrost.port)
    }
}

/// Directory the config file lives in: `$HEIMDALL_CONFIG_DIR`, else
/// `~/.config`.
pub fn config_dir() -> Result<PathBuf, CoreError> {
    if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .ok_or_else(|| CoreError::ConfigRead {
            path: PathBuf::from("~/.config"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "home directory not found"),
        })
}

/// Loads the config from `dir`, or the default location when `None`.
pub fn load(dir: Option<&Path>) -> Result<Config, CoreError> {
    let path = match dir {
        Some(dir) => dir.join(CONFIG_FILE_NAME),
        None => config_dir()?.join(CONFIG_FILE_NAME),
    };
    if !path.exists() {
        tracing::info!(path = %path.display(), "No config file; using defaults");
        return Ok(Config::default());
    }
    let content = fs_err::read_to_string(&path).map_err(|err| CoreError::ConfigRead {
        path: path.clone(),
        source: err.into(),
    })?;
    toml::from_str(&content).map_err(|err| CoreError::ConfigMalformed {
        path,
        details: err.to_string(),
    })
}

fn env_port() -> Option<u16> {
    env::var(PORT_ENV).ok()?.trim().parse().ok()
}

/// Reads an environment variable as a boolean flag, accepting the usual
/// truthy spellings.
pub fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => false,
    }
}
