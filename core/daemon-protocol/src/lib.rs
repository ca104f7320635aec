//! Wire types and validation for the heimdall daemon.
//!
//! This crate is shared by the daemon and the `heimdall` CLI to prevent
//! schema drift. The daemon remains the authority on validation, but clients
//! reuse the same types to construct valid requests.
//!
//! Framing is one JSON request per connection, newline-terminated, answered
//! by one JSON response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

/// Default TCP port the daemon listens on (loopback only).
pub const DEFAULT_PORT: u16 = 54351;

/// Default freshness window for `cache_command`, in seconds.
pub const DEFAULT_CACHE_WITHIN_SECS: u32 = 420;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    CommandStart,
    CommandEnd,
    ListCommands,
    WaitForCommand,
    CacheCommand,
    Notify,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// A currently running command as reported by `list_commands`.
///
/// `start_time` is seconds since the Unix epoch; display formatting is the
/// client's concern, as is ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunningCommandInfo {
    pub id: String,
    pub command: String,
    pub start_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandStartParams {
    /// Literal command line as entered by the user.
    pub command: String,
    /// Client-supplied idempotency key; the daemon mints one when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Seconds since the Unix epoch; daemon clock when absent.
    #[serde(default)]
    pub start_time: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEndParams {
    /// Id returned by `command_start`.
    pub id: String,
    /// Command line, used for the notification decision when the daemon no
    /// longer has the entry (e.g. it restarted mid-command).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub start_time: Option<i64>,
    pub return_code: i32,
    /// When the command's stdin was last accessed, seconds since the epoch.
    #[serde(default)]
    pub last_interaction_time: Option<i64>,
    #[serde(default)]
    pub force_notify: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitForCommandParams {
    pub id: String,
    /// Optional server-side wait cap; the daemon also observes client
    /// disconnect as cancellation.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheCommandParams {
    /// Program to execute (not a shell string; args are separate).
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Freshness window in seconds.
    #[serde(default = "default_within_secs")]
    pub within_secs: u32,
    /// Accept any cached run, including ones that exited non-zero.
    #[serde(default)]
    pub any: bool,
}

fn default_within_secs() -> u32 {
    DEFAULT_CACHE_WITHIN_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheCommandReply {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyParams {
    pub message: String,
}

const MAX_ID_LEN: usize = 128;

impl CommandStartParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_non_blank(&self.command, "command")?;
        if let Some(id) = &self.id {
            validate_id(id)?;
        }
        Ok(())
    }
}

impl CommandEndParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_id(&self.id)
    }
}

impl WaitForCommandParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_id(&self.id)
    }
}

impl CacheCommandParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_non_blank(&self.command, "command")
    }
}

impl NotifyParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_non_blank(&self.message, "message")
    }
}

pub fn parse_command_start(params: Value) -> Result<CommandStartParams, ErrorInfo> {
    let parsed: CommandStartParams = deserialize_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_command_end(params: Value) -> Result<CommandEndParams, ErrorInfo> {
    let parsed: CommandEndParams = deserialize_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_wait_for_command(params: Value) -> Result<WaitForCommandParams, ErrorInfo> {
    let parsed: WaitForCommandParams = deserialize_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_cache_command(params: Value) -> Result<CacheCommandParams, ErrorInfo> {
    let parsed: CacheCommandParams = deserialize_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_notify(params: Value) -> Result<NotifyParams, ErrorInfo> {
    let parsed: NotifyParams = deserialize_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

fn deserialize_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ErrorInfo> {
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("params are invalid: {}", err)))
}

fn require_non_blank(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "invalid_params",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn validate_id(id: &str) -> Result<(), ErrorInfo> {
    if id.trim().is_empty() {
        return Err(ErrorInfo::new("invalid_id", "id is required"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_id",
            format!("id must be {} characters or fewer", MAX_ID_LEN),
        ));
    }
    Ok(())
}
