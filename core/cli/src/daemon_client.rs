//! Client helper for talking to the heimdall daemon over loopback TCP.
//!
//! One newline-framed JSON request per connection. Hooks retry once with a
//! short delay; failures are surfaced to the caller, never to the user's
//! terminal.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use heimdall_core::config;
use heimdall_daemon_protocol::{
    Method, Request, Response, DEFAULT_PORT, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;

const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

pub struct Client {
    port: u16,
}

impl Client {
    /// Resolves the daemon's port from `HEIMDALL_PORT` / the config file.
    pub fn from_config() -> Self {
        let port = match config::load(None) {
            Ok(config) => config.port(),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load config; using default port");
                DEFAULT_PORT
            }
        };
        Self { port }
    }

    /// Sends a request and returns the response's `data` payload.
    pub fn call(&self, method: Method, params: Value) -> Result<Value, String> {
        self.send(method, params, Some(Duration::from_millis(READ_TIMEOUT_MS)))
    }

    /// Like [`Client::call`] but with no read timeout, for operations that
    /// block server-side (`wait_for_command`, a cache miss).
    pub fn call_blocking(&self, method: Method, params: Value) -> Result<Value, String> {
        self.send(method, params, None)
    }

    /// One retry with a short delay, for hook paths racing daemon startup.
    pub fn call_with_retry(&self, method: Method, params: Value) -> Result<Value, String> {
        match self.call(method, params.clone()) {
            Ok(data) => Ok(data),
            Err(err) => {
                tracing::warn!(error = %err, "Daemon request failed; retrying once");
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                self.call(method, params)
            }
        }
    }

    fn send(
        &self,
        method: Method,
        params: Value,
        read_timeout: Option<Duration>,
    ) -> Result<Value, String> {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params: Some(params),
        };

        let mut stream = TcpStream::connect(("127.0.0.1", self.port))
            .map_err(|err| format!("Failed to connect to daemon: {}", err))?;
        let _ = stream.set_read_timeout(read_timeout);
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

        serde_json::to_writer(&mut stream, &request)
            .map_err(|err| format!("Failed to write request: {}", err))?;
        stream
            .write_all(b"\n")
            .map_err(|err| format!("Failed to flush request: {}", err))?;
        stream.flush().ok();

        let response = read_response(&mut stream)?;
        if response.ok {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            let message = response
                .error
                .map(|err| format!("{}: {}", err.code, err.message))
                .unwrap_or_else(|| "Unknown daemon error".to_string());
            Err(message)
        }
    }
}

fn read_response(stream: &mut TcpStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) => {
                return Err(format!("Failed to read response: {}", err));
            }
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Empty response from daemon".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Response was not valid JSON: {}", err))
}
