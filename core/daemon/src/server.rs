//! Loopback TCP server: newline-framed JSON requests, one per connection.
//!
//! Each accepted connection gets its own thread; blocking operations
//! (`wait_for_command`, a cache request riding a refresh) suspend only that
//! thread. Client disconnects are observed as cancellation via a zero-byte
//! peek between wait slices.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use heimdall_core::registry::RunningCommand;
use heimdall_daemon_protocol::{
    parse_cache_command, parse_command_end, parse_command_start, parse_notify,
    parse_wait_for_command, CacheCommandReply, ErrorInfo, Method, Request, Response,
    RunningCommandInfo, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;
use tracing::warn;

use crate::service::Bifrost;
use heimdall_core::cache::CacheError;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

pub fn serve(listener: TcpListener, service: Arc<Bifrost>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let service = Arc::clone(&service);
                thread::spawn(move || handle_connection(stream, service));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept connection");
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, service: Arc<Bifrost>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Request received");
    let response = handle_request(request, &service, &stream);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut TcpStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, service: &Bifrost, stream: &TcpStream) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let Request {
        id: request_id,
        method,
        params,
        ..
    } = request;

    match method {
        Method::GetHealth => Response::ok(
            request_id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            }),
        ),
        Method::CommandStart => {
            let params = match require_params(params, request_id.clone(), parse_command_start) {
                Ok(params) => params,
                Err(response) => return *response,
            };
            let id = service.command_start(&params);
            Response::ok(request_id, serde_json::json!({ "id": id }))
        }
        Method::CommandEnd => {
            let params = match require_params(params, request_id.clone(), parse_command_end) {
                Ok(params) => params,
                Err(response) => return *response,
            };
            service.command_end(&params);
            Response::ok(request_id, serde_json::json!({}))
        }
        Method::ListCommands => {
            let commands: Vec<RunningCommandInfo> = service
                .list_commands()
                .into_iter()
                .map(running_command_info)
                .collect();
            match serde_json::to_value(&commands) {
                Ok(value) => Response::ok(request_id, serde_json::json!({ "commands": value })),
                Err(err) => Response::error(
                    request_id,
                    "serialization_error",
                    format!("Failed to serialize commands: {}", err),
                ),
            }
        }
        Method::WaitForCommand => {
            let params = match require_params(params, request_id.clone(), parse_wait_for_command) {
                Ok(params) => params,
                Err(response) => return *response,
            };
            let deadline = params
                .timeout_secs
                .map(|secs| Instant::now() + Duration::from_secs(secs));
            let mut cancelled =
                || connection_closed(stream) || deadline.is_some_and(|d| Instant::now() >= d);
            // Cancellation is an early return, not an error.
            service.wait_for_command(&params.id, &mut cancelled);
            Response::ok(request_id, serde_json::json!({}))
        }
        Method::CacheCommand => {
            let params = match require_params(params, request_id.clone(), parse_cache_command) {
                Ok(params) => params,
                Err(response) => return *response,
            };
            let mut cancelled = || connection_closed(stream);
            match service.cache_command(&params, &mut cancelled) {
                Ok(record) => {
                    let reply = CacheCommandReply {
                        stdout: record.stdout,
                        stderr: record.stderr,
                        return_code: record.return_code,
                    };
                    match serde_json::to_value(&reply) {
                        Ok(value) => Response::ok(request_id, value),
                        Err(err) => Response::error(
                            request_id,
                            "serialization_error",
                            format!("Failed to serialize result: {}", err),
                        ),
                    }
                }
                Err(err @ CacheError::Launch { .. }) => {
                    Response::error(request_id, "launch_failure", err.to_string())
                }
                Err(CacheError::Cancelled) => {
                    Response::error(request_id, "cancelled", "caller abandoned the wait")
                }
            }
        }
        Method::Notify => {
            let params = match require_params(params, request_id.clone(), parse_notify) {
                Ok(params) => params,
                Err(response) => return *response,
            };
            service.notify(params.message);
            Response::ok(request_id, serde_json::json!({}))
        }
    }
}

fn require_params<T>(
    params: Option<Value>,
    request_id: Option<String>,
    parse: fn(Value) -> Result<T, ErrorInfo>,
) -> Result<T, Box<Response>> {
    let params = params
        .ok_or_else(|| Box::new(Response::error(request_id.clone(), "invalid_params", "params are required")))?;
    parse(params).map_err(|err| Box::new(Response::error_with_info(request_id, err)))
}

fn running_command_info(command: RunningCommand) -> RunningCommandInfo {
    RunningCommandInfo {
        id: command.id,
        command: command.command,
        start_time: command.start_time.timestamp(),
    }
}

/// True once the peer has closed its end. A half-open probe: the client
/// sends nothing after its single request, so a readable zero means EOF.
fn connection_closed(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut probe = [0u8; 1];
    let closed = match stream.peek(&mut probe) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    let _ = stream.set_nonblocking(false);
    closed
}

fn write_response(stream: &mut TcpStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
