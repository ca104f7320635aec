use heimdall_daemon_protocol::{Method, Request, Response, PROTOCOL_VERSION};
use serde_json::json;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

fn spawn_daemon(config_dir: &Path, port: u16) -> Child {
    fs_err::write(
        config_dir.join("heimdall.toml"),
        format!("[bifrost]\nport = {}\n\n[notify]\nquiet_secs = 0\n", port),
    )
    .expect("write config");
    Command::new(env!("CARGO_BIN_EXE_heimdall-daemon"))
        .env("HEIMDALL_CONFIG_DIR", config_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn heimdall-daemon")
}

fn wait_for_listener(port: u16, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon on port {}", port);
}

fn send_request(port: u16, request: Request) -> Response {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to daemon");
    serde_json::to_writer(&mut stream, &request).expect("serialize request");
    stream.write_all(b"\n").expect("write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut TcpStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("parse response JSON")
}

fn request(method: Method, id: &str, params: serde_json::Value) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(id.to_string()),
        params: Some(params),
    }
}

#[test]
fn daemon_ipc_smoke() {
    let config_dir = TempDir::new().expect("temp config dir");
    let port = free_port();
    let child = spawn_daemon(config_dir.path(), port);
    let _guard = DaemonGuard { child };

    wait_for_listener(port, Duration::from_secs(5));

    // Health.
    let health = send_request(
        port,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetHealth,
            id: Some("health-check".to_string()),
            params: None,
        },
    );
    assert!(health.ok, "health response was not ok");
    let status = health
        .data
        .as_ref()
        .and_then(|data| data.get("status"))
        .and_then(|value| value.as_str())
        .unwrap_or("missing");
    assert_eq!(status, "ok");

    // Start shows up in the list.
    let start = send_request(
        port,
        request(Method::CommandStart, "start-1", json!({"command": "sleep 600"})),
    );
    assert!(start.ok, "start failed: {:?}", start.error);
    let command_id = start
        .data
        .as_ref()
        .and_then(|data| data.get("id"))
        .and_then(|value| value.as_str())
        .expect("start response carries an id")
        .to_string();

    let list = send_request(port, request(Method::ListCommands, "list-1", json!({})));
    assert!(list.ok);
    let commands = list
        .data
        .as_ref()
        .and_then(|data| data.get("commands"))
        .and_then(|value| value.as_array())
        .expect("commands array");
    assert_eq!(commands.len(), 1);
    assert_eq!(
        commands[0].get("command").and_then(|v| v.as_str()),
        Some("sleep 600")
    );

    // A waiter blocks until end, then the list is empty.
    let waiter = {
        let id = command_id.clone();
        thread::spawn(move || {
            send_request(port, request(Method::WaitForCommand, "wait-1", json!({"id": id})))
        })
    };
    sleep(Duration::from_millis(100));
    assert!(!waiter.is_finished(), "waiter returned before end");

    let end = send_request(
        port,
        request(
            Method::CommandEnd,
            "end-1",
            json!({"id": command_id, "return_code": 0}),
        ),
    );
    assert!(end.ok);

    let wait = waiter.join().expect("waiter panicked");
    assert!(wait.ok);

    let list = send_request(port, request(Method::ListCommands, "list-2", json!({})));
    let commands = list
        .data
        .as_ref()
        .and_then(|data| data.get("commands"))
        .and_then(|value| value.as_array())
        .expect("commands array");
    assert!(commands.is_empty());

    // Waiting on an id that already ended returns promptly.
    let wait = send_request(
        port,
        request(Method::WaitForCommand, "wait-2", json!({"id": command_id})),
    );
    assert!(wait.ok);

    // Cache: two calls within the window run the process once. Nanosecond
    // timestamps differ between runs, so identical stdout proves the hit.
    let cache_params = json!({
        "command": "sh",
        "args": ["-c", "date +%s%N"],
        "within_secs": 60,
        "any": true,
    });
    let first = send_request(
        port,
        request(Method::CacheCommand, "cache-1", cache_params.clone()),
    );
    assert!(first.ok, "cache failed: {:?}", first.error);
    let second = send_request(port, request(Method::CacheCommand, "cache-2", cache_params));
    assert!(second.ok);
    let stdout_of = |response: &Response| {
        response
            .data
            .as_ref()
            .and_then(|data| data.get("stdout"))
            .and_then(|value| value.as_str())
            .expect("stdout field")
            .to_string()
    };
    assert_eq!(stdout_of(&first), stdout_of(&second));

    // A missing binary is a launch failure, not a cached result.
    let launch = send_request(
        port,
        request(
            Method::CacheCommand,
            "cache-3",
            json!({"command": "definitely-not-a-real-binary", "any": true}),
        ),
    );
    assert!(!launch.ok);
    assert_eq!(
        launch.error.as_ref().map(|err| err.code.as_str()),
        Some("launch_failure")
    );

    // Malformed params are rejected synchronously.
    let bad = send_request(
        port,
        request(Method::CacheCommand, "cache-4", json!({"command": ""})),
    );
    assert!(!bad.ok);
}
