//! Integration tests for the `strata serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port with
//! its own configuration file, makes HTTP requests, and verifies the
//! responses.

use std::io::Read;
use std::net::TcpStream;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tempfile::TempDir;

/// Base port is derived from the process id so separate test binaries do
/// not collide on the same range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

const ADMIN_TOKEN: &str = "admin-secret";
const DISCOVERY_TOKEN: &str = "discover-secret";

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

struct Server {
    child: Child,
    port: u16,
    _dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

/// Start `strata serve` with an admin token and a discovery token.
fn start_server() -> Server {
    let port = next_port();
    let dir = TempDir::new().expect("temp dir");
    let config = dir.path().join("strata.toml");
    std::fs::write(
        &config,
        format!(
            r#"
log_level = "warn"

[api]
port = {port}
server_discovery_token = "{DISCOVERY_TOKEN}"

[auth]
tokens = [{{ token = "{ADMIN_TOKEN}", user_id = "root" }}]

[[roles]]
id = "wheel"
name = "wheel"
all_permissions = true

[[users]]
id = "root"
login = "root"
role_id = "wheel"
"#
        ),
    )
    .expect("write config");

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_strata"));
    cmd.arg("serve").arg("--config").arg(&config);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = cmd.spawn().expect("failed to start strata serve");
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server {
        child,
        port,
        _dir: dir,
    }
}

fn request(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut headers = String::new();
    if let Some(token) = token {
        headers.push_str(&format!("Authorization: {}\r\n", token));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() {
        headers.push_str("Content-Type: application/json\r\n");
    }
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        headers,
        body.len(),
        body
    );
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    parse_http_response(&response)
}

/// Parse an HTTP response into (status_code, JSON body).
fn parse_http_response(response: &str) -> (u16, serde_json::Value) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"");
    let body = parts.get(1).unwrap_or(&"");

    let status = headers
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let json = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[test]
fn info_is_public() {
    let server = start_server();
    let (status, body) = request(server.port, "GET", "/v1/info/", None, None);
    assert_eq!(status, 200);
    assert_eq!(body["name"], "strata");
    assert_eq!(body["server_discovery"], true);
    assert!(body["time"].is_string());
}

#[test]
fn listing_requires_a_token() {
    let server = start_server();
    let (status, body) = request(server.port, "GET", "/v1/cluster/", None, None);
    assert_eq!(status, 401);
    assert_eq!(body["error"], "AuthenticationRequired");

    let (status, body) = request(
        server.port,
        "GET",
        "/v1/cluster/",
        Some(&format!("Bearer {ADMIN_TOKEN}")),
        None,
    );
    assert_eq!(status, 200);
    assert_eq!(body["total"], 0);
}

#[test]
fn discovery_is_dispatched_to_the_runner() {
    let server = start_server();
    let (status, execution) = request(
        server.port,
        "POST",
        "/v1/server/",
        Some(DISCOVERY_TOKEN),
        Some(r#"{"id": "s1", "host": "10.0.0.5", "username": "ansible"}"#),
    );
    assert_eq!(status, 200, "{execution}");
    let id = execution["id"].as_str().expect("execution id").to_string();

    // The background dispatcher hands the execution to the runner.
    let mut state = String::new();
    for _ in 0..50 {
        let (_, current) = request(
            server.port,
            "GET",
            &format!("/v1/execution/{id}/"),
            Some(ADMIN_TOKEN),
            None,
        );
        state = current["data"]["state"].as_str().unwrap_or("").to_string();
        if state == "running" {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(state, "running");

    let (status, claimed) = request(
        server.port,
        "POST",
        "/v1/runner/claim/",
        Some(ADMIN_TOKEN),
        None,
    );
    assert_eq!(status, 200);
    assert_eq!(claimed["job"]["execution_id"], id.as_str());
    assert_eq!(claimed["job"]["host"], "10.0.0.5");
}

#[test]
fn unknown_route_returns_json_404() {
    let server = start_server();
    let (status, body) = request(server.port, "GET", "/v2/nothing", Some(ADMIN_TOKEN), None);
    assert_eq!(status, 404);
    assert_eq!(body["code"], 404);
}
