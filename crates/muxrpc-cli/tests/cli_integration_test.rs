//! CLI Integration Tests
//!
//! Runs the `muxrpc` binary as a child process.
//!
//! Test Scenarios:
//! 1. Argument validation and help output
//! 2. `call` against an in-process server: stdout, exit codes, metadata
//! 3. `serve` starting up and answering calls
//!
//! Addresses always use `127.0.0.1` to avoid DNS resolution.

use std::process::{Command, Output, Stdio};
use std::time::Duration;

use bytes::Bytes;
use muxrpc_client::{CallOptions, Client, ClientConfig};
use muxrpc_server::Server;
use tokio::net::TcpListener;

// ============================================================================
// Test Helpers
// ============================================================================

fn muxrpc() -> Command {
    Command::new(env!("CARGO_BIN_EXE_muxrpc"))
}

/// Runs the binary off the async runtime so in-process servers keep serving.
async fn run(args: Vec<String>) -> Output {
    tokio::task::spawn_blocking(move || muxrpc().args(args).output().unwrap())
        .await
        .unwrap()
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Serves the demo methods plus `whoami`, which answers with the caller's
/// `tenant` metadata.
async fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Server::builder()
        .unary("echo", |req| async move { Ok(req.payload) })
        .unary("whoami", |req| async move {
            Ok(Bytes::from(req.metadata.get("tenant").unwrap_or("none").to_string()))
        })
        .build();
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

/// A port that was free a moment ago.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Argument Validation
// ============================================================================

#[test]
fn test_help_flag() {
    let output = muxrpc().arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("call"));
}

#[test]
fn test_call_requires_method() {
    let output = muxrpc().args(["call", "127.0.0.1:7000"]).output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_call_rejects_malformed_metadata() {
    let output = muxrpc()
        .args(["call", "127.0.0.1:7000", "echo", "--metadata", "no-equals"])
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("key=value"), "stderr: {stderr}");
}

#[test]
fn test_call_rejects_zero_attempts() {
    let output = muxrpc()
        .args(["call", "127.0.0.1:7000", "echo", "--max-attempts", "0"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

// ============================================================================
// Calls
// ============================================================================

#[tokio::test]
async fn test_call_prints_response() {
    let addr = start_server().await;
    let output = run(strings(&["call", &addr, "echo", "--data", "hello world"])).await;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello world\n");
    // No logging without --verbose.
    assert!(output.stderr.is_empty());
}

#[tokio::test]
async fn test_call_sends_metadata() {
    let addr = start_server().await;
    let output = run(strings(&["call", &addr, "whoami", "-m", "tenant=acme"])).await;

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "acme\n");
}

#[tokio::test]
async fn test_call_unknown_method_fails() {
    let addr = start_server().await;
    let output = run(strings(&["call", &addr, "missing"])).await;
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(stderr.contains("INVALID_ARGUMENT"), "stderr: {stderr}");
}

#[tokio::test]
async fn test_call_unreachable_endpoint_fails() {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let output = run(strings(&["call", &addr, "echo", "--max-attempts", "1", "--timeout-ms", "1000"])).await;
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("UNAVAILABLE"), "stderr: {stderr}");
}

// ============================================================================
// Serve
// ============================================================================

#[tokio::test]
async fn test_serve_answers_calls() {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let mut child = muxrpc()
        .args(["serve", "--bind", &addr])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // A fresh client per attempt, so refused dials during startup never
    // trip a breaker.
    let mut response = None;
    for _ in 0..50 {
        let client = Client::new(ClientConfig::default());
        let result = client
            .invoke(&addr, "upper", Bytes::from_static(b"muxrpc"), CallOptions::new())
            .await;
        client.shutdown();
        match result {
            Ok(bytes) => {
                response = Some(bytes);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    let _ = child.kill();
    let _ = child.wait();

    assert_eq!(response, Some(Bytes::from_static(b"MUXRPC")));
}

#[test]
fn test_serve_rejects_bad_bind_address() {
    let output = muxrpc().args(["serve", "--bind", "not-an-address"]).output().unwrap();
    assert!(!output.status.success());
}
