// ABOUTME: Shared fixtures for the sandbox integration tests
// ABOUTME: Mock control plane and agent on one local server, plus Connect stream builders

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use skiff::{Client, ClientConfig, Sandbox};
use skiff_transport::connect::encode_envelope;
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const API_KEY: &str = "test-key";
pub const SANDBOX_ID: &str = "sbx-test";

static TRACING: Once = Once::new();

/// Route client logs to the test harness; `RUST_LOG` overrides the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Client whose control plane and sandbox endpoints both point at `server`
pub fn client(server: &MockServer) -> Client {
    init_tracing();
    let config = ClientConfig::with_api_key(API_KEY)
        .base_url(server.uri())
        .sandbox_url(server.uri())
        .max_retries(1)
        .retry_initial_interval(Duration::from_millis(5))
        .request_timeout(Duration::from_secs(5));
    Client::with_config(config).expect("Failed to build client")
}

pub fn sandbox_record(template_id: &str) -> Value {
    json!({
        "sandboxID": SANDBOX_ID,
        "templateID": template_id,
        "clientID": "client-1",
        "envdAccessToken": "envd-token",
        "startedAt": "2026-01-05T10:00:00Z",
        "endAt": "2026-01-05T10:05:00Z",
        "cpuCount": 2,
        "memoryMB": 512,
        "state": "running"
    })
}

/// Create a sandbox from `template_id` against the mock control plane
pub async fn create_sandbox(server: &MockServer, template_id: &str) -> Sandbox {
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .and(header("X-API-Key", API_KEY))
        .respond_with(ResponseTemplate::new(201).set_body_json(sandbox_record(template_id)))
        .mount(server)
        .await;

    client(server)
        .sandboxes()
        .template(template_id)
        .create()
        .await
        .expect("Failed to create sandbox")
}

/// Enveloped Connect stream body: every message, then an empty trailer
pub fn connect_stream(messages: &[Value]) -> Vec<u8> {
    let mut body = Vec::new();
    for message in messages {
        let payload = serde_json::to_vec(message).expect("Failed to encode message");
        body.extend_from_slice(&encode_envelope(&payload));
    }
    body.push(0x02);
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(b"{}");
    body
}

pub fn stream_response(messages: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(connect_stream(messages), "application/connect+json")
}

pub fn start_event(pid: u32) -> Value {
    json!({"event": {"start": {"pid": pid}}})
}

pub fn stdout_event(text: &str) -> Value {
    json!({"event": {"data": {"stdout": general_purpose::STANDARD.encode(text)}}})
}

pub fn stderr_event(text: &str) -> Value {
    json!({"event": {"data": {"stderr": general_purpose::STANDARD.encode(text)}}})
}

pub fn end_event(exit_code: i32) -> Value {
    json!({"event": {"end": {
        "exitCode": exit_code,
        "exited": true,
        "status": format!("exit status {}", exit_code)
    }}})
}

/// Connect error body the agent sends for a missing path or process
pub fn not_found_body(message: &str) -> Value {
    json!({"code": "not_found", "message": message})
}
