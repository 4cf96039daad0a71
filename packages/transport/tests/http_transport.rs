// ABOUTME: Integration tests for the HTTP transport against a local mock server
// ABOUTME: Covers retry budget, status propagation, and Connect stream decoding

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use skiff_config::ClientConfig;
use skiff_transport::connect::encode_envelope;
use skiff_transport::{ApiRequest, HttpTransport, RpcChannel, Transport, TransportError};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport(max_retries: u32) -> HttpTransport {
    let config = ClientConfig::with_api_key("test-key")
        .max_retries(max_retries)
        .retry_initial_interval(Duration::from_millis(5))
        .request_timeout(Duration::from_secs(5));
    HttpTransport::new(&config).expect("Failed to build transport")
}

fn end_frame(payload: &[u8]) -> Vec<u8> {
    let mut raw = vec![0x02];
    raw.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    raw.extend_from_slice(payload);
    raw
}

/// Two 503s followed by success resolve within a budget of three retries
#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sandboxes"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sandboxes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport(3)
        .send(ApiRequest::get(format!("{}/sandboxes", server.uri())))
        .await
        .expect("request should succeed after retries");

    assert_eq!(response.status, 200);
    assert_eq!(response.json_value().unwrap(), json!([]));
}

/// The retry budget bounds the number of attempts
#[tokio::test]
async fn test_retry_budget_is_enforced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .expect(3)
        .mount(&server)
        .await;

    let err = transport(2)
        .send(ApiRequest::get(format!("{}/anything", server.uri())))
        .await
        .unwrap_err();

    assert_eq!(err, TransportError::status(502, "bad gateway"));
}

/// Client errors propagate on first occurrence with the remote message intact
#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"code": 400, "message": "template 'nope' not found"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = transport(3)
        .send(ApiRequest::post(format!("{}/sandboxes", server.uri())).json(json!({})))
        .await
        .unwrap_err();

    assert_eq!(err, TransportError::status(400, "template 'nope' not found"));
}

/// Per-request deadlines surface as timeouts
#[tokio::test]
async fn test_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let err = transport(0)
        .send(ApiRequest::get(server.uri()).timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert_eq!(err, TransportError::Timeout);
}

/// Enveloped messages decode in order and the trailer ends the stream
#[tokio::test]
async fn test_connect_stream_decoding() {
    let server = MockServer::start().await;
    let mut body = encode_envelope(br#"{"event":{"start":{"pid":7}}}"#).to_vec();
    body.extend(encode_envelope(br#"{"event":{"end":{"exited":true,"status":"exit status 0"}}}"#));
    body.extend(end_frame(b"{}"));

    Mock::given(method("POST"))
        .and(path("/process.Process/Start"))
        .and(header("connect-protocol-version", "1"))
        .and(header("x-access-token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/connect+json"))
        .mount(&server)
        .await;

    let channel = RpcChannel::new(Arc::new(transport(0)), server.uri())
        .with_header("X-Access-Token", "secret");
    let messages: Vec<_> = channel
        .server_stream("process.Process", "Start", json!({"process": {"cmd": "true"}}))
        .await
        .expect("stream should open")
        .collect()
        .await;

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].as_ref().unwrap()["event"]["start"]["pid"], json!(7));
    assert!(messages[1].as_ref().unwrap()["event"]["end"]["exited"].as_bool().unwrap());
}

/// An error carried in the trailer becomes the stream's final item
#[tokio::test]
async fn test_connect_stream_trailer_error() {
    let server = MockServer::start().await;
    let body = end_frame(br#"{"error":{"code":"not_found","message":"process not found"}}"#);
    Mock::given(method("POST"))
        .and(path("/process.Process/Connect"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/connect+json"))
        .mount(&server)
        .await;

    let channel = RpcChannel::new(Arc::new(transport(0)), server.uri());
    let mut stream = channel
        .server_stream("process.Process", "Connect", json!({"process": {"pid": 1}}))
        .await
        .unwrap();

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(err.is_not_found());
    assert!(stream.next().await.is_none());
}

/// A body that ends without a trailer is reported rather than treated as success
#[tokio::test]
async fn test_connect_stream_truncated() {
    let server = MockServer::start().await;
    let body = encode_envelope(br#"{"event":{"keepalive":{}}}"#);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_vec(), "application/connect+json"))
        .mount(&server)
        .await;

    let channel = RpcChannel::new(Arc::new(transport(0)), server.uri());
    let items: Vec<_> = channel
        .server_stream("filesystem.Filesystem", "WatchDir", json!({"path": "/tmp"}))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(items[1], Err(TransportError::Network(_))));
}

/// Connect unary calls post JSON and return the decoded reply
#[tokio::test]
async fn test_connect_unary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/filesystem.Filesystem/Stat"))
        .and(header("connect-protocol-version", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"entry": {"name": "a.txt"}})))
        .mount(&server)
        .await;

    let channel = RpcChannel::new(Arc::new(transport(0)), server.uri());
    let reply = channel
        .unary("filesystem.Filesystem", "Stat", json!({"path": "/a.txt"}))
        .await
        .unwrap();

    assert_eq!(reply["entry"]["name"], json!("a.txt"));
}
