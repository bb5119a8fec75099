//! HTTP adapter integration tests
//!
//! Runs `HttpAdapter` against a `wiremock` mock server.
//!
//! # wiremock body helpers
//!
//! Use `set_body_raw(bytes, mime)` for SSE responses so that the
//! `Content-Type` is exactly `text/event-stream`. `set_body_json` forces
//! `application/json`.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_bridge::error::BridgeError;
use mcp_bridge::protocol::{MessageId, ProtocolMessage};
use mcp_bridge::transport::http::{HttpAdapter, SESSION_HEADER};
use mcp_bridge::transport::{
    AdapterSettings, ConnectionStatus, ServerConfig, TransportAdapter,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn adapter() -> HttpAdapter {
    let adapter = HttpAdapter::new(AdapterSettings {
        request_timeout: Duration::from_secs(5),
        http_timeout: Duration::from_secs(5),
        ..AdapterSettings::default()
    });
    adapter.initialize().await.expect("initialize");
    adapter
}

async fn connect(adapter: &HttpAdapter, server: &MockServer) -> String {
    adapter
        .create_connection(ServerConfig::remote(format!("{}/mcp", server.uri())))
        .await
        .expect("create_connection")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A JSON body carrying the matching response resolves the request.
#[tokio::test]
async fn test_json_response_resolves_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({ "method": "tools/list" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "tools": [] }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter().await;
    let id = connect(&adapter, &server).await;

    let reply = adapter
        .send_message(&id, ProtocolMessage::request(1, "tools/list", Some(json!({}))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.result, Some(json!({ "tools": [] })));

    let status = adapter.get_status(&id).await;
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.metrics.requests_completed, 1);
}

/// `202 Accepted` acknowledges a notification.
#[tokio::test]
async fn test_accepted_notification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let adapter = adapter().await;
    let id = connect(&adapter, &server).await;

    let outcome = adapter
        .send_message(&id, ProtocolMessage::notification("notifications/initialized", None))
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(adapter.get_status(&id).await.metrics.messages_sent, 1);
}

/// A request answered with `202` and no body can never be resolved, so it
/// fails immediately rather than waiting for the deadline.
#[tokio::test]
async fn test_request_without_response_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let adapter = adapter().await;
    let id = connect(&adapter, &server).await;

    let started = std::time::Instant::now();
    let result = adapter
        .send_message(&id, ProtocolMessage::request(1, "ping", None))
        .await;
    assert!(matches!(result, Err(BridgeError::Transport(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(adapter.get_status(&id).await.metrics.pending_requests, 0);
}

/// Non-2xx statuses surface as transport errors.
#[tokio::test]
async fn test_server_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let adapter = adapter().await;
    let id = connect(&adapter, &server).await;

    match adapter
        .send_message(&id, ProtocolMessage::request(1, "ping", None))
        .await
    {
        Err(BridgeError::Transport(msg)) => assert!(msg.contains("500")),
        other => panic!("expected transport error, got {:?}", other),
    }
    assert_eq!(adapter.get_status(&id).await.metrics.errors, 1);
}

/// The session header is captured, echoed, and terminated on close.
#[tokio::test]
async fn test_session_header_round_trip() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header(SESSION_HEADER, "session-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 2, "result": "with-session"
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(SESSION_HEADER, "session-abc")
                .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": "first" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(header(SESSION_HEADER, "session-abc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter().await;
    let id = connect(&adapter, &server).await;

    let first = adapter
        .send_message(&id, ProtocolMessage::request(1, "initialize", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.result, Some(json!("first")));
    assert_eq!(adapter.session_id(&id).await.as_deref(), Some("session-abc"));

    let second = adapter
        .send_message(&id, ProtocolMessage::request(2, "tools/list", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.result, Some(json!("with-session")));

    adapter.close_connection(&id).await.unwrap();
    adapter.close_connection(&id).await.unwrap();
}

/// An SSE response body delivers the matching response as an event.
#[tokio::test]
async fn test_sse_body_resolves_request() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "event: message\n",
        "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n",
        "\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"streamed\":true}}\n",
        "\n",
    );
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let adapter = adapter().await;
    let id = connect(&adapter, &server).await;

    let reply = adapter
        .send_message(&id, ProtocolMessage::request(7, "tools/call", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.id, Some(MessageId::from(7)));
    assert_eq!(reply.result, Some(json!({ "streamed": true })));
}

/// A batch array body is split and correlated per element.
#[tokio::test]
async fn test_batch_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "jsonrpc": "2.0", "method": "notifications/message" },
            { "jsonrpc": "2.0", "id": "b", "result": 1 }
        ])))
        .mount(&server)
        .await;

    let adapter = adapter().await;
    let id = connect(&adapter, &server).await;

    let reply = adapter
        .send_message(&id, ProtocolMessage::request("b", "ping", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.result, Some(json!(1)));
}

/// Caller-supplied headers are sent with every POST.
#[tokio::test]
async fn test_custom_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer token-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": "authorized"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter().await;
    let mut config = ServerConfig::remote(server.uri());
    config
        .headers
        .insert("Authorization".to_string(), "Bearer token-123".to_string());
    let id = adapter.create_connection(config).await.unwrap();

    let reply = adapter
        .send_message(&id, ProtocolMessage::request(1, "ping", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.result, Some(json!("authorized")));
}

/// Sends after close fail with `ConnectionNotFound`; status stays readable.
#[tokio::test]
async fn test_send_after_close() {
    let server = MockServer::start().await;
    let adapter = adapter().await;
    let id = connect(&adapter, &server).await;

    adapter.close_connection(&id).await.unwrap();
    assert_eq!(
        adapter.get_status(&id).await.status,
        ConnectionStatus::Disconnected
    );
    let result = adapter
        .send_message(&id, ProtocolMessage::request(1, "ping", None))
        .await;
    assert!(matches!(result, Err(BridgeError::ConnectionNotFound(_))));
}
