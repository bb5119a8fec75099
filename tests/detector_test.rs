//! Transport detector integration tests
//!
//! Live probes run against `wiremock` endpoints and the `echo_server`
//! helper binary.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_bridge::config::DetectorConfig;
use mcp_bridge::detector::{Detection, TransportDetector};
use mcp_bridge::transport::{ServerConfig, TransportKind};

fn detector() -> TransportDetector {
    TransportDetector::new(&DetectorConfig {
        probe_timeout_ms: 2_000,
        ..DetectorConfig::default()
    })
}

#[tokio::test]
async fn test_event_stream_endpoint_is_confirmed_sse() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .and(header("Accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(b"data: {}\n\n".to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let result = detector()
        .detect_transport(&ServerConfig::remote(format!("{}/events", server.uri())))
        .await;
    assert_eq!(result.kind, TransportKind::Sse);
    assert_eq!(result.confidence, 1.0);
    assert!(result.details.streaming);
    assert!(!result.details.bidirectional);
    assert_eq!(result.strategy.as_deref(), Some("sse"));
}

#[tokio::test]
async fn test_event_path_without_stream_falls_through_to_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let result = detector()
        .detect_transport(&ServerConfig::remote(format!("{}/events", server.uri())))
        .await;
    assert_eq!(result.kind, TransportKind::Http);
    assert!(result.confidence < 1.0);
    assert!(result.confidence > 0.0);
}

#[tokio::test]
async fn test_protocol_header_confirms_http() {
    let server = MockServer::start().await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(204).insert_header("MCP-Protocol-Version", "2025-06-18"))
        .mount(&server)
        .await;

    let result = detector()
        .detect_transport(&ServerConfig::remote(format!("{}/mcp", server.uri())))
        .await;
    assert_eq!(result.kind, TransportKind::Http);
    assert_eq!(result.confidence, 1.0);
}

#[tokio::test]
async fn test_server_error_ranks_below_plain_success() {
    let failing = MockServer::start().await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&failing)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;

    let detector = detector();
    let low = detector
        .detect_transport(&ServerConfig::remote(format!("{}/mcp", failing.uri())))
        .await;
    let high = detector
        .detect_transport(&ServerConfig::remote(format!("{}/mcp", healthy.uri())))
        .await;
    assert_eq!(low.kind, TransportKind::Http);
    assert_eq!(high.kind, TransportKind::Http);
    assert!(high.confidence > low.confidence);
}

#[tokio::test]
async fn test_unreachable_http_is_unknown() {
    let result = detector()
        .detect_transport(&ServerConfig::remote("http://127.0.0.1:9/mcp"))
        .await;
    assert_eq!(result.kind, TransportKind::Unknown);
    assert_eq!(result.confidence, 0.0);
}

#[tokio::test]
async fn test_version_probe_confirms_stdio() {
    let config = ServerConfig::process(env!("CARGO_BIN_EXE_echo_server"), vec![]);
    let result = detector().detect_transport(&config).await;
    assert_eq!(result.kind, TransportKind::Stdio);
    assert_eq!(result.confidence, 1.0);
    assert!(result.details.bidirectional);
}

#[tokio::test]
async fn test_missing_executable_is_unknown() {
    let config = ServerConfig::process("/nonexistent/echo-server", vec![]);
    let result = detector().detect_transport(&config).await;
    assert_eq!(result.kind, TransportKind::Unknown);
}

#[tokio::test]
async fn test_custom_strategy_runs_before_builtins() {
    let detector = detector();
    detector
        .register_fn("unix-socket", TransportKind::Stdio, Some(1), |config| async move {
            Detection::from(config.url.as_deref().is_some_and(|u| u.starts_with("unix:")))
        })
        .unwrap();

    let result = detector
        .detect_transport(&ServerConfig::remote("unix:/tmp/server.sock"))
        .await;
    assert_eq!(result.kind, TransportKind::Stdio);
    assert_eq!(result.confidence, 0.8);
    assert_eq!(result.strategy.as_deref(), Some("unix-socket"));

    let names = detector.strategy_names();
    assert_eq!(names.first().map(String::as_str), Some("unix-socket"));
    assert!(detector
        .register_fn("unix-socket", TransportKind::Stdio, None, |_| async {
            Detection::NoMatch
        })
        .is_err());
}
