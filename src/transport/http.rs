//! HTTP adapter: one POST exchange per message
//!
//! A "connection" here is a logical grouping of target URL, extra headers
//! and session state; no socket is kept open between messages. Every
//! outbound message is POSTed to the endpoint and the server may reply
//! with:
//!
//! - `application/json` -- one response (or a batch array) in the body
//! - `text/event-stream` -- responses delivered as SSE `data:` events
//! - `202 Accepted` -- acknowledgement with no body (notifications)
//!
//! # Session management
//!
//! If a response carries an `Mcp-Session-Id` header, the value is stored
//! and echoed on every later POST. Closing the connection sends a
//! best-effort `DELETE` with that header. A `404` while a session is
//! active clears the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{BridgeError, Result};
use crate::protocol::types::{MessageId, MessageKind};
use crate::protocol::ProtocolMessage;
use crate::transport::connection::{ConnectionCore, ConnectionTable, HasCore, InitGate};
use crate::transport::sse::pump_events;
use crate::transport::{
    AdapterSettings, ConnectionId, ServerConfig, StatusReport, TransportAdapter, TransportKind,
};

/// Session header echoed on every request once the server assigns one.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Add caller-supplied headers (auth tokens and the like) to `req`.
pub(crate) fn apply_headers(
    mut req: reqwest::RequestBuilder,
    headers: &HashMap<String, String>,
) -> reqwest::RequestBuilder {
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }
    req
}

/// A client with a per-request timeout.
pub(crate) fn build_client(timeout: Duration, target: &Url) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BridgeError::establish(target.as_str(), e))
}

/// The config's URL, required to be `http` or `https`.
pub(crate) fn parse_http_url(config: &ServerConfig) -> Result<Url> {
    let raw = config.effective_url().ok_or_else(|| {
        BridgeError::InvalidConfig("network transport requires `url` or `port`".to_string())
    })?;
    let url = Url::parse(&raw)
        .map_err(|e| BridgeError::InvalidConfig(format!("invalid url `{}`: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(BridgeError::InvalidConfig(format!(
            "expected an http(s) url, got scheme `{}`",
            other
        ))),
    }
}

/// Parse a JSON response body (a single message or a batch array) and feed
/// every message into `core`. Bodies that are empty or not JSON are
/// ignored.
pub(crate) async fn deliver_json_body(core: &ConnectionCore, response: reqwest::Response) -> Result<()> {
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);
    let body = response
        .bytes()
        .await
        .map_err(|e| BridgeError::Transport(format!("failed to read response body: {}", e)))?;
    core.record_bytes_received(body.len());
    if !is_json || body.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(connection_id = %core.id(), error = %e, "discarding malformed response body");
            return Ok(());
        }
    };
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    for item in items {
        match ProtocolMessage::from_value(item) {
            Ok(msg) => core.handle_inbound(msg).await,
            Err(e) => {
                tracing::warn!(connection_id = %core.id(), error = %e, "discarding malformed message in response body");
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
struct HttpConnection {
    core: Arc<ConnectionCore>,
    endpoint: Url,
    headers: HashMap<String, String>,
    session_id: RwLock<Option<String>>,
    client: reqwest::Client,
    max_buffer: usize,
    cancel: CancellationToken,
}

impl HasCore for HttpConnection {
    fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

impl HttpConnection {
    async fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, self.endpoint.as_str());
        if let Some(sid) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, sid);
        }
        apply_headers(req, &self.headers)
    }

    /// One POST exchange. `awaited` is the id of the request whose
    /// response the caller is waiting for, if any.
    async fn exchange(self: Arc<Self>, line: Bytes, awaited: Option<MessageId>) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST)
            .await
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(line)
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("HTTP POST failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND && self.session_id.write().await.take().is_some() {
            return Err(BridgeError::Transport("HTTP session expired".to_string()));
        }
        if !status.is_success() {
            return Err(BridgeError::Transport(format!(
                "HTTP POST returned status {}",
                status
            )));
        }

        if let Some(sid) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.session_id.write().await;
            if session.is_none() {
                tracing::debug!(connection_id = %self.core.id(), session_id = sid, "session assigned");
                *session = Some(sid.to_string());
            }
        }

        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            // Responses trickle in as events; the caller keeps waiting on
            // its pending entry while the stream is pumped.
            let conn = Arc::clone(&self);
            tokio::spawn(async move {
                let outcome = pump_events(
                    &conn.core,
                    response.bytes_stream(),
                    conn.max_buffer,
                    &conn.cancel,
                    |_| {},
                )
                .await;
                conn.settle(awaited, outcome.err()).await;
            });
            return Ok(());
        }

        deliver_json_body(&self.core, response).await?;
        self.settle(awaited, None).await;
        Ok(())
    }

    /// Fail the awaited request if the exchange finished without answering it.
    async fn settle(&self, awaited: Option<MessageId>, failure: Option<String>) {
        let Some(id) = awaited else {
            return;
        };
        let reason = failure.unwrap_or_else(|| "HTTP exchange ended without a response".to_string());
        if self.core.pending().fail(&id, reason).await {
            self.core.record_error();
        }
    }

    async fn terminate_session(&self) {
        let Some(sid) = self.session_id.write().await.take() else {
            return;
        };
        let req = apply_headers(
            self.client
                .delete(self.endpoint.as_str())
                .header(SESSION_HEADER, sid.as_str()),
            &self.headers,
        );
        if let Err(e) = req.send().await {
            tracing::debug!(connection_id = %self.core.id(), error = %e, "session DELETE failed");
        }
    }
}

/// Adapter for servers reached through plain HTTP POSTs.
///
/// # Examples
///
/// ```no_run
/// use mcp_bridge::transport::http::HttpAdapter;
/// use mcp_bridge::transport::{AdapterSettings, ServerConfig, TransportAdapter};
///
/// # #[tokio::main]
/// # async fn main() -> mcp_bridge::error::Result<()> {
/// let adapter = HttpAdapter::new(AdapterSettings::default());
/// adapter.initialize().await?;
/// let id = adapter
///     .create_connection(ServerConfig::remote("http://localhost:3000/mcp"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HttpAdapter {
    settings: AdapterSettings,
    initialized: InitGate,
    connections: ConnectionTable<HttpConnection>,
}

impl HttpAdapter {
    /// Create an adapter; call [`TransportAdapter::initialize`] before use.
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            initialized: InitGate::default(),
            connections: ConnectionTable::default(),
        }
    }

    /// Session id the server assigned to a live connection, if any.
    pub async fn session_id(&self, connection_id: &str) -> Option<String> {
        let conn = self.connections.get(connection_id).await?;
        let sid = conn.session_id.read().await.clone();
        sid
    }
}

#[async_trait::async_trait]
impl TransportAdapter for HttpAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.open() {
            tracing::debug!(
                http_timeout_ms = self.settings.http_timeout.as_millis() as u64,
                "http adapter initialized"
            );
        }
        Ok(())
    }

    async fn create_connection(&self, config: ServerConfig) -> Result<ConnectionId> {
        self.initialized.check()?;
        let endpoint = parse_http_url(&config)?;
        let client = build_client(self.settings.http_timeout, &endpoint)?;

        let core = Arc::new(ConnectionCore::new(
            TransportKind::Http,
            config.server_id.clone(),
            self.settings.request_timeout,
        ));
        core.mark_connected();

        let conn = Arc::new(HttpConnection {
            core,
            endpoint: endpoint.clone(),
            headers: config.headers.clone(),
            session_id: RwLock::new(None),
            client,
            max_buffer: self.settings.max_buffer_bytes,
            cancel: CancellationToken::new(),
        });
        let id = self.connections.insert(conn).await;
        tracing::info!(connection_id = %id, server = %config.label(), url = %endpoint, "registered http endpoint");
        Ok(id)
    }

    async fn send_message(
        &self,
        connection_id: &str,
        message: ProtocolMessage,
    ) -> Result<Option<ProtocolMessage>> {
        self.initialized.check()?;
        let conn = self.connections.require(connection_id).await?;
        let awaited = match message.kind() {
            Some(MessageKind::Request) => message.id.clone(),
            _ => None,
        };
        let exchange = Arc::clone(&conn);
        conn.core
            .send(message, move |line| exchange.exchange(line, awaited))
            .await
    }

    async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let Some(conn) = self.connections.remove(connection_id).await else {
            tracing::debug!(connection_id, "close on unknown or closed connection ignored");
            return Ok(());
        };
        conn.cancel.cancel();
        conn.core.mark_disconnected("closed by caller").await;
        conn.terminate_session().await;
        tracing::info!(connection_id, url = %conn.endpoint, "closed http endpoint");
        Ok(())
    }

    async fn get_status(&self, connection_id: &str) -> StatusReport {
        self.connections.status(connection_id).await
    }
}
