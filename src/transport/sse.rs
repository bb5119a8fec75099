//! Server-sent event adapter
//!
//! Inbound traffic arrives on a long-lived `GET` stream with
//! `Accept: text/event-stream`; every `data:` payload is fed through the
//! same newline framing as the process adapter. Outbound messages are sent
//! as HTTP POSTs.
//!
//! # Endpoint discovery
//!
//! A server may announce where POSTs should go by emitting an `endpoint`
//! event whose data is a URL, absolute or relative to the stream URL.
//! Until one arrives (or if none ever does) messages are POSTed to the
//! stream URL itself.
//!
//! # Event parsing
//!
//! - `id:` is remembered as the last event id.
//! - `event: ping` and `data: [PING]` are discarded.
//! - Multiple `data:` lines in one event are joined with `\n`.
//! - `retry:` and comment lines are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{BridgeError, Result};
use crate::protocol::framing::DEFAULT_MAX_BUFFER_BYTES;
use crate::protocol::{LineFramer, ProtocolMessage};
use crate::telemetry;
use crate::transport::connection::{ConnectionCore, ConnectionTable, HasCore, InitGate};
use crate::transport::http::{apply_headers, build_client, deliver_json_body, parse_http_url};
use crate::transport::{
    AdapterSettings, ConnectionId, ServerConfig, StatusReport, TransportAdapter, TransportKind,
};

/// Event name a server uses to announce its POST endpoint.
pub const ENDPOINT_EVENT: &str = "endpoint";

/// How long after the stream opens sends may wait for an `endpoint` event
/// before falling back to the stream URL.
const ENDPOINT_WAIT: Duration = Duration::from_millis(500);

/// One parsed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field
    pub event: Option<String>,
    /// `id:` field
    pub id: Option<String>,
    /// Joined `data:` lines
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// # Examples
///
/// ```
/// use mcp_bridge::transport::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::default();
/// assert!(decoder.push(b"data: hel").is_empty());
/// let events = decoder.push(b"lo\n\n");
/// assert_eq!(events[0].data, "hello");
/// ```
#[derive(Debug)]
pub struct SseDecoder {
    buffer: BytesMut,
    max_buffer: usize,
    /// Set after an oversized event was dropped; the rest of that event is
    /// skipped up to its terminating blank line.
    discarding: bool,
    last_event_id: Option<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl SseDecoder {
    /// Create a decoder that drops any single event larger than
    /// `max_buffer` bytes.
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_buffer,
            discarding: false,
            last_event_id: None,
        }
    }

    /// Append `chunk` and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        // Held bytes contain no blank line, except possibly one straddling
        // the chunk boundary.
        let mut from = self.buffer.len().saturating_sub(1);
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer[from..].windows(2).position(|w| w == b"\n\n") {
            let block = self.buffer.split_to(from + pos);
            self.buffer.advance(2);
            from = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if let Some(event) = self.parse_block(&block) {
                events.push(event);
            }
        }

        if self.buffer.len() > self.max_buffer {
            tracing::warn!(
                buffered = self.buffer.len(),
                limit = self.max_buffer,
                "event exceeded buffer limit without terminating; discarding"
            );
            telemetry::record_malformed_frame();
            // Keep a trailing newline so a blank line split across chunks
            // still ends the dropped event.
            let keep_newline = self.buffer.last() == Some(&b'\n');
            self.buffer.clear();
            if keep_newline {
                self.buffer.extend_from_slice(b"\n");
            }
            self.discarding = true;
        }
        events
    }

    /// Number of bytes held back waiting for the end of an event.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Flush a trailing event left without its blank-line terminator.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if std::mem::take(&mut self.discarding) {
            self.buffer.clear();
            return None;
        }
        if self.buffer.is_empty() {
            return None;
        }
        let block = self.buffer.split();
        self.parse_block(&block)
    }

    /// Last `id:` seen on the stream.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn parse_block(&mut self, block: &[u8]) -> Option<SseEvent> {
        let text = String::from_utf8_lossy(block);
        let mut data_lines: Vec<&str> = Vec::new();
        let mut event: Option<&str> = None;
        let mut id: Option<&str> = None;

        for line in text.lines() {
            if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.strip_prefix(' ').unwrap_or(value));
            } else if let Some(value) = line.strip_prefix("id:") {
                id = Some(value.trim());
            } else if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim());
            }
        }

        if let Some(id) = id {
            self.last_event_id = Some(id.to_string());
        }
        if event.is_some_and(|e| e.eq_ignore_ascii_case("ping")) {
            return None;
        }

        let data = data_lines.join("\n");
        if data.trim().is_empty() || data.trim().eq_ignore_ascii_case("[ping]") {
            return None;
        }

        Some(SseEvent {
            event: event.map(str::to_string),
            id: id.map(str::to_string),
            data,
        })
    }
}

/// Drive `stream` through a decoder, feeding every message event into
/// `core` and reporting `endpoint` events through `on_endpoint`.
///
/// Returns `Err` with a description when the stream fails, `Ok` when it
/// ends or `cancel` fires.
pub(crate) async fn pump_events<S, F>(
    core: &ConnectionCore,
    stream: S,
    max_buffer: usize,
    cancel: &CancellationToken,
    mut on_endpoint: F,
) -> std::result::Result<(), String>
where
    S: Stream<Item = reqwest::Result<Bytes>>,
    F: FnMut(&str),
{
    let mut decoder = SseDecoder::new(max_buffer);
    let mut framer = LineFramer::new(max_buffer);
    tokio::pin!(stream);

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e.to_string()),
                None => break,
            },
        };
        core.record_bytes_received(chunk.len());
        for event in decoder.push(&chunk) {
            dispatch(core, &mut framer, event, &mut on_endpoint).await;
        }
    }

    if let Some(event) = decoder.finish() {
        dispatch(core, &mut framer, event, &mut on_endpoint).await;
    }
    Ok(())
}

async fn dispatch<F: FnMut(&str)>(
    core: &ConnectionCore,
    framer: &mut LineFramer,
    event: SseEvent,
    on_endpoint: &mut F,
) {
    if event.event.as_deref() == Some(ENDPOINT_EVENT) {
        on_endpoint(event.data.trim());
        return;
    }
    for msg in framer.push_frame(event.data.as_bytes()) {
        core.handle_inbound(msg).await;
    }
}

#[derive(Debug)]
struct SseConnection {
    core: Arc<ConnectionCore>,
    stream_url: Url,
    endpoint: watch::Receiver<Option<Url>>,
    endpoint_deadline: Instant,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl HasCore for SseConnection {
    fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

impl SseConnection {
    /// POST target: the announced endpoint, waiting for one only until
    /// `endpoint_deadline`.
    async fn post_target(&self) -> Url {
        let mut endpoint = self.endpoint.clone();
        let announced = match tokio::time::timeout_at(
            self.endpoint_deadline,
            endpoint.wait_for(Option::is_some),
        )
        .await
        {
            Ok(Ok(announced)) => announced.as_ref().cloned(),
            _ => None,
        };
        announced.unwrap_or_else(|| self.stream_url.clone())
    }

    async fn post(&self, line: Bytes) -> Result<()> {
        let target = self.post_target().await;
        let req = self
            .client
            .post(target.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(line);
        let response = apply_headers(req, &self.headers)
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("SSE POST failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Transport(format!(
                "SSE POST returned status {}",
                status
            )));
        }
        deliver_json_body(&self.core, response).await
    }
}

/// Adapter for servers that push responses over an event stream.
#[derive(Debug)]
pub struct SseAdapter {
    settings: AdapterSettings,
    initialized: InitGate,
    connections: ConnectionTable<SseConnection>,
}

impl SseAdapter {
    /// Create an adapter; call [`TransportAdapter::initialize`] before use.
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            initialized: InitGate::default(),
            connections: ConnectionTable::default(),
        }
    }

    /// The POST endpoint announced on a live connection's stream, if any.
    pub async fn announced_endpoint(&self, connection_id: &str) -> Option<Url> {
        let conn = self.connections.get(connection_id).await?;
        let endpoint = conn.endpoint.borrow().as_ref().cloned();
        endpoint
    }
}

#[async_trait::async_trait]
impl TransportAdapter for SseAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.open() {
            tracing::debug!("sse adapter initialized");
        }
        Ok(())
    }

    async fn create_connection(&self, config: ServerConfig) -> Result<ConnectionId> {
        self.initialized.check()?;
        let stream_url = parse_http_url(&config)?;
        // Streams stay open indefinitely; only the connect phase is bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(self.settings.http_timeout)
            .build()
            .map_err(|e| BridgeError::establish(stream_url.as_str(), e))?;

        let req = client
            .get(stream_url.as_str())
            .header("Accept", "text/event-stream");
        let response = apply_headers(req, &config.headers)
            .send()
            .await
            .map_err(|e| BridgeError::establish(stream_url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::establish(
                stream_url.as_str(),
                format!("event stream returned HTTP {}", status),
            ));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/event-stream") {
            return Err(BridgeError::establish(
                stream_url.as_str(),
                format!("expected text/event-stream, got `{}`", content_type),
            ));
        }

        let core = Arc::new(ConnectionCore::new(
            TransportKind::Sse,
            config.server_id.clone(),
            self.settings.request_timeout,
        ));
        core.mark_connected();

        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let reader_core = Arc::clone(&core);
        let reader_cancel = cancel.clone();
        let base = stream_url.clone();
        let max_buffer = self.settings.max_buffer_bytes;
        tokio::spawn(async move {
            let outcome = pump_events(
                &reader_core,
                response.bytes_stream(),
                max_buffer,
                &reader_cancel,
                |announced| match base.join(announced) {
                    Ok(url) => {
                        tracing::debug!(connection_id = %reader_core.id(), endpoint = %url, "server announced POST endpoint");
                        endpoint_tx.send_replace(Some(url));
                    }
                    Err(e) => {
                        tracing::warn!(connection_id = %reader_core.id(), error = %e, "ignoring unparseable endpoint event");
                    }
                },
            )
            .await;
            match outcome {
                Ok(()) => reader_core.mark_disconnected("event stream ended").await,
                Err(e) => {
                    tracing::warn!(connection_id = %reader_core.id(), error = %e, "event stream failed");
                    reader_core
                        .mark_error(&format!("event stream failed: {}", e))
                        .await;
                }
            }
        });

        let conn = Arc::new(SseConnection {
            core,
            stream_url: stream_url.clone(),
            endpoint: endpoint_rx,
            endpoint_deadline: Instant::now() + ENDPOINT_WAIT,
            headers: config.headers.clone(),
            client: build_client(self.settings.http_timeout, &stream_url)?,
            cancel,
        });
        let id = self.connections.insert(conn).await;
        tracing::info!(connection_id = %id, server = %config.label(), url = %stream_url, "opened event stream");
        Ok(id)
    }

    async fn send_message(
        &self,
        connection_id: &str,
        message: ProtocolMessage,
    ) -> Result<Option<ProtocolMessage>> {
        self.initialized.check()?;
        let conn = self.connections.require(connection_id).await?;
        let poster = Arc::clone(&conn);
        conn.core
            .send(message, move |line| async move { poster.post(line).await })
            .await
    }

    async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let Some(conn) = self.connections.remove(connection_id).await else {
            tracing::debug!(connection_id, "close on unknown or closed connection ignored");
            return Ok(());
        };
        conn.cancel.cancel();
        conn.core.mark_disconnected("closed by caller").await;
        tracing::info!(connection_id, url = %conn.stream_url, "closed event stream");
        Ok(())
    }

    async fn get_status(&self, connection_id: &str) -> StatusReport {
        self.connections.status(connection_id).await
    }
}
