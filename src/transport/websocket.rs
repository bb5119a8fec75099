//! WebSocket adapter
//!
//! A persistent socket plays the role of the process adapter's pipes:
//! each outbound message is one text frame, and every inbound text or
//! binary frame goes through the same newline framing (a frame may carry
//! several newline-separated messages). Ping/pong is handled by the
//! WebSocket layer and never surfaces as protocol traffic.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{BridgeError, Result};
use crate::protocol::{LineFramer, ProtocolMessage};
use crate::transport::connection::{ConnectionCore, ConnectionTable, HasCore, InitGate};
use crate::transport::{
    AdapterSettings, ConnectionId, ServerConfig, StatusReport, TransportAdapter, TransportKind,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsConnection {
    core: Arc<ConnectionCore>,
    url: Url,
    sink: Mutex<SplitSink<Socket, Message>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("core", &self.core)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl HasCore for WsConnection {
    fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

impl WsConnection {
    async fn write_frame(&self, line: Bytes) -> Result<()> {
        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| BridgeError::Transport(format!("WebSocket send failed: {}", e)))
    }

    async fn close_socket(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            tracing::debug!(connection_id = %self.core.id(), error = %e, "close frame not sent");
        }
        let _ = sink.close().await;
    }
}

fn parse_ws_url(config: &ServerConfig) -> Result<Url> {
    let raw = config.url.clone().ok_or_else(|| {
        BridgeError::InvalidConfig("websocket transport requires `url`".to_string())
    })?;
    let url = Url::parse(&raw)
        .map_err(|e| BridgeError::InvalidConfig(format!("invalid url `{}`: {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(BridgeError::InvalidConfig(format!(
            "expected a ws(s) url, got scheme `{}`",
            other
        ))),
    }
}

async fn read_frames(
    core: Arc<ConnectionCore>,
    mut stream: SplitStream<Socket>,
    mut framer: LineFramer,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        let payload = match frame {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(connection_id = %core.id(), frame = ?frame, "server closed socket");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(connection_id = %core.id(), error = %e, "socket read failed");
                core.mark_error(&format!("socket read failed: {}", e)).await;
                return;
            }
            None => break,
        };

        core.record_bytes_received(payload.len());
        for msg in framer.push_frame(&payload) {
            core.handle_inbound(msg).await;
        }
    }
    core.mark_disconnected("socket closed").await;
}

/// Adapter for servers reached over a WebSocket.
#[derive(Debug)]
pub struct WebSocketAdapter {
    settings: AdapterSettings,
    initialized: InitGate,
    connections: ConnectionTable<WsConnection>,
}

impl WebSocketAdapter {
    /// Create an adapter; call [`TransportAdapter::initialize`] before use.
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            initialized: InitGate::default(),
            connections: ConnectionTable::default(),
        }
    }
}

#[async_trait::async_trait]
impl TransportAdapter for WebSocketAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.open() {
            tracing::debug!("websocket adapter initialized");
        }
        Ok(())
    }

    async fn create_connection(&self, config: ServerConfig) -> Result<ConnectionId> {
        self.initialized.check()?;
        let url = parse_ws_url(&config)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::InvalidConfig(format!("invalid websocket request: {}", e)))?;
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BridgeError::InvalidConfig(format!("invalid header `{}`: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| BridgeError::InvalidConfig(format!("invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (socket, _) = tokio::time::timeout(self.settings.http_timeout, connect_async(request))
            .await
            .map_err(|_| BridgeError::establish(url.as_str(), "connection attempt timed out"))?
            .map_err(|e| BridgeError::establish(url.as_str(), e))?;
        let (sink, stream) = socket.split();

        let core = Arc::new(ConnectionCore::new(
            TransportKind::WebSocket,
            config.server_id.clone(),
            self.settings.request_timeout,
        ));
        core.mark_connected();

        let cancel = CancellationToken::new();
        tokio::spawn(read_frames(
            Arc::clone(&core),
            stream,
            LineFramer::new(self.settings.max_buffer_bytes),
            cancel.clone(),
        ));

        let conn = Arc::new(WsConnection {
            core,
            url: url.clone(),
            sink: Mutex::new(sink),
            cancel,
        });
        let id = self.connections.insert(conn).await;
        tracing::info!(connection_id = %id, server = %config.label(), url = %url, "opened websocket");
        Ok(id)
    }

    async fn send_message(
        &self,
        connection_id: &str,
        message: ProtocolMessage,
    ) -> Result<Option<ProtocolMessage>> {
        self.initialized.check()?;
        let conn = self.connections.require(connection_id).await?;
        let writer = Arc::clone(&conn);
        conn.core
            .send(message, move |line| async move { writer.write_frame(line).await })
            .await
    }

    async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let Some(conn) = self.connections.remove(connection_id).await else {
            tracing::debug!(connection_id, "close on unknown or closed connection ignored");
            return Ok(());
        };
        conn.cancel.cancel();
        conn.core.mark_disconnected("closed by caller").await;
        conn.close_socket().await;
        tracing::info!(connection_id, url = %conn.url, "closed websocket");
        Ok(())
    }

    async fn get_status(&self, connection_id: &str) -> StatusReport {
        self.connections.status(connection_id).await
    }
}
