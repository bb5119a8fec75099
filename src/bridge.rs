//! The transport bridge: one broker in front of every adapter
//!
//! [`TransportBridge`] owns one adapter per transport kind and a
//! [`TransportDetector`]. `create_connection` chooses the adapter (explicit
//! hint, then detection, then static heuristics), and remembers which
//! adapter owns the returned id so that later calls are routed without
//! re-detecting. The bridge itself implements [`TransportAdapter`], so
//! callers hold one object and never see which transport is in use.
//!
//! The bridge is created at startup and torn down with
//! [`TransportBridge::shutdown`], which closes every live connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::BridgeConfig;
use crate::detector::{DetectionResult, TransportDetector};
use crate::error::{BridgeError, Result};
use crate::protocol::ProtocolMessage;
use crate::transport::connection::InitGate;
use crate::transport::http::HttpAdapter;
use crate::transport::sse::SseAdapter;
use crate::transport::stdio::StdioAdapter;
use crate::transport::websocket::WebSocketAdapter;
use crate::transport::{
    AdapterSettings, ConnectionId, ServerConfig, StatusReport, TransportAdapter, TransportKind,
};

/// Broker over the four adapters.
///
/// # Examples
///
/// ```no_run
/// use mcp_bridge::bridge::TransportBridge;
/// use mcp_bridge::config::BridgeConfig;
/// use mcp_bridge::protocol::ProtocolMessage;
/// use mcp_bridge::transport::{ServerConfig, TransportAdapter};
///
/// # #[tokio::main]
/// # async fn main() -> mcp_bridge::error::Result<()> {
/// let bridge = TransportBridge::new(&BridgeConfig::default());
/// bridge.initialize().await?;
/// let id = bridge
///     .create_connection(ServerConfig::process("echo-server", vec![]))
///     .await?;
/// let reply = bridge
///     .send_message(&id, ProtocolMessage::request(1, "ping", None))
///     .await?;
/// bridge.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TransportBridge {
    adapters: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
    detector: Arc<TransportDetector>,
    routes: RwLock<HashMap<ConnectionId, TransportKind>>,
    initialized: InitGate,
}

impl TransportBridge {
    /// Build the bridge with the built-in adapters and detector.
    pub fn new(config: &BridgeConfig) -> Self {
        let settings = AdapterSettings::from(&config.transport);
        let adapters: Vec<Arc<dyn TransportAdapter>> = vec![
            Arc::new(StdioAdapter::new(settings.clone())),
            Arc::new(HttpAdapter::new(settings.clone())),
            Arc::new(WebSocketAdapter::new(settings.clone())),
            Arc::new(SseAdapter::new(settings)),
        ];
        Self::with_adapters(adapters, TransportDetector::new(&config.detector))
    }

    /// Build the bridge from explicit parts. A later adapter of the same
    /// kind replaces an earlier one.
    pub fn with_adapters(
        adapters: Vec<Arc<dyn TransportAdapter>>,
        detector: TransportDetector,
    ) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.kind(), a)).collect(),
            detector: Arc::new(detector),
            routes: RwLock::new(HashMap::new()),
            initialized: InitGate::default(),
        }
    }

    /// The detector, e.g. to register extra strategies.
    pub fn detector(&self) -> &TransportDetector {
        &self.detector
    }

    /// Resolve the transport for `config`: explicit hint, then the
    /// detector, then static heuristics.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] when nothing applies.
    pub async fn resolve_kind(&self, config: &ServerConfig) -> Result<TransportKind> {
        if let Some(hint) = config.transport_hint.filter(|k| *k != TransportKind::Unknown) {
            return Ok(hint);
        }

        let detected = self.detector.detect_transport(config).await;
        if detected.is_known() {
            tracing::debug!(
                server = %config.label(),
                kind = %detected.kind,
                confidence = detected.confidence,
                "transport detected"
            );
            return Ok(detected.kind);
        }

        static_kind(config).ok_or_else(|| {
            BridgeError::InvalidConfig(format!(
                "cannot determine transport for `{}`: need a command, url or port",
                config.label()
            ))
        })
    }

    /// Run only the detector.
    pub async fn detect(&self, config: &ServerConfig) -> DetectionResult {
        self.detector.detect_transport(config).await
    }

    /// Transport behind a live connection id.
    pub async fn route(&self, connection_id: &str) -> Option<TransportKind> {
        self.routes.read().await.get(connection_id).copied()
    }

    /// Ids of every routed connection.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.routes.read().await.keys().cloned().collect()
    }

    fn adapter(&self, kind: TransportKind) -> Result<&Arc<dyn TransportAdapter>> {
        self.adapters.get(&kind).ok_or_else(|| {
            BridgeError::InvalidConfig(format!("no adapter registered for transport `{}`", kind))
        })
    }

    /// Close every live connection. Errors are logged, not returned.
    pub async fn shutdown(&self) {
        let routes: Vec<(ConnectionId, TransportKind)> = self.routes.write().await.drain().collect();
        if routes.is_empty() {
            return;
        }
        tracing::info!(connections = routes.len(), "shutting down bridge");
        for (id, kind) in routes {
            if let Some(adapter) = self.adapters.get(&kind) {
                if let Err(e) = adapter.close_connection(&id).await {
                    tracing::warn!(connection_id = %id, error = %e, "close during shutdown failed");
                }
            }
        }
    }
}

/// Scheme and field heuristics used when no strategy answered.
fn static_kind(config: &ServerConfig) -> Option<TransportKind> {
    if let Some(url) = config.url.as_deref() {
        let scheme = url.split("://").next().unwrap_or_default().to_ascii_lowercase();
        return match scheme.as_str() {
            "ws" | "wss" => Some(TransportKind::WebSocket),
            "http" | "https" => Some(TransportKind::Http),
            _ => None,
        };
    }
    if config.command.as_deref().is_some_and(|c| !c.trim().is_empty()) {
        return Some(TransportKind::Stdio);
    }
    config.port.map(|_| TransportKind::Http)
}

#[async_trait::async_trait]
impl TransportAdapter for TransportBridge {
    /// The bridge is not one transport; it reports `unknown`.
    fn kind(&self) -> TransportKind {
        TransportKind::Unknown
    }

    async fn initialize(&self) -> Result<()> {
        for adapter in self.adapters.values() {
            adapter.initialize().await?;
        }
        if self.initialized.open() {
            tracing::info!(adapters = self.adapters.len(), "bridge initialized");
        }
        Ok(())
    }

    async fn create_connection(&self, config: ServerConfig) -> Result<ConnectionId> {
        self.initialized.check()?;
        let kind = self.resolve_kind(&config).await?;
        let id = self.adapter(kind)?.create_connection(config).await?;
        self.routes.write().await.insert(id.clone(), kind);
        Ok(id)
    }

    async fn send_message(
        &self,
        connection_id: &str,
        message: ProtocolMessage,
    ) -> Result<Option<ProtocolMessage>> {
        self.initialized.check()?;
        let kind = self
            .route(connection_id)
            .await
            .ok_or_else(|| BridgeError::ConnectionNotFound(connection_id.to_string()))?;
        self.adapter(kind)?
            .send_message(connection_id, message)
            .await
    }

    async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let Some(kind) = self.routes.write().await.remove(connection_id) else {
            return Ok(());
        };
        match self.adapters.get(&kind) {
            Some(adapter) => adapter.close_connection(connection_id).await,
            None => Ok(()),
        }
    }

    async fn get_status(&self, connection_id: &str) -> StatusReport {
        // Ids carry their transport as a prefix, so closed connections are
        // still answered by the adapter that owned them.
        let kind = match self.route(connection_id).await {
            Some(kind) => Some(kind),
            None => self
                .adapters
                .keys()
                .copied()
                .find(|k| connection_id.starts_with(&format!("{}-", k.as_str()))),
        };
        match kind.and_then(|k| self.adapters.get(&k)) {
            Some(adapter) => adapter.get_status(connection_id).await,
            None => StatusReport::unknown(),
        }
    }
}
