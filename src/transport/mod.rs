//! Transport adapters and the connection contract they share
//!
//! This module defines the [`TransportAdapter`] trait that every transport
//! implementation satisfies. Concrete implementations live in submodules:
//!
//! - [`stdio::StdioAdapter`] -- spawns a child process and speaks
//!   newline-delimited JSON over its stdin/stdout pipes.
//! - [`http::HttpAdapter`] -- one HTTP POST exchange per message.
//! - [`websocket::WebSocketAdapter`] -- a persistent WebSocket, one
//!   message per text frame.
//! - [`sse::SseAdapter`] -- a server-sent event stream for inbound traffic
//!   and HTTP POSTs for outbound traffic.
//!
//! # Design
//!
//! Callers never learn which transport sits behind a connection id. They
//! `create_connection`, `send_message`, and `close_connection`; every
//! adapter reports the same [`StatusReport`] and fails with the same
//! [`crate::error::BridgeError`] variants. Each adapter owns its own
//! connection table; nothing is shared between adapters.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::error::Result;
use crate::protocol::ProtocolMessage;

pub mod connection;
pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

/// Opaque connection identifier, unique for the adapter's lifetime.
pub type ConnectionId = String;

/// The kinds of transport the bridge knows how to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned OS process over stdin/stdout
    #[serde(alias = "process")]
    Stdio,
    /// One HTTP request/response exchange per message
    #[serde(alias = "https")]
    Http,
    /// Persistent WebSocket
    #[serde(alias = "ws", alias = "wss")]
    WebSocket,
    /// Server-sent event stream
    #[serde(alias = "events")]
    Sse,
    /// Nothing matched
    Unknown,
}

impl TransportKind {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::WebSocket => "websocket",
            TransportKind::Sse => "sse",
            TransportKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to reach one server.
///
/// Field names are camelCase on the wire so the control protocol accepts
/// the same objects external callers already produce.
///
/// # Examples
///
/// ```
/// use mcp_bridge::transport::ServerConfig;
///
/// let cfg: ServerConfig = serde_json::from_str(
///     r#"{"serverId": "fs", "command": "echo-server", "args": []}"#,
/// ).unwrap();
/// assert_eq!(cfg.command.as_deref(), Some("echo-server"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Caller-chosen server identifier, used in logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Explicit transport type; skips detection when present
    #[serde(
        default,
        rename = "transport",
        alias = "transportHint",
        skip_serializing_if = "Option::is_none"
    )]
    pub transport_hint: Option<TransportKind>,
    /// Executable for process transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for process transports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment for process transports
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Working directory for process transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Endpoint for network transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Bare local port; implies `http://127.0.0.1:<port>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Extra headers for network transports (e.g. Authorization)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl ServerConfig {
    /// Config for a process transport.
    pub fn process(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::default()
        }
    }

    /// Config for a network transport.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// The declared URL, or one derived from a bare port.
    pub fn effective_url(&self) -> Option<String> {
        match (&self.url, self.port) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(port)) => Some(format!("http://127.0.0.1:{}", port)),
            (None, None) => None,
        }
    }

    /// Human-readable name for logs.
    pub fn label(&self) -> String {
        self.server_id
            .clone()
            .or_else(|| self.command.clone())
            .or_else(|| self.effective_url())
            .unwrap_or_else(|| "(unnamed)".to_string())
    }
}

/// Connection state machine: `connecting -> connected -> {disconnected, error}`.
///
/// `Unknown` is the sentinel reported for ids the adapter has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Channel is being established
    Connecting,
    /// Channel is up and accepting messages
    Connected,
    /// Channel closed, cleanly or not
    Disconnected,
    /// Channel failed with an OS or network error
    Error,
    /// Id not known to the adapter
    Unknown,
}

impl ConnectionStatus {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one connection's counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Messages written to the transport
    pub messages_sent: u64,
    /// Messages parsed from the transport
    pub messages_received: u64,
    /// Requests resolved by a correlated response
    pub requests_completed: u64,
    /// Requests that hit their deadline
    pub requests_timed_out: u64,
    /// Write failures and transport errors
    pub errors: u64,
    /// Bytes written to the transport
    pub bytes_sent: u64,
    /// Bytes read from the transport
    pub bytes_received: u64,
    /// Requests currently awaiting a response
    pub pending_requests: usize,
    /// Bytes buffered waiting for a message boundary
    pub buffer_size: usize,
}

/// What `get_status` reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Current state
    pub status: ConnectionStatus,
    /// Whole seconds since the connection was created
    pub uptime: u64,
    /// Connection metrics
    pub metrics: ConnectionMetrics,
    /// Transport behind the connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    /// Server identifier from the config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Wall-clock creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    /// The sentinel for an id the adapter does not know.
    pub fn unknown() -> Self {
        Self {
            status: ConnectionStatus::Unknown,
            uptime: 0,
            metrics: ConnectionMetrics::default(),
            transport: None,
            server_id: None,
            started_at: None,
        }
    }
}

/// Tunables every adapter reads, derived from [`TransportConfig`].
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Per-request deadline
    pub request_timeout: Duration,
    /// Grace between graceful and forced termination
    pub shutdown_grace: Duration,
    /// Whether spawned processes inherit the bridge's environment
    pub inherit_env: bool,
    /// Ceiling for an unterminated inbound buffer
    pub max_buffer_bytes: usize,
    /// Timeout for individual HTTP requests
    pub http_timeout: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for AdapterSettings {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            shutdown_grace: Duration::from_millis(cfg.shutdown_grace_ms),
            inherit_env: cfg.inherit_env,
            max_buffer_bytes: cfg.max_buffer_bytes,
            http_timeout: Duration::from_millis(cfg.http_timeout_ms),
        }
    }
}

/// The uniform lifecycle every transport implements.
///
/// Implementations are used polymorphically through `Arc<dyn
/// TransportAdapter>` and must tolerate concurrent calls: different
/// connections never serialize on one another.
#[async_trait::async_trait]
pub trait TransportAdapter: Send + Sync + fmt::Debug {
    /// The transport this adapter speaks.
    fn kind(&self) -> TransportKind;

    /// Idempotent setup. Connection calls fail with
    /// [`crate::error::BridgeError::NotInitialized`] until this has run.
    async fn initialize(&self) -> Result<()>;

    /// Validate `config`, establish the channel, and return a new id.
    ///
    /// # Errors
    ///
    /// `NotInitialized`, `InvalidConfig` for missing fields, or
    /// `EstablishFailed` wrapping the underlying OS/network error.
    async fn create_connection(&self, config: ServerConfig) -> Result<ConnectionId>;

    /// Send one message.
    ///
    /// Requests (messages with an id) resolve with the correlated
    /// response. Notifications resolve with `None` as soon as the
    /// transport has accepted the message.
    ///
    /// # Errors
    ///
    /// `ConnectionNotFound`, `ConnectionInactive`, `InvalidMessage`,
    /// `Timeout`, `Terminated`, or `Transport` for write failures.
    async fn send_message(
        &self,
        connection_id: &str,
        message: ProtocolMessage,
    ) -> Result<Option<ProtocolMessage>>;

    /// Close a connection. Unknown or already-closed ids are a no-op.
    async fn close_connection(&self, connection_id: &str) -> Result<()>;

    /// Report status; unknown ids yield [`StatusReport::unknown`].
    async fn get_status(&self, connection_id: &str) -> StatusReport;
}
