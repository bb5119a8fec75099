//! mcp-bridge - one connection contract for JSON-RPC servers
//!
//! This library lets a caller talk to a server without knowing whether it
//! is a spawned process, an HTTP endpoint, a WebSocket, or a server-sent
//! event stream. Every transport implements the same lifecycle:
//! `initialize`, `create_connection`, `send_message`, `close_connection`
//! and `get_status`.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `protocol`: JSON-RPC message types and newline framing
//! - `transport`: the `TransportAdapter` contract and the stdio, HTTP,
//!   WebSocket and SSE adapters
//! - `detector`: strategy-based transport detection with confidence scores
//! - `bridge`: the broker that picks an adapter and routes by connection id
//! - `runner`: the line-delimited control protocol used by the binary
//! - `config`: configuration management and validation
//! - `error`: error types and result aliases
//! - `telemetry`: process-wide metrics
//! - `cli`: command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use mcp_bridge::{BridgeConfig, ProtocolMessage, ServerConfig, TransportAdapter, TransportBridge};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bridge = TransportBridge::new(&BridgeConfig::default());
//!     bridge.initialize().await?;
//!
//!     let id = bridge
//!         .create_connection(ServerConfig::process("my-server", vec![]))
//!         .await?;
//!     let reply = bridge
//!         .send_message(&id, ProtocolMessage::request(1, "ping", None))
//!         .await?;
//!     println!("{:?}", reply);
//!
//!     bridge.close_connection(&id).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod protocol;
pub mod runner;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use bridge::TransportBridge;
pub use config::BridgeConfig;
pub use detector::{DetectionResult, TransportDetector};
pub use error::{BridgeError, Result};
pub use protocol::{MessageId, ProtocolMessage};
pub use transport::{
    ConnectionStatus, ServerConfig, StatusReport, TransportAdapter, TransportKind,
};
