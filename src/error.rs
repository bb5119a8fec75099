//! Error types for mcp-bridge
//!
//! This module defines the error taxonomy shared by every transport
//! adapter, the transport detector, and the control-protocol runner,
//! using `thiserror` for ergonomic error handling.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::types::{
    ERROR_INTERNAL, ERROR_INVALID_REQUEST, ERROR_SERVER, ERROR_TIMEOUT,
};

/// Main error type for bridge operations
///
/// Every adapter honors the same taxonomy so callers can stay
/// transport-agnostic: a `Timeout` from the process adapter means exactly
/// what a `Timeout` from the WebSocket adapter means.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Adapter used before `initialize()` was called
    #[error("Transport not initialized")]
    NotInitialized,

    /// A required field for the chosen transport is missing or invalid
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Spawning the process or connecting to the endpoint failed
    #[error("Failed to establish connection to {target}: {source}")]
    EstablishFailed {
        /// Command or URL that could not be reached
        target: String,
        /// Underlying OS or network error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Operation on a connection id that was never issued or already closed
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Send attempted on a connection that is not `connected`
    #[error("Connection {id} is not active (status: {status})")]
    ConnectionInactive {
        /// Connection identifier
        id: String,
        /// Current status of the connection
        status: String,
    },

    /// No correlated response arrived within the per-request deadline
    #[error("Request {id} ({method}) timed out after {after:?}")]
    Timeout {
        /// Protocol message id of the request
        id: String,
        /// Method of the request
        method: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// The underlying process or socket died while the request was pending
    #[error("Connection terminated: {0}")]
    Terminated(String),

    /// Outbound message is not a well-formed protocol message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Writing to an established channel failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration file problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Wrap an underlying error as [`BridgeError::EstablishFailed`].
    pub fn establish(
        target: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::EstablishFailed {
            target: target.into(),
            source: source.into(),
        }
    }

    /// JSON-RPC error code used when this error is rendered as a
    /// synthetic error response.
    pub fn code(&self) -> i64 {
        match self {
            Self::Terminated(_) | Self::Transport(_) => ERROR_INTERNAL,
            Self::Timeout { .. } => ERROR_TIMEOUT,
            Self::InvalidMessage(_) => ERROR_INVALID_REQUEST,
            _ => ERROR_SERVER,
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
