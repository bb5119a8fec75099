//! JSON-RPC wire protocol: message types and newline framing
//!
//! - `types`   -- [`ProtocolMessage`], [`MessageId`], error codes
//! - `framing` -- [`LineFramer`] and [`encode`]

pub mod framing;
pub mod types;

pub use framing::{encode, LineFramer};
pub use types::{JsonRpcError, MessageId, MessageKind, ProtocolMessage};
