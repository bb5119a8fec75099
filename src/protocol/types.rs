//! JSON-RPC 2.0 wire types
//!
//! [`ProtocolMessage`] is the single wire unit every adapter frames,
//! sends, and correlates. It is deliberately one flat struct rather than
//! separate request/response types: the bridge routes messages it does not
//! interpret, so it only needs to know which *kind* a message is.
//!
//! All `Option<>` fields omit their key from JSON when `None`. `result`
//! is the exception on the way in: an explicit `"result": null` is kept
//! as `Some(Value::Null)` so a null-valued response is still a response.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// The only JSON-RPC version spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const ERROR_PARSE: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const ERROR_INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const ERROR_INVALID_PARAMS: i64 = -32602;
/// Internal error; used for requests resolved by a dying connection.
pub const ERROR_INTERNAL: i64 = -32603;
/// Generic implementation-defined server error.
pub const ERROR_SERVER: i64 = -32000;
/// Implementation-defined: no response within the request deadline.
pub const ERROR_TIMEOUT: i64 = -32001;

/// A JSON-RPC request identifier: either a number or a string.
///
/// # Examples
///
/// ```
/// use mcp_bridge::protocol::MessageId;
///
/// let id: MessageId = serde_json::from_str("42").unwrap();
/// assert_eq!(id, MessageId::Number(42));
/// assert_eq!(id.to_string(), "42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Numeric identifier
    Number(i64),
    /// String identifier
    String(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{}", n),
            MessageId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        MessageId::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId::String(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId::String(s)
    }
}

/// A JSON-RPC 2.0 error object.
///
/// Implements `Display` as `"JSON-RPC error {code}: {message}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code as defined by JSON-RPC 2.0
    pub code: i64,
    /// Human-readable error description
    pub message: String,
    /// Optional additional error context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// What a [`ProtocolMessage`] is, judged by which fields it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `method` with an `id`: the peer expects a response
    Request,
    /// `method` without an `id`: no response expected
    Notification,
    /// `result` or `error`, no `method`
    Response,
}

/// The JSON-RPC 2.0 wire unit.
///
/// # Examples
///
/// ```
/// use mcp_bridge::protocol::{MessageKind, ProtocolMessage};
///
/// let msg = ProtocolMessage::request(1, "ping", None);
/// assert_eq!(msg.validate().unwrap(), MessageKind::Request);
///
/// let note = ProtocolMessage::notification("notifications/initialized", None);
/// assert!(note.id.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Protocol version identifier; always `"2.0"`
    pub jsonrpc: String,
    /// Correlation id; absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Method name for requests and notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful result; mutually exclusive with `error`
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Error object; mutually exclusive with `result`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Treat a present-but-null field as `Some(Value::Null)`.
fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ProtocolMessage {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Build a request that expects a correlated response.
    pub fn request(id: impl Into<MessageId>, method: &str, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.to_string()),
            params,
            ..Self::empty()
        }
    }

    /// Build a notification (no id, no response).
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            method: Some(method.to_string()),
            params,
            ..Self::empty()
        }
    }

    /// Build a successful response.
    pub fn result_response(id: MessageId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Build an error response.
    pub fn error_response(id: Option<MessageId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            ..Self::empty()
        }
    }

    /// Classify the message, or `None` when it carries neither a method
    /// nor a result/error.
    pub fn kind(&self) -> Option<MessageKind> {
        match (&self.method, &self.id) {
            (Some(_), Some(_)) => Some(MessageKind::Request),
            (Some(_), None) => Some(MessageKind::Notification),
            (None, _) if self.result.is_some() || self.error.is_some() => {
                Some(MessageKind::Response)
            }
            _ => None,
        }
    }

    /// `true` for a message carrying an id and a result or error.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.kind() == Some(MessageKind::Response)
    }

    /// Check that the message is well-formed JSON-RPC 2.0.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidMessage`] when the version is not
    /// `"2.0"`, the method is empty, a request also carries a result, or a
    /// response carries both `result` and `error`.
    pub fn validate(&self) -> Result<MessageKind> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(BridgeError::InvalidMessage(format!(
                "jsonrpc must be \"{}\", got \"{}\"",
                JSONRPC_VERSION, self.jsonrpc
            )));
        }

        if let Some(method) = &self.method {
            if method.is_empty() {
                return Err(BridgeError::InvalidMessage(
                    "method must not be empty".to_string(),
                ));
            }
            if self.result.is_some() || self.error.is_some() {
                return Err(BridgeError::InvalidMessage(
                    "a request cannot carry result or error".to_string(),
                ));
            }
        } else if self.result.is_some() && self.error.is_some() {
            return Err(BridgeError::InvalidMessage(
                "a response carries either result or error, not both".to_string(),
            ));
        }

        self.kind().ok_or_else(|| {
            BridgeError::InvalidMessage(
                "message has neither method nor result/error".to_string(),
            )
        })
    }

    /// Parse and validate a message from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidMessage`] if the value does not
    /// describe a well-formed message.
    pub fn from_value(value: Value) -> Result<Self> {
        let msg: ProtocolMessage = serde_json::from_value(value)
            .map_err(|e| BridgeError::InvalidMessage(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trips_without_empty_fields() {
        let msg = ProtocolMessage::request(1, "ping", None);
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
    }

    #[test]
    fn test_string_and_number_ids_are_distinct() {
        let a: MessageId = serde_json::from_value(json!("1")).unwrap();
        let b: MessageId = serde_json::from_value(json!(1)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_null_result_is_still_a_response() {
        let msg: ProtocolMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "result": null})).unwrap();
        assert_eq!(msg.result, Some(Value::Null));
        assert!(msg.is_response());
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            ProtocolMessage::notification("x", None).kind(),
            Some(MessageKind::Notification)
        );
        assert_eq!(
            ProtocolMessage::error_response(Some(1.into()), -1, "bad").kind(),
            Some(MessageKind::Response)
        );
        let bare: ProtocolMessage = serde_json::from_value(json!({"jsonrpc": "2.0"})).unwrap();
        assert_eq!(bare.kind(), None);
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let mut msg = ProtocolMessage::request(1, "ping", None);
        msg.jsonrpc = "1.0".to_string();
        assert!(matches!(
            msg.validate(),
            Err(BridgeError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_validate_rejects_result_and_error() {
        let msg: ProtocolMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {},
            "error": {"code": -1, "message": "x"}
        }))
        .unwrap();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_from_value_rejects_missing_version() {
        let result = ProtocolMessage::from_value(json!({"id": 1, "method": "ping"}));
        assert!(matches!(result, Err(BridgeError::InvalidMessage(_))));
    }

    #[test]
    fn test_json_rpc_error_display() {
        let e = JsonRpcError {
            code: -32600,
            message: "Invalid Request".to_string(),
            data: None,
        };
        assert_eq!(e.to_string(), "JSON-RPC error -32600: Invalid Request");
    }
}
