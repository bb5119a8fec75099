//! Newline-delimited message framing
//!
//! Inbound bytes are appended to an accumulation buffer. Every complete
//! line is parsed as one [`ProtocolMessage`]; the trailing fragment (if
//! any) stays in the buffer until the next chunk completes it. A line that
//! fails to parse is logged and discarded without disturbing the lines
//! around it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::protocol::types::ProtocolMessage;
use crate::telemetry;

/// Default ceiling for an inbound buffer that has not seen a newline.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Accumulates raw bytes and yields complete protocol messages.
///
/// # Examples
///
/// ```
/// use mcp_bridge::protocol::LineFramer;
///
/// let mut framer = LineFramer::default();
/// assert!(framer.push(br#"{"jsonrpc":"2.0","id":1,"res"#).is_empty());
/// let messages = framer.push(b"ult\":true}\n");
/// assert_eq!(messages.len(), 1);
/// assert_eq!(framer.buffered_len(), 0);
/// ```
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_buffer: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl LineFramer {
    /// Create a framer that discards an unterminated buffer once it grows
    /// beyond `max_buffer` bytes.
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_buffer,
        }
    }

    /// Append `chunk` and return every message completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ProtocolMessage> {
        let held = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        // Bytes already held contain no newline; only the new chunk can.
        let mut messages = Vec::new();
        if let Some(last_newline) = chunk.iter().rposition(|b| *b == b'\n') {
            let complete = self.buffer.split_to(held + last_newline + 1);
            for line in complete[..].split(|b| *b == b'\n') {
                if let Some(msg) = parse_line(line) {
                    messages.push(msg);
                }
            }
        }

        if self.buffer.len() > self.max_buffer {
            tracing::warn!(
                buffered = self.buffer.len(),
                limit = self.max_buffer,
                "inbound buffer exceeded limit without a newline; discarding"
            );
            telemetry::record_malformed_frame();
            self.buffer.clear();
        }

        messages
    }

    /// Treat `frame` as one complete unit (e.g. a WebSocket text frame or
    /// an SSE `data:` payload) that may still hold several lines.
    pub fn push_frame(&mut self, frame: &[u8]) -> Vec<ProtocolMessage> {
        let mut messages = self.push(frame);
        messages.extend(self.push(b"\n"));
        messages
    }

    /// Number of bytes held back waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_line(line: &[u8]) -> Option<ProtocolMessage> {
    let line = trim_ascii(line);
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice::<ProtocolMessage>(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!(
                error = %e,
                line = %String::from_utf8_lossy(line),
                "discarding malformed inbound line"
            );
            telemetry::record_malformed_frame();
            None
        }
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

/// Serialize `msg` followed by a single newline.
///
/// # Errors
///
/// Returns [`crate::error::BridgeError::Serialization`] if the message
/// cannot be serialized.
pub fn encode(msg: &ProtocolMessage) -> Result<Bytes> {
    let body = serde_json::to_vec(msg)?;
    let mut out = BytesMut::with_capacity(body.len() + 1);
    out.put_slice(&body);
    out.put_u8(b'\n');
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::MessageId;

    const MSG: &str = r#"{"jsonrpc":"2.0","id":"x","result":"pong"}"#;

    #[test]
    fn test_single_complete_line() {
        let mut framer = LineFramer::default();
        let out = framer.push(format!("{MSG}\n").as_bytes());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, Some(MessageId::from("x")));
    }

    #[test]
    fn test_split_across_writes_yields_identical_message() {
        let whole = {
            let mut framer = LineFramer::default();
            framer.push(format!("{MSG}\n").as_bytes())
        };

        let mut framer = LineFramer::default();
        let (head, tail) = MSG.split_at(17);
        assert!(framer.push(head.as_bytes()).is_empty());
        assert_eq!(framer.buffered_len(), head.len());
        let split = framer.push(format!("{tail}\n").as_bytes());

        assert_eq!(split, whole);
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk_keep_order() {
        let mut framer = LineFramer::default();
        let chunk = concat!(
            r#"{"jsonrpc":"2.0","id":1,"result":1}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"result":2}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"res"#
        );
        let out = framer.push(chunk.as_bytes());
        let ids: Vec<_> = out.iter().map(|m| m.id.clone().unwrap()).collect();
        assert_eq!(ids, vec![MessageId::Number(1), MessageId::Number(2)]);
        assert!(framer.buffered_len() > 0);
    }

    #[test]
    fn test_malformed_line_is_discarded_without_losing_neighbours() {
        let mut framer = LineFramer::default();
        let chunk = format!("{MSG}\nnot json at all\n{MSG}\n");
        let out = framer.push(chunk.as_bytes());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_crlf_and_blank_lines_are_tolerated() {
        let mut framer = LineFramer::default();
        let out = framer.push(format!("\r\n{MSG}\r\n\n").as_bytes());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_oversized_buffer_is_discarded() {
        let mut framer = LineFramer::new(16);
        framer.push(&[b'a'; 32]);
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_large_line_in_small_chunks() {
        let payload = "A".repeat(2 * 1024 * 1024);
        let line = format!(
            r#"{{"jsonrpc":"2.0","id":9,"result":"{payload}"}}"#
        );
        let mut stream = format!("{line}\n").into_bytes();
        stream.extend_from_slice(br#"{"jsonrpc":"2.0","id":10,"#);

        let mut framer = LineFramer::default();
        let mut out = Vec::new();
        for chunk in stream.chunks(4096) {
            out.extend(framer.push(chunk));
        }

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, Some(MessageId::Number(9)));
        assert_eq!(out[0].result, Some(serde_json::Value::String(payload)));
        assert_eq!(framer.buffered_len(), br#"{"jsonrpc":"2.0","id":10,"#.len());
    }

    #[test]
    fn test_oversized_unterminated_stream_in_chunks_is_discarded() {
        let mut framer = LineFramer::new(64 * 1024);
        for _ in 0..32 {
            framer.push(&[b'x'; 4096]);
            assert!(framer.buffered_len() <= 64 * 1024);
        }
        let out = framer.push(format!("\n{MSG}\n").as_bytes());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_push_frame_terminates_the_frame() {
        let mut framer = LineFramer::default();
        let out = framer.push_frame(MSG.as_bytes());
        assert_eq!(out.len(), 1);
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_encode_appends_single_newline() {
        let msg = crate::protocol::ProtocolMessage::request(1, "echo", None);
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }
}
