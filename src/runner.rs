//! Control-protocol runner
//!
//! Drives a [`TransportBridge`] from another process over a line-delimited
//! channel. Each input line is one JSON object:
//!
//! ```text
//! {"method": "create_connection", "args": {"config": {"command": "echo-server"}}}
//! {"method": "send_message", "args": {"connection_id": "stdio-...", "message": {...}}}
//! ```
//!
//! and each output line is either `{"result": ...}` or `{"error": "..."}`.
//! Requests are answered strictly in input order. A request carrying an
//! `id` field gets it echoed back so a caller may correlate if it wants to.
//!
//! The runner keeps no state of its own: EOF or a termination signal ends
//! the loop, and connections are whatever the caller left open.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::bridge::TransportBridge;
use crate::protocol::ProtocolMessage;
use crate::transport::{ServerConfig, TransportAdapter};

/// Methods the control channel understands.
pub const METHODS: &[&str] = &[
    "initialize",
    "create_connection",
    "send_message",
    "close_connection",
    "get_status",
];

/// One input line.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    /// One of [`METHODS`]
    pub method: String,
    /// Method arguments; absent means `{}`
    #[serde(default)]
    pub args: Value,
    /// Optional caller correlation token, echoed on the reply
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CreateArgs {
    config: ServerConfig,
}

#[derive(Debug, Deserialize)]
struct ConnectionArgs {
    #[serde(alias = "connectionId")]
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct SendArgs {
    #[serde(alias = "connectionId")]
    connection_id: String,
    message: ProtocolMessage,
}

/// Serves control requests against one bridge.
#[derive(Debug, Clone)]
pub struct ControlRunner {
    bridge: Arc<TransportBridge>,
}

impl ControlRunner {
    /// Create a runner over `bridge`.
    pub fn new(bridge: Arc<TransportBridge>) -> Self {
        Self { bridge }
    }

    /// The bridge requests are dispatched to.
    pub fn bridge(&self) -> &Arc<TransportBridge> {
        &self.bridge
    }

    /// Execute one request and return its `result` value.
    ///
    /// # Errors
    ///
    /// Unknown methods, malformed arguments, and every bridge failure.
    pub async fn dispatch(&self, request: ControlRequest) -> Result<Value> {
        let method = request.method.as_str();
        tracing::debug!(method, "control request");

        match method {
            "initialize" => {
                self.bridge.initialize().await?;
                Ok(Value::Null)
            }
            "create_connection" => {
                let args: CreateArgs = parse_args(method, request.args)?;
                let id = self.bridge.create_connection(args.config).await?;
                Ok(Value::String(id))
            }
            "send_message" => {
                let args: SendArgs = parse_args(method, request.args)?;
                let reply = self
                    .bridge
                    .send_message(&args.connection_id, args.message)
                    .await?;
                Ok(serde_json::to_value(reply)?)
            }
            "close_connection" => {
                let args: ConnectionArgs = parse_args(method, request.args)?;
                self.bridge.close_connection(&args.connection_id).await?;
                Ok(Value::Null)
            }
            "get_status" => {
                let args: ConnectionArgs = parse_args(method, request.args)?;
                let report = self.bridge.get_status(&args.connection_id).await;
                Ok(serde_json::to_value(report)?)
            }
            other => bail!(
                "unknown method `{}` (expected one of: {})",
                other,
                METHODS.join(", ")
            ),
        }
    }

    /// Turn one input line into one output object.
    pub async fn handle_line(&self, line: &str) -> Value {
        let request: ControlRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable control line");
                return json!({ "error": format!("invalid request: {}", e) });
            }
        };

        let id = request.id.clone();
        let mut reply = match self.dispatch(request).await {
            Ok(result) => json!({ "result": result }),
            Err(e) => json!({ "error": format!("{:#}", e) }),
        };
        if let (Some(id), Some(obj)) = (id, reply.as_object_mut()) {
            obj.insert("id".to_string(), id);
        }
        reply
    }

    /// Serve until `reader` reaches EOF.
    ///
    /// Blank lines are skipped. Each reply is written and flushed before
    /// the next line is read.
    ///
    /// # Errors
    ///
    /// Only I/O failures on `reader` or `writer`.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.context("reading control input")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let reply = self.handle_line(line).await;
            let mut out = serde_json::to_vec(&reply)?;
            out.push(b'\n');
            writer
                .write_all(&out)
                .await
                .context("writing control output")?;
            writer.flush().await.context("flushing control output")?;
        }
        tracing::info!("control input closed");
        Ok(())
    }
}

fn parse_args<T: DeserializeOwned>(method: &str, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| anyhow!("invalid args for `{}`: {}", method, e))
}

/// Serve the control protocol on this process's stdin/stdout until EOF,
/// Ctrl+C, or SIGTERM.
///
/// # Errors
///
/// I/O failures on stdin/stdout.
pub async fn serve_stdio(bridge: Arc<TransportBridge>) -> Result<()> {
    let runner = ControlRunner::new(bridge);
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        res = runner.run(stdin, stdout) => res,
        _ = shutdown_signal() => {
            tracing::info!("termination signal received, exiting");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
