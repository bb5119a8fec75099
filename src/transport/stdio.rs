//! Process adapter: servers spawned as child processes
//!
//! Each connection owns one child process. Outbound messages are written
//! to the child's stdin as one JSON object per line; the child's stdout is
//! read in raw chunks and fed through a [`LineFramer`], so message
//! boundaries never depend on how the OS splits reads. The child's stderr
//! is diagnostic text only and is logged at `DEBUG`.
//!
//! # Lifecycle
//!
//! Three background tasks run per connection:
//!
//! 1. a stdout reader that frames and correlates inbound messages,
//! 2. a stderr reader that logs diagnostics,
//! 3. a waiter that owns the [`Child`] and reports its exit.
//!
//! When the process exits for any reason the waiter marks the connection
//! `disconnected` and resolves every pending request. `close_connection`
//! asks the waiter to send SIGTERM (Unix) and, if the process is still
//! alive after the grace period, to kill it. Only the waiter signals the
//! process, so a signal can never reach a pid that has already been reaped.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::protocol::{LineFramer, ProtocolMessage};
use crate::transport::connection::{ConnectionCore, ConnectionTable, HasCore, InitGate};
use crate::transport::{
    AdapterSettings, ConnectionId, ServerConfig, StatusReport, TransportAdapter, TransportKind,
};

/// Size of a single stdout read.
const READ_CHUNK: usize = 8 * 1024;

/// How long the waiter lets the stdout reader flush trailing output after
/// the process has exited.
const READER_DRAIN: Duration = Duration::from_millis(250);

/// Requests from the connection to the task that owns the [`Child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// Ask the process to exit (SIGTERM on Unix)
    Terminate,
    /// Force the process down
    Kill,
}

/// One spawned server process.
#[derive(Debug)]
struct ProcessConnection {
    core: Arc<ConnectionCore>,
    command: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    exited: watch::Receiver<bool>,
    signals: std::sync::Mutex<Option<mpsc::UnboundedSender<Signal>>>,
    cancel: CancellationToken,
}

impl HasCore for ProcessConnection {
    fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

impl ProcessConnection {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    async fn write_line(&self, line: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Transport("process stdin is closed".to_string()))?;
        stdin
            .write_all(line)
            .await
            .map_err(|e| BridgeError::Transport(format!("write to `{}` failed: {}", self.command, e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| BridgeError::Transport(format!("flush to `{}` failed: {}", self.command, e)))
    }

    /// Graceful termination with a forced fallback after `grace`.
    ///
    /// Only the first call has any effect: the signal sender is taken out
    /// of the connection, so a second call can never send a second
    /// termination.
    async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.stdin.lock().await.take();

        let signals = match self.signals.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(signals) = signals else {
            return;
        };
        if self.has_exited() {
            return;
        }
        if signals.send(Signal::Terminate).is_err() {
            return;
        }

        let mut exited = self.exited.clone();
        let command = self.command.clone();
        let id = self.core.id().to_string();
        tokio::spawn(async move {
            let graceful = tokio::time::timeout(grace, exited.wait_for(|done| *done)).await;
            if graceful.is_err() {
                tracing::warn!(
                    connection_id = %id,
                    command = %command,
                    grace_ms = grace.as_millis() as u64,
                    "process ignored SIGTERM; killing"
                );
                let _ = signals.send(Signal::Kill);
            }
        });
    }
}

/// Adapter for servers reached as spawned child processes.
///
/// # Examples
///
/// ```no_run
/// use mcp_bridge::protocol::ProtocolMessage;
/// use mcp_bridge::transport::stdio::StdioAdapter;
/// use mcp_bridge::transport::{AdapterSettings, ServerConfig, TransportAdapter};
///
/// # #[tokio::main]
/// # async fn main() -> mcp_bridge::error::Result<()> {
/// let adapter = StdioAdapter::new(AdapterSettings::default());
/// adapter.initialize().await?;
/// let id = adapter
///     .create_connection(ServerConfig::process("echo-server", vec![]))
///     .await?;
/// let reply = adapter
///     .send_message(&id, ProtocolMessage::request(1, "ping", None))
///     .await?;
/// println!("{:?}", reply);
/// adapter.close_connection(&id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StdioAdapter {
    settings: AdapterSettings,
    initialized: InitGate,
    connections: ConnectionTable<ProcessConnection>,
}

impl StdioAdapter {
    /// Create an adapter; call [`TransportAdapter::initialize`] before use.
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            initialized: InitGate::default(),
            connections: ConnectionTable::default(),
        }
    }

    /// Ids of every live connection.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.ids().await
    }

    /// OS process id behind a live connection.
    pub async fn pid(&self, connection_id: &str) -> Option<u32> {
        self.connections.get(connection_id).await.and_then(|c| c.pid)
    }

    fn build_command(&self, command: &str, config: &ServerConfig) -> Command {
        let mut cmd = Command::new(command);
        cmd.args(&config.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if !self.settings.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&config.env);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait::async_trait]
impl TransportAdapter for StdioAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.open() {
            tracing::debug!(
                request_timeout_ms = self.settings.request_timeout.as_millis() as u64,
                "stdio adapter initialized"
            );
        }
        Ok(())
    }

    async fn create_connection(&self, config: ServerConfig) -> Result<ConnectionId> {
        self.initialized.check()?;
        let command = config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                BridgeError::InvalidConfig("process transport requires `command`".to_string())
            })?;

        let mut child = self
            .build_command(&command, &config)
            .spawn()
            .map_err(|e| BridgeError::establish(&command, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Transport("child stdin unavailable after spawn".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Transport("child stdout unavailable after spawn".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Transport("child stderr unavailable after spawn".into()))?;

        let core = Arc::new(ConnectionCore::new(
            TransportKind::Stdio,
            config.server_id.clone(),
            self.settings.request_timeout,
        ));
        core.mark_connected();

        let pid = child.id();
        let cancel = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_stdout(
            Arc::clone(&core),
            stdout,
            LineFramer::new(self.settings.max_buffer_bytes),
            cancel.clone(),
        ));
        tokio::spawn(log_stderr(stderr, core.id().to_string()));
        tokio::spawn(wait_for_exit(
            Arc::clone(&core),
            child,
            reader,
            signal_rx,
            exited_tx,
        ));

        let conn = Arc::new(ProcessConnection {
            core,
            command: command.clone(),
            pid,
            stdin: Mutex::new(Some(stdin)),
            exited: exited_rx,
            signals: std::sync::Mutex::new(Some(signal_tx)),
            cancel,
        });
        let id = self.connections.insert(conn).await;

        tracing::info!(
            connection_id = %id,
            server = %config.label(),
            command = %command,
            pid = ?pid,
            "spawned server process"
        );
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
            .send(message, move |line| async move { writer.write_line(&line).await })
            .await
    }

    async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let Some(conn) = self.connections.remove(connection_id).await else {
            tracing::debug!(connection_id, "close on unknown or closed connection ignored");
            return Ok(());
        };
        conn.core.mark_disconnected("closed by caller").await;
        conn.shutdown(self.settings.shutdown_grace).await;
        tracing::info!(connection_id, command = %conn.command, "closed server process");
        Ok(())
    }

    async fn get_status(&self, connection_id: &str) -> StatusReport {
        self.connections.status(connection_id).await
    }
}

async fn read_stdout(
    core: Arc<ConnectionCore>,
    mut stdout: ChildStdout,
    mut framer: LineFramer,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(connection_id = %core.id(), error = %e, "stdout read failed");
                    core.record_error();
                    break;
                }
            },
        };

        core.record_bytes_received(n);
        let messages = framer.push(&buf[..n]);
        core.set_buffer_size(framer.buffered_len());
        for msg in messages {
            core.handle_inbound(msg).await;
        }
    }
}

async fn log_stderr(stderr: ChildStderr, connection_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(
            target: "mcp_bridge::transport::stdio",
            connection_id = %connection_id,
            "server stderr: {}",
            line
        );
    }
}

/// Ask `child` to exit. Must only be called by the task that waits on it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        // `id()` is `None` once `wait` has reaped the process.
        if let Some(pid) = child.id() {
            // SAFETY: the process has not been reaped, so `pid` still names
            // our child (possibly a zombie) and cannot have been reused.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

async fn wait_for_exit(
    core: Arc<ConnectionCore>,
    mut child: Child,
    reader: tokio::task::JoinHandle<()>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exited_tx: watch::Sender<bool>,
) {
    // A closed signal channel means the connection itself was dropped.
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = signals.recv() => match signal {
                Some(Signal::Terminate) => terminate(&mut child),
                Some(Signal::Kill) | None => {
                    let _ = child.start_kill();
                    break child.wait().await;
                }
            },
        }
    };
    exited_tx.send_replace(true);

    let _ = tokio::time::timeout(READER_DRAIN, reader).await;

    match status {
        Ok(status) => {
            tracing::debug!(connection_id = %core.id(), %status, "server process exited");
            core.mark_disconnected(&format!("process exited ({})", status))
                .await;
        }
        Err(e) => {
            tracing::error!(connection_id = %core.id(), error = %e, "waiting on server process failed");
            core.mark_error(&format!("process wait failed: {}", e)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionStatus;

    async fn adapter() -> StdioAdapter {
        let adapter = StdioAdapter::new(AdapterSettings::default());
        adapter.initialize().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_create_before_initialize_fails() {
        let adapter = StdioAdapter::new(AdapterSettings::default());
        let result = adapter
            .create_connection(ServerConfig::process("cat", vec![]))
            .await;
        assert!(matches!(result, Err(BridgeError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_missing_command_is_invalid_config() {
        let adapter = adapter().await;
        let result = adapter
            .create_connection(ServerConfig::remote("http://localhost"))
            .await;
        assert!(matches!(result, Err(BridgeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_executable_is_establish_failed() {
        let adapter = adapter().await;
        let result = adapter
            .create_connection(ServerConfig::process(
                "/nonexistent/binary/that/does/not/exist",
                vec![],
            ))
            .await;
        assert!(matches!(result, Err(BridgeError::EstablishFailed { .. })));
    }

    #[tokio::test]
    async fn test_notification_then_idempotent_close() {
        let adapter = adapter().await;
        let id = match adapter
            .create_connection(ServerConfig::process("cat", vec![]))
            .await
        {
            Ok(id) => id,
            Err(_) => return,
        };

        let outcome = adapter
            .send_message(&id, ProtocolMessage::notification("note", None))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(
            adapter.get_status(&id).await.status,
            ConnectionStatus::Connected
        );

        adapter.close_connection(&id).await.unwrap();
        adapter.close_connection(&id).await.unwrap();
        let status = adapter.get_status(&id).await.status;
        assert_eq!(status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection() {
        let adapter = adapter().await;
        let result = adapter
            .send_message("stdio-missing", ProtocolMessage::request(1, "x", None))
            .await;
        assert!(matches!(result, Err(BridgeError::ConnectionNotFound(_))));
    }
}
