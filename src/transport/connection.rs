//! Per-connection state shared by every adapter
//!
//! [`ConnectionCore`] holds what the connection contract needs regardless
//! of transport: the status state machine, the pending-request table,
//! counters, and the start time. Adapters wrap it with their own transport
//! handle (a child process, a socket, an HTTP client).
//!
//! # Pending requests
//!
//! A request with an id is registered in [`PendingRequests`] *before* it
//! is written, so its response can never arrive before the slot exists.
//! Each entry is removed exactly once, under the table's lock, by whichever
//! of these happens first:
//!
//! - a matching response ([`PendingRequests::resolve`]),
//! - the deadline ([`PendingRequests::expire`]),
//! - a transport failure for that request ([`PendingRequests::fail`]),
//! - the connection going away ([`PendingRequests::drain`]).
//!
//! Whoever removes the entry is the only one that completes the caller.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch, Mutex, RwLock};

use crate::error::{BridgeError, Result};
use crate::protocol::types::{MessageId, MessageKind, ProtocolMessage, ERROR_INTERNAL};
use crate::protocol::encode;
use crate::telemetry::{self, ConnectionGauge};
use crate::transport::{
    ConnectionId, ConnectionMetrics, ConnectionStatus, StatusReport, TransportKind,
};

/// How many closed connections keep answering `get_status` with
/// `disconnected` before they are forgotten.
const RETIRED_CAPACITY: usize = 256;

/// How a pending request was completed.
#[derive(Debug)]
pub enum Completion {
    /// A correlated response arrived
    Response(ProtocolMessage),
    /// The connection went away; carries the synthetic `-32603` response
    Terminated(ProtocolMessage),
    /// Writing or exchanging this particular request failed
    Failed(String),
}

#[derive(Debug)]
struct PendingEntry {
    method: String,
    tx: oneshot::Sender<Completion>,
}

/// Message id -> waiting caller, for one connection.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<MessageId, PendingEntry>>,
}

impl PendingRequests {
    /// Register a waiter for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidMessage`] if a request with the same
    /// id is already in flight on this connection.
    pub async fn register(
        &self,
        id: MessageId,
        method: &str,
    ) -> Result<oneshot::Receiver<Completion>> {
        let mut pending = self.inner.lock().await;
        if pending.contains_key(&id) {
            return Err(BridgeError::InvalidMessage(format!(
                "request id {} is already in flight on this connection",
                id
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Complete the waiter matching `response.id`. Returns `false` for
    /// orphaned or duplicate responses.
    pub async fn resolve(&self, response: ProtocolMessage) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        let entry = self.inner.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                // The caller may have given up already; that is fine.
                let _ = entry.tx.send(Completion::Response(response));
                true
            }
            None => false,
        }
    }

    /// Remove the waiter for `id` because its deadline elapsed.
    pub async fn expire(&self, id: &MessageId) -> bool {
        self.inner.lock().await.remove(id).is_some()
    }

    /// Complete the waiter for `id` with a transport failure.
    pub async fn fail(&self, id: &MessageId, reason: impl Into<String>) -> bool {
        let entry = self.inner.lock().await.remove(id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Completion::Failed(reason.into()));
                true
            }
            None => false,
        }
    }

    /// Complete every waiter with a synthetic internal-error response.
    ///
    /// Returns how many waiters were completed.
    pub async fn drain(&self, reason: &str) -> usize {
        let drained: Vec<(MessageId, PendingEntry)> =
            self.inner.lock().await.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(id = %id, method = %entry.method, "resolving pending request on teardown");
            let synthetic = ProtocolMessage::error_response(
                Some(id),
                ERROR_INTERNAL,
                format!("connection terminated: {}", reason),
            );
            let _ = entry.tx.send(Completion::Terminated(synthetic));
        }
        count
    }

    /// Whether `id` is awaiting a response.
    pub async fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    /// Number of waiters.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether there are no waiters.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    requests_completed: AtomicU64,
    requests_timed_out: AtomicU64,
    errors: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Transport-independent state of one live connection.
#[derive(Debug)]
pub struct ConnectionCore {
    id: ConnectionId,
    kind: TransportKind,
    server_id: Option<String>,
    status: watch::Sender<ConnectionStatus>,
    pending: PendingRequests,
    counters: Counters,
    buffer_size: AtomicUsize,
    started: Instant,
    started_at: DateTime<Utc>,
    request_timeout: Duration,
    gauge: ConnectionGauge,
}

impl ConnectionCore {
    /// Create a core in the `connecting` state with a fresh, never-reused id.
    pub fn new(kind: TransportKind, server_id: Option<String>, request_timeout: Duration) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            id: format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4()),
            kind,
            server_id,
            status,
            pending: PendingRequests::default(),
            counters: Counters::default(),
            buffer_size: AtomicUsize::new(0),
            started: Instant::now(),
            started_at: Utc::now(),
            request_timeout,
            gauge: ConnectionGauge::new(kind.as_str()),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport kind.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Pending-request table.
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// `connecting -> connected`.
    pub fn mark_connected(&self) {
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Connecting {
                *status = ConnectionStatus::Connected;
                true
            } else {
                false
            }
        });
    }

    /// Close the connection: `disconnected`, every pending request resolved.
    ///
    /// Safe to call repeatedly; an `error` status is kept.
    pub async fn mark_disconnected(&self, reason: &str) {
        self.finish(ConnectionStatus::Disconnected, reason).await;
    }

    /// Fail the connection: `error`, every pending request resolved.
    pub async fn mark_error(&self, reason: &str) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.finish(ConnectionStatus::Error, reason).await;
    }

    async fn finish(&self, target: ConnectionStatus, reason: &str) {
        self.status.send_if_modified(|status| match *status {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                *status = target;
                true
            }
            _ => false,
        });
        let drained = self.pending.drain(reason).await;
        if self.gauge.release() || drained > 0 {
            tracing::info!(
                connection_id = %self.id,
                kind = %self.kind,
                status = %self.status(),
                drained,
                reason,
                "connection finished"
            );
        }
    }

    /// Fail unless the connection is `connected`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectionInactive`] otherwise.
    pub fn ensure_active(&self) -> Result<()> {
        let status = self.status();
        if status == ConnectionStatus::Connected {
            Ok(())
        } else {
            Err(BridgeError::ConnectionInactive {
                id: self.id.clone(),
                status: status.to_string(),
            })
        }
    }

    /// Record bytes read from the transport.
    pub fn record_bytes_received(&self, n: usize) {
        self.counters
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Record the size of the framing buffer after a read.
    pub fn set_buffer_size(&self, n: usize) {
        self.buffer_size.store(n, Ordering::Relaxed);
    }

    /// Record a transport error that did not end the connection.
    pub fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Route one inbound message: responses complete their waiter;
    /// orphaned responses and server-initiated traffic are dropped.
    pub async fn handle_inbound(&self, msg: ProtocolMessage) {
        self.counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        match msg.kind() {
            Some(MessageKind::Response) if msg.id.is_some() => {
                let id = msg.id.clone();
                if !self.pending.resolve(msg).await {
                    tracing::debug!(
                        connection_id = %self.id,
                        id = ?id,
                        "dropping response with no pending request"
                    );
                }
            }
            other => {
                tracing::debug!(
                    connection_id = %self.id,
                    kind = ?other,
                    method = ?msg.method,
                    "ignoring inbound message that is not a correlated response"
                );
            }
        }
    }

    /// The shared send path for every adapter.
    ///
    /// Validates the connection and the message, registers a waiter for
    /// requests, hands the encoded line to `write`, and then waits for the
    /// correlated response (requests) or returns `None` (notifications).
    ///
    /// # Errors
    ///
    /// `ConnectionInactive`, `InvalidMessage`, whatever `write` returns,
    /// `Timeout`, `Terminated`, or `Transport`.
    pub async fn send<F, Fut>(
        &self,
        message: ProtocolMessage,
        write: F,
    ) -> Result<Option<ProtocolMessage>>
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.ensure_active()?;
        let kind = message.validate()?;
        let line = encode(&message)?;
        let len = line.len() as u64;

        let waiter = match (kind, &message.id) {
            (MessageKind::Request, Some(id)) => {
                let method = message.method.clone().unwrap_or_default();
                let rx = self.pending.register(id.clone(), &method).await?;
                Some((id.clone(), method, rx))
            }
            _ => None,
        };

        if let Err(e) = write(line).await {
            self.record_error();
            if let Some((id, _, _)) = &waiter {
                self.pending.expire(id).await;
            }
            return Err(e);
        }

        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        telemetry::record_message_sent(self.kind.as_str());

        match waiter {
            Some((id, method, rx)) => self.await_response(id, method, rx).await.map(Some),
            None => Ok(None),
        }
    }

    /// Wait for the waiter registered under `id`, enforcing the deadline.
    ///
    /// # Errors
    ///
    /// `Timeout`, `Terminated`, or `Transport`.
    pub async fn await_response(
        &self,
        id: MessageId,
        method: String,
        mut rx: oneshot::Receiver<Completion>,
    ) -> Result<ProtocolMessage> {
        let outcome = match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.pending.expire(&id).await {
                    self.counters
                        .requests_timed_out
                        .fetch_add(1, Ordering::Relaxed);
                    telemetry::record_timeout(self.kind.as_str());
                    tracing::warn!(
                        connection_id = %self.id,
                        id = %id,
                        method = %method,
                        "request timed out"
                    );
                    return Err(BridgeError::Timeout {
                        id: id.to_string(),
                        method,
                        after: self.request_timeout,
                    });
                }
                // Completed in the same instant the deadline fired; the
                // completion is already in the channel.
                rx.await
            }
        };

        match outcome {
            Ok(Completion::Response(msg)) => {
                self.counters
                    .requests_completed
                    .fetch_add(1, Ordering::Relaxed);
                Ok(msg)
            }
            Ok(Completion::Terminated(synthetic)) => Err(BridgeError::Terminated(
                synthetic
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "connection terminated".to_string()),
            )),
            Ok(Completion::Failed(reason)) => Err(BridgeError::Transport(reason)),
            Err(_) => Err(BridgeError::Terminated(
                "connection dropped before a response arrived".to_string(),
            )),
        }
    }

    /// Build the `get_status` report.
    pub async fn status_report(&self) -> StatusReport {
        StatusReport {
            status: self.status(),
            uptime: self.started.elapsed().as_secs(),
            metrics: self.metrics().await,
            transport: Some(self.kind),
            server_id: self.server_id.clone(),
            started_at: Some(self.started_at),
        }
    }

    /// Snapshot the counters and gauges.
    pub async fn metrics(&self) -> ConnectionMetrics {
        let c = &self.counters;
        ConnectionMetrics {
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            requests_completed: c.requests_completed.load(Ordering::Relaxed),
            requests_timed_out: c.requests_timed_out.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            pending_requests: self.pending.len().await,
            buffer_size: self.buffer_size.load(Ordering::Relaxed),
        }
    }
}

/// The `initialize()` gate every adapter carries.
#[derive(Debug, Default)]
pub struct InitGate(AtomicBool);

impl InitGate {
    /// Open the gate. Returns `true` only for the first call.
    pub fn open(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Fail with [`BridgeError::NotInitialized`] until the gate is open.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotInitialized`] before [`InitGate::open`].
    pub fn check(&self) -> Result<()> {
        if self.0.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BridgeError::NotInitialized)
        }
    }
}

/// Anything an adapter keeps per connection, as long as it exposes a core.
pub trait HasCore: Send + Sync {
    /// The transport-independent state.
    fn core(&self) -> &Arc<ConnectionCore>;
}

/// Connection id -> live connection, plus a short memory of closed ones.
#[derive(Debug)]
pub struct ConnectionTable<C> {
    live: RwLock<HashMap<ConnectionId, Arc<C>>>,
    retired: std::sync::Mutex<VecDeque<Arc<ConnectionCore>>>,
}

impl<C> Default for ConnectionTable<C> {
    fn default() -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            retired: std::sync::Mutex::new(VecDeque::new()),
        }
    }
}

impl<C: HasCore> ConnectionTable<C> {
    /// Register a live connection under its core's id.
    pub async fn insert(&self, conn: Arc<C>) -> ConnectionId {
        let id = conn.core().id().to_string();
        self.live.write().await.insert(id.clone(), conn);
        id
    }

    /// Look up a live connection.
    pub async fn get(&self, id: &str) -> Option<Arc<C>> {
        self.live.read().await.get(id).cloned()
    }

    /// Look up a live connection or fail with `ConnectionNotFound`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectionNotFound`] for unknown ids.
    pub async fn require(&self, id: &str) -> Result<Arc<C>> {
        self.get(id)
            .await
            .ok_or_else(|| BridgeError::ConnectionNotFound(id.to_string()))
    }

    /// Remove a live connection, remembering its core for status queries.
    ///
    /// Returns `None` when the id is unknown or already removed, which is
    /// what makes closing idempotent.
    pub async fn remove(&self, id: &str) -> Option<Arc<C>> {
        let conn = self.live.write().await.remove(id)?;
        if let Ok(mut retired) = self.retired.lock() {
            if retired.len() >= RETIRED_CAPACITY {
                retired.pop_front();
            }
            retired.push_back(Arc::clone(conn.core()));
        }
        Some(conn)
    }

    /// Ids of every live connection.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.live.read().await.keys().cloned().collect()
    }

    /// Status of a live or recently closed connection, or the sentinel.
    pub async fn status(&self, id: &str) -> StatusReport {
        if let Some(conn) = self.get(id).await {
            return conn.core().status_report().await;
        }
        let retired = self
            .retired
            .lock()
            .ok()
            .and_then(|r| r.iter().find(|core| core.id() == id).cloned());
        match retired {
            Some(core) => core.status_report().await,
            None => StatusReport::unknown(),
        }
    }
}
