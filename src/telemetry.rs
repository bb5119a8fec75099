//! Process-wide bridge metrics
//!
//! Per-connection counters live on each connection and are reported by
//! `get_status`. This module emits the aggregate series through the
//! `metrics` facade so they can be scraped when an exporter is installed.
//!
//! # Metrics
//!
//! - `bridge_connections_total`: Counter of connections created, by kind
//! - `bridge_connections_active`: Gauge of live connections, by kind
//! - `bridge_messages_sent_total`: Counter of outbound messages, by kind
//! - `bridge_request_timeouts_total`: Counter of requests that hit their deadline
//! - `bridge_malformed_frames_total`: Counter of discarded inbound lines
//!
//! # Examples
//!
//! ```
//! use mcp_bridge::telemetry::ConnectionGauge;
//!
//! let gauge = ConnectionGauge::new("stdio");
//! gauge.release();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use metrics::{decrement_gauge, increment_counter, increment_gauge};

/// Tracks one connection's contribution to `bridge_connections_active`.
///
/// The gauge is incremented on construction and decremented exactly once,
/// either by [`ConnectionGauge::release`] or on drop.
#[derive(Debug)]
pub struct ConnectionGauge {
    kind: &'static str,
    released: AtomicBool,
}

impl ConnectionGauge {
    /// Count a new connection of the given transport kind.
    pub fn new(kind: &'static str) -> Self {
        increment_counter!("bridge_connections_total", "kind" => kind);
        increment_gauge!("bridge_connections_active", 1.0, "kind" => kind);

        Self {
            kind,
            released: AtomicBool::new(false),
        }
    }

    /// Remove the connection from the active gauge. Later calls are no-ops.
    ///
    /// Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        decrement_gauge!("bridge_connections_active", 1.0, "kind" => self.kind);
        true
    }

    /// Whether the gauge has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        self.release();
    }
}

/// Count one outbound message.
pub fn record_message_sent(kind: &'static str) {
    increment_counter!("bridge_messages_sent_total", "kind" => kind);
}

/// Count one request that reached its deadline.
pub fn record_timeout(kind: &'static str) {
    increment_counter!("bridge_request_timeouts_total", "kind" => kind);
}

/// Count one discarded inbound frame.
pub fn record_malformed_frame() {
    increment_counter!("bridge_malformed_frames_total");
}

/// Initializes the metrics exporter for Prometheus
///
/// Only has an effect when compiled with the `prometheus` feature; it is
/// still safe to call otherwise.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let builder = PrometheusBuilder::new();
        let _ = builder.install().map_err(|e| {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        });
    }
}
