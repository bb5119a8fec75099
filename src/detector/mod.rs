//! Transport detection
//!
//! [`TransportDetector`] decides which adapter a [`ServerConfig`] belongs
//! to. It holds a priority-ordered list of [`DetectionStrategy`]
//! implementations; `detect_transport` asks each in ascending priority
//! order and returns the first positive answer. Built-in strategies live
//! in [`strategies`]; callers may register more at runtime.
//!
//! # Confidence
//!
//! A strategy answers [`Detection::NoMatch`], [`Detection::Matched`]
//! (worth 0.8) or an explicit [`Detection::Confidence`]. The exact numbers
//! are heuristics; what matters is the ordering
//! confirmed (1.0) > unconfirmed success > unconfirmed failure > none (0).
//! A confidence of 0 is not a positive result and evaluation continues.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::DetectorConfig;
use crate::error::{BridgeError, Result};
use crate::transport::{ServerConfig, TransportKind};

pub mod strategies;

pub use strategies::ProbeSettings;

/// Priority given to runtime-registered strategies that do not name one;
/// they run after every built-in.
pub const DEFAULT_CUSTOM_PRIORITY: u32 = 1000;

/// Confidence a bare [`Detection::Matched`] is worth.
pub const MATCHED_CONFIDENCE: f64 = 0.8;

/// One strategy's answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Detection {
    /// The config is not for this transport
    NoMatch,
    /// The config is for this transport, unconfirmed
    Matched,
    /// Explicit confidence in `[0, 1]`
    Confidence(f64),
}

impl Detection {
    /// The answer as a number in `[0, 1]`.
    pub fn confidence(&self) -> f64 {
        match self {
            Detection::NoMatch => 0.0,
            Detection::Matched => MATCHED_CONFIDENCE,
            Detection::Confidence(c) if c.is_nan() => 0.0,
            Detection::Confidence(c) => c.clamp(0.0, 1.0),
        }
    }

    /// Whether this answer ends the search.
    pub fn is_positive(&self) -> bool {
        self.confidence() > 0.0
    }
}

impl From<bool> for Detection {
    fn from(matched: bool) -> Self {
        if matched {
            Detection::Matched
        } else {
            Detection::NoMatch
        }
    }
}

/// A pluggable detection heuristic.
#[async_trait::async_trait]
pub trait DetectionStrategy: Send + Sync + fmt::Debug {
    /// Name used in logs and listings.
    fn name(&self) -> &str;

    /// The transport this strategy votes for.
    fn kind(&self) -> TransportKind;

    /// Lower runs first.
    fn priority(&self) -> u32;

    /// Judge `config`.
    async fn detect(&self, config: &ServerConfig) -> Detection;
}

/// Transport-specific capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Server can push messages without a request
    pub streaming: bool,
    /// Both sides can initiate messages on the same channel
    pub bidirectional: bool,
    /// Channel carries arbitrary bytes
    pub binary_safe: bool,
    /// Channel can carry auth headers
    pub supports_auth: bool,
    /// Channel is encrypted
    pub supports_tls: bool,
}

impl TransportCapabilities {
    /// Capabilities of `kind` as configured by `config`.
    pub fn for_kind(kind: TransportKind, config: &ServerConfig) -> Self {
        let tls = config
            .effective_url()
            .and_then(|u| url::Url::parse(&u).ok())
            .map(|u| matches!(u.scheme(), "https" | "wss"))
            .unwrap_or(false);
        match kind {
            TransportKind::Stdio => Self {
                streaming: true,
                bidirectional: true,
                binary_safe: true,
                ..Self::default()
            },
            TransportKind::Http => Self {
                supports_auth: true,
                supports_tls: tls,
                ..Self::default()
            },
            TransportKind::WebSocket => Self {
                streaming: true,
                bidirectional: true,
                binary_safe: true,
                supports_auth: true,
                supports_tls: tls,
            },
            TransportKind::Sse => Self {
                streaming: true,
                supports_auth: true,
                supports_tls: tls,
                ..Self::default()
            },
            TransportKind::Unknown => Self::default(),
        }
    }
}

/// What `detect_transport` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Chosen transport, or `unknown`
    #[serde(rename = "type")]
    pub kind: TransportKind,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Capability flags for the chosen transport
    pub details: TransportCapabilities,
    /// Strategy that produced the answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl DetectionResult {
    /// The "nothing matched" answer.
    pub fn unknown() -> Self {
        Self {
            kind: TransportKind::Unknown,
            confidence: 0.0,
            details: TransportCapabilities::default(),
            strategy: None,
        }
    }

    /// Whether a transport was chosen.
    pub fn is_known(&self) -> bool {
        self.kind != TransportKind::Unknown
    }
}

type DetectFn = dyn Fn(ServerConfig) -> BoxFuture<'static, Detection> + Send + Sync;

/// A strategy built from a closure by [`TransportDetector::register_fn`].
struct FnStrategy {
    name: String,
    kind: TransportKind,
    priority: u32,
    detect: Box<DetectFn>,
}

impl fmt::Debug for FnStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStrategy")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl DetectionStrategy for FnStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn detect(&self, config: &ServerConfig) -> Detection {
        (self.detect)(config.clone()).await
    }
}

/// Priority-ordered set of detection strategies.
///
/// # Examples
///
/// ```
/// use mcp_bridge::config::DetectorConfig;
/// use mcp_bridge::detector::TransportDetector;
/// use mcp_bridge::transport::{ServerConfig, TransportKind};
///
/// # #[tokio::main]
/// # async fn main() {
/// let detector = TransportDetector::new(&DetectorConfig {
///     probe_enabled: false,
///     ..DetectorConfig::default()
/// });
/// let result = detector
///     .detect_transport(&ServerConfig::remote("ws://localhost:8080"))
///     .await;
/// assert_eq!(result.kind, TransportKind::WebSocket);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct TransportDetector {
    strategies: RwLock<Vec<Arc<dyn DetectionStrategy>>>,
}

impl TransportDetector {
    /// A detector with the four built-in strategies.
    pub fn new(config: &DetectorConfig) -> Self {
        let detector = Self::empty();
        for strategy in strategies::builtin(ProbeSettings::from(config)) {
            detector.insert(strategy);
        }
        detector
    }

    /// A detector with no strategies at all.
    pub fn empty() -> Self {
        Self::default()
    }

    fn insert(&self, strategy: Arc<dyn DetectionStrategy>) {
        if let Ok(mut strategies) = self.strategies.write() {
            // Stable: equal priorities keep registration order.
            let at = strategies.partition_point(|s| s.priority() <= strategy.priority());
            strategies.insert(at, strategy);
        }
    }

    /// Add a strategy.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] if the name is empty or
    /// already registered.
    pub fn register(&self, strategy: Arc<dyn DetectionStrategy>) -> Result<()> {
        let name = strategy.name().trim().to_string();
        if name.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "detection strategy needs a name".to_string(),
            ));
        }
        if self.strategy_names().iter().any(|n| *n == name) {
            return Err(BridgeError::InvalidConfig(format!(
                "detection strategy `{}` is already registered",
                name
            )));
        }
        tracing::debug!(strategy = %name, kind = %strategy.kind(), priority = strategy.priority(), "registered detection strategy");
        self.insert(strategy);
        Ok(())
    }

    /// Add a strategy from a closure. `priority` defaults to
    /// [`DEFAULT_CUSTOM_PRIORITY`].
    ///
    /// # Errors
    ///
    /// Same as [`TransportDetector::register`].
    pub fn register_fn<F, Fut>(
        &self,
        name: impl Into<String>,
        kind: TransportKind,
        priority: Option<u32>,
        detect: F,
    ) -> Result<()>
    where
        F: Fn(ServerConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Detection> + Send + 'static,
    {
        self.register(Arc::new(FnStrategy {
            name: name.into(),
            kind,
            priority: priority.unwrap_or(DEFAULT_CUSTOM_PRIORITY),
            detect: Box::new(move |config| Box::pin(detect(config))),
        }))
    }

    /// Strategy names in evaluation order.
    pub fn strategy_names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn DetectionStrategy>> {
        self.strategies
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Run strategies in priority order and return the first positive
    /// answer, or [`DetectionResult::unknown`].
    pub async fn detect_transport(&self, config: &ServerConfig) -> DetectionResult {
        for strategy in self.snapshot() {
            let detection = strategy.detect(config).await;
            tracing::debug!(
                strategy = strategy.name(),
                kind = %strategy.kind(),
                server = %config.label(),
                detection = ?detection,
                "evaluated detection strategy"
            );
            if detection.is_positive() {
                let kind = strategy.kind();
                return DetectionResult {
                    kind,
                    confidence: detection.confidence(),
                    details: TransportCapabilities::for_kind(kind, config),
                    strategy: Some(strategy.name().to_string()),
                };
            }
        }
        DetectionResult::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> TransportDetector {
        TransportDetector::new(&DetectorConfig {
            probe_enabled: false,
            ..DetectorConfig::default()
        })
    }

    #[test]
    fn test_confidence_scaling() {
        assert_eq!(Detection::NoMatch.confidence(), 0.0);
        assert_eq!(Detection::Matched.confidence(), 0.8);
        assert_eq!(Detection::Confidence(1.7).confidence(), 1.0);
        assert_eq!(Detection::Confidence(f64::NAN).confidence(), 0.0);
        assert!(!Detection::Confidence(0.0).is_positive());
        assert_eq!(Detection::from(true), Detection::Matched);
    }

    #[test]
    fn test_builtin_order() {
        assert_eq!(
            offline().strategy_names(),
            vec!["sse", "websocket", "http", "stdio"]
        );
    }

    #[tokio::test]
    async fn test_nothing_matches_yields_unknown() {
        let result = offline().detect_transport(&ServerConfig::default()).await;
        assert_eq!(result, DetectionResult::unknown());
    }

    #[tokio::test]
    async fn test_static_matches_without_probes() {
        let detector = offline();
        let ws = detector
            .detect_transport(&ServerConfig::remote("wss://example.com/ws"))
            .await;
        assert_eq!(ws.kind, TransportKind::WebSocket);
        assert_eq!(ws.confidence, 0.8);
        assert!(ws.details.supports_tls);

        let stdio = detector
            .detect_transport(&ServerConfig::process("server", vec![]))
            .await;
        assert_eq!(stdio.kind, TransportKind::Stdio);
        assert!(stdio.details.binary_safe);

        let http = detector
            .detect_transport(&ServerConfig::remote("http://localhost:3000/mcp"))
            .await;
        assert_eq!(http.kind, TransportKind::Http);
    }

    #[tokio::test]
    async fn test_custom_strategy_runs_last_by_default() {
        let detector = TransportDetector::empty();
        detector
            .register_fn("always", TransportKind::Http, None, |_| async {
                Detection::Confidence(0.2)
            })
            .unwrap();
        detector
            .register_fn("never", TransportKind::Sse, Some(1), |_| async {
                Detection::NoMatch
            })
            .unwrap();
        assert_eq!(detector.strategy_names(), vec!["never", "always"]);

        let result = detector.detect_transport(&ServerConfig::default()).await;
        assert_eq!(result.kind, TransportKind::Http);
        assert_eq!(result.confidence, 0.2);
        assert_eq!(result.strategy.as_deref(), Some("always"));
    }

    #[tokio::test]
    async fn test_custom_strategy_can_preempt_builtins() {
        let detector = offline();
        detector
            .register_fn("docker", TransportKind::Http, Some(0), |cfg| async move {
                Detection::from(cfg.command.as_deref() == Some("docker"))
            })
            .unwrap();
        let result = detector
            .detect_transport(&ServerConfig::process("docker", vec![]))
            .await;
        assert_eq!(result.kind, TransportKind::Http);
    }

    #[test]
    fn test_register_rejects_empty_and_duplicate_names() {
        let detector = offline();
        assert!(detector
            .register_fn(" ", TransportKind::Http, None, |_| async { Detection::NoMatch })
            .is_err());
        assert!(detector
            .register_fn("http", TransportKind::Http, None, |_| async { Detection::NoMatch })
            .is_err());
    }

    #[test]
    fn test_result_serializes_type_field() {
        let value = serde_json::to_value(DetectionResult::unknown()).unwrap();
        assert_eq!(value["type"], "unknown");
        assert_eq!(value["confidence"], 0.0);
        assert_eq!(value["details"]["streaming"], false);
    }
}
