//! Built-in detection strategies
//!
//! | Strategy    | Priority | Matches on                                  | Probe                          |
//! |-------------|----------|---------------------------------------------|--------------------------------|
//! | `sse`       | 10       | `sse` hint, or an event-stream-looking path  | `GET` with `Accept: text/event-stream` |
//! | `websocket` | 20       | `websocket` hint, or a `ws(s)://` URL        | none                           |
//! | `http`      | 30       | `http` hint, `http(s)://` URL, or bare port  | `OPTIONS`                      |
//! | `stdio`     | 40       | `stdio` hint or a `command`                  | `<command> --version`          |
//!
//! With probes disabled every heuristic match reports
//! [`Detection::Matched`].

use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::config::DetectorConfig;
use crate::detector::{Detection, DetectionStrategy};
use crate::transport::{ServerConfig, TransportKind};

/// Live-probe settings shared by the built-in strategies.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Whether probes run at all
    pub enabled: bool,
    /// Timeout for one probe
    pub timeout: Duration,
    /// Protocol name looked for in probe output and response headers
    pub protocol_name: String,
}

impl From<&DetectorConfig> for ProbeSettings {
    fn from(cfg: &DetectorConfig) -> Self {
        Self {
            enabled: cfg.probe_enabled,
            timeout: Duration::from_millis(cfg.probe_timeout_ms),
            protocol_name: cfg.protocol_name.to_lowercase(),
        }
    }
}

/// The four built-ins, in no particular order.
pub fn builtin(probe: ProbeSettings) -> Vec<Arc<dyn DetectionStrategy>> {
    let client = reqwest::Client::new();
    vec![
        Arc::new(SseStrategy {
            probe: probe.clone(),
            client: client.clone(),
        }),
        Arc::new(WebSocketStrategy),
        Arc::new(HttpStrategy {
            probe: probe.clone(),
            client,
        }),
        Arc::new(StdioStrategy { probe }),
    ]
}

/// `None` when there is no hint; `Some(true)` when the hint names `kind`.
fn hint_is(config: &ServerConfig, kind: TransportKind) -> Option<bool> {
    config.transport_hint.map(|hint| hint == kind)
}

fn parsed_url(config: &ServerConfig) -> Option<Url> {
    config.effective_url().and_then(|u| Url::parse(&u).ok())
}

fn event_stream_path() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)(^|/)(sse|events?|event-stream|stream)(/|$)").ok())
        .as_ref()
}

/// Whether a URL path suggests an event stream (`/sse`, `/events`, ...).
pub fn looks_like_event_stream(url: &Url) -> bool {
    event_stream_path().is_some_and(|re| re.is_match(url.path()))
}

enum StreamProbe {
    /// Responded with `text/event-stream`
    Confirmed,
    /// Responded with something else
    WrongType,
    /// Could not connect
    Unreachable,
}

/// Event-stream detection by hint or path, confirmed by content type.
#[derive(Debug)]
pub struct SseStrategy {
    probe: ProbeSettings,
    client: reqwest::Client,
}

impl SseStrategy {
    async fn probe_stream(&self, url: &Url, config: &ServerConfig) -> StreamProbe {
        let mut req = self
            .client
            .get(url.as_str())
            .header("Accept", "text/event-stream")
            .timeout(self.probe.timeout);
        for (k, v) in &config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        // Only the headers are inspected; dropping the response closes the
        // stream.
        match req.send().await {
            Ok(response) => {
                let is_stream = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|ct| ct.contains("text/event-stream"))
                    .unwrap_or(false);
                if is_stream && response.status().is_success() {
                    StreamProbe::Confirmed
                } else {
                    StreamProbe::WrongType
                }
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "event-stream probe failed");
                StreamProbe::Unreachable
            }
        }
    }
}

#[async_trait::async_trait]
impl DetectionStrategy for SseStrategy {
    fn name(&self) -> &str {
        "sse"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn priority(&self) -> u32 {
        10
    }

    async fn detect(&self, config: &ServerConfig) -> Detection {
        let hinted = match hint_is(config, TransportKind::Sse) {
            Some(false) => return Detection::NoMatch,
            Some(true) => true,
            None => false,
        };
        let Some(url) = parsed_url(config).filter(|u| matches!(u.scheme(), "http" | "https"))
        else {
            return Detection::from(hinted);
        };
        if !hinted && !looks_like_event_stream(&url) {
            return Detection::NoMatch;
        }
        if !self.probe.enabled {
            return Detection::Matched;
        }

        match (self.probe_stream(&url, config).await, hinted) {
            (StreamProbe::Confirmed, _) => Detection::Confidence(1.0),
            (_, true) => Detection::Matched,
            (StreamProbe::WrongType, false) => Detection::NoMatch,
            (StreamProbe::Unreachable, false) => Detection::Confidence(0.3),
        }
    }
}

/// `ws(s)://` URLs; nothing to probe.
#[derive(Debug)]
pub struct WebSocketStrategy;

#[async_trait::async_trait]
impl DetectionStrategy for WebSocketStrategy {
    fn name(&self) -> &str {
        "websocket"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn priority(&self) -> u32 {
        20
    }

    async fn detect(&self, config: &ServerConfig) -> Detection {
        match hint_is(config, TransportKind::WebSocket) {
            Some(matched) => Detection::from(matched),
            None => Detection::from(
                parsed_url(config).is_some_and(|u| matches!(u.scheme(), "ws" | "wss")),
            ),
        }
    }
}

/// `http(s)://` URLs or a bare port, confirmed with `OPTIONS`.
#[derive(Debug)]
pub struct HttpStrategy {
    probe: ProbeSettings,
    client: reqwest::Client,
}

impl HttpStrategy {
    async fn probe_options(&self, url: &Url, config: &ServerConfig) -> Detection {
        let mut req = self
            .client
            .request(reqwest::Method::OPTIONS, url.as_str())
            .timeout(self.probe.timeout);
        for (k, v) in &config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let response = match req.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "OPTIONS probe failed");
                return Detection::Confidence(0.0);
            }
        };

        let version_header = format!("{}-protocol-version", self.probe.protocol_name);
        let session_header = format!("{}-session-id", self.probe.protocol_name);
        let identified = response
            .headers()
            .keys()
            .any(|name| name.as_str() == version_header || name.as_str() == session_header);

        if identified {
            Detection::Confidence(1.0)
        } else if !response.status().is_server_error() {
            Detection::Confidence(0.7)
        } else {
            Detection::Confidence(0.3)
        }
    }
}

#[async_trait::async_trait]
impl DetectionStrategy for HttpStrategy {
    fn name(&self) -> &str {
        "http"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn priority(&self) -> u32 {
        30
    }

    async fn detect(&self, config: &ServerConfig) -> Detection {
        let hinted = match hint_is(config, TransportKind::Http) {
            Some(false) => return Detection::NoMatch,
            Some(true) => true,
            None => false,
        };
        let bare_port = config.url.is_none() && config.port.is_some() && config.command.is_none();
        let url = parsed_url(config).filter(|u| matches!(u.scheme(), "http" | "https"));
        let Some(url) = url.filter(|_| hinted || bare_port || config.url.is_some()) else {
            return Detection::from(hinted);
        };
        if !self.probe.enabled {
            return Detection::Matched;
        }

        let probed = self.probe_options(&url, config).await;
        if hinted && probed.confidence() < Detection::Matched.confidence() {
            Detection::Matched
        } else {
            probed
        }
    }
}

/// A `command`, confirmed with `<command> --version`.
#[derive(Debug)]
pub struct StdioStrategy {
    probe: ProbeSettings,
}

impl StdioStrategy {
    async fn probe_version(&self, command: &str, config: &ServerConfig) -> Detection {
        let mut cmd = tokio::process::Command::new(command);
        cmd.arg("--version")
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(command, error = %e, "version probe could not spawn");
                return Detection::Confidence(0.0);
            }
        };

        match tokio::time::timeout(self.probe.timeout, child.wait_with_output()).await {
            Err(_) => Detection::Confidence(0.5),
            Ok(Err(e)) => {
                tracing::debug!(command, error = %e, "version probe failed");
                Detection::Confidence(0.0)
            }
            Ok(Ok(output)) => {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                )
                .to_lowercase();
                if text.contains(&self.probe.protocol_name) {
                    Detection::Confidence(1.0)
                } else if output.status.success() {
                    Detection::Matched
                } else {
                    Detection::Confidence(0.4)
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl DetectionStrategy for StdioStrategy {
    fn name(&self) -> &str {
        "stdio"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn priority(&self) -> u32 {
        40
    }

    async fn detect(&self, config: &ServerConfig) -> Detection {
        if hint_is(config, TransportKind::Stdio) == Some(false) {
            return Detection::NoMatch;
        }
        let Some(command) = config.command.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Detection::NoMatch;
        };
        if !self.probe.enabled {
            return Detection::Matched;
        }
        self.probe_version(command, config).await
    }
}
