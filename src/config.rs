//! Configuration management for mcp-bridge
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for the bridge
///
/// Every field has a default, so an empty (or missing) file is a valid
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Adapter tunables shared by every transport
    #[serde(default)]
    pub transport: TransportConfig,

    /// Transport detection settings
    #[serde(default)]
    pub detector: DetectorConfig,
}

/// Adapter tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Deadline for a request's correlated response (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Grace between SIGTERM and a forced kill on close (milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Whether spawned servers inherit the bridge's environment
    #[serde(default = "default_true")]
    pub inherit_env: bool,

    /// Largest inbound buffer kept without seeing a newline (bytes)
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    /// Timeout for individual HTTP requests and connects (milliseconds)
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_max_buffer_bytes() -> usize {
    crate::protocol::framing::DEFAULT_MAX_BUFFER_BYTES
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            inherit_env: default_true(),
            max_buffer_bytes: default_max_buffer_bytes(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

/// Transport detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Run live probes; when off, strategies report static confidence
    #[serde(default = "default_true")]
    pub probe_enabled: bool,

    /// Timeout for a single probe (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Name the stdio probe looks for in `--version` output
    #[serde(default = "default_protocol_name")]
    pub protocol_name: String,
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_protocol_name() -> String {
    "mcp".to_string()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            probe_enabled: default_true(),
            probe_timeout_ms: default_probe_timeout_ms(),
            protocol_name: default_protocol_name(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the file exists but cannot be
    /// read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read config file: {}", e)))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config: {}", e)))
    }

    fn apply_env_vars(&mut self) {
        if let Ok(timeout) = std::env::var("MCP_BRIDGE_REQUEST_TIMEOUT_MS") {
            if let Ok(value) = timeout.parse() {
                self.transport.request_timeout_ms = value;
            } else {
                tracing::warn!("Invalid MCP_BRIDGE_REQUEST_TIMEOUT_MS: {}", timeout);
            }
        }

        if let Ok(grace) = std::env::var("MCP_BRIDGE_SHUTDOWN_GRACE_MS") {
            if let Ok(value) = grace.parse() {
                self.transport.shutdown_grace_ms = value;
            } else {
                tracing::warn!("Invalid MCP_BRIDGE_SHUTDOWN_GRACE_MS: {}", grace);
            }
        }

        if let Ok(enabled) = std::env::var("MCP_BRIDGE_PROBE_ENABLED") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.detector.probe_enabled = true,
                "0" | "false" | "no" | "off" => self.detector.probe_enabled = false,
                _ => tracing::warn!("Invalid MCP_BRIDGE_PROBE_ENABLED: {}", enabled),
            }
        }

        if let Ok(timeout) = std::env::var("MCP_BRIDGE_PROBE_TIMEOUT_MS") {
            if let Ok(value) = timeout.parse() {
                self.detector.probe_timeout_ms = value;
            } else {
                tracing::warn!("Invalid MCP_BRIDGE_PROBE_TIMEOUT_MS: {}", timeout);
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(timeout) = cli.request_timeout_ms {
            self.transport.request_timeout_ms = timeout;
        }
        if cli.no_probe {
            self.detector.probe_enabled = false;
        }
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.transport.request_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "transport.request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.transport.http_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "transport.http_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.transport.max_buffer_bytes == 0 {
            return Err(BridgeError::Config(
                "transport.max_buffer_bytes must be greater than 0".to_string(),
            ));
        }

        if self.detector.probe_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "detector.probe_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.detector.protocol_name.trim().is_empty() {
            return Err(BridgeError::Config(
                "detector.protocol_name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
