//! mcp-bridge - transport bridge for JSON-RPC servers
//!
#![doc = "mcp-bridge - transport bridge for JSON-RPC servers"]
#![doc = "Main entry point: the control-protocol runner and the detection CLI."]

use std::sync::Arc;

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_bridge::bridge::TransportBridge;
use mcp_bridge::cli::{Cli, Commands};
use mcp_bridge::config::BridgeConfig;
use mcp_bridge::runner;
use mcp_bridge::transport::{ServerConfig, TransportKind};

const DEFAULT_CONFIG_PATH: &str = "mcp-bridge.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing; stdout belongs to the control protocol
    init_tracing(cli.verbose, cli.json_logs);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let config = BridgeConfig::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    mcp_bridge::telemetry::init_metrics_exporter();

    let bridge = Arc::new(TransportBridge::new(&config));

    match cli.command() {
        Commands::Serve => {
            tracing::info!(config = %config_path, "Starting control-protocol runner");
            let outcome = runner::serve_stdio(Arc::clone(&bridge)).await;
            bridge.shutdown().await;
            outcome
        }
        Commands::Detect {
            command,
            args,
            url,
            port,
            transport,
        } => {
            let transport_hint = transport
                .map(|t| serde_json::from_value::<TransportKind>(serde_json::Value::String(t)))
                .transpose()
                .map_err(|e| anyhow::anyhow!("invalid --transport: {}", e))?;
            let server = ServerConfig {
                command,
                args,
                url,
                port,
                transport_hint,
                ..ServerConfig::default()
            };
            tracing::debug!(server = %server.label(), "Running detection");

            let result = bridge.detect(&server).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose {
        "mcp_bridge=debug"
    } else {
        "mcp_bridge=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
