//! Command-line interface definition for mcp-bridge
//!
//! This module defines the CLI structure using clap's derive API:
//! `serve` runs the control protocol on stdin/stdout, `detect` prints what
//! transport a server config resolves to.

use clap::{Parser, Subcommand};

/// mcp-bridge - one connection contract for stdio, HTTP, WebSocket and SSE servers
///
/// Drive it over stdin/stdout with line-delimited `{method, args}` requests.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mcp-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines (still on stderr)
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Override the per-request deadline in milliseconds
    #[arg(long, global = true)]
    pub request_timeout_ms: Option<u64>,

    /// Disable live detection probes
    #[arg(long, global = true)]
    pub no_probe: bool,

    /// Command to execute; defaults to `serve`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run the control protocol on stdin/stdout
    Serve,

    /// Detect which transport a server config resolves to
    Detect {
        /// Executable for a process server
        #[arg(long)]
        command: Option<String>,

        /// Arguments for the executable
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Endpoint for a network server
        #[arg(long)]
        url: Option<String>,

        /// Bare local port (implies http://127.0.0.1:<port>)
        #[arg(long)]
        port: Option<u16>,

        /// Explicit transport hint (stdio, http, websocket, sse)
        #[arg(long)]
        transport: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The subcommand to run, `serve` when none was given.
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}
