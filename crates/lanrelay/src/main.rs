//! # lanrelay
//!
//! LAN `WebSocket` relay binary: loads configuration, installs logging and
//! metrics, runs the relay until Ctrl-C, then stops it gracefully.

#![deny(unsafe_code)]

mod logging;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lanrelay_server::{RelayServer, ServerConfig};

/// LAN `WebSocket` relay server.
#[derive(Parser, Debug)]
#[command(name = "lanrelay", about = "Relay every text message to every connected WebSocket client")]
struct Cli {
    /// JSON config file, deep-merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config and env).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config and env).
    #[arg(long)]
    port: Option<u16>,

    /// Path at which upgrades are accepted (overrides config and env).
    #[arg(long)]
    path: Option<String>,

    /// Do not relay a message back to its sender.
    #[arg(long)]
    no_echo: bool,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Apply explicit flags over the loaded configuration.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.path {
            config.path.clone_from(path);
        }
        if self.no_echo {
            config.echo_to_sender = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    logging::init_subscriber(&args.log_level, args.log_json);

    let mut config =
        settings::load_config(args.config.as_deref()).context("Failed to load settings")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let mut server = RelayServer::new(config);
    match lanrelay_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled"),
    }
    let server = Arc::new(server);

    // start() blocks for the server's lifetime; keep it off the signal path.
    let mut runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutting down...");
            server.stop().await;
        }
        finished = &mut runner => {
            return finished
                .context("Server task panicked")?
                .context("Server failed");
        }
    }

    runner
        .await
        .context("Server task panicked")?
        .context("Server failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}
