//! Vitals Binary Entry Point
//!
//! Runs the standalone collector: accepts monitor connections and logs
//! every received snapshot. Core functionality is provided by the `vitals`
//! library crate.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vitals::{AppConfig, CollectorServer, Delivery, DeliverySink, Snapshot};

/// Vitals - Live-Instance Telemetry Collector
#[derive(Parser, Debug)]
#[command(name = "vitals", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, env = "VITALS_CONFIG")]
    config: Option<String>,

    /// Bind host (overrides config file)
    #[arg(long, env = "VITALS_BIND")]
    bind: Option<String>,

    /// Listening port (overrides config file)
    #[arg(long, env = "VITALS_PORT")]
    port: Option<u16>,
}

/// Reference consumer: decode what decodes, log the rest raw.
struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn deliver(&self, delivery: Delivery) {
        match Snapshot::decode(&delivery.payload) {
            Ok(snapshot) => {
                tracing::info!(peer = %delivery.peer, "{snapshot}");
            }
            Err(e) => {
                tracing::warn!(
                    peer = %delivery.peer,
                    error = %e,
                    bytes = delivery.payload.len(),
                    "Received undecodable frame"
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vitals=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Vitals - Live-Instance Telemetry Collector");

    let cli = Cli::parse();

    // Load configuration (CLI > ENV > config file > defaults)
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path);
            AppConfig::load(path)?
        }
        None => AppConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;

    let addr: SocketAddr = config.server.socket_addr()?;
    let server = CollectorServer::start(addr, Arc::new(LogSink)).await?;

    tracing::info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;

    tracing::info!("Shutting down collector...");
    server.stop().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
