//! rtun-server - Tunnel server component.
//!
//! Runs on a publicly reachable host to accept tunnels and expose their ports.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rtun_core::ShutdownSignal;
use rtun_server::{ServerConfig, TunnelServer};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration
    let config = ServerConfig::parse();

    // Initialize logging; RUST_LOG overrides --debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if config.debug { "debug" } else { "info" }));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting rtun-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Public host: {}", config.public_host);

    let shutdown = ShutdownSignal::default();
    let server = Arc::new(TunnelServer::new(config, shutdown.clone())?);
    let listener = server.bind().await?;

    // Wait for shutdown signal
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait_for_signal().await });

    server.run(listener).await;
    Ok(())
}
