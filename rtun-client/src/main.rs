//! rtun-client - Tunnel client component.
//!
//! Runs behind NAT and exposes local services (or a SOCKS5 proxy) through
//! an rtun server.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rtun_client::{ClientConfig, TunnelClient, WorkerKind};
use rtun_core::ShutdownSignal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration
    let config = ClientConfig::parse();

    // Initialize logging; RUST_LOG overrides --debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if config.debug { "debug" } else { "info" }));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting rtun-client v{}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}", config.server);
    for entry in config.entries() {
        match entry.kind {
            WorkerKind::Relay { ref target_addr } => {
                info!("  relay  :{} -> {}", entry.remote_port, target_addr)
            }
            WorkerKind::Proxy => info!("  socks5 :{}", entry.remote_port),
        }
    }

    let shutdown = ShutdownSignal::default();
    let client = Arc::new(TunnelClient::new(config, shutdown.clone())?);

    // Wait for shutdown signal
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait_for_signal().await });

    client.run().await;
    Ok(())
}
