//! The Tessera grid node.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use tessera::app::App;
use tessera::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        node_id = %cfg.node_id,
        server_port = %cfg.server_port,
        peers = cfg.peer_addrs.len(),
        partitions = cfg.partitions,
        backups = cfg.backups,
        storage_data_path = %cfg.storage_data_path,
        "starting Tessera node",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
