//! Custody ledger server binary

use anyhow::Context;
use custody_ledger::{Config, InMemoryTransferProvider, Ledger};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting custody ledger server");

    // Load configuration: explicit path first, environment otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    // Open ledger
    let provider = Arc::new(InMemoryTransferProvider::new());
    let ledger = Ledger::open(config, provider)
        .await
        .context("opening ledger")?;

    match ledger.active_version().await {
        Ok(version) => tracing::info!(%version, "Ledger opened"),
        Err(custody_ledger::Error::NotInitialized) => {
            tracing::info!("Ledger opened, waiting for initialization")
        }
        Err(e) => return Err(e).context("reading active version"),
    }

    let stats = ledger.stats().await.context("reading storage stats")?;
    tracing::info!(
        accounts = stats.total_accounts,
        events = stats.total_events,
        "Storage statistics"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down custody ledger server");
    ledger.shutdown().await.context("stopping ledger actor")?;
    Ok(())
}
