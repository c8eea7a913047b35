//! LedgerCore service binary.
//!
//! Connects to PostgreSQL, applies the schema and runs the ledger service
//! with its reconciliation loop until Ctrl+C.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgercore_ledger::PgLedgerStore;
use ledgercore_orchestrator::{LedgerConfig, LedgerService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match LedgerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return Err(anyhow::anyhow!("Configuration error: {}", e));
        }
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting LedgerCore");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let instance_id = format!("ledgercore-{}", uuid::Uuid::new_v4());
    info!(instance_id = %instance_id, "Instance ID assigned");

    let store = PgLedgerStore::connect(&config.database_url, config.max_connections).await?;
    store.migrate().await?;
    info!(max_connections = config.max_connections, "Database ready");

    let service = Arc::new(LedgerService::new(Arc::new(store), config, instance_id.clone()));
    service.start().await?;

    info!(instance_id = %instance_id, "LedgerCore running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    service.stop().await?;

    match serde_json::to_string(&service.metrics()) {
        Ok(metrics) => info!(metrics = %metrics, "Final metrics"),
        Err(e) => error!(error = %e, "Failed to serialize metrics"),
    }

    info!("LedgerCore shutdown complete");
    Ok(())
}
