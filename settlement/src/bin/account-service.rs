//! Account service binary
//!
//! Usage: `account-service [config.toml]` (environment variables otherwise)

use anyhow::Context;
use ledger_core::Stores;
use message_bus::{Broker, BusMetrics, Correlator, NatsBroker, Requester};
use prometheus::Registry;
use settlement::{
    telemetry, Config, FixedRateConverter, SettlementClient, SettlementEngine, SettlementMetrics,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => Config::from_env().context("failed to load config from environment")?,
    };

    telemetry::init_logging(&config.logging)?;
    info!(service = %config.service_name, "Starting account service");

    let registry = Registry::new();

    // Storage
    let stores = Stores::open(&config.store)
        .await
        .context("failed to open stores")?;

    // Broker and reply correlation
    let broker = Arc::new(
        NatsBroker::connect(&config.nats)
            .await
            .context("failed to connect to NATS")?,
    );
    let correlator = Correlator::new(BusMetrics::new(&registry)?);
    let reader = correlator.spawn(broker.replies().await?);

    let client = SettlementClient::new(Requester::new(broker, correlator), &config.approval);
    let converter = Arc::new(FixedRateConverter::from_config(&config.currency)?);
    let engine = SettlementEngine::new(
        stores,
        client,
        converter,
        SettlementMetrics::new(&registry)?,
        &config,
    );

    if config.recovery.enabled {
        let recovered = engine.recover_stranded().await?;
        info!(recovered, "Startup recovery complete");
    }

    let fixups = engine.list_fixups().await?;
    if !fixups.is_empty() {
        warn!(count = fixups.len(), "Transactions awaiting manual fixup");
    }

    info!(subject = %config.approval.request_subject, "Account service ready");
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    engine
        .serve(reader, ctrl_c)
        .await
        .context("account service stopped")?;

    info!("Account service stopped");
    Ok(())
}
