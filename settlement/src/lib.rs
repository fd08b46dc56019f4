//! Settlement Engine
//!
//! Reserves funds on an account, asks an external approval worker over the
//! message bus whether the transaction may proceed, and applies the answer
//! back onto the ledger.
//!
//! # Flow
//!
//! 1. **Admission**: Convert to the settlement currency, reserve, journal as `Created`
//! 2. **Approval**: Publish a request correlated by transaction id, wait with a deadline
//! 3. **Reconciliation**: Record the terminal status, then apply the settlement delta
//!
//! Timeouts and transport failures settle along the rejected path. A half-applied
//! reconciliation is flagged for manual fixup and never retried automatically.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ledger_core::Stores;
//! use message_bus::{Broker, BusMetrics, Correlator, MemoryBroker, Requester};
//! use prometheus::Registry;
//! use rust_decimal::Decimal;
//! use settlement::{Config, FixedRateConverter, SettlementClient, SettlementEngine, SettlementMetrics};
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let config = Config::default();
//!     let registry = Registry::new();
//!
//!     let (broker, inbox) = MemoryBroker::new();
//!     let broker = Arc::new(broker);
//!     let correlator = Correlator::new(BusMetrics::new(&registry)?);
//!     correlator.spawn(broker.replies().await?);
//!     inbox.spawn_worker(|_| Some("1".into()));
//!
//!     let client = SettlementClient::new(Requester::new(broker, correlator), &config.approval);
//!     let engine = SettlementEngine::new(
//!         Stores::in_memory(),
//!         client,
//!         Arc::new(FixedRateConverter::from_config(&config.currency)?),
//!         SettlementMetrics::new(&registry)?,
//!         &config,
//!     );
//!
//!     let account = engine.create_account().await?;
//!     engine.invoice(account.id, Decimal::new(10000, 2), "RUB").await?;
//!     engine.shutdown().await;
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod client;
pub mod config;
pub mod currency;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod runner;
pub mod telemetry;

// Re-exports
pub use client::{ApprovalOutcome, SettlementClient};
pub use config::Config;
pub use currency::{CurrencyConverter, FixedRateConverter};
pub use engine::SettlementEngine;
pub use error::{Error, Result};
pub use metrics::SettlementMetrics;
pub use reconciler::{Reconciled, Reconciler, SettlementJob, Stage};
pub use runner::SettlementRunner;
