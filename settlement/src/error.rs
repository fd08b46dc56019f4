//! Error types for settlement engine

use crate::reconciler::Stage;
use ledger_core::TransactionId;
use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger or journal error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Broker error
    #[error("Message bus error: {0}")]
    Bus(#[from] message_bus::Error),

    /// No conversion rate for the currency
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// A settlement for this transaction is already waiting on approval
    #[error("Duplicate correlation for transaction {0}")]
    DuplicateCorrelation(TransactionId),

    /// One of the two reconciliation writes failed; needs manual fixup
    #[error("Reconciliation incomplete for transaction {transaction_id} at {stage}: {reason}")]
    ReconciliationIncomplete {
        /// Transaction being settled
        transaction_id: TransactionId,
        /// Write that failed
        stage: Stage,
        /// Underlying failure
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures caused by the caller's request
    pub fn is_rejection(&self) -> bool {
        match self {
            Error::Ledger(e) => e.is_rejection(),
            Error::UnsupportedCurrency(_) => true,
            _ => false,
        }
    }
}
