//! Error types for the ledger

use crate::types::{AccountId, TransactionId, TransactionStatus};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Account row absent
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Journal row absent
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Withdraw precondition failed; nothing was reserved
    #[error("Insufficient funds on account {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        /// Account checked
        account_id: AccountId,
        /// Requested amount
        required: Decimal,
        /// Balance at the time of the check
        available: Decimal,
    },

    /// Journal insert referenced a missing account
    #[error("Foreign key violation: account {0} does not exist")]
    ForeignKeyViolation(AccountId),

    /// Second terminal transition attempt
    #[error("Invalid transition for transaction {transaction_id}: {from} -> {to}")]
    InvalidTransition {
        /// Transaction updated
        transaction_id: TransactionId,
        /// Stored status
        from: TransactionStatus,
        /// Requested status
        to: TransactionStatus,
    },

    /// Invariant violation (negative frozen amount, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Non-positive amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed currency code
    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    /// Database error (PostgreSQL)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored row could not be decoded
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures caused by the caller's request rather than the store
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::AccountNotFound(_)
                | Error::InsufficientFunds { .. }
                | Error::ForeignKeyViolation(_)
                | Error::InvalidAmount(_)
                | Error::InvalidCurrency(_)
        )
    }
}
