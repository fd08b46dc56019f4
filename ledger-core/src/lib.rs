//! Account Ledger Core
//!
//! Accounts with an available `balance` and a reserved `frozen` amount, plus a
//! journal of invoice and withdraw transactions.
//!
//! # Architecture
//!
//! - **Additive deltas**: Balances change only through atomic `+=` updates
//! - **Two stores**: Ledger (accounts) and journal (transactions) behind async traits
//! - **Backends**: In-memory (`DashMap`) or PostgreSQL (`sqlx`)
//!
//! # Invariants
//!
//! - `frozen >= 0` for every account at all times
//! - A transaction moves from `Created` to a terminal status exactly once
//! - A transaction always references an existing account

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

// Re-exports
pub use config::{Config, PostgresConfig, StorageBackend};
pub use error::{Error, Result};
pub use memory::{InMemoryJournalStore, InMemoryLedgerStore};
pub use postgres::{PgJournalStore, PgLedgerStore};
pub use store::{JournalStore, JournalStoreRef, LedgerStore, LedgerStoreRef, Stores};
pub use types::{
    Account, AccountId, BalanceDelta, CurrencyCode, NewTransaction, Operation, StatusChange,
    Transaction, TransactionId, TransactionStatus,
};
