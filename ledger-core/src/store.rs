//! Store contracts for accounts (ledger) and transactions (journal)
//!
//! Every balance mutation is expressed as an additive [`BalanceDelta`] applied
//! atomically by the store, so concurrent settlements on one account commute.
//! No in-process lock is held on accounts.

use crate::{
    config::{Config, StorageBackend},
    memory::{InMemoryJournalStore, InMemoryLedgerStore},
    postgres::{PgJournalStore, PgLedgerStore},
    types::{
        Account, AccountId, BalanceDelta, NewTransaction, StatusChange, Transaction,
        TransactionId, TransactionStatus,
    },
    Result,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Per-account balances
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a new account with zero balance
    async fn create_account(&self) -> Result<Account>;

    /// Atomically add `delta` to the stored row
    ///
    /// Fails with `AccountNotFound`, or `InvariantViolation` if `frozen` would
    /// drop below zero (row unchanged).
    async fn apply_delta(&self, account_id: AccountId, delta: BalanceDelta) -> Result<Account>;

    /// Check `balance >= amount` and move `amount` from balance to frozen in one step
    async fn reserve_withdraw(&self, account_id: AccountId, amount: Decimal) -> Result<Account>;

    /// Read one account
    async fn read(&self, account_id: AccountId) -> Result<Account>;

    /// All accounts ordered by id
    async fn list_all(&self) -> Result<Vec<Account>>;
}

/// Per-transaction records
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Insert a `Created` transaction; the account must exist
    async fn insert(&self, new: NewTransaction) -> Result<Transaction>;

    /// Read one transaction
    async fn get(&self, transaction_id: TransactionId) -> Result<Transaction>;

    /// Move a `Created` transaction to a terminal status
    ///
    /// Replaying the same terminal status is a no-op (`Unchanged`); any other
    /// transition fails with `InvalidTransition`.
    async fn set_status(
        &self,
        transaction_id: TransactionId,
        status: TransactionStatus,
    ) -> Result<StatusChange>;

    /// Flag a transaction whose reconciliation did not complete
    async fn mark_fixup_required(&self, transaction_id: TransactionId) -> Result<()>;

    /// Transactions in the given status ordered by id
    async fn list_by_status(&self, status: TransactionStatus) -> Result<Vec<Transaction>>;

    /// Transactions flagged for manual fixup
    async fn list_fixups(&self) -> Result<Vec<Transaction>>;
}

/// Shared handle to a ledger store
pub type LedgerStoreRef = Arc<dyn LedgerStore>;

/// Shared handle to a journal store
pub type JournalStoreRef = Arc<dyn JournalStore>;

/// Ledger and journal opened against the same backend
#[derive(Clone)]
pub struct Stores {
    /// Account balances
    pub ledger: LedgerStoreRef,
    /// Transaction journal
    pub journal: JournalStoreRef,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    /// Fresh in-memory pair sharing one account table
    pub fn in_memory() -> Self {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let journal = Arc::new(InMemoryJournalStore::new(ledger.clone()));
        Self { ledger, journal }
    }

    /// Open the configured backend, running migrations for PostgreSQL
    pub async fn open(config: &Config) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => {
                tracing::info!("Using in-memory ledger and journal stores");
                Ok(Self::in_memory())
            }
            StorageBackend::Postgres => {
                let pool = crate::postgres::connect(&config.postgres).await?;
                crate::postgres::migrate(&pool).await?;
                tracing::info!("Connected to PostgreSQL ledger store");
                Ok(Self {
                    ledger: Arc::new(PgLedgerStore::new(pool.clone())),
                    journal: Arc::new(PgJournalStore::new(pool)),
                })
            }
        }
    }
}
