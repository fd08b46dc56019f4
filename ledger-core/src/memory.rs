//! In-memory stores
//!
//! Row-level atomicity comes from the `DashMap` shard lock held for the whole
//! read-check-write of one entry.

use crate::{
    store::{JournalStore, LedgerStore},
    types::{
        Account, AccountId, BalanceDelta, NewTransaction, StatusChange, Transaction,
        TransactionId, TransactionStatus,
    },
    Error, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Account table kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    accounts: DashMap<AccountId, Account>,
    next_id: AtomicI64,
}

impl InMemoryLedgerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether an account exists
    pub fn contains(&self, account_id: AccountId) -> bool {
        self.accounts.contains_key(&account_id)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_account(&self) -> Result<Account> {
        let id = AccountId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let account = Account::open(id);
        self.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn apply_delta(&self, account_id: AccountId, delta: BalanceDelta) -> Result<Account> {
        let mut account = self
            .accounts
            .get_mut(&account_id)
            .ok_or(Error::AccountNotFound(account_id))?;
        account.apply(delta)?;
        Ok(account.clone())
    }

    async fn reserve_withdraw(&self, account_id: AccountId, amount: Decimal) -> Result<Account> {
        let mut account = self
            .accounts
            .get_mut(&account_id)
            .ok_or(Error::AccountNotFound(account_id))?;
        if account.balance < amount {
            return Err(Error::InsufficientFunds {
                account_id,
                required: amount,
                available: account.balance,
            });
        }
        account.apply(BalanceDelta::new(-amount, amount))?;
        Ok(account.clone())
    }

    async fn read(&self, account_id: AccountId) -> Result<Account> {
        self.accounts
            .get(&account_id)
            .map(|a| a.clone())
            .ok_or(Error::AccountNotFound(account_id))
    }

    async fn list_all(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|a| a.clone()).collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }
}

/// Transaction table kept in process memory
///
/// Holds the account table to enforce referential integrity on insert.
#[derive(Debug)]
pub struct InMemoryJournalStore {
    accounts: Arc<InMemoryLedgerStore>,
    transactions: DashMap<TransactionId, Transaction>,
    next_id: AtomicI64,
}

impl InMemoryJournalStore {
    /// Create an empty journal referencing `accounts`
    pub fn new(accounts: Arc<InMemoryLedgerStore>) -> Self {
        Self {
            accounts,
            transactions: DashMap::new(),
            next_id: AtomicI64::new(0),
        }
    }

    fn collect<F>(&self, filter: F) -> Vec<Transaction>
    where
        F: Fn(&Transaction) -> bool,
    {
        let mut rows: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| filter(t.value()))
            .map(|t| t.clone())
            .collect();
        rows.sort_by_key(|t| t.id);
        rows
    }
}

#[async_trait]
impl JournalStore for InMemoryJournalStore {
    async fn insert(&self, new: NewTransaction) -> Result<Transaction> {
        if !self.accounts.contains(new.account_id) {
            return Err(Error::ForeignKeyViolation(new.account_id));
        }

        let id = TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let transaction = Transaction {
            id,
            account_id: new.account_id,
            amount: new.amount,
            currency: new.currency,
            operation: new.operation,
            status: TransactionStatus::Created,
            fixup_required: false,
            created_at: Utc::now(),
        };
        self.transactions.insert(id, transaction.clone());
        Ok(transaction)
    }

    async fn get(&self, transaction_id: TransactionId) -> Result<Transaction> {
        self.transactions
            .get(&transaction_id)
            .map(|t| t.clone())
            .ok_or(Error::TransactionNotFound(transaction_id))
    }

    async fn set_status(
        &self,
        transaction_id: TransactionId,
        status: TransactionStatus,
    ) -> Result<StatusChange> {
        let mut transaction = self
            .transactions
            .get_mut(&transaction_id)
            .ok_or(Error::TransactionNotFound(transaction_id))?;

        let current = transaction.status;
        match current {
            TransactionStatus::Created if status.is_terminal() => {
                transaction.status = status;
                Ok(StatusChange::Applied)
            }
            current if current == status && status.is_terminal() => Ok(StatusChange::Unchanged),
            current => Err(Error::InvalidTransition {
                transaction_id,
                from: current,
                to: status,
            }),
        }
    }

    async fn mark_fixup_required(&self, transaction_id: TransactionId) -> Result<()> {
        let mut transaction = self
            .transactions
            .get_mut(&transaction_id)
            .ok_or(Error::TransactionNotFound(transaction_id))?;
        transaction.fixup_required = true;
        Ok(())
    }

    async fn list_by_status(&self, status: TransactionStatus) -> Result<Vec<Transaction>> {
        Ok(self.collect(|t| t.status == status))
    }

    async fn list_fixups(&self) -> Result<Vec<Transaction>> {
        Ok(self.collect(|t| t.fixup_required))
    }
}
