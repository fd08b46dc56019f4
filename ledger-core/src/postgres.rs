//! PostgreSQL stores
//!
//! Each mutation is a single `UPDATE … RETURNING` statement so the database
//! applies the delta against the stored value under its row lock.

use crate::{
    config::PostgresConfig,
    store::{JournalStore, LedgerStore},
    types::{
        Account, AccountId, BalanceDelta, CurrencyCode, NewTransaction, Operation, StatusChange,
        Transaction, TransactionId, TransactionStatus,
    },
    Error, Result,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";

const ACCOUNT_COLUMNS: &str = "id, balance, frozen, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, fk_account_id, amount, currency, operation, status, fixup_required, created_at";

/// Open a connection pool
pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;
    Ok(pool)
}

/// Create tables if absent
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id BIGSERIAL PRIMARY KEY,
            balance NUMERIC NOT NULL DEFAULT 0,
            frozen NUMERIC NOT NULL DEFAULT 0 CHECK (frozen >= 0),
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id BIGSERIAL PRIMARY KEY,
            fk_account_id BIGINT NOT NULL REFERENCES accounts(id),
            amount NUMERIC NOT NULL CHECK (amount > 0),
            currency TEXT NOT NULL,
            operation SMALLINT NOT NULL,
            status SMALLINT NOT NULL,
            fixup_required BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS transactions_status_idx ON transactions (status)")
        .execute(pool)
        .await?;

    Ok(())
}

fn db_error_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: AccountId::new(row.try_get("id")?),
        balance: row.try_get("balance")?,
        frozen: row.try_get("frozen")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let id = TransactionId::new(row.try_get("id")?);
    let operation_code: i16 = row.try_get("operation")?;
    let status_code: i16 = row.try_get("status")?;
    let currency: String = row.try_get("currency")?;

    Ok(Transaction {
        id,
        account_id: AccountId::new(row.try_get("fk_account_id")?),
        amount: row.try_get("amount")?,
        currency: CurrencyCode::new(&currency)?,
        operation: Operation::from_code(operation_code).ok_or_else(|| {
            Error::CorruptRow(format!("transaction {} has operation {}", id, operation_code))
        })?,
        status: TransactionStatus::from_code(status_code).ok_or_else(|| {
            Error::CorruptRow(format!("transaction {} has status {}", id, status_code))
        })?,
        fixup_required: row.try_get("fixup_required")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Account table in PostgreSQL
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap an open pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_account(&self) -> Result<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (balance, frozen) VALUES (0, 0) RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .fetch_one(&self.pool)
        .await?;
        account_from_row(&row)
    }

    async fn apply_delta(&self, account_id: AccountId, delta: BalanceDelta) -> Result<Account> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE accounts
            SET balance = balance + $1,
                frozen = frozen + $2,
                updated_at = now()
            WHERE id = $3
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(delta.balance)
        .bind(delta.frozen)
        .bind(account_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match db_error_code(&e).as_deref() {
            Some(CHECK_VIOLATION) => Error::InvariantViolation(format!(
                "delta ({}) would make frozen negative on account {}",
                delta, account_id
            )),
            _ => Error::Database(e),
        })?
        .ok_or(Error::AccountNotFound(account_id))?;

        account_from_row(&row)
    }

    async fn reserve_withdraw(&self, account_id: AccountId, amount: Decimal) -> Result<Account> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE accounts
            SET balance = balance - $1,
                frozen = frozen + $1,
                updated_at = now()
            WHERE id = $2 AND balance >= $1
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(amount)
        .bind(account_id.get())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => account_from_row(&row),
            None => {
                // Either the account is missing or the guarded check failed
                let account = self.read(account_id).await?;
                Err(Error::InsufficientFunds {
                    account_id,
                    required: amount,
                    available: account.balance,
                })
            }
        }
    }

    async fn read(&self, account_id: AccountId) -> Result<Account> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::AccountNotFound(account_id))?;

        account_from_row(&row)
    }

    async fn list_all(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM accounts ORDER BY id",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(account_from_row).collect()
    }
}

/// Transaction table in PostgreSQL
#[derive(Debug, Clone)]
pub struct PgJournalStore {
    pool: PgPool,
}

impl PgJournalStore {
    /// Wrap an open pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(&self, clause: &str, status: Option<i16>) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE {} ORDER BY id",
            TRANSACTION_COLUMNS, clause
        );
        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl JournalStore for PgJournalStore {
    async fn insert(&self, new: NewTransaction) -> Result<Transaction> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO transactions (fk_account_id, amount, currency, operation, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(new.account_id.get())
        .bind(new.amount)
        .bind(new.currency.as_str())
        .bind(new.operation.code())
        .bind(TransactionStatus::Created.code())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match db_error_code(&e).as_deref() {
            Some(FOREIGN_KEY_VIOLATION) => Error::ForeignKeyViolation(new.account_id),
            _ => Error::Database(e),
        })?;

        transaction_from_row(&row)
    }

    async fn get(&self, transaction_id: TransactionId) -> Result<Transaction> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::TransactionNotFound(transaction_id))?;

        transaction_from_row(&row)
    }

    async fn set_status(
        &self,
        transaction_id: TransactionId,
        status: TransactionStatus,
    ) -> Result<StatusChange> {
        if status.is_terminal() {
            let updated = sqlx::query(
                "UPDATE transactions SET status = $1 WHERE id = $2 AND status = $3 RETURNING id",
            )
            .bind(status.code())
            .bind(transaction_id.get())
            .bind(TransactionStatus::Created.code())
            .fetch_optional(&self.pool)
            .await?;

            if updated.is_some() {
                return Ok(StatusChange::Applied);
            }
        }

        let current = self.get(transaction_id).await?.status;
        if current == status && status.is_terminal() {
            Ok(StatusChange::Unchanged)
        } else {
            Err(Error::InvalidTransition {
                transaction_id,
                from: current,
                to: status,
            })
        }
    }

    async fn mark_fixup_required(&self, transaction_id: TransactionId) -> Result<()> {
        let result = sqlx::query("UPDATE transactions SET fixup_required = TRUE WHERE id = $1")
            .bind(transaction_id.get())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TransactionNotFound(transaction_id));
        }
        Ok(())
    }

    async fn list_by_status(&self, status: TransactionStatus) -> Result<Vec<Transaction>> {
        self.fetch_where("status = $1", Some(status.code())).await
    }

    async fn list_fixups(&self) -> Result<Vec<Transaction>> {
        self.fetch_where("fixup_required", None).await
    }
}
