//! Core types for the ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Stable numeric codes for storage and the approval wire format
//! - Additive mutation: balances change through [`BalanceDelta`]s, never by overwrite

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Neg;

/// Account identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(i64);

impl AccountId {
    /// Create new account ID
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier
///
/// Doubles as the correlation id of the approval request, so it is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(i64);

impl TransactionId {
    /// Create new transaction ID
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw value
    pub fn get(&self) -> i64 {
        self.0
    }

    /// Parse the decimal text form used on the wire
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse().ok().map(Self)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code as submitted by the client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Parse a three-letter code, case-insensitively
    pub fn new(code: &str) -> crate::Result<Self> {
        let code = code.trim();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_uppercase()))
        } else {
            Err(crate::Error::InvalidCurrency(code.to_string()))
        }
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account ID
    pub id: AccountId,

    /// Funds available for immediate use
    pub balance: Decimal,

    /// Funds reserved pending settlement (never negative)
    pub frozen: Decimal,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh account with zero balance and nothing frozen
    pub fn open(id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: Decimal::ZERO,
            frozen: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a delta in place, refusing to drive `frozen` below zero
    ///
    /// On error the account is left unchanged, including on overflow.
    pub fn apply(&mut self, delta: BalanceDelta) -> crate::Result<()> {
        let id = self.id;
        let overflow =
            || crate::Error::InvariantViolation(format!("balance of account {} would overflow", id));
        let balance = self.balance.checked_add(delta.balance).ok_or_else(overflow)?;
        let frozen = self.frozen.checked_add(delta.frozen).ok_or_else(overflow)?;
        if frozen < Decimal::ZERO {
            return Err(crate::Error::InvariantViolation(format!(
                "frozen amount of account {} would become {}",
                self.id, frozen
            )));
        }
        self.balance = balance;
        self.frozen = frozen;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Additive change to an account's `balance` and `frozen` columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalanceDelta {
    /// Change to the available balance
    pub balance: Decimal,
    /// Change to the frozen amount
    pub frozen: Decimal,
}

impl BalanceDelta {
    /// Create new delta
    pub fn new(balance: Decimal, frozen: Decimal) -> Self {
        Self { balance, frozen }
    }

    /// True if applying the delta changes nothing
    pub fn is_zero(&self) -> bool {
        self.balance.is_zero() && self.frozen.is_zero()
    }
}

impl Neg for BalanceDelta {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            balance: -self.balance,
            frozen: -self.frozen,
        }
    }
}

impl fmt::Display for BalanceDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "balance {:+}, frozen {:+}", self.balance, self.frozen)
    }
}

/// Direction of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum Operation {
    /// Incoming funds
    Invoice = 1,
    /// Outgoing funds
    Withdraw = 2,
}

impl Operation {
    /// Storage code
    pub fn code(&self) -> i16 {
        *self as i16
    }

    /// Parse from storage code
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(Operation::Invoice),
            2 => Some(Operation::Withdraw),
            _ => None,
        }
    }

    /// Lowercase label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Invoice => "invoice",
            Operation::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status
///
/// `Created` moves exactly once to `Success` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum TransactionStatus {
    /// Settled successfully (terminal)
    Success = 1,
    /// Settlement declined or failed (terminal)
    Error = 2,
    /// Reserved, awaiting approval
    Created = 3,
}

impl TransactionStatus {
    /// Storage and wire code
    pub fn code(&self) -> i16 {
        *self as i16
    }

    /// Parse from storage or wire code
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(TransactionStatus::Success),
            2 => Some(TransactionStatus::Error),
            3 => Some(TransactionStatus::Created),
            _ => None,
        }
    }

    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Created)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Success => "success",
            TransactionStatus::Error => "error",
            TransactionStatus::Created => "created",
        };
        f.write_str(s)
    }
}

/// Journal row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction ID
    pub id: TransactionId,

    /// Owning account
    pub account_id: AccountId,

    /// Amount in the settlement currency (positive, immutable)
    pub amount: Decimal,

    /// Currency the client submitted
    pub currency: CurrencyCode,

    /// Invoice or withdraw
    pub operation: Operation,

    /// Lifecycle status
    pub status: TransactionStatus,

    /// Terminal status recorded but the ledger delta did not land
    pub fixup_required: bool,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Insert request for the journal
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    /// Owning account
    pub account_id: AccountId,
    /// Amount in the settlement currency
    pub amount: Decimal,
    /// Currency the client submitted
    pub currency: CurrencyCode,
    /// Invoice or withdraw
    pub operation: Operation,
}

impl NewTransaction {
    /// Validate and build an insert request
    pub fn new(
        account_id: AccountId,
        amount: Decimal,
        currency: CurrencyCode,
        operation: Operation,
    ) -> crate::Result<Self> {
        if amount <= Decimal::ZERO {
            return Err(crate::Error::InvalidAmount(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        Ok(Self {
            account_id,
            amount,
            currency,
            operation,
        })
    }
}

/// Result of a journal status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// Created → terminal transition happened now
    Applied,
    /// Already in the requested terminal status; nothing written
    Unchanged,
}
