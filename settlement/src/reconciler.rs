//! Settlement state machine
//!
//! Reservation at admission, then one of two settlement deltas once the
//! approval outcome is known:
//!
//! | operation | reserve            | approved           | otherwise          |
//! |-----------|--------------------|--------------------|--------------------|
//! | invoice   | frozen +a          | balance +a, frozen -a | frozen -a       |
//! | withdraw  | balance -a, frozen +a | frozen -a       | balance +a, frozen -a |
//!
//! The journal status is written first and the ledger delta only when that
//! write actually moved the transaction out of `Created`, so replays never
//! apply a delta twice.

use crate::{client::ApprovalOutcome, metrics::SettlementMetrics, Error, Result};
use ledger_core::{
    AccountId, BalanceDelta, JournalStoreRef, LedgerStoreRef, Operation, StatusChange,
    Transaction, TransactionId, TransactionStatus,
};
use rust_decimal::Decimal;
use std::fmt;
use tracing::{error, info};

/// Self-contained unit of settlement work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementJob {
    /// Transaction to settle (also the correlation id)
    pub transaction_id: TransactionId,
    /// Account the reservation was made on
    pub account_id: AccountId,
    /// Invoice or withdraw
    pub operation: Operation,
    /// Reserved amount
    pub amount: Decimal,
}

impl From<&Transaction> for SettlementJob {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            account_id: tx.account_id,
            operation: tx.operation,
            amount: tx.amount,
        }
    }
}

/// Reconciliation write that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Terminal status update
    Journal,
    /// Settlement delta
    Ledger,
}

impl Stage {
    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Journal => "journal",
            Stage::Ledger => "ledger",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Status recorded and delta applied now
    Applied(TransactionStatus),
    /// Status was already recorded; nothing applied
    AlreadySettled(TransactionStatus),
}

impl Reconciled {
    /// Terminal status of the transaction
    pub fn status(&self) -> TransactionStatus {
        match self {
            Reconciled::Applied(status) | Reconciled::AlreadySettled(status) => *status,
        }
    }
}

/// Delta applied when funds are reserved
pub fn reservation_delta(operation: Operation, amount: Decimal) -> BalanceDelta {
    match operation {
        Operation::Invoice => BalanceDelta::new(Decimal::ZERO, amount),
        Operation::Withdraw => BalanceDelta::new(-amount, amount),
    }
}

/// Delta that releases the reservation for `outcome`
pub fn settlement_delta(
    operation: Operation,
    outcome: ApprovalOutcome,
    amount: Decimal,
) -> BalanceDelta {
    match (operation, outcome.is_approved()) {
        (Operation::Invoice, true) => BalanceDelta::new(amount, -amount),
        (Operation::Invoice, false) => BalanceDelta::new(Decimal::ZERO, -amount),
        (Operation::Withdraw, true) => BalanceDelta::new(Decimal::ZERO, -amount),
        (Operation::Withdraw, false) => BalanceDelta::new(amount, -amount),
    }
}

/// Terminal status recorded for `outcome`
pub fn terminal_status(outcome: ApprovalOutcome) -> TransactionStatus {
    if outcome.is_approved() {
        TransactionStatus::Success
    } else {
        TransactionStatus::Error
    }
}

/// Applies approval outcomes to the journal and ledger
#[derive(Clone)]
pub struct Reconciler {
    ledger: LedgerStoreRef,
    journal: JournalStoreRef,
    metrics: SettlementMetrics,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create new reconciler
    pub fn new(ledger: LedgerStoreRef, journal: JournalStoreRef, metrics: SettlementMetrics) -> Self {
        Self {
            ledger,
            journal,
            metrics,
        }
    }

    /// Record the terminal status for `outcome`, then apply its delta
    pub async fn reconcile(&self, job: &SettlementJob, outcome: ApprovalOutcome) -> Result<Reconciled> {
        let status = terminal_status(outcome);

        match self.journal.set_status(job.transaction_id, status).await {
            Ok(StatusChange::Applied) => {}
            Ok(StatusChange::Unchanged) => {
                info!(
                    transaction_id = %job.transaction_id,
                    status = %status,
                    "Transaction already settled"
                );
                return Ok(Reconciled::AlreadySettled(status));
            }
            Err(e @ ledger_core::Error::InvalidTransition { .. }) => {
                // Settled elsewhere with the other outcome; that path owns the delta
                error!(transaction_id = %job.transaction_id, error = %e, "Conflicting settlement");
                return Err(e.into());
            }
            Err(e) => return Err(self.incomplete(job, Stage::Journal, e.to_string())),
        }

        let delta = settlement_delta(job.operation, outcome, job.amount);
        if let Err(e) = self.ledger.apply_delta(job.account_id, delta).await {
            if let Err(flag_err) = self.journal.mark_fixup_required(job.transaction_id).await {
                error!(
                    transaction_id = %job.transaction_id,
                    error = %flag_err,
                    alert = true,
                    "Failed to flag transaction for fixup"
                );
            }
            return Err(self.incomplete(job, Stage::Ledger, e.to_string()));
        }

        Ok(Reconciled::Applied(status))
    }

    fn incomplete(&self, job: &SettlementJob, stage: Stage, reason: String) -> Error {
        self.metrics
            .reconciliation_incomplete
            .with_label_values(&[stage.as_str()])
            .inc();
        error!(
            transaction_id = %job.transaction_id,
            account_id = %job.account_id,
            operation = %job.operation,
            stage = %stage,
            reason = %reason,
            alert = true,
            "Reconciliation incomplete"
        );
        Error::ReconciliationIncomplete {
            transaction_id: job.transaction_id,
            stage,
            reason,
        }
    }
}
