//! Main settlement engine
//!
//! Orchestrates admission (convert, reserve, journal), the approval round trip
//! and reconciliation. Admission is synchronous; settlement runs on the
//! [`SettlementRunner`] and its completion is visible as the terminal journal
//! status.

use crate::{
    client::{ApprovalOutcome, SettlementClient},
    config::{Config, RecoveryConfig},
    currency::CurrencyConverter,
    metrics::SettlementMetrics,
    reconciler::{reservation_delta, Reconciled, Reconciler, SettlementJob},
    runner::SettlementRunner,
    Error, Result,
};
use chrono::Utc;
use ledger_core::{
    Account, AccountId, CurrencyCode, NewTransaction, Operation, Stores, Transaction,
    TransactionId, TransactionStatus,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Approval round trip plus reconciliation, shared with runner tasks
#[derive(Debug)]
struct SettlementFlow {
    client: SettlementClient,
    reconciler: Reconciler,
    metrics: SettlementMetrics,
}

impl SettlementFlow {
    async fn settle(&self, job: SettlementJob) -> Result<Reconciled> {
        let start = Instant::now();
        let outcome = self.client.request_approval(job.transaction_id).await?;
        self.finish(&job, outcome, start).await
    }

    async fn finish(
        &self,
        job: &SettlementJob,
        outcome: ApprovalOutcome,
        start: Instant,
    ) -> Result<Reconciled> {
        self.metrics
            .outcomes
            .with_label_values(&[job.operation.as_str(), outcome.as_str()])
            .inc();
        if outcome == ApprovalOutcome::Rejected {
            warn!(transaction_id = %job.transaction_id, "Approval rejected");
        }

        let result = self.reconciler.reconcile(job, outcome).await;
        self.metrics.duration.observe(start.elapsed().as_secs_f64());

        if let Ok(reconciled) = &result {
            info!(
                transaction_id = %job.transaction_id,
                account_id = %job.account_id,
                operation = %job.operation,
                outcome = %outcome,
                status = %reconciled.status(),
                "Settlement finished"
            );
        }
        result
    }
}

/// Transactions handed to the runner whose flow has not finished
type Submitted = Arc<Mutex<HashSet<TransactionId>>>;

/// Removes its transaction from [`Submitted`] when the flow is dropped
struct SubmittedGuard {
    submitted: Submitted,
    transaction_id: TransactionId,
}

impl Drop for SubmittedGuard {
    fn drop(&mut self) {
        self.submitted.lock().remove(&self.transaction_id);
    }
}

/// Settlement engine
pub struct SettlementEngine {
    stores: Stores,
    converter: Arc<dyn CurrencyConverter>,
    flow: Arc<SettlementFlow>,
    runner: SettlementRunner,
    submitted: Submitted,
    recovery: RecoveryConfig,
}

impl std::fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("runner", &self.runner)
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

impl SettlementEngine {
    /// Create new settlement engine
    pub fn new(
        stores: Stores,
        client: SettlementClient,
        converter: Arc<dyn CurrencyConverter>,
        metrics: SettlementMetrics,
        config: &Config,
    ) -> Self {
        let reconciler = Reconciler::new(
            stores.ledger.clone(),
            stores.journal.clone(),
            metrics.clone(),
        );

        Self {
            stores,
            converter,
            flow: Arc::new(SettlementFlow {
                client,
                reconciler,
                metrics,
            }),
            runner: SettlementRunner::new(config.approval.max_concurrent_settlements),
            submitted: Submitted::default(),
            recovery: config.recovery.clone(),
        }
    }

    /// Open an account with zero balance
    pub async fn create_account(&self) -> Result<Account> {
        let account = self.stores.ledger.create_account().await?;
        info!(account_id = %account.id, "Account created");
        Ok(account)
    }

    /// Read one account
    pub async fn get_account(&self, account_id: AccountId) -> Result<Account> {
        Ok(self.stores.ledger.read(account_id).await?)
    }

    /// All accounts
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.stores.ledger.list_all().await?)
    }

    /// Read one transaction
    pub async fn get_transaction(&self, transaction_id: TransactionId) -> Result<Transaction> {
        Ok(self.stores.journal.get(transaction_id).await?)
    }

    /// Transactions flagged for manual fixup
    pub async fn list_fixups(&self) -> Result<Vec<Transaction>> {
        Ok(self.stores.journal.list_fixups().await?)
    }

    /// Reserve incoming funds and start settlement
    pub async fn invoice(
        &self,
        account_id: AccountId,
        amount: Decimal,
        currency: &str,
    ) -> Result<TransactionId> {
        self.admit(Operation::Invoice, account_id, amount, currency).await
    }

    /// Reserve outgoing funds and start settlement
    ///
    /// Fails with `InsufficientFunds` without reserving anything if the
    /// converted amount exceeds the available balance.
    pub async fn withdraw(
        &self,
        account_id: AccountId,
        amount: Decimal,
        currency: &str,
    ) -> Result<TransactionId> {
        self.admit(Operation::Withdraw, account_id, amount, currency).await
    }

    async fn admit(
        &self,
        operation: Operation,
        account_id: AccountId,
        amount: Decimal,
        currency: &str,
    ) -> Result<TransactionId> {
        let currency = CurrencyCode::new(currency)?;
        let converted = self.converter.convert(&currency, amount)?;
        let new = NewTransaction::new(account_id, converted, currency, operation)?;

        let reserved = match operation {
            Operation::Invoice => {
                self.stores
                    .ledger
                    .apply_delta(account_id, reservation_delta(operation, converted))
                    .await
            }
            Operation::Withdraw => self.stores.ledger.reserve_withdraw(account_id, converted).await,
        };
        if let Err(e) = reserved {
            let result = if e.is_rejection() { "rejected" } else { "error" };
            self.record_reservation(operation, result);
            return Err(e.into());
        }

        let tx = match self.stores.journal.insert(new).await {
            Ok(tx) => tx,
            Err(e) => {
                self.record_reservation(operation, "error");
                self.revert_reservation(operation, account_id, converted).await;
                return Err(e.into());
            }
        };

        self.record_reservation(operation, "accepted");
        info!(
            transaction_id = %tx.id,
            account_id = %account_id,
            operation = %operation,
            amount = %converted,
            currency = %tx.currency,
            "Reservation admitted"
        );

        self.submit(SettlementJob::from(&tx));
        Ok(tx.id)
    }

    async fn revert_reservation(&self, operation: Operation, account_id: AccountId, amount: Decimal) {
        let inverse = -reservation_delta(operation, amount);
        if let Err(e) = self.stores.ledger.apply_delta(account_id, inverse).await {
            error!(
                account_id = %account_id,
                operation = %operation,
                amount = %amount,
                error = %e,
                alert = true,
                "Failed to revert reservation after journal error"
            );
        }
    }

    fn record_reservation(&self, operation: Operation, result: &str) {
        self.flow
            .metrics
            .reservations
            .with_label_values(&[operation.as_str(), result])
            .inc();
    }

    /// Hand a job to the runner
    pub fn submit(&self, job: SettlementJob) {
        let flow = self.flow.clone();
        let transaction_id = job.transaction_id;
        self.submitted.lock().insert(transaction_id);
        let guard = SubmittedGuard {
            submitted: self.submitted.clone(),
            transaction_id,
        };

        self.runner.spawn(async move {
            let _guard = guard;
            if let Err(e) = flow.settle(job).await {
                // Incomplete reconciliations were already raised as alerts
                if !matches!(e, Error::ReconciliationIncomplete { .. }) {
                    warn!(transaction_id = %transaction_id, error = %e, "Settlement flow failed");
                }
            }
        });
    }

    /// Run one settlement flow to completion
    pub async fn settle(&self, job: SettlementJob) -> Result<Reconciled> {
        self.flow.settle(job).await
    }

    /// Resolve transactions stuck in `Created` along the timed-out path
    ///
    /// Skips transactions younger than `recovery.stranded_after_secs` and those
    /// this process is still settling, whether waiting on approval or queued
    /// behind the runner. Returns how many were settled.
    pub async fn recover_stranded(&self) -> Result<usize> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.recovery.stranded_after_secs as i64);
        let created = self
            .stores
            .journal
            .list_by_status(TransactionStatus::Created)
            .await?;

        let mut recovered = 0;
        for tx in created.iter().filter(|tx| tx.created_at <= cutoff) {
            if self.submitted.lock().contains(&tx.id) || self.flow.client.is_in_flight(tx.id) {
                continue;
            }

            let job = SettlementJob::from(tx);
            warn!(
                transaction_id = %tx.id,
                account_id = %tx.account_id,
                created_at = %tx.created_at,
                "Recovering stranded transaction"
            );
            match self
                .flow
                .finish(&job, ApprovalOutcome::TimedOut, Instant::now())
                .await
            {
                Ok(Reconciled::Applied(_)) => recovered += 1,
                Ok(Reconciled::AlreadySettled(_)) => {}
                Err(e) => warn!(transaction_id = %tx.id, error = %e, "Recovery failed"),
            }
        }

        if recovered > 0 {
            info!(recovered, "Stranded transactions recovered");
        }
        Ok(recovered)
    }

    /// Settlement tasks still tracked by the runner
    pub fn in_flight(&self) -> usize {
        self.runner.in_flight()
    }

    /// Wait for running settlement flows
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }

    /// Serve until `shutdown` resolves, then drain running flows
    ///
    /// `reader` is the correlator loop. If it ends first no reply can arrive
    /// any more, so this drains and fails with `ReplyStreamClosed`.
    pub async fn serve<F>(&self, mut reader: JoinHandle<()>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let reader_stopped = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                false
            }
            finished = &mut reader => {
                if let Err(e) = finished {
                    error!(error = %e, "Reply reader task failed");
                }
                error!(alert = true, "Reply reader stopped");
                true
            }
        };

        self.shutdown().await;
        reader.abort();

        if reader_stopped {
            Err(Error::Bus(message_bus::Error::ReplyStreamClosed))
        } else {
            Ok(())
        }
    }
}
