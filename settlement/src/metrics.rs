//! Prometheus metrics for settlement

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

/// Settlement metrics
#[derive(Clone)]
pub struct SettlementMetrics {
    /// Reservation attempts by `operation` and `result` (accepted/rejected/error)
    pub reservations: IntCounterVec,

    /// Approval outcomes by `operation` and `outcome`
    pub outcomes: IntCounterVec,

    /// Reconciliations needing manual fixup, by failed `stage`
    pub reconciliation_incomplete: IntCounterVec,

    /// Time from approval request to reconciled ledger
    pub duration: Histogram,
}

impl std::fmt::Debug for SettlementMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementMetrics").finish_non_exhaustive()
    }
}

impl SettlementMetrics {
    /// Create and register with `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let reservations = IntCounterVec::new(
            Opts::new("settlement_reservations_total", "Total reservation attempts"),
            &["operation", "result"],
        )?;
        let outcomes = IntCounterVec::new(
            Opts::new("settlement_outcomes_total", "Total approval outcomes"),
            &["operation", "outcome"],
        )?;
        let reconciliation_incomplete = IntCounterVec::new(
            Opts::new(
                "settlement_reconciliation_incomplete_total",
                "Reconciliations left for manual fixup",
            ),
            &["stage"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "settlement_duration_seconds",
                "Settlement flow duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(reservations.clone()))?;
        registry.register(Box::new(outcomes.clone()))?;
        registry.register(Box::new(reconciliation_incomplete.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            reservations,
            outcomes,
            reconciliation_incomplete,
            duration,
        })
    }
}
