//! Prometheus metrics for message bus

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

/// Request/reply metrics
#[derive(Clone)]
pub struct BusMetrics {
    /// Requests published, by `status` (success/error)
    pub requests_published: IntCounterVec,

    /// Replies read from the stream, by `result` (delivered/orphaned)
    pub replies: IntCounterVec,

    /// Finished waits, by `result` (replied/timeout/closed/cancelled)
    pub waits: IntCounterVec,

    /// Correlation entries currently outstanding
    pub pending_correlations: IntGauge,
}

impl std::fmt::Debug for BusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMetrics")
            .field("pending_correlations", &self.pending_correlations.get())
            .finish_non_exhaustive()
    }
}

impl BusMetrics {
    /// Create and register with `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let requests_published = IntCounterVec::new(
            Opts::new("bus_requests_published_total", "Total requests published"),
            &["status"],
        )?;
        let replies = IntCounterVec::new(
            Opts::new("bus_replies_total", "Total replies read from the reply stream"),
            &["result"],
        )?;
        let waits = IntCounterVec::new(
            Opts::new("bus_waits_total", "Total reply waits by how they finished"),
            &["result"],
        )?;
        let pending_correlations = IntGauge::new(
            "bus_pending_correlations",
            "Correlation entries awaiting a reply",
        )?;

        registry.register(Box::new(requests_published.clone()))?;
        registry.register(Box::new(replies.clone()))?;
        registry.register(Box::new(waits.clone()))?;
        registry.register(Box::new(pending_correlations.clone()))?;

        Ok(Self {
            requests_published,
            replies,
            waits,
            pending_correlations,
        })
    }

    pub(crate) fn published(&self, ok: bool) {
        let status = if ok { "success" } else { "error" };
        self.requests_published.with_label_values(&[status]).inc();
    }

    pub(crate) fn reply(&self, result: &str) {
        self.replies.with_label_values(&[result]).inc();
    }

    pub(crate) fn wait(&self, result: &str) {
        self.waits.with_label_values(&[result]).inc();
    }
}
