//! Reply correlation
//!
//! Exactly one task reads the process's reply stream ([`Correlator::run`]) and
//! hands each reply to the caller registered under its correlation id. Callers
//! never touch the stream themselves, so one caller cannot consume a reply
//! addressed to another.
//!
//! Entry lifetime is tied to the [`PendingReply`] handle: the entry is removed
//! when the reply is delivered, when the wait times out, or when the handle is
//! dropped.

use crate::{broker::ReplyStream, message::Reply, metrics::BusMetrics, Error, Result};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Slot {
    /// Registration number, so a stale handle never removes a newer entry
    seq: u64,
    tx: oneshot::Sender<Bytes>,
}

#[derive(Debug, Default)]
struct Pending {
    entries: HashMap<String, Slot>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    pending: Mutex<Pending>,
    metrics: BusMetrics,
}

impl Inner {
    /// Remove the entry if it still belongs to registration `seq`
    fn unregister(&self, correlation_id: &str, seq: u64) -> bool {
        let mut pending = self.pending.lock();
        let owned = pending
            .entries
            .get(correlation_id)
            .map_or(false, |slot| slot.seq == seq);
        if owned {
            pending.entries.remove(correlation_id);
            self.metrics
                .pending_correlations
                .set(pending.entries.len() as i64);
        }
        owned
    }
}

/// Fans one reply stream out to concurrent waiters by correlation id
#[derive(Debug, Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    /// Create a correlator with no outstanding entries
    pub fn new(metrics: BusMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(Pending::default()),
                metrics,
            }),
        }
    }

    /// Register a waiter for `correlation_id`
    ///
    /// Fails with `DuplicateCorrelation` while the id is outstanding, and with
    /// `ReplyStreamClosed` once the reply stream has ended.
    pub fn register(&self, correlation_id: impl Into<String>) -> Result<PendingReply> {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();

        let mut pending = self.inner.pending.lock();
        if pending.closed {
            return Err(Error::ReplyStreamClosed);
        }
        if pending.entries.contains_key(&correlation_id) {
            error!(correlation_id = %correlation_id, "Correlation id already outstanding");
            return Err(Error::DuplicateCorrelation(correlation_id));
        }

        pending.next_seq += 1;
        let seq = pending.next_seq;
        pending
            .entries
            .insert(correlation_id.clone(), Slot { seq, tx });
        self.inner
            .metrics
            .pending_correlations
            .set(pending.entries.len() as i64);
        drop(pending);

        Ok(PendingReply {
            inner: self.inner.clone(),
            correlation_id,
            seq,
            rx,
            finished: false,
        })
    }

    /// Deliver one reply to its waiter
    ///
    /// Returns `false` if no waiter is registered (late or foreign reply); the
    /// reply is dropped.
    pub fn resolve(&self, reply: Reply) -> bool {
        let mut pending = self.inner.pending.lock();
        // Sent under the lock: once the entry is gone the payload is in the slot
        let delivered = match pending.entries.remove(&reply.correlation_id) {
            Some(slot) => slot.tx.send(reply.payload).is_ok(),
            None => false,
        };
        self.inner
            .metrics
            .pending_correlations
            .set(pending.entries.len() as i64);
        drop(pending);

        if delivered {
            self.inner.metrics.reply("delivered");
            debug!(correlation_id = %reply.correlation_id, "Reply delivered");
        } else {
            self.inner.metrics.reply("orphaned");
            warn!(correlation_id = %reply.correlation_id, "Dropping reply with no waiter");
        }
        delivered
    }

    /// Read `replies` until it ends, resolving each reply
    ///
    /// When the stream ends every outstanding waiter fails with
    /// `ReplyStreamClosed` and further registrations are refused.
    pub async fn run(&self, mut replies: ReplyStream) {
        info!("Correlator reading reply stream");

        while let Some(reply) = replies.next().await {
            self.resolve(reply);
        }

        warn!("Reply stream ended");
        self.close();
    }

    /// Spawn [`run`](Self::run) on the tokio runtime
    pub fn spawn(&self, replies: ReplyStream) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move { correlator.run(replies).await })
    }

    /// Fail all outstanding waiters and refuse new registrations
    pub fn close(&self) {
        let mut pending = self.inner.pending.lock();
        pending.closed = true;
        let abandoned = pending.entries.len();
        pending.entries.clear();
        self.inner.metrics.pending_correlations.set(0);
        drop(pending);

        if abandoned > 0 {
            warn!(abandoned, "Correlator closed with waiters outstanding");
        }
    }

    /// Number of outstanding entries
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().entries.len()
    }

    /// Whether `correlation_id` has a waiter
    pub fn is_outstanding(&self, correlation_id: &str) -> bool {
        self.inner.pending.lock().entries.contains_key(correlation_id)
    }

    /// Metrics this correlator records into
    pub fn metrics(&self) -> &BusMetrics {
        &self.inner.metrics
    }
}

/// Handle to one registered waiter
///
/// Dropping the handle before the reply arrives unregisters the entry; a late
/// reply is then dropped by the correlator.
#[derive(Debug)]
pub struct PendingReply {
    inner: Arc<Inner>,
    correlation_id: String,
    seq: u64,
    rx: oneshot::Receiver<Bytes>,
    finished: bool,
}

impl PendingReply {
    /// Correlation id this handle waits on
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply until `deadline`
    ///
    /// If the deadline and the reply cross, whichever removed the entry first
    /// wins: a reply already handed over is returned rather than discarded.
    pub async fn wait(mut self, deadline: Instant) -> Result<Bytes> {
        let outcome = tokio::time::timeout_at(deadline, &mut self.rx).await;
        self.finished = true;

        match outcome {
            Ok(Ok(payload)) => {
                self.inner.metrics.wait("replied");
                Ok(payload)
            }
            Ok(Err(_)) => {
                self.inner.metrics.wait("closed");
                Err(Error::ReplyStreamClosed)
            }
            Err(_) => {
                if !self.inner.unregister(&self.correlation_id, self.seq) {
                    if let Ok(payload) = self.rx.try_recv() {
                        self.inner.metrics.wait("replied");
                        return Ok(payload);
                    }
                }
                self.inner.metrics.wait("timeout");
                Err(Error::Timeout(self.correlation_id.clone()))
            }
        }
    }

    /// Unregister without waiting, e.g. after a failed publish
    pub fn abandon(mut self) {
        self.inner.unregister(&self.correlation_id, self.seq);
        self.finished = true;
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.unregister(&self.correlation_id, self.seq);
            self.inner.metrics.wait("cancelled");
            debug!(correlation_id = %self.correlation_id, "Reply wait cancelled");
        }
    }
}
