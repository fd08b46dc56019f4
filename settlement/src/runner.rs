//! Background task runner for settlement flows

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Runs settlement flows as tokio tasks with bounded concurrency
#[derive(Debug)]
pub struct SettlementRunner {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl SettlementRunner {
    /// Create a runner allowing `max_concurrent` flows at once
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn `flow`; it starts once a permit is free
    pub fn spawn<F>(&self, flow: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let mut tasks = self.tasks.lock();

        // Reap finished tasks so the set only holds live ones
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Settlement task failed");
            }
        }

        tasks.spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => flow.await,
                Err(_) => warn!("Runner closed; settlement flow not started"),
            }
        });
    }

    /// Flows spawned and not yet reaped
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for every spawned flow to finish
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let pending = tasks.len();
        if pending > 0 {
            info!(pending, "Waiting for settlement flows to finish");
        }

        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Settlement task failed");
            }
        }
    }
}
