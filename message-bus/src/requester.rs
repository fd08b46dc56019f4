//! Request/reply over a broker

use crate::{
    broker::Broker,
    correlator::Correlator,
    message::Request,
    Result,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

/// Publishes a request and waits for its correlated reply
#[derive(Clone)]
pub struct Requester {
    broker: Arc<dyn Broker>,
    correlator: Correlator,
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("reply_to", &self.broker.reply_to())
            .field("correlator", &self.correlator)
            .finish()
    }
}

impl Requester {
    /// Create new requester
    ///
    /// The correlator must be fed from `broker.replies()`.
    pub fn new(broker: Arc<dyn Broker>, correlator: Correlator) -> Self {
        Self { broker, correlator }
    }

    /// Correlator waiters are registered with
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Send `payload` to `subject` and wait until `deadline` for the reply
    ///
    /// The waiter is registered before publishing so a fast reply cannot be
    /// missed. A failed publish unregisters it before returning.
    pub async fn request(
        &self,
        subject: &str,
        correlation_id: &str,
        payload: impl Into<Bytes>,
        deadline: Instant,
    ) -> Result<Bytes> {
        let pending = self.correlator.register(correlation_id)?;
        let request = Request::new(subject, correlation_id, self.broker.reply_to(), payload);

        match self.broker.publish(request).await {
            Ok(()) => self.correlator.metrics().published(true),
            Err(e) => {
                self.correlator.metrics().published(false);
                warn!(correlation_id, error = %e, "Failed to publish request");
                pending.abandon();
                return Err(e);
            }
        }

        pending.wait(deadline).await
    }
}
