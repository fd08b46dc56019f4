//! Approval client
//!
//! Asks the approval worker about one transaction and turns whatever happens
//! into an [`ApprovalOutcome`] within the configured deadline. No retries: the
//! correlation id is the transaction id, so a second publish would be
//! indistinguishable from the first.

use crate::{config::ApprovalConfig, Error, Result};
use ledger_core::{TransactionId, TransactionStatus};
use message_bus::Requester;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// Resolved result of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApprovalOutcome {
    /// Worker approved
    Approved,
    /// Worker declined
    Rejected,
    /// No reply before the deadline
    TimedOut,
    /// Publish failed, reply stream gone, or reply unreadable
    TransportError,
}

impl ApprovalOutcome {
    /// Map a reply payload: the decimal status code `1` approves, `2` rejects
    pub fn from_reply(payload: &[u8]) -> Self {
        let code = std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.trim().parse::<i16>().ok())
            .and_then(TransactionStatus::from_code);

        match code {
            Some(TransactionStatus::Success) => ApprovalOutcome::Approved,
            Some(TransactionStatus::Error) => ApprovalOutcome::Rejected,
            _ => ApprovalOutcome::TransportError,
        }
    }

    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalOutcome::Approved => "approved",
            ApprovalOutcome::Rejected => "rejected",
            ApprovalOutcome::TimedOut => "timed_out",
            ApprovalOutcome::TransportError => "transport_error",
        }
    }

    /// Only `Approved` commits the reservation
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalOutcome::Approved)
    }
}

impl fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests approval for transactions over the broker
#[derive(Debug, Clone)]
pub struct SettlementClient {
    requester: Requester,
    subject: String,
    timeout: Duration,
}

impl SettlementClient {
    /// Create new client
    pub fn new(requester: Requester, config: &ApprovalConfig) -> Self {
        Self {
            requester,
            subject: config.request_subject.clone(),
            timeout: config.timeout(),
        }
    }

    /// Whether an approval request for `transaction_id` is in flight
    pub fn is_in_flight(&self, transaction_id: TransactionId) -> bool {
        self.requester
            .correlator()
            .is_outstanding(&transaction_id.to_string())
    }

    /// Request approval and wait at most the configured timeout
    ///
    /// Fails only with `DuplicateCorrelation`; every broker failure is an
    /// outcome.
    pub async fn request_approval(&self, transaction_id: TransactionId) -> Result<ApprovalOutcome> {
        let deadline = Instant::now() + self.timeout;
        let correlation_id = transaction_id.to_string();

        let reply = self
            .requester
            .request(&self.subject, &correlation_id, correlation_id.clone(), deadline)
            .await;

        let outcome = match reply {
            Ok(payload) => {
                let outcome = ApprovalOutcome::from_reply(&payload);
                if outcome == ApprovalOutcome::TransportError {
                    warn!(
                        transaction_id = %transaction_id,
                        payload = %String::from_utf8_lossy(&payload),
                        "Unreadable approval reply"
                    );
                }
                outcome
            }
            Err(message_bus::Error::DuplicateCorrelation(_)) => {
                error!(transaction_id = %transaction_id, "Approval already in flight");
                return Err(Error::DuplicateCorrelation(transaction_id));
            }
            Err(message_bus::Error::Timeout(_)) => {
                warn!(
                    transaction_id = %transaction_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Approval timed out"
                );
                ApprovalOutcome::TimedOut
            }
            Err(e) => {
                warn!(transaction_id = %transaction_id, error = %e, "Approval transport error");
                ApprovalOutcome::TransportError
            }
        };

        Ok(outcome)
    }
}
