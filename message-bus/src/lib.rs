//! Message Bus with request/reply correlation
//!
//! Provides point-to-point request/reply over a shared reply channel:
//! - Broker contract with NATS and in-process implementations
//! - Correlator: single reader of the reply stream, fan-out by correlation id
//! - Deadline-bounded waits that never leak correlation entries
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod broker;
pub mod correlator;
pub mod error;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod nats;
pub mod requester;

pub use broker::{Broker, ReplyStream};
pub use correlator::{Correlator, PendingReply};
pub use error::{Error, Result};
pub use memory::{ApprovalInbox, MemoryBroker, ReplySender};
pub use message::{Reply, Request};
pub use metrics::BusMetrics;
pub use nats::{NatsBroker, NatsConfig, CORRELATION_ID_HEADER};
pub use requester::Requester;
