//! Broker contract

use crate::{
    message::{Reply, Request},
    Result,
};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// The process's single inbound reply stream
pub type ReplyStream = BoxStream<'static, Reply>;

/// Duplex channel to the approval worker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Address replies to this process are delivered to
    fn reply_to(&self) -> &str;

    /// Publish a request
    async fn publish(&self, request: Request) -> Result<()>;

    /// Subscribe to the reply address
    ///
    /// Called once per process; the stream is handed to the correlator.
    async fn replies(&self) -> Result<ReplyStream>;
}
