//! In-process broker for tests and local runs

use crate::{
    broker::{Broker, ReplyStream},
    message::{Reply, Request},
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

const REPLY_ADDRESS: &str = "memory.replies";

/// Broker that keeps both directions in process
///
/// Published requests arrive at the paired [`ApprovalInbox`]; replies are
/// injected with a [`ReplySender`].
#[derive(Debug)]
pub struct MemoryBroker {
    requests: mpsc::UnboundedSender<Request>,
    replies_tx: mpsc::UnboundedSender<Reply>,
    replies_rx: Mutex<Option<mpsc::UnboundedReceiver<Reply>>>,
    closed: watch::Sender<bool>,
    fail_publish: AtomicBool,
}

impl MemoryBroker {
    /// Create a broker and the inbox its requests arrive at
    pub fn new() -> (Self, ApprovalInbox) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let broker = Self {
            requests,
            replies_tx: replies_tx.clone(),
            replies_rx: Mutex::new(Some(replies_rx)),
            closed,
            fail_publish: AtomicBool::new(false),
        };
        let inbox = ApprovalInbox {
            requests: requests_rx,
            replies: ReplySender(replies_tx),
        };
        (broker, inbox)
    }

    /// Handle for injecting replies
    pub fn reply_sender(&self) -> ReplySender {
        ReplySender(self.replies_tx.clone())
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// End the reply stream
    pub fn close_replies(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn reply_to(&self) -> &str {
        REPLY_ADDRESS
    }

    async fn publish(&self, request: Request) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Publish("broker unavailable".to_string()));
        }
        self.requests
            .send(request)
            .map_err(|_| Error::Publish("approval inbox dropped".to_string()))
    }

    async fn replies(&self) -> Result<ReplyStream> {
        let rx = self
            .replies_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Subscribe("reply stream already taken".to_string()))?;

        let mut closed = self.closed.subscribe();
        let shutdown = async move {
            let _ = closed.wait_for(|closed| *closed).await;
        };

        Ok(UnboundedReceiverStream::new(rx)
            .take_until(shutdown)
            .boxed())
    }
}

/// Injects replies into a [`MemoryBroker`]'s reply stream
#[derive(Debug, Clone)]
pub struct ReplySender(mpsc::UnboundedSender<Reply>);

impl ReplySender {
    /// Send a reply; fails once the reply stream is gone
    pub fn send(&self, reply: Reply) -> Result<()> {
        self.0
            .send(reply)
            .map_err(|_| Error::Publish("reply stream dropped".to_string()))
    }
}

/// Receiving end of a [`MemoryBroker`], standing in for the approval worker
#[derive(Debug)]
pub struct ApprovalInbox {
    requests: mpsc::UnboundedReceiver<Request>,
    replies: ReplySender,
}

impl ApprovalInbox {
    /// Next published request
    pub async fn recv(&mut self) -> Option<Request> {
        self.requests.recv().await
    }

    /// Next published request, if one is queued
    pub fn try_recv(&mut self) -> Option<Request> {
        self.requests.try_recv().ok()
    }

    /// Reply to `request`
    pub fn reply(&self, request: &Request, payload: impl Into<Bytes>) -> Result<()> {
        self.replies.send(request.reply(payload))
    }

    /// Handle for replying from elsewhere
    pub fn reply_sender(&self) -> ReplySender {
        self.replies.clone()
    }

    /// Answer every request with `decide`; `None` leaves it unanswered
    pub fn spawn_worker<F>(mut self, decide: F) -> JoinHandle<()>
    where
        F: Fn(&Request) -> Option<Bytes> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = self.requests.recv().await {
                if let Some(payload) = decide(&request) {
                    if self.reply(&request, payload).is_err() {
                        break;
                    }
                }
            }
        })
    }
}
