//! NATS broker
//!
//! Requests go to a subject with the process inbox as reply address and the
//! correlation id in a `Correlation-Id` header. The approval worker copies
//! the header onto its reply.

use crate::{
    broker::{Broker, ReplyStream},
    message::{Reply, Request},
    Error, Result,
};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Header carrying the correlation id on requests and replies
pub const CORRELATION_ID_HEADER: &str = "Correlation-Id";

/// NATS connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Connection timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Inbox prefix for this process's reply address (defaults to `_INBOX`)
    pub inbox_prefix: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connect_timeout_ms: 5000,
            inbox_prefix: None,
        }
    }
}

/// Broker backed by a NATS connection
#[derive(Debug, Clone)]
pub struct NatsBroker {
    client: Client,
    inbox: String,
}

impl NatsBroker {
    /// Connect and allocate this process's reply inbox
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let mut options = ConnectOptions::new()
            .connection_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(prefix) = &config.inbox_prefix {
            options = options.custom_inbox_prefix(prefix.as_str());
        }

        let client = options
            .connect(config.url.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let inbox = client.new_inbox();

        info!(url = %config.url, inbox = %inbox, "Connected to NATS");
        Ok(Self { client, inbox })
    }

    /// Underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn reply_to(&self) -> &str {
        &self.inbox
    }

    async fn publish(&self, request: Request) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_ID_HEADER, request.correlation_id.as_str());

        self.client
            .publish_with_reply_and_headers(
                request.subject,
                request.reply_to,
                headers,
                request.payload,
            )
            .await
            .map_err(|e| Error::Publish(e.to_string()))
    }

    async fn replies(&self) -> Result<ReplyStream> {
        let subscriber = self
            .client
            .subscribe(self.inbox.clone())
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        info!(inbox = %self.inbox, "Subscribed to reply inbox");

        let stream = subscriber.filter_map(|message| async move {
            let correlation_id = message
                .headers
                .as_ref()
                .and_then(|headers| headers.get(CORRELATION_ID_HEADER))
                .map(|value| value.as_str().to_string());

            match correlation_id {
                Some(correlation_id) => Some(Reply::new(correlation_id, message.payload)),
                None => {
                    warn!("Dropping reply without {} header", CORRELATION_ID_HEADER);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}
