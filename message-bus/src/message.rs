//! Request/reply envelopes

use bytes::Bytes;

/// Outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Destination subject
    pub subject: String,

    /// Id the reply must carry back
    pub correlation_id: String,

    /// Address replies are sent to
    pub reply_to: String,

    /// Body
    pub payload: Bytes,
}

impl Request {
    /// Create new request
    pub fn new(
        subject: impl Into<String>,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            subject: subject.into(),
            correlation_id: correlation_id.into(),
            reply_to: reply_to.into(),
            payload: payload.into(),
        }
    }

    /// Build the reply to this request
    pub fn reply(&self, payload: impl Into<Bytes>) -> Reply {
        Reply::new(self.correlation_id.clone(), payload)
    }
}

/// Inbound reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Id copied from the request
    pub correlation_id: String,

    /// Body
    pub payload: Bytes,
}

impl Reply {
    /// Create new reply
    pub fn new(correlation_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload: payload.into(),
        }
    }
}
