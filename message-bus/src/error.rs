//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Subscribe error
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Correlation id already has a waiter
    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelation(String),

    /// No reply before the deadline
    #[error("Timed out waiting for reply to {0}")]
    Timeout(String),

    /// Reply stream ended while the caller was waiting
    #[error("Reply stream closed")]
    ReplyStreamClosed,

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
