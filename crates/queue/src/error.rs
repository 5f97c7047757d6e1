//! Drain error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("reject error: {0}")]
    Reject(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A downstream dependency ran out of a pooled resource (connections,
    /// channels) and the caller may try again.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("batch handler error: {0}")]
    Handler(String),

    #[error("flush task aborted: {0}")]
    FlushAborted(String),
}

impl DrainError {
    /// Whether the bounded-time retry wrapper should re-run the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ResourceExhausted(_))
    }
}
