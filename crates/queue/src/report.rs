//! Secondary error reporting for failed deliveries and batches.

use std::sync::Arc;

use thiserror::Error;
use tracing::error;

use crate::error::DrainError;

/// The reporter itself failed; callers log this and carry on.
#[derive(Debug, Error)]
#[error("error report failed: {0}")]
pub struct ReportError(pub String);

/// Where a reported error happened.
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub queue: &'a str,
    pub stage: &'a str,
}

/// Best-effort sink for errors that deserve more than a log line (an
/// exception tracker, an alerting hook).
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &DrainError, context: ReportContext<'_>) -> Result<(), ReportError>;
}

impl<T: ErrorReporter + ?Sized> ErrorReporter for Arc<T> {
    fn report(&self, error: &DrainError, context: ReportContext<'_>) -> Result<(), ReportError> {
        (**self).report(error, context)
    }
}

/// Reports by logging at error level. Never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &DrainError, context: ReportContext<'_>) -> Result<(), ReportError> {
        error!(
            queue = context.queue,
            stage = context.stage,
            error = %error,
            retryable = error.is_retryable(),
            "reported drain error"
        );
        Ok(())
    }
}
