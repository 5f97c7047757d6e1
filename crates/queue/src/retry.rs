//! Bounded-time retry for per-delivery processing.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::DrainError;
use crate::metrics::{Metric, Metrics};

/// How long one attempt may take and how often a timed-out attempt is re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, timeout: Duration) -> Self {
        Self { max_retries, timeout }
    }

    /// Total attempts before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(3))
    }
}

/// Run `op` under `policy.timeout`, re-running it from scratch after a
/// deadline miss or a [`DrainError::ResourceExhausted`] until
/// `policy.max_retries` is used up.
///
/// Any other error is returned on the spot. Every retry marks
/// [`Metric::TimeoutRetry`]; giving up marks [`Metric::TimeoutError`].
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    metrics: &dyn Metrics,
    mut op: F,
) -> Result<T, DrainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DrainError>>,
{
    let mut retry = 0u32;
    loop {
        let err = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => DrainError::Timeout(policy.timeout),
        };

        if retry < policy.max_retries {
            retry += 1;
            warn!(
                action = "receive",
                error = %err,
                timeout_seconds = policy.timeout.as_secs_f64(),
                retry,
                max_retries = policy.max_retries,
                "processing message timeout exceeded"
            );
            metrics.mark(Metric::TimeoutRetry);
        } else {
            error!(
                action = "receive",
                error = %err,
                max_retries = policy.max_retries,
                "failed to process message, aborting"
            );
            metrics.mark(Metric::TimeoutError);
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::metrics::DrainMetrics;

    #[tokio::test(start_paused = true)]
    async fn always_timing_out_runs_max_retries_plus_one_times() {
        let metrics = DrainMetrics::new();
        let attempts = &AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<(), _> = run_with_retry(&policy, &metrics, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<(), DrainError>>().await
        })
        .await;

        assert!(matches!(result, Err(DrainError::Timeout(d)) if d == Duration::from_secs(3)));
        assert_eq!(attempts.load(Ordering::SeqCst), policy.max_attempts());
        assert_eq!(metrics.get(Metric::TimeoutRetry), 2);
        assert_eq!(metrics.get(Metric::TimeoutError), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_a_later_attempt_finishes_in_time() {
        let metrics = DrainMetrics::new();
        let attempts = &AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(100));

        let result = run_with_retry(&policy, &metrics, move || async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok::<_, DrainError>(n)
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(metrics.get(Metric::TimeoutRetry), 1);
        assert_eq!(metrics.get(Metric::TimeoutError), 0);
    }

    #[tokio::test]
    async fn resource_exhaustion_is_retried() {
        let metrics = DrainMetrics::new();
        let attempts = &AtomicU32::new(0);

        let result: Result<(), _> = run_with_retry(&RetryPolicy::default(), &metrics, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(DrainError::ResourceExhausted("pool timeout".into()))
        })
        .await;

        assert!(matches!(result, Err(DrainError::ResourceExhausted(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_propagate_without_retry() {
        let metrics = DrainMetrics::new();
        let attempts = &AtomicU32::new(0);

        let result: Result<(), _> = run_with_retry(&RetryPolicy::default(), &metrics, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(DrainError::Ack("channel closed".into()))
        })
        .await;

        assert!(matches!(result, Err(DrainError::Ack(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.get(Metric::TimeoutRetry), 0);
        assert_eq!(metrics.get(Metric::TimeoutError), 0);
    }

    #[tokio::test]
    async fn zero_retries_gives_up_after_first_failure() {
        let metrics = DrainMetrics::new();
        let policy = RetryPolicy::new(0, Duration::from_secs(1));

        let result: Result<(), _> = run_with_retry(&policy, &metrics, move || async move {
            Err(DrainError::ResourceExhausted("pool".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(metrics.get(Metric::TimeoutError), 1);
    }
}
