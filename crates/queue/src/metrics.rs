//! Counters for the drain.
//!
//! Components receive a [`Metrics`] handle at construction and `mark` events
//! on it. [`DrainMetrics`] is the in-process implementation: one atomic
//! counter per [`Metric`], readable as a serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

/// Prefix shared by every metric name.
pub const METRICS_PREFIX: &str = "logs.queue";

const METRIC_COUNT: usize = 13;

/// Countable drain events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// A delivery entered the receive path.
    Received,
    /// A decoded record was inserted into the batch buffer.
    Buffered,
    /// An empty or undecodable payload was acknowledged and discarded.
    AckedEmpty,
    DecodeError,
    TimeoutRetry,
    TimeoutError,
    /// A delivery was rejected with requeue after an unrecoverable failure.
    ReceiveRetry,
    Flush,
    /// One record handed to the batch handler.
    FlushDelivered,
    /// A snapshotted entry was gone from the buffer by the time it was removed.
    FlushRace,
    AckError,
    /// A periodic flush outlived its timeout interval.
    FlushTimeout,
    HandlerError,
}

impl Metric {
    pub const ALL: [Metric; METRIC_COUNT] = [
        Metric::Received,
        Metric::Buffered,
        Metric::AckedEmpty,
        Metric::DecodeError,
        Metric::TimeoutRetry,
        Metric::TimeoutError,
        Metric::ReceiveRetry,
        Metric::Flush,
        Metric::FlushDelivered,
        Metric::FlushRace,
        Metric::AckError,
        Metric::FlushTimeout,
        Metric::HandlerError,
    ];

    /// Name relative to [`METRICS_PREFIX`].
    pub fn name(self) -> &'static str {
        match self {
            Metric::Received => "receive",
            Metric::Buffered => "buffered",
            Metric::AckedEmpty => "acked_empty",
            Metric::DecodeError => "payload.decode_error",
            Metric::TimeoutRetry => "timeout.retry",
            Metric::TimeoutError => "timeout.error",
            Metric::ReceiveRetry => "receive.retry",
            Metric::Flush => "flush",
            Metric::FlushDelivered => "flush.delivered",
            Metric::FlushRace => "flush.race",
            Metric::AckError => "ack.error",
            Metric::FlushTimeout => "flush.timeout",
            Metric::HandlerError => "batch.handler_error",
        }
    }

    /// Fully qualified name, e.g. `logs.queue.timeout.retry`.
    pub fn qualified_name(self) -> String {
        format!("{METRICS_PREFIX}.{}", self.name())
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Sink for drain events.
pub trait Metrics: Send + Sync {
    fn mark(&self, metric: Metric);
}

impl<T: Metrics + ?Sized> Metrics for Arc<T> {
    fn mark(&self, metric: Metric) {
        (**self).mark(metric)
    }
}

/// Atomic counters, one per [`Metric`].
#[derive(Debug, Default)]
pub struct DrainMetrics {
    counters: [AtomicU64; METRIC_COUNT],
}

impl DrainMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.counters[metric.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: Metric::ALL
                .iter()
                .map(|m| (m.qualified_name(), self.get(*m)))
                .collect(),
        }
    }
}

impl Metrics for DrainMetrics {
    fn mark(&self, metric: Metric) {
        let total = self.counters[metric.index()].fetch_add(1, Ordering::Relaxed) + 1;
        trace!(metric = metric.name(), total, "mark");
    }
}

/// JSON-serializable counter values, in [`Metric::ALL`] order.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<(String, u64)>,
}

impl MetricsSnapshot {
    /// Counters that have fired at least once.
    pub fn non_zero(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters
            .iter()
            .filter(|(_, v)| *v > 0)
            .map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed() {
        assert_eq!(Metric::DecodeError.qualified_name(), "logs.queue.payload.decode_error");
        assert_eq!(Metric::ReceiveRetry.qualified_name(), "logs.queue.receive.retry");
    }

    #[test]
    fn all_lists_every_variant_in_index_order() {
        for (i, metric) in Metric::ALL.iter().enumerate() {
            assert_eq!(metric.index(), i);
        }
    }

    #[test]
    fn mark_increments_only_its_counter() {
        let metrics = DrainMetrics::new();
        metrics.mark(Metric::TimeoutRetry);
        metrics.mark(Metric::TimeoutRetry);
        metrics.mark(Metric::Flush);

        assert_eq!(metrics.get(Metric::TimeoutRetry), 2);
        assert_eq!(metrics.get(Metric::Flush), 1);
        assert_eq!(metrics.get(Metric::TimeoutError), 0);

        let fired: Vec<_> = metrics.snapshot().non_zero().map(|(k, _)| k.to_string()).collect();
        assert_eq!(fired, vec!["logs.queue.timeout.retry", "logs.queue.flush"]);
    }

    #[test]
    fn shared_handle_marks_through_arc() {
        let metrics = Arc::new(DrainMetrics::new());
        let handle: Arc<dyn Metrics> = metrics.clone();
        handle.mark(Metric::AckError);
        assert_eq!(metrics.get(Metric::AckError), 1);
    }
}
