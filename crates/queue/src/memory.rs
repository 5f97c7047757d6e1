//! In-process broker with manual-ack semantics, for tests and local runs.
//!
//! Behaves like a single AMQP channel: delivery tags start at 1 and grow
//! monotonically, `ack(tag, true)` settles every outstanding tag up to and
//! including `tag`, acking an unknown tag is an error, and a requeued message
//! comes back under a fresh tag with `redelivered` set.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::{Broker, Delivery, DeliveryStream, DeliveryTag, Payload, QueueSpec};
use crate::error::DrainError;

const CHANNEL_CAPACITY: usize = 1024;

/// Failure injected into an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFailure {
    /// Plain broker error, not retried by the delivery path.
    Error,
    /// Transient exhaustion, retried within the delivery budget.
    Exhausted,
}

#[derive(Default)]
struct State {
    next_tag: u64,
    unacked: BTreeMap<DeliveryTag, Payload>,
    consumer: Option<mpsc::Sender<Delivery>>,
    backlog: VecDeque<Delivery>,
    declared: Vec<QueueSpec>,
    acks: Vec<(DeliveryTag, bool)>,
    rejects: Vec<(DeliveryTag, bool)>,
    dropped: Vec<Payload>,
    ack_failures: HashMap<DeliveryTag, (AckFailure, u32)>,
    reject_failures: HashMap<DeliveryTag, u32>,
    ack_delay: Option<Duration>,
}

impl State {
    fn issue(&mut self, payload: Payload, redelivered: bool) -> Delivery {
        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        self.unacked.insert(tag, payload.clone());
        Delivery {
            tag,
            payload,
            redelivered,
        }
    }

    fn push(&mut self, delivery: Delivery) {
        let delivery = match &self.consumer {
            Some(tx) => match tx.try_send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(d) | mpsc::error::TrySendError::Closed(d)) => d,
            },
            None => delivery,
        };
        self.backlog.push_back(delivery);
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    acks_in_flight: AtomicUsize,
    max_acks_in_flight: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a delivery without routing it to a consumer. For driving
    /// `DrainQueue::receive` by hand.
    pub fn deliver(&self, payload: impl Into<Payload>) -> Delivery {
        self.state().issue(payload.into(), false)
    }

    /// Publish to the subscribed consumer, or hold it until one subscribes.
    pub fn publish(&self, payload: impl Into<Payload>) -> DeliveryTag {
        let mut state = self.state();
        let delivery = state.issue(payload.into(), false);
        let tag = delivery.tag;
        state.push(delivery);
        tag
    }

    /// Close the delivery stream of the current consumer.
    pub fn close(&self) {
        self.state().consumer = None;
    }

    /// Fail the next `times` acknowledgments of `tag`.
    pub fn fail_ack(&self, tag: DeliveryTag, failure: AckFailure, times: u32) {
        self.state().ack_failures.insert(tag, (failure, times));
    }

    /// Fail the next `times` rejects of `tag`. The delivery stays outstanding.
    pub fn fail_reject(&self, tag: DeliveryTag, times: u32) {
        self.state().reject_failures.insert(tag, times);
    }

    /// Delay every acknowledgment by `delay`.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.state().ack_delay = Some(delay);
    }

    /// Successful acknowledgments, in call order.
    pub fn acks(&self) -> Vec<(DeliveryTag, bool)> {
        self.state().acks.clone()
    }

    pub fn rejects(&self) -> Vec<(DeliveryTag, bool)> {
        self.state().rejects.clone()
    }

    /// Outstanding delivery tags.
    pub fn unacked(&self) -> Vec<DeliveryTag> {
        self.state().unacked.keys().copied().collect()
    }

    /// Payloads rejected without requeue.
    pub fn dropped(&self) -> Vec<Payload> {
        self.state().dropped.clone()
    }

    pub fn declared_queues(&self) -> Vec<QueueSpec> {
        self.state().declared.clone()
    }

    /// Highest number of acknowledgments observed running at the same time.
    pub fn max_concurrent_acks(&self) -> usize {
        self.max_acks_in_flight.load(Ordering::SeqCst)
    }

    fn settle_ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), DrainError> {
        let mut state = self.state();
        if let Some((failure, remaining)) = state.ack_failures.get_mut(&tag) {
            if *remaining > 0 {
                *remaining -= 1;
                let failure = *failure;
                return Err(match failure {
                    AckFailure::Error => DrainError::Ack(format!("injected failure for tag {tag}")),
                    AckFailure::Exhausted => {
                        DrainError::ResourceExhausted(format!("injected exhaustion for tag {tag}"))
                    }
                });
            }
        }

        if state.unacked.remove(&tag).is_none() {
            return Err(DrainError::Ack(format!("unknown delivery tag {tag}")));
        }
        if multiple {
            state.unacked.retain(|t, _| *t > tag);
        }
        state.acks.push((tag, multiple));
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, spec: &QueueSpec) -> Result<DeliveryStream, DrainError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = self.state();
        state.declared.push(spec.clone());
        while let Some(delivery) = state.backlog.pop_front() {
            if tx.try_send(delivery).is_err() {
                return Err(DrainError::Subscribe(format!(
                    "backlog for {} exceeds channel capacity",
                    spec.name
                )));
            }
        }
        state.consumer = Some(tx);
        debug!(queue = %spec.name, "memory consumer attached");
        Ok(rx)
    }

    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), DrainError> {
        let now = self.acks_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.acks_in_flight);
        self.max_acks_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.state().ack_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.settle_ack(tag, multiple)
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), DrainError> {
        let mut state = self.state();
        if let Some(remaining) = state.reject_failures.get_mut(&tag) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DrainError::Reject(format!("injected failure for tag {tag}")));
            }
        }
        let payload = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| DrainError::Reject(format!("unknown delivery tag {tag}")))?;
        state.rejects.push((tag, requeue));
        if requeue {
            let delivery = state.issue(payload, true);
            state.push(delivery);
        } else {
            state.dropped.push(payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tags_are_monotonic_from_one() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.deliver("a").tag, DeliveryTag(1));
        assert_eq!(broker.deliver("b").tag, DeliveryTag(2));
        assert_eq!(broker.unacked(), vec![DeliveryTag(1), DeliveryTag(2)]);
    }

    #[tokio::test]
    async fn cumulative_ack_settles_everything_up_to_the_tag() {
        let broker = MemoryBroker::new();
        for p in ["a", "b", "c", "d"] {
            broker.deliver(p);
        }
        broker.ack(DeliveryTag(3), true).await.unwrap();
        assert_eq!(broker.unacked(), vec![DeliveryTag(4)]);

        let err = broker.ack(DeliveryTag(2), false).await.unwrap_err();
        assert!(matches!(err, DrainError::Ack(_)));
    }

    #[tokio::test]
    async fn requeue_redelivers_under_a_new_tag() {
        let broker = MemoryBroker::new();
        let mut stream = broker.subscribe(&QueueSpec::for_drain("logs")).await.unwrap();
        let tag = broker.publish("payload");

        let first = stream.recv().await.unwrap();
        assert_eq!(first.tag, tag);
        assert!(!first.redelivered);

        broker.reject(tag, true).await.unwrap();
        let again = stream.recv().await.unwrap();
        assert_eq!(again.tag, DeliveryTag(2));
        assert!(again.redelivered);
        assert_eq!(again.payload, Payload::from("payload"));
        assert_eq!(broker.rejects(), vec![(tag, true)]);
    }

    #[tokio::test]
    async fn backlog_is_delivered_on_subscribe() {
        let broker = MemoryBroker::new();
        broker.publish("early");
        let mut stream = broker.subscribe(&QueueSpec::for_drain("logs")).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().payload, Payload::from("early"));
        assert_eq!(broker.declared_queues()[0].name, "reporting.jobs.logs");
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let broker = MemoryBroker::new();
        let tag = broker.deliver("x").tag;
        broker.fail_ack(tag, AckFailure::Exhausted, 1);

        let err = broker.ack(tag, false).await.unwrap_err();
        assert!(err.is_retryable());
        broker.ack(tag, false).await.unwrap();
        assert!(broker.unacked().is_empty());
    }

    #[tokio::test]
    async fn injected_reject_failure_keeps_the_delivery_outstanding() {
        let broker = MemoryBroker::new();
        let tag = broker.deliver("x").tag;
        broker.fail_reject(tag, 1);

        let err = broker.reject(tag, true).await.unwrap_err();
        assert!(matches!(err, DrainError::Reject(_)));
        assert_eq!(broker.unacked(), vec![tag]);
        assert!(broker.rejects().is_empty());

        broker.reject(tag, true).await.unwrap();
        assert_eq!(broker.unacked(), vec![DeliveryTag(2)]);
    }

    #[tokio::test]
    async fn reject_without_requeue_drops() {
        let broker = MemoryBroker::new();
        let tag = broker.deliver("gone").tag;
        broker.reject(tag, false).await.unwrap();
        assert_eq!(broker.dropped(), vec![Payload::from("gone")]);
        assert!(broker.unacked().is_empty());
    }
}
