//! Broker capability trait and delivery types.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::DrainError;

/// Prefix of every drain queue name.
pub const QUEUE_PREFIX: &str = "reporting.jobs";

/// Broker-assigned delivery identifier, scoped to one channel.
///
/// Tags increase monotonically per channel, so ordering by tag is ordering by
/// delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message body as handed over by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Undecoded bytes straight off the wire.
    Raw(Vec<u8>),
    /// Already parsed by the transport.
    Structured(serde_json::Value),
}

impl Payload {
    /// Lossy text rendering for log lines.
    pub fn to_log_string(&self) -> String {
        match self {
            Self::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Raw(s.as_bytes().to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

/// One instance of a message handed from the broker to the consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Payload,
    /// Set by the broker when this message was delivered before and requeued.
    pub redelivered: bool,
}

/// Queue declaration and consumption parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    /// Deliveries stay unacknowledged until the consumer acks or rejects them.
    pub manual_ack: bool,
    pub consumer_tag: String,
}

impl QueueSpec {
    /// Declaration for the drain named `name`: `reporting.jobs.<name>`, durable,
    /// shared, manually acknowledged.
    pub fn for_drain(name: &str) -> Self {
        Self {
            name: format!("{QUEUE_PREFIX}.{name}"),
            durable: true,
            exclusive: false,
            manual_ack: true,
            consumer_tag: format!("logdrain-{name}-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

/// Stream of deliveries for one subscription.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

/// What the drain needs from a message broker.
///
/// Implementations own the connection and channel; the drain only ever sees
/// delivery tags.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare the queue and start consuming it.
    async fn subscribe(&self, spec: &QueueSpec) -> Result<DeliveryStream, DrainError>;

    /// Acknowledge `tag`. With `multiple`, also every earlier unacknowledged
    /// delivery on the same channel.
    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), DrainError>;

    /// Reject `tag`, asking the broker to redeliver it when `requeue` is set.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), DrainError>;
}

#[async_trait]
impl<T: Broker + ?Sized> Broker for Arc<T> {
    async fn subscribe(&self, spec: &QueueSpec) -> Result<DeliveryStream, DrainError> {
        (**self).subscribe(spec).await
    }

    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), DrainError> {
        (**self).ack(tag, multiple).await
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), DrainError> {
        (**self).reject(tag, requeue).await
    }
}
