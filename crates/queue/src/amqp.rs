//! AMQP 0-9-1 broker over lapin.
//!
//! One connection, one channel. Delivery tags are channel-scoped, so the
//! same channel carries the consumer and every ack/reject.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery, DeliveryStream, DeliveryTag, Payload, QueueSpec};
use crate::error::DrainError;

const CHANNEL_CAPACITY: usize = 256;

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    /// Open a connection and a channel to `url`.
    pub async fn connect(url: &str) -> Result<Self, DrainError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| DrainError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| DrainError::Connection(e.to_string()))?;
        info!(channel_id = channel.id(), "connected to AMQP broker");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Close the channel and the connection. Unacknowledged deliveries go back
    /// to the queue.
    pub async fn close(&self) -> Result<(), DrainError> {
        self.channel
            .close(200, "logdrain shutdown")
            .await
            .map_err(|e| DrainError::Connection(e.to_string()))?;
        self.connection
            .close(200, "logdrain shutdown")
            .await
            .map_err(|e| DrainError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn subscribe(&self, spec: &QueueSpec) -> Result<DeliveryStream, DrainError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DrainError::Subscribe(format!("declare {}: {e}", spec.name)))?;

        let mut consumer = self
            .channel
            .basic_consume(
                &spec.name,
                &spec.consumer_tag,
                BasicConsumeOptions {
                    no_ack: !spec.manual_ack,
                    exclusive: spec.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DrainError::Subscribe(format!("consume {}: {e}", spec.name)))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let queue = spec.name.clone();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "consumer stream error");
                        break;
                    }
                };
                let delivery = Delivery {
                    tag: DeliveryTag(delivery.delivery_tag),
                    payload: Payload::Raw(delivery.data),
                    redelivered: delivery.redelivered,
                };
                if tx.send(delivery).await.is_err() {
                    debug!(queue = %queue, "delivery receiver dropped");
                    break;
                }
            }
            warn!(queue = %queue, "AMQP consumer stopped");
        });

        Ok(rx)
    }

    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), DrainError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions { multiple })
            .await
            .map_err(|e| DrainError::Ack(format!("tag {tag}: {e}")))
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), DrainError> {
        self.channel
            .basic_reject(tag.0, BasicRejectOptions { requeue })
            .await
            .map_err(|e| DrainError::Reject(format!("tag {tag}: {e}")))
    }
}
