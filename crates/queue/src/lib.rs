pub mod amqp;
pub mod broker;
pub mod buffer;
pub mod decoder;
pub mod drain;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod report;
pub mod retry;

pub use amqp::AmqpBroker;
pub use broker::{Broker, Delivery, DeliveryStream, DeliveryTag, Payload, QueueSpec};
pub use buffer::BatchBuffer;
pub use decoder::{Decoded, Decoder, Record};
pub use drain::{
    BatchHandler, DeliveryOutcome, DrainQueue, DrainQueueBuilder, DrainSettings, FlushReport,
    PeriodicFlush, Subscription,
};
pub use error::DrainError;
pub use memory::{AckFailure, MemoryBroker};
pub use metrics::{DrainMetrics, Metric, Metrics, MetricsSnapshot};
pub use report::{ErrorReporter, LogReporter, ReportContext, ReportError};
pub use retry::{run_with_retry, RetryPolicy};
