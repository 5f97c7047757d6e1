//! The drain queue: decode deliveries into a shared buffer and hand them to a
//! [`BatchHandler`] in acknowledged batches.
//!
//! Two triggers flush the buffer: the delivery path once the buffer reaches
//! `batch_size`, and a background timer every `execution_interval`. Both go
//! through one flush guard, so flushes never interleave. A flush walks a
//! tag-ordered snapshot and moves every entry through
//!
//! ```text
//! pending ─remove─▶ removed ─ack ok──▶ acknowledged  (goes into the batch)
//!    │                 └─────ack err─▶ reinserted    (retried next flush)
//!    └─remove fails─▶ raced                          (someone else has it)
//! ```
//!
//! and then calls the handler with whatever was acknowledged, even when that
//! is nothing. Flushes run as their own tasks: a caller that stops waiting
//! for one never cancels it halfway through its acknowledgments.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use logdrain_core::LogsConfig;

use crate::broker::{Broker, Delivery, DeliveryTag, QueueSpec};
use crate::buffer::BatchBuffer;
use crate::decoder::{Decoded, Decoder, Record};
use crate::error::DrainError;
use crate::metrics::{DrainMetrics, Metric, Metrics};
use crate::report::{ErrorReporter, LogReporter, ReportContext};
use crate::retry::{run_with_retry, RetryPolicy};

/// Shortest periodic flush cadence; shorter settings are raised to it.
pub const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(1);

// ── Handler ──────────────────────────────────────────────────────────

/// Downstream consumer of drained batches.
///
/// Called inside the flush critical section: while it runs, no other flush can
/// start, so a slow handler slows the whole drain down. The batch may be
/// empty. By the time the handler runs, every record in the batch has been
/// acknowledged with the broker; an error is logged and counted but cannot
/// bring the messages back.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: Vec<Record>) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: BatchHandler + ?Sized> BatchHandler for Arc<T> {
    async fn handle(&self, batch: Vec<Record>) -> anyhow::Result<()> {
        (**self).handle(batch).await
    }
}

// ── Settings and reports ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrainSettings {
    /// Buffer size that triggers an inline flush; 0 leaves flushing to the timer.
    pub batch_size: usize,
    pub execution_interval: Duration,
    /// How long a periodic flush may run before it is reported as overdue.
    pub timeout_interval: Duration,
    /// Per-delivery processing budget.
    pub retry: RetryPolicy,
    /// Acknowledge flushed entries cumulatively.
    pub ack_multiple: bool,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            execution_interval: Duration::from_secs(3),
            timeout_interval: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            ack_multiple: true,
        }
    }
}

impl From<&LogsConfig> for DrainSettings {
    fn from(logs: &LogsConfig) -> Self {
        Self {
            batch_size: logs.drain_batch_size,
            execution_interval: logs.execution_interval(),
            timeout_interval: logs.timeout_interval(),
            retry: RetryPolicy::new(logs.max_retries, logs.receive_timeout()),
            ack_multiple: logs.ack_multiple,
        }
    }
}

/// Where a delivery ended up once `receive` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryOutcome {
    /// In the buffer, or already flushed by the time `receive` returned.
    Buffered,
    /// Nothing to drain; acknowledged and dropped.
    AckedEmpty,
    /// Processing failed; handed back to the broker for redelivery.
    RejectedRequeued,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Entries in the snapshot.
    pub snapshot: usize,
    /// Records handed to the batch handler.
    pub delivered: usize,
    /// Entries already gone from the buffer when the flush reached them.
    pub raced: usize,
    /// Entries put back after a failed acknowledgment.
    pub reinserted: usize,
    pub handler_failed: bool,
}

enum EntryState {
    Raced,
    Acknowledged(Record),
    Reinserted,
}

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent builder for a [`DrainQueue`].
///
/// # Example
/// ```ignore
/// let drain = DrainQueue::builder("logs", broker, handler)
///     .settings(DrainSettings::from(&config.logs))
///     .metrics(metrics.clone())
///     .build();
/// let subscription = drain.subscribe().await?;
/// ```
pub struct DrainQueueBuilder {
    name: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn BatchHandler>,
    settings: DrainSettings,
    metrics: Option<Arc<dyn Metrics>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl DrainQueueBuilder {
    pub fn settings(mut self, settings: DrainSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Counter sink (default: a private [`DrainMetrics`]).
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Secondary error sink (default: [`LogReporter`]).
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> Arc<DrainQueue> {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(DrainMetrics::new()) as Arc<dyn Metrics>);
        Arc::new(DrainQueue {
            name: self.name,
            broker: self.broker,
            handler: self.handler,
            settings: self.settings,
            decoder: Decoder::new(metrics.clone()),
            buffer: BatchBuffer::new(),
            flush_guard: Mutex::new(()),
            metrics,
            reporter: self.reporter.unwrap_or_else(|| Arc::new(LogReporter)),
        })
    }
}

// ── DrainQueue ───────────────────────────────────────────────────────

pub struct DrainQueue {
    name: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn BatchHandler>,
    settings: DrainSettings,
    decoder: Decoder,
    buffer: BatchBuffer,
    /// Held for the whole of every flush.
    flush_guard: Mutex<()>,
    metrics: Arc<dyn Metrics>,
    reporter: Arc<dyn ErrorReporter>,
}

impl DrainQueue {
    pub fn builder(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn BatchHandler>,
    ) -> DrainQueueBuilder {
        DrainQueueBuilder {
            name: name.into(),
            broker,
            handler,
            settings: DrainSettings::default(),
            metrics: None,
            reporter: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &DrainSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &BatchBuffer {
        &self.buffer
    }

    // ── Delivery path ────────────────────────────────────────────────

    /// Process one delivery: decode, buffer, maybe flush, all within the
    /// retry budget. Never fails; the outcome says where the message went.
    pub async fn receive(self: &Arc<Self>, delivery: Delivery) -> DeliveryOutcome {
        self.metrics.mark(Metric::Received);
        let buffered = OnceLock::new();

        let attempt = {
            let (delivery, buffered) = (&delivery, &buffered);
            run_with_retry(&self.settings.retry, &*self.metrics, move || {
                self.process(delivery, buffered)
            })
            .await
        };

        match attempt {
            Ok(outcome) => outcome,
            Err(error) => self.requeue(&delivery, buffered.get(), error).await,
        }
    }

    /// One attempt. A delivery that an earlier attempt already buffered is not
    /// decoded or inserted again; only the threshold check is repeated.
    async fn process(
        self: &Arc<Self>,
        delivery: &Delivery,
        buffered: &OnceLock<Record>,
    ) -> Result<DeliveryOutcome, DrainError> {
        if buffered.get().is_none() {
            match self.decoder.decode(&delivery.payload) {
                Decoded::Record(record) => {
                    self.buffer.insert(delivery.tag, Arc::clone(&record));
                    let _ = buffered.set(record);
                    self.metrics.mark(Metric::Buffered);
                }
                Decoded::Empty | Decoded::Unusable => {
                    info!(
                        queue = %self.name,
                        delivery_tag = %delivery.tag,
                        "acking empty or undecodable payload"
                    );
                    // Never cumulative: earlier deliveries may still sit in the buffer.
                    self.broker.ack(delivery.tag, false).await?;
                    self.metrics.mark(Metric::AckedEmpty);
                    return Ok(DeliveryOutcome::AckedEmpty);
                }
            }
        }

        if self.size_trigger_reached() {
            self.flush().await?;
        }
        Ok(DeliveryOutcome::Buffered)
    }

    fn size_trigger_reached(&self) -> bool {
        self.settings.batch_size > 0 && self.buffer.len() >= self.settings.batch_size
    }

    /// Give a failed delivery back to the broker.
    ///
    /// A buffered delivery is withdrawn first. If the broker refuses the
    /// reject, the record goes back into the buffer: it is still outstanding
    /// with the broker and the next flush acknowledges and delivers it.
    async fn requeue(
        &self,
        delivery: &Delivery,
        buffered: Option<&Record>,
        error: DrainError,
    ) -> DeliveryOutcome {
        let withdrawn = match buffered {
            Some(record) if !self.buffer.remove_pair(delivery.tag, record) => {
                // A flush took it; it is acknowledged or will be retried from the buffer.
                warn!(
                    queue = %self.name,
                    delivery_tag = %delivery.tag,
                    error = %error,
                    "delivery failed after being flushed, not requeueing"
                );
                return DeliveryOutcome::Buffered;
            }
            other => other,
        };

        self.log_exception(&error, delivery);
        if let Err(e) = self.broker.reject(delivery.tag, true).await {
            error!(
                queue = %self.name,
                delivery_tag = %delivery.tag,
                error = %e,
                "failed to reject message"
            );
            if let Some(record) = withdrawn {
                self.buffer.insert(delivery.tag, Arc::clone(record));
                warn!(
                    queue = %self.name,
                    delivery_tag = %delivery.tag,
                    "record restored to the batch buffer"
                );
                return DeliveryOutcome::Buffered;
            }
            return DeliveryOutcome::RejectedRequeued;
        }
        self.metrics.mark(Metric::ReceiveRetry);
        error!(
            queue = %self.name,
            delivery_tag = %delivery.tag,
            stage = "queue:receive",
            "message requeued"
        );
        DeliveryOutcome::RejectedRequeued
    }

    fn log_exception(&self, error: &DrainError, delivery: &Delivery) {
        error!(
            action = "receive",
            queue = %self.name,
            delivery_tag = %delivery.tag,
            redelivered = delivery.redelivered,
            error = %error,
            payload = %delivery.payload.to_log_string(),
            "exception caught in queue while processing payload"
        );
        self.report_error(error, "queue:receive");
    }

    /// Hand `error` to the reporter. A failing or panicking reporter only
    /// produces a failsafe log line.
    fn report_error(&self, error: &DrainError, stage: &str) {
        let context = ReportContext {
            queue: &self.name,
            stage,
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.reporter.report(error, context))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(queue = %self.name, error = %e, "!!!FAILSAFE!!! error reporter failed"),
            Err(_) => error!(queue = %self.name, "!!!FAILSAFE!!! error reporter panicked"),
        }
    }

    // ── Flush ────────────────────────────────────────────────────────

    /// Run one flush to completion and return its report.
    ///
    /// Waits for any flush already in progress. The flush itself runs as a
    /// separate task, so dropping this future does not interrupt it.
    pub async fn flush(self: &Arc<Self>) -> Result<FlushReport, DrainError> {
        self.spawn_flush().await.map_err(|e| self.flush_aborted(e))
    }

    /// A flush task ended without a report. Only a panicking handler gets
    /// here; its records were already acknowledged.
    fn flush_aborted(&self, e: JoinError) -> DrainError {
        if e.is_panic() {
            self.metrics.mark(Metric::HandlerError);
        }
        error!(queue = %self.name, error = %e, "flush task aborted");
        let error = DrainError::FlushAborted(e.to_string());
        self.report_error(&error, "queue:flush");
        error
    }

    fn spawn_flush(self: &Arc<Self>) -> JoinHandle<FlushReport> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = this.flush_guard.lock().await;
            this.flush_batch_buffer().await
        })
    }

    /// The flush body. Caller holds `flush_guard`.
    async fn flush_batch_buffer(&self) -> FlushReport {
        let snapshot = self.buffer.snapshot();
        if snapshot.is_empty() {
            debug!(queue = %self.name, "flushing empty batch buffer");
        } else {
            info!(queue = %self.name, size = snapshot.len(), "flushing batch buffer");
        }

        let mut report = FlushReport {
            snapshot: snapshot.len(),
            ..FlushReport::default()
        };
        let mut batch = Vec::with_capacity(snapshot.len());
        let mut cumulative = self.settings.ack_multiple;

        for (tag, record) in snapshot {
            match self.settle(tag, record, cumulative).await {
                EntryState::Acknowledged(record) => batch.push(record),
                EntryState::Raced => {
                    report.raced += 1;
                    self.metrics.mark(Metric::FlushRace);
                    debug!(queue = %self.name, delivery_tag = %tag, "entry left the buffer before flush");
                }
                EntryState::Reinserted => {
                    report.reinserted += 1;
                    // A cumulative ack from here on would cover the entry just put back.
                    cumulative = false;
                }
            }
        }

        report.delivered = batch.len();
        self.metrics.mark(Metric::Flush);
        for _ in 0..report.delivered {
            self.metrics.mark(Metric::FlushDelivered);
        }

        if let Err(e) = self.handler.handle(batch).await {
            report.handler_failed = true;
            self.metrics.mark(Metric::HandlerError);
            error!(
                queue = %self.name,
                batch_size = report.delivered,
                error = %e,
                "batch handler failed after acknowledgment"
            );
            self.report_error(&DrainError::Handler(format!("{e:#}")), "queue:flush");
        }
        report
    }

    /// Move one snapshotted entry through remove → acknowledge.
    async fn settle(&self, tag: DeliveryTag, record: Record, cumulative: bool) -> EntryState {
        if !self.buffer.remove_pair(tag, &record) {
            return EntryState::Raced;
        }
        match self.broker.ack(tag, cumulative).await {
            Ok(()) => EntryState::Acknowledged(record),
            Err(e) => {
                error!(
                    queue = %self.name,
                    delivery_tag = %tag,
                    error = %e,
                    "failed to ack message"
                );
                self.metrics.mark(Metric::AckError);
                self.buffer.insert(tag, record);
                EntryState::Reinserted
            }
        }
    }

    // ── Periodic trigger ─────────────────────────────────────────────

    /// Start the background timer flushing every `execution_interval`.
    ///
    /// The first flush happens one interval from now. Dropping the returned
    /// handle stops the timer as well.
    pub fn spawn_periodic_flush(self: &Arc<Self>) -> PeriodicFlush {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let period = this.settings.execution_interval.max(MIN_FLUSH_PERIOD);
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => this.run_periodic_flush().await,
                }
            }
            debug!(queue = %this.name, "periodic flush stopped");
        });
        PeriodicFlush { stop: stop_tx, task }
    }

    async fn run_periodic_flush(self: &Arc<Self>) {
        let mut flush = self.spawn_flush();
        match time::timeout(self.settings.timeout_interval, &mut flush).await {
            Ok(Ok(report)) => debug!(queue = %self.name, ?report, "periodic flush finished"),
            Ok(Err(e)) => {
                self.flush_aborted(e);
            }
            Err(_) => {
                warn!(
                    queue = %self.name,
                    timeout = ?self.settings.timeout_interval,
                    "periodic flush exceeded its timeout interval, letting it finish"
                );
                self.metrics.mark(Metric::FlushTimeout);
            }
        }
    }

    // ── Subscription ─────────────────────────────────────────────────

    /// Consume `reporting.jobs.<name>` and start the periodic flush.
    ///
    /// Deliveries are processed one at a time, in the order the broker hands
    /// them over.
    pub async fn subscribe(self: &Arc<Self>) -> Result<Subscription, DrainError> {
        let spec = QueueSpec::for_drain(&self.name);
        let mut deliveries = self.broker.subscribe(&spec).await?;
        info!(
            queue = %spec.name,
            consumer_tag = %spec.consumer_tag,
            batch_size = self.settings.batch_size,
            execution_interval = ?self.settings.execution_interval,
            "subscribed to drain queue"
        );

        let periodic = self.spawn_periodic_flush();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let consumer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    next = deliveries.recv() => match next {
                        Some(delivery) => {
                            this.receive(delivery).await;
                        }
                        None => {
                            warn!(queue = %this.name, "delivery stream closed");
                            break;
                        }
                    },
                }
            }
            let _ = closed_tx.send(true);
        });

        Ok(Subscription {
            drain: Arc::clone(self),
            spec,
            stop: stop_tx,
            closed: closed_rx,
            consumer,
            periodic,
        })
    }
}

/// Handle to a running periodic flush timer.
pub struct PeriodicFlush {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeriodicFlush {
    /// Stop ticking. A flush already running is allowed to finish first.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "periodic flush task failed");
        }
    }
}

/// Handle to a running drain subscription.
pub struct Subscription {
    drain: Arc<DrainQueue>,
    spec: QueueSpec,
    stop: watch::Sender<bool>,
    closed: watch::Receiver<bool>,
    consumer: JoinHandle<()>,
    periodic: PeriodicFlush,
}

impl Subscription {
    pub fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    /// Resolves once the consumer routine has exited (stream closed or shut down).
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
    }

    /// Stop consuming, stop the timer, then flush whatever is still buffered.
    ///
    /// The delivery being processed and any running flush complete first.
    pub async fn shutdown(self) -> Result<FlushReport, DrainError> {
        let _ = self.stop.send(true);
        if let Err(e) = self.consumer.await {
            error!(queue = %self.spec.name, error = %e, "consumer task failed");
        }
        self.periodic.stop().await;

        let report = self.drain.flush().await?;
        info!(
            queue = %self.spec.name,
            delivered = report.delivered,
            left_in_buffer = self.drain.buffer.len(),
            "drain shut down"
        );
        Ok(report)
    }
}
