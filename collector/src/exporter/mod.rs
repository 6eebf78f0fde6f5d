//! Exporters.
//!
//! Each configured exporter subscribed to a pipeline gets its own worker task
//! with a bounded [`BatchQueue`] and a retry state machine, so a slow
//! destination only ever delays itself. The [`Dispatcher`] fans every batch
//! out to all exporters of its pipeline.

pub mod loki;
pub mod memory;
pub mod otlp;
pub mod prometheus;
pub mod queue;
pub mod retry;

pub use loki::LokiDestination;
pub use memory::{MemoryDestination, MemoryStores};
pub use otlp::{OtlpHttpDestination, OtlpPayload};
pub use prometheus::{PrometheusDestination, ScrapeRegistry};
pub use queue::{BatchQueue, DropReason};
pub use retry::{Delivery, DeliveryState, RetryPolicy};

use crate::admission::MemoryBudget;
use crate::batcher::Batch;
use crate::error::{CollectorError, DataLoss, DeliveryError};
use crate::telemetry::{Counter, Counters};
use async_trait::async_trait;
use serde::Serialize;
use shared::config::ExporterConfig;
use shared::models::{LogRecord, MetricPoint, Record, SignalType, Span};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A destination write API.
#[async_trait]
pub trait Destination<T: Record>: Send + Sync {
    /// Destination family, for log lines.
    fn kind(&self) -> &'static str;

    /// Performs one delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns a transient error when the attempt may be repeated and a
    /// permanent one when it cannot succeed.
    async fn deliver(&self, batch: &Batch<T>) -> Result<(), DeliveryError>;
}

/// Shared resources destinations are built from.
#[derive(Debug, Default, Clone)]
pub struct DestinationContext {
    /// Scrape registry served at `/metrics`, when a prometheus exporter exists.
    pub scrape: Option<Arc<ScrapeRegistry>>,
    /// In-process stores of the `memory` exporters, by exporter name.
    pub memory: HashMap<String, MemoryStores>,
}

/// Record types that know which destination families can store them.
pub trait DestinationFactory: Record + Sized {
    /// Builds the destination of one exporter definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the family cannot store this signal or the
    /// destination cannot be constructed.
    fn destination(
        name: &str,
        config: &ExporterConfig,
        ctx: &DestinationContext,
    ) -> Result<Arc<dyn Destination<Self>>, CollectorError>;
}

fn unsupported(name: &str, config: &ExporterConfig, signal: SignalType) -> CollectorError {
    CollectorError::Exporter {
        name: name.to_string(),
        message: format!("{} exporters cannot export {signal}", config.kind()),
    }
}

fn memory_stores(name: &str, ctx: &DestinationContext) -> Result<MemoryStores, CollectorError> {
    ctx.memory
        .get(name)
        .cloned()
        .ok_or_else(|| CollectorError::Exporter {
            name: name.to_string(),
            message: "memory stores were not created".to_string(),
        })
}

impl DestinationFactory for Span {
    fn destination(
        name: &str,
        config: &ExporterConfig,
        ctx: &DestinationContext,
    ) -> Result<Arc<dyn Destination<Self>>, CollectorError> {
        match config {
            ExporterConfig::OtlpHttp(c) => Ok(Arc::new(OtlpHttpDestination::new(name, c)?)),
            ExporterConfig::Memory(_) => Ok(Arc::new(MemoryDestination::new(memory_stores(name, ctx)?))),
            other => Err(unsupported(name, other, Self::SIGNAL)),
        }
    }
}

impl DestinationFactory for MetricPoint {
    fn destination(
        name: &str,
        config: &ExporterConfig,
        ctx: &DestinationContext,
    ) -> Result<Arc<dyn Destination<Self>>, CollectorError> {
        match config {
            ExporterConfig::OtlpHttp(c) => Ok(Arc::new(OtlpHttpDestination::new(name, c)?)),
            ExporterConfig::Memory(_) => Ok(Arc::new(MemoryDestination::new(memory_stores(name, ctx)?))),
            ExporterConfig::Prometheus(_) => match &ctx.scrape {
                Some(registry) => Ok(Arc::new(PrometheusDestination::new(Arc::clone(registry)))),
                None => Err(CollectorError::Exporter {
                    name: name.to_string(),
                    message: "scrape registry was not created".to_string(),
                }),
            },
            other @ ExporterConfig::Loki(_) => Err(unsupported(name, other, Self::SIGNAL)),
        }
    }
}

impl DestinationFactory for LogRecord {
    fn destination(
        name: &str,
        config: &ExporterConfig,
        ctx: &DestinationContext,
    ) -> Result<Arc<dyn Destination<Self>>, CollectorError> {
        match config {
            ExporterConfig::OtlpHttp(c) => Ok(Arc::new(OtlpHttpDestination::new(name, c)?)),
            ExporterConfig::Memory(_) => Ok(Arc::new(MemoryDestination::new(memory_stores(name, ctx)?))),
            ExporterConfig::Loki(c) => Ok(Arc::new(LokiDestination::new(name, c)?)),
            other @ ExporterConfig::Prometheus(_) => Err(unsupported(name, other, Self::SIGNAL)),
        }
    }
}

/// Live state of one exporter, read by the readiness check.
#[derive(Debug)]
pub struct ExporterStatus {
    name: String,
    signal: SignalType,
    kind: &'static str,
    queued: AtomicUsize,
    in_flight: AtomicBool,
    completed_cycles: AtomicU64,
}

impl ExporterStatus {
    fn new(name: &str, signal: SignalType, kind: &'static str) -> Self {
        Self {
            name: name.to_string(),
            signal,
            kind,
            queued: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
            completed_cycles: AtomicU64::new(0),
        }
    }

    /// Exporter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pipeline the exporter belongs to.
    #[must_use]
    pub fn signal(&self) -> SignalType {
        self.signal
    }

    /// Batches that reached a terminal state.
    #[must_use]
    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles.load(Ordering::Acquire)
    }

    /// Whether the exporter has finished a delivery cycle or is idle.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.completed_cycles() > 0
            || (!self.in_flight.load(Ordering::Acquire) && self.queued.load(Ordering::Acquire) == 0)
    }

    /// Serializable copy for the readiness route.
    #[must_use]
    pub fn report(&self) -> ExporterReport {
        ExporterReport {
            name: self.name.clone(),
            signal: self.signal,
            kind: self.kind,
            queued: self.queued.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
            completed_cycles: self.completed_cycles(),
        }
    }
}

/// Point-in-time state of one exporter.
#[derive(Debug, Clone, Serialize)]
pub struct ExporterReport {
    /// Exporter name.
    pub name: String,
    /// Pipeline.
    pub signal: SignalType,
    /// Destination family.
    pub kind: &'static str,
    /// Batches waiting.
    pub queued: usize,
    /// Whether an attempt is in progress.
    pub in_flight: bool,
    /// Batches that reached a terminal state.
    pub completed_cycles: u64,
}

/// What one worker did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    /// Exporter name.
    pub name: String,
    /// Batches delivered.
    pub delivered_batches: u64,
    /// Batches that failed permanently.
    pub failed_batches: u64,
    /// Batches given up at the end of the grace period.
    pub abandoned_batches: u64,
    /// Records in abandoned batches.
    pub abandoned_records: u64,
}

/// Enqueue side of an exporter, held by the dispatcher.
pub struct ExporterHandle<T> {
    name: Arc<str>,
    queue: Arc<BatchQueue<T>>,
    status: Arc<ExporterStatus>,
    counters: Arc<Counters>,
    budget: Arc<MemoryBudget>,
}

impl<T> Clone for ExporterHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            queue: Arc::clone(&self.queue),
            status: Arc::clone(&self.status),
            counters: Arc::clone(&self.counters),
            budget: Arc::clone(&self.budget),
        }
    }
}

impl<T: Record> ExporterHandle<T> {
    /// Queues a batch, accounting for anything dropped to make room.
    pub fn enqueue(&self, batch: Batch<T>) {
        let dropped = self.queue.push(batch, self.budget.is_shedding());
        self.status.queued.store(self.queue.len(), Ordering::Release);

        let counters = self.counters.signal(T::SIGNAL);
        for (batch, reason) in dropped {
            match reason {
                DropReason::Memory => {
                    counters.add(Counter::DroppedMemory, batch.len());
                    let loss = DataLoss {
                        signal: T::SIGNAL,
                        exporter: self.name.to_string(),
                        records: batch.len(),
                        reason: reason.as_str(),
                    };
                    tracing::warn!(error = %loss, sequence = batch.sequence(), "Shed batch");
                }
                DropReason::Overflow | DropReason::Closed => {
                    counters.add(Counter::PermanentFailures, batch.len());
                    tracing::error!(
                        signal = %T::SIGNAL,
                        exporter = %self.name,
                        records = batch.len(),
                        sequence = batch.sequence(),
                        reason = reason.as_str(),
                        "Dropped batch"
                    );
                }
            }
        }
    }

    /// Stops accepting batches.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Live state of the exporter.
    #[must_use]
    pub fn status(&self) -> &Arc<ExporterStatus> {
        &self.status
    }
}

/// Fans batches out to every exporter of a pipeline.
pub struct Dispatcher<T> {
    exporters: Vec<ExporterHandle<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            exporters: self.exporters.clone(),
        }
    }
}

impl<T: Record> Dispatcher<T> {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(exporters: Vec<ExporterHandle<T>>) -> Self {
        Self { exporters }
    }

    /// Hands a clone of the batch to every exporter.
    pub fn dispatch(&self, batch: &Batch<T>) {
        tracing::debug!(
            signal = %T::SIGNAL,
            records = batch.len(),
            sequence = batch.sequence(),
            trigger = %batch.trigger(),
            exporters = self.exporters.len(),
            "Dispatching batch"
        );
        for exporter in &self.exporters {
            exporter.enqueue(batch.clone());
        }
    }
}

enum Outcome {
    Delivered,
    Failed(String),
    Abandoned,
}

/// One destination's delivery worker.
pub struct Exporter<T: Record> {
    handle: ExporterHandle<T>,
    destination: Arc<dyn Destination<T>>,
    policy: RetryPolicy,
}

impl<T: Record> Exporter<T> {
    /// Creates an exporter and its queue.
    #[must_use]
    pub fn new(
        name: &str,
        destination: Arc<dyn Destination<T>>,
        policy: RetryPolicy,
        queue_size: usize,
        counters: Arc<Counters>,
        budget: Arc<MemoryBudget>,
    ) -> Self {
        let status = Arc::new(ExporterStatus::new(name, T::SIGNAL, destination.kind()));
        Self {
            handle: ExporterHandle {
                name: Arc::from(name),
                queue: Arc::new(BatchQueue::new(queue_size)),
                status,
                counters,
                budget,
            },
            destination,
            policy,
        }
    }

    /// The enqueue side of this exporter.
    #[must_use]
    pub fn handle(&self) -> ExporterHandle<T> {
        self.handle.clone()
    }

    /// Delivers queued batches until the queue is closed and empty.
    ///
    /// Once `abandon` is cancelled the attempt in progress and every waiting
    /// batch are given up and counted as permanent failures.
    pub async fn run(self, abandon: CancellationToken) -> WorkerReport {
        let name = self.handle.name.to_string();
        let mut report = WorkerReport {
            name: name.clone(),
            ..WorkerReport::default()
        };
        let counters = self.handle.counters.signal(T::SIGNAL);
        let status = &self.handle.status;

        tracing::debug!(signal = %T::SIGNAL, exporter = %name, kind = self.destination.kind(), "Exporter started");

        loop {
            let next = tokio::select! {
                biased;
                () = abandon.cancelled() => None,
                next = self.handle.queue.next() => next,
            };
            let Some(batch) = next else { break };

            status.in_flight.store(true, Ordering::Release);
            status.queued.store(self.handle.queue.len(), Ordering::Release);

            match self.deliver(&batch, &abandon).await {
                Outcome::Delivered => {
                    counters.add(Counter::Exported, batch.len());
                    report.delivered_batches += 1;
                }
                Outcome::Failed(reason) => {
                    counters.add(Counter::PermanentFailures, batch.len());
                    report.failed_batches += 1;
                    tracing::error!(
                        signal = %T::SIGNAL,
                        exporter = %name,
                        records = batch.len(),
                        sequence = batch.sequence(),
                        error = %reason,
                        "Batch permanently failed"
                    );
                }
                Outcome::Abandoned => {
                    counters.add(Counter::PermanentFailures, batch.len());
                    report.abandoned_batches += 1;
                    report.abandoned_records += batch.len() as u64;
                }
            }
            status.completed_cycles.fetch_add(1, Ordering::AcqRel);
            status.in_flight.store(false, Ordering::Release);
        }

        for batch in self.handle.queue.drain() {
            counters.add(Counter::PermanentFailures, batch.len());
            report.abandoned_batches += 1;
            report.abandoned_records += batch.len() as u64;
        }
        status.queued.store(0, Ordering::Release);

        if report.abandoned_batches > 0 {
            tracing::error!(
                signal = %T::SIGNAL,
                exporter = %name,
                batches = report.abandoned_batches,
                records = report.abandoned_records,
                "Abandoned undelivered batches at the end of the grace period"
            );
        }
        tracing::debug!(signal = %T::SIGNAL, exporter = %name, "Exporter stopped");
        report
    }

    async fn deliver(&self, batch: &Batch<T>, abandon: &CancellationToken) -> Outcome {
        let counters = self.handle.counters.signal(T::SIGNAL);
        let mut delivery = Delivery::new(self.policy.clone());

        loop {
            match delivery.state().clone() {
                DeliveryState::Pending => delivery.begin(),
                DeliveryState::Sending { attempt } => {
                    let attempt_timeout = self.policy.attempt_timeout;
                    let result = tokio::select! {
                        biased;
                        () = abandon.cancelled() => return Outcome::Abandoned,
                        r = tokio::time::timeout(attempt_timeout, self.destination.deliver(batch)) => {
                            r.unwrap_or_else(|_| Err(DeliveryError::Transient(format!(
                                "attempt timed out after {}ms",
                                attempt_timeout.as_millis()
                            ))))
                        }
                    };
                    if let Err(e) = &result {
                        tracing::debug!(exporter = %self.handle.name, attempt, error = %e, "Delivery attempt failed");
                    }
                    delivery.record(result);
                }
                DeliveryState::AwaitingRetry { attempt, backoff } => {
                    counters.add(Counter::Retried, 1);
                    tracing::warn!(
                        signal = %T::SIGNAL,
                        exporter = %self.handle.name,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "Retrying batch"
                    );
                    tokio::select! {
                        biased;
                        () = abandon.cancelled() => return Outcome::Abandoned,
                        () = tokio::time::sleep(backoff) => delivery.resume(),
                    }
                }
                DeliveryState::Succeeded { attempts } => {
                    tracing::debug!(exporter = %self.handle.name, attempts, records = batch.len(), "Batch delivered");
                    return Outcome::Delivered;
                }
                DeliveryState::PermanentlyFailed { reason, .. } => return Outcome::Failed(reason),
            }
        }
    }
}

#[cfg(test)]
#[path = "exporter_test.rs"]
pub(crate) mod tests;
