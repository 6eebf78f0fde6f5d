//! Self-observability counters and their periodic reporter.
//!
//! Counters are plain atomics updated on the hot path. The
//! [`TelemetryReporter`] turns them into metric points and feeds them back
//! through the metrics pipeline, so the collector's own numbers land in the
//! same store as everything else.

use crate::receiver::Ingress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::models::{MetricPoint, Resource, SignalType};
use shared::otlp::Decoded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Service name of the collector's own telemetry.
pub const SELF_SERVICE_NAME: &str = "trisignal";

/// One self-observability counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Records accepted into a pipeline.
    Received,
    /// Records refused at ingestion.
    Rejected,
    /// Records delivered by an exporter.
    Exported,
    /// Delivery attempts that were retried.
    Retried,
    /// Records shed under memory pressure.
    DroppedMemory,
    /// Records given up after the retry budget, queue overflow or shutdown.
    PermanentFailures,
}

impl Counter {
    /// Every counter, in reporting order.
    pub const ALL: [Self; 6] = [
        Self::Received,
        Self::Rejected,
        Self::Exported,
        Self::Retried,
        Self::DroppedMemory,
        Self::PermanentFailures,
    ];

    /// Counter name without prefix or suffix.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Rejected => "rejected",
            Self::Exported => "exported",
            Self::Retried => "retried",
            Self::DroppedMemory => "dropped_memory",
            Self::PermanentFailures => "permanent_failures",
        }
    }

    /// Name of the reported metric.
    #[must_use]
    pub fn metric_name(self) -> String {
        format!("trisignal_{}_total", self.name())
    }
}

/// Counters of one pipeline.
#[derive(Debug, Default)]
pub struct SignalCounters {
    received: AtomicU64,
    rejected: AtomicU64,
    exported: AtomicU64,
    retried: AtomicU64,
    dropped_memory: AtomicU64,
    permanent_failures: AtomicU64,
}

impl SignalCounters {
    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Received => &self.received,
            Counter::Rejected => &self.rejected,
            Counter::Exported => &self.exported,
            Counter::Retried => &self.retried,
            Counter::DroppedMemory => &self.dropped_memory,
            Counter::PermanentFailures => &self.permanent_failures,
        }
    }

    /// Adds `n` to a counter.
    pub fn add(&self, counter: Counter, n: usize) {
        self.cell(counter).fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Current value of a counter.
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            received: self.get(Counter::Received),
            rejected: self.get(Counter::Rejected),
            exported: self.get(Counter::Exported),
            retried: self.get(Counter::Retried),
            dropped_memory: self.get(Counter::DroppedMemory),
            permanent_failures: self.get(Counter::PermanentFailures),
        }
    }
}

/// Point-in-time copy of one pipeline's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    /// Records accepted into the pipeline.
    pub received: u64,
    /// Records refused at ingestion.
    pub rejected: u64,
    /// Records delivered, summed over exporters.
    pub exported: u64,
    /// Retried attempts.
    pub retried: u64,
    /// Records shed under memory pressure.
    pub dropped_memory: u64,
    /// Records permanently lost.
    pub permanent_failures: u64,
}

/// Counters of all three pipelines.
#[derive(Debug, Default)]
pub struct Counters {
    traces: SignalCounters,
    metrics: SignalCounters,
    logs: SignalCounters,
}

impl Counters {
    /// Creates zeroed counters wrapped in an `Arc`.
    #[must_use]
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counters of one pipeline.
    #[must_use]
    pub fn signal(&self, signal: SignalType) -> &SignalCounters {
        match signal {
            SignalType::Traces => &self.traces,
            SignalType::Metrics => &self.metrics,
            SignalType::Logs => &self.logs,
        }
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            traces: self.traces.snapshot(),
            metrics: self.metrics.snapshot(),
            logs: self.logs.snapshot(),
        }
    }

    /// Converts the counters into monotonic metric points.
    #[must_use]
    pub fn to_points(
        &self,
        resource: &Arc<Resource>,
        start_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<MetricPoint> {
        let mut points = Vec::with_capacity(SignalType::ALL.len() * Counter::ALL.len());
        for signal in SignalType::ALL {
            let counters = self.signal(signal);
            for counter in Counter::ALL {
                #[allow(clippy::cast_precision_loss)]
                let value = counters.get(counter) as f64;
                points.push(
                    MetricPoint::counter(counter.metric_name(), value, Arc::clone(resource))
                        .with_attribute("signal", signal.as_str())
                        .with_start_time(start_time)
                        .with_timestamp(now),
                );
            }
        }
        points
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Trace pipeline.
    pub traces: SignalSnapshot,
    /// Metrics pipeline.
    pub metrics: SignalSnapshot,
    /// Logs pipeline.
    pub logs: SignalSnapshot,
}

impl CountersSnapshot {
    /// Snapshot of one pipeline.
    #[must_use]
    pub fn signal(&self, signal: SignalType) -> &SignalSnapshot {
        match signal {
            SignalType::Traces => &self.traces,
            SignalType::Metrics => &self.metrics,
            SignalType::Logs => &self.logs,
        }
    }
}

/// Periodically reports the counters.
pub struct TelemetryReporter {
    counters: Arc<Counters>,
    metrics: Option<Ingress<MetricPoint>>,
    interval_duration: Duration,
    resource: Arc<Resource>,
    start_time: DateTime<Utc>,
}

impl TelemetryReporter {
    /// Creates a reporter.
    ///
    /// # Arguments
    ///
    /// * `counters` - Counters to report
    /// * `metrics` - Ingress of the metrics pipeline, if one is configured
    /// * `interval_duration` - How often to report
    #[must_use]
    pub fn new(
        counters: Arc<Counters>,
        metrics: Option<Ingress<MetricPoint>>,
        interval_duration: Duration,
    ) -> Self {
        let resource = Resource::for_service(SELF_SERVICE_NAME)
            .with_attribute("service.version", env!("CARGO_PKG_VERSION"))
            .shared();
        Self {
            counters,
            metrics,
            interval_duration,
            resource,
            start_time: Utc::now(),
        }
    }

    /// Reports once.
    pub async fn report(&self) {
        let snapshot = self.counters.snapshot();
        for signal in SignalType::ALL {
            let s = snapshot.signal(signal);
            tracing::info!(
                signal = %signal,
                received = s.received,
                rejected = s.rejected,
                exported = s.exported,
                retried = s.retried,
                dropped_memory = s.dropped_memory,
                permanent_failures = s.permanent_failures,
                "Pipeline counters"
            );
        }

        let Some(metrics) = &self.metrics else {
            return;
        };
        let points = self
            .counters
            .to_points(&self.resource, self.start_time, Utc::now());
        let decoded = Decoded {
            records: points,
            rejected: Vec::new(),
        };
        if let Err(e) = metrics.submit(decoded).await {
            tracing::warn!(error = %e, "Failed to submit self-observability metrics");
        }
    }

    /// Runs the reporting loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval_duration);
        // The first tick completes immediately.
        ticker.tick().await;

        tracing::info!(
            interval_ms = u64::try_from(self.interval_duration.as_millis()).unwrap_or(u64::MAX),
            "Telemetry reporter started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => self.report().await,
            }
        }

        tracing::info!("Telemetry reporter stopped");
    }
}
