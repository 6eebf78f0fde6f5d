//! Pipeline supervisor.
//!
//! Builds the three signal pipelines from a validated configuration, binds
//! the receivers and the service port, and owns the shutdown sequence:
//!
//! 1. ingress is closed and the servers stop accepting,
//! 2. accumulators drain their channel and flush regardless of thresholds,
//! 3. exporters keep delivering for `service.shutdown_grace_ms`, after which
//!    whatever is still queued or in flight is abandoned and counted as a
//!    permanent delivery failure.

use crate::admission::MemoryBudget;
use crate::batcher::{run_accumulator, Accumulator, Admitted};
use crate::error::{parse_address, CollectorError};
use crate::exporter::{
    DestinationContext, DestinationFactory, Dispatcher, Exporter, ExporterHandle, ExporterReport,
    ExporterStatus, MemoryStores, RetryPolicy, ScrapeRegistry, WorkerReport,
};
use crate::processor::{Processor, ProcessorChain, SeriesCheck};
use crate::receiver::{self, Ingress, Ingresses};
use crate::routes::{service_router, ServiceState};
use crate::telemetry::{Counters, CountersSnapshot, TelemetryReporter};
use serde::Serialize;
use shared::config::{CollectorConfig, ExporterConfig, PipelineConfig};
use shared::models::{LogRecord, MetricPoint, SignalType, Span};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared resources every pipeline is built from.
struct Resources {
    config: Arc<CollectorConfig>,
    budget: Arc<MemoryBudget>,
    counters: Arc<Counters>,
    destinations: DestinationContext,
}

/// A pipeline whose tasks have not been spawned yet.
struct PipelineParts<T: DestinationFactory> {
    ingress: Ingress<T>,
    rx: mpsc::Receiver<Admitted<T>>,
    accumulator: Accumulator<T>,
    exporters: Vec<Exporter<T>>,
}

impl<T: DestinationFactory> PipelineParts<T> {
    fn build(
        pipeline: &PipelineConfig,
        resources: &Resources,
        validator: Option<Box<dyn Processor<T>>>,
    ) -> Result<Self, CollectorError> {
        let config = &resources.config;
        let chain = ProcessorChain::<T>::build(pipeline, config, &resources.budget)?;

        let mut exporters = Vec::with_capacity(pipeline.exporters.len());
        for name in &pipeline.exporters {
            let exporter_config: &ExporterConfig =
                config.exporters.get(name).ok_or_else(|| CollectorError::Exporter {
                    name: name.clone(),
                    message: "exporter is not defined".to_string(),
                })?;
            let destination = T::destination(name, exporter_config, &resources.destinations)?;
            let retry = exporter_config.retry();
            exporters.push(Exporter::new(
                name,
                destination,
                RetryPolicy::from(retry),
                retry.queue_size,
                Arc::clone(&resources.counters),
                Arc::clone(&resources.budget),
            ));
        }

        let (tx, rx) = mpsc::channel(config.receivers.queue_capacity);
        let ingress = Ingress::new(
            tx,
            chain,
            validator,
            Arc::clone(&resources.counters),
            Duration::from_millis(config.receivers.enqueue_timeout_ms),
        );
        let accumulator = Accumulator::new(
            pipeline.batch.max_batch_size,
            Duration::from_millis(pipeline.batch.max_wait_ms),
        );

        Ok(Self {
            ingress,
            rx,
            accumulator,
            exporters,
        })
    }

    fn statuses(&self) -> impl Iterator<Item = Arc<ExporterStatus>> + '_ {
        self.exporters.iter().map(|e| Arc::clone(e.handle().status()))
    }

    fn spawn(self, flush: &CancellationToken, abandon: &CancellationToken) -> PipelineTasks {
        let handles: Vec<ExporterHandle<T>> = self.exporters.iter().map(Exporter::handle).collect();
        let closers = handles
            .iter()
            .cloned()
            .map(|h| Box::new(move || h.close()) as Box<dyn Fn() + Send + Sync>)
            .collect();

        let workers = self
            .exporters
            .into_iter()
            .map(|exporter| tokio::spawn(exporter.run(abandon.clone())))
            .collect();

        let accumulator = tokio::spawn(run_accumulator(
            self.rx,
            self.accumulator,
            Dispatcher::new(handles),
            flush.clone(),
        ));

        tracing::info!(signal = %T::SIGNAL, "Pipeline started");

        PipelineTasks {
            signal: T::SIGNAL,
            accumulator,
            workers,
            closers,
        }
    }
}

/// Running tasks of one pipeline.
struct PipelineTasks {
    signal: SignalType,
    accumulator: JoinHandle<()>,
    workers: Vec<JoinHandle<WorkerReport>>,
    closers: Vec<Box<dyn Fn() + Send + Sync>>,
}

/// Outcome of a shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Per-exporter lifetime totals.
    pub workers: Vec<WorkerReport>,
    /// Batches given up at the end of the grace period.
    pub abandoned_batches: u64,
    /// Records in those batches.
    pub abandoned_records: u64,
    /// Final counter values.
    pub counters: CountersSnapshot,
}

/// Starts collectors.
pub struct Supervisor;

impl Supervisor {
    /// Validates `config`, builds the pipelines and binds every listener.
    ///
    /// Nothing is spawned unless every pipeline and listener could be
    /// constructed.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the document is invalid, `Exporter` when a
    /// destination cannot be built and `Bind` when a listener fails.
    pub async fn start(config: CollectorConfig) -> Result<CollectorHandle, CollectorError> {
        config.check()?;
        let config = Arc::new(config);

        let budget = MemoryBudget::new_shared(config.memory_limits());
        let counters = Counters::new_shared();
        let scrape = config.has_scrape_exporter().then(ScrapeRegistry::new_shared);
        let memory: HashMap<String, MemoryStores> = config
            .exporters
            .iter()
            .filter(|(_, e)| matches!(e, ExporterConfig::Memory(_)))
            .map(|(name, _)| (name.clone(), MemoryStores::new()))
            .collect();

        let resources = Resources {
            config: Arc::clone(&config),
            budget: Arc::clone(&budget),
            counters: Arc::clone(&counters),
            destinations: DestinationContext {
                scrape: scrape.clone(),
                memory: memory.clone(),
            },
        };

        let traces = config
            .pipelines
            .traces
            .as_ref()
            .map(|p| PipelineParts::<Span>::build(p, &resources, None))
            .transpose()?;
        let metrics = config
            .pipelines
            .metrics
            .as_ref()
            .map(|p| {
                let check: Box<dyn Processor<MetricPoint>> =
                    Box::new(SeriesCheck::new(config.service.max_tracked_series));
                PipelineParts::<MetricPoint>::build(p, &resources, Some(check))
            })
            .transpose()?;
        let logs = config
            .pipelines
            .logs
            .as_ref()
            .map(|p| PipelineParts::<LogRecord>::build(p, &resources, None))
            .transpose()?;

        let ingresses = Ingresses {
            traces: traces.as_ref().map(|p| p.ingress.clone()),
            metrics: metrics.as_ref().map(|p| p.ingress.clone()),
            logs: logs.as_ref().map(|p| p.ingress.clone()),
        };
        let mut statuses: Vec<Arc<ExporterStatus>> = Vec::new();
        statuses.extend(traces.iter().flat_map(|p| p.statuses()));
        statuses.extend(metrics.iter().flat_map(|p| p.statuses()));
        statuses.extend(logs.iter().flat_map(|p| p.statuses()));

        let receivers = &config.receivers;
        let http_listener = if receivers.http.enabled {
            Some(bind("http", &receivers.http.address).await?)
        } else {
            None
        };
        let grpc_listener = if receivers.grpc.enabled {
            Some(bind("grpc", &receivers.grpc.address).await?)
        } else {
            None
        };
        let service_listener = bind("service", &config.service.address).await?;

        let http_addr = http_listener.as_ref().map(local_addr).transpose()?;
        let grpc_addr = grpc_listener.as_ref().map(local_addr).transpose()?;
        let service_addr = local_addr(&service_listener)?;

        let stop = CancellationToken::new();
        let service_stop = CancellationToken::new();
        let flush = CancellationToken::new();
        let abandon = CancellationToken::new();

        let mut pipelines = Vec::with_capacity(3);
        pipelines.extend(traces.map(|p| p.spawn(&flush, &abandon)));
        pipelines.extend(metrics.map(|p| p.spawn(&flush, &abandon)));
        pipelines.extend(logs.map(|p| p.spawn(&flush, &abandon)));

        let mut servers = Vec::with_capacity(2);
        if let Some(listener) = http_listener {
            let app = receiver::http::otlp_routes(&ingresses, receivers.max_request_bytes)
                .layer(TraceLayer::new_for_http());
            let token = stop.clone();
            servers.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
                {
                    tracing::error!(error = %e, "OTLP HTTP receiver failed");
                }
            }));
            tracing::info!(addr = ?http_addr, "OTLP HTTP receiver listening");
        }
        if let Some(listener) = grpc_listener {
            let server = receiver::grpc::serve(
                listener,
                ingresses.clone(),
                receivers.max_request_bytes,
                stop.clone(),
            );
            servers.push(tokio::spawn(async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "OTLP gRPC receiver failed");
                }
            }));
            tracing::info!(addr = ?grpc_addr, "OTLP gRPC receiver listening");
        }

        let service_app = service_router(ServiceState::new(statuses.clone(), scrape.clone()));
        let token = service_stop.clone();
        let service = tokio::spawn(async move {
            if let Err(e) = axum::serve(service_listener, service_app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "Service listener failed");
            }
        });
        tracing::info!(addr = %service_addr, "Service routes listening");

        let reporter = Arc::new(TelemetryReporter::new(
            Arc::clone(&counters),
            ingresses.metrics.clone(),
            Duration::from_millis(config.service.telemetry_interval_ms),
        ));
        let reporter = tokio::spawn(reporter.run(stop.clone()));

        tracing::info!(
            pipelines = pipelines.len(),
            exporters = statuses.len(),
            soft_limit_bytes = budget.limits().soft_limit_bytes,
            hard_limit_bytes = budget.limits().hard_limit_bytes,
            "Collector started"
        );

        Ok(CollectorHandle {
            config,
            http_addr,
            grpc_addr,
            service_addr,
            counters,
            budget,
            ingresses,
            statuses,
            memory,
            scrape,
            pipelines,
            servers,
            service,
            reporter,
            stop,
            service_stop,
            flush,
            abandon,
        })
    }
}

async fn bind(name: &'static str, address: &str) -> Result<TcpListener, CollectorError> {
    let addr = parse_address(name, address)?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| CollectorError::bind(name, address, e))
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr, CollectorError> {
    listener
        .local_addr()
        .map_err(|e| CollectorError::bind("local", "unknown", e))
}

/// A running collector.
pub struct CollectorHandle {
    config: Arc<CollectorConfig>,
    http_addr: Option<SocketAddr>,
    grpc_addr: Option<SocketAddr>,
    service_addr: SocketAddr,
    counters: Arc<Counters>,
    budget: Arc<MemoryBudget>,
    ingresses: Ingresses,
    statuses: Vec<Arc<ExporterStatus>>,
    memory: HashMap<String, MemoryStores>,
    scrape: Option<Arc<ScrapeRegistry>>,
    pipelines: Vec<PipelineTasks>,
    servers: Vec<JoinHandle<()>>,
    service: JoinHandle<()>,
    reporter: JoinHandle<()>,
    stop: CancellationToken,
    service_stop: CancellationToken,
    flush: CancellationToken,
    abandon: CancellationToken,
}

impl CollectorHandle {
    /// The configuration the collector runs with.
    #[must_use]
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Bound address of the OTLP HTTP receiver.
    #[must_use]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Bound address of the OTLP gRPC receiver.
    #[must_use]
    pub fn grpc_addr(&self) -> Option<SocketAddr> {
        self.grpc_addr
    }

    /// Bound address of the service routes.
    #[must_use]
    pub fn service_addr(&self) -> SocketAddr {
        self.service_addr
    }

    /// Pipeline counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// The process-wide memory budget.
    #[must_use]
    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Ingress of every configured pipeline.
    #[must_use]
    pub fn ingresses(&self) -> &Ingresses {
        &self.ingresses
    }

    /// Stores of the `memory` exporter called `name`.
    #[must_use]
    pub fn memory_store(&self, name: &str) -> Option<&MemoryStores> {
        self.memory.get(name)
    }

    /// Scrape registry, when a prometheus exporter is configured.
    #[must_use]
    pub fn scrape_registry(&self) -> Option<&Arc<ScrapeRegistry>> {
        self.scrape.as_ref()
    }

    /// Whether every exporter has completed a delivery cycle or is idle.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.statuses.iter().all(|s| s.is_ready())
    }

    /// Current state of every exporter.
    #[must_use]
    pub fn exporter_reports(&self) -> Vec<ExporterReport> {
        self.statuses.iter().map(|s| s.report()).collect()
    }

    /// Stops the collector.
    pub async fn shutdown(self) -> ShutdownReport {
        let grace = Duration::from_millis(self.config.service.shutdown_grace_ms);
        tracing::info!(grace_ms = self.config.service.shutdown_grace_ms, "Shutting down collector");

        self.ingresses.close();
        self.stop.cancel();
        if let Err(e) = self.reporter.await {
            tracing::error!(error = %e, "Telemetry reporter task failed");
        }
        for mut server in self.servers {
            match timeout(grace, &mut server).await {
                Ok(Err(e)) => tracing::error!(error = %e, "Receiver task failed"),
                Ok(Ok(())) => {}
                Err(_) => {
                    tracing::warn!("Receiver did not stop within the grace period");
                    server.abort();
                }
            }
        }

        self.flush.cancel();
        let mut workers = Vec::new();
        for pipeline in self.pipelines {
            if let Err(e) = pipeline.accumulator.await {
                tracing::error!(signal = %pipeline.signal, error = %e, "Accumulator task failed");
            }
            for close in &pipeline.closers {
                close();
            }
            workers.extend(pipeline.workers.into_iter().map(|w| (pipeline.signal, w)));
        }

        let deadline = Instant::now() + grace;
        let mut reports = Vec::with_capacity(workers.len());
        for (signal, mut worker) in workers {
            let result = match timeout_at(deadline, &mut worker).await {
                Ok(result) => result,
                Err(_) => {
                    if !self.abandon.is_cancelled() {
                        tracing::warn!("Grace period elapsed, abandoning remaining deliveries");
                        self.abandon.cancel();
                    }
                    worker.await
                }
            };
            match result {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(signal = %signal, error = %e, "Exporter task failed"),
            }
        }

        self.service_stop.cancel();
        if let Err(e) = self.service.await {
            tracing::error!(error = %e, "Service listener task failed");
        }

        let report = ShutdownReport {
            abandoned_batches: reports.iter().map(|r| r.abandoned_batches).sum(),
            abandoned_records: reports.iter().map(|r| r.abandoned_records).sum(),
            workers: reports,
            counters: self.counters.snapshot(),
        };
        tracing::info!(
            abandoned_batches = report.abandoned_batches,
            abandoned_records = report.abandoned_records,
            "Collector stopped"
        );
        report
    }
}
