//! OTLP gRPC receiver services.
//!
//! Implements the OpenTelemetry Protocol gRPC services for ingesting traces, metrics and logs.
//! These services follow the OTLP specification and work with standard OpenTelemetry SDK exporters.

use super::{Ingress, Ingresses, OtlpExport};
use shared::models::{LogRecord, MetricPoint, SignalType, Span};
use shared::otlp::proto::collector::{
    logs::v1::{
        logs_service_server::{LogsService, LogsServiceServer},
        ExportLogsServiceRequest, ExportLogsServiceResponse,
    },
    metrics::v1::{
        metrics_service_server::{MetricsService, MetricsServiceServer},
        ExportMetricsServiceRequest, ExportMetricsServiceResponse,
    },
    trace::v1::{
        trace_service_server::{TraceService, TraceServiceServer},
        ExportTraceServiceRequest, ExportTraceServiceResponse,
    },
};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::codegen::http;
use tonic::server::NamedService;
use tonic::{Code, Request, Response, Status};
use tower::{Layer, Service};

async fn export<R: OtlpExport>(
    ingress: &Ingress<R::Record>,
    request: Request<R>,
) -> Result<Response<R::Response>, Status> {
    let request = request.into_inner();
    let accepted = ingress.submit(request.decode_records()).await?;
    tracing::debug!(
        accepted = accepted.accepted,
        rejected = accepted.rejected,
        "Processed OTLP gRPC request"
    );
    Ok(Response::new(R::response(&accepted)))
}

/// Implementation of the OTLP `TraceService` gRPC service.
#[derive(Clone)]
pub struct TraceServiceImpl {
    ingress: Ingress<Span>,
}

impl TraceServiceImpl {
    /// Creates a new `TraceServiceImpl` feeding the traces pipeline.
    #[must_use]
    pub fn new(ingress: Ingress<Span>) -> Self {
        Self { ingress }
    }
}

#[tonic::async_trait]
impl TraceService for TraceServiceImpl {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        export(&self.ingress, request).await
    }
}

/// Implementation of the OTLP `MetricsService` gRPC service.
#[derive(Clone)]
pub struct MetricsServiceImpl {
    ingress: Ingress<MetricPoint>,
}

impl MetricsServiceImpl {
    /// Creates a new `MetricsServiceImpl` feeding the metrics pipeline.
    #[must_use]
    pub fn new(ingress: Ingress<MetricPoint>) -> Self {
        Self { ingress }
    }
}

#[tonic::async_trait]
impl MetricsService for MetricsServiceImpl {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        export(&self.ingress, request).await
    }
}

/// Implementation of the OTLP `LogsService` gRPC service.
#[derive(Clone)]
pub struct LogsServiceImpl {
    ingress: Ingress<LogRecord>,
}

impl LogsServiceImpl {
    /// Creates a new `LogsServiceImpl` feeding the logs pipeline.
    #[must_use]
    pub fn new(ingress: Ingress<LogRecord>) -> Self {
        Self { ingress }
    }
}

#[tonic::async_trait]
impl LogsService for LogsServiceImpl {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        export(&self.ingress, request).await
    }
}

/// Maps a gRPC request path such as `/opentelemetry.proto.collector.logs.v1.LogsService/Export`
/// to the pipeline its service feeds.
fn signal_for_path(path: &str) -> Option<SignalType> {
    let service = path.trim_start_matches('/').split('/').next()?;
    if service == <TraceServiceServer<TraceServiceImpl> as NamedService>::NAME {
        Some(SignalType::Traces)
    } else if service == <MetricsServiceServer<MetricsServiceImpl> as NamedService>::NAME {
        Some(SignalType::Metrics)
    } else if service == <LogsServiceServer<LogsServiceImpl> as NamedService>::NAME {
        Some(SignalType::Logs)
    } else {
        None
    }
}

/// Whether a response carries the status tonic produces for a message it could
/// not decode (`Internal`) or one over the decoding limit (`OutOfRange`).
fn refused_before_ingress(headers: &http::HeaderMap) -> bool {
    Status::from_header_map(headers)
        .is_some_and(|status| matches!(status.code(), Code::Internal | Code::OutOfRange))
}

/// Counts requests that tonic refuses before they reach a service handler.
#[derive(Clone)]
struct RefusalLayer {
    ingresses: Ingresses,
}

impl<S> Layer<S> for RefusalLayer {
    type Service = CountRefused<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CountRefused {
            inner,
            ingresses: self.ingresses.clone(),
        }
    }
}

#[derive(Clone)]
struct CountRefused<S> {
    inner: S,
    ingresses: Ingresses,
}

impl<S, B, RB> Service<http::Request<B>> for CountRefused<S>
where
    S: Service<http::Request<B>, Response = http::Response<RB>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let signal = signal_for_path(request.uri().path());
        let ingresses = self.ingresses.clone();
        let response = self.inner.call(request);
        Box::pin(async move {
            let response = response.await?;
            if let Some(signal) = signal.filter(|_| refused_before_ingress(response.headers())) {
                ingresses.reject_undecodable(signal);
            }
            Ok(response)
        })
    }
}

/// Serves the services of the configured pipelines until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    ingresses: Ingresses,
    max_request_bytes: usize,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    let refusals = RefusalLayer {
        ingresses: ingresses.clone(),
    };
    let traces = ingresses.traces.map(|i| {
        TraceServiceServer::new(TraceServiceImpl::new(i))
            .max_decoding_message_size(max_request_bytes)
            .accept_compressed(CompressionEncoding::Gzip)
    });
    let metrics = ingresses.metrics.map(|i| {
        MetricsServiceServer::new(MetricsServiceImpl::new(i))
            .max_decoding_message_size(max_request_bytes)
            .accept_compressed(CompressionEncoding::Gzip)
    });
    let logs = ingresses.logs.map(|i| {
        LogsServiceServer::new(LogsServiceImpl::new(i))
            .max_decoding_message_size(max_request_bytes)
            .accept_compressed(CompressionEncoding::Gzip)
    });

    tonic::transport::Server::builder()
        .layer(refusals)
        .add_optional_service(traces)
        .add_optional_service(metrics)
        .add_optional_service(logs)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await
}
