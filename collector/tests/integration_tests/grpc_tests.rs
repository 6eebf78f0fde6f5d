//! Integration tests for the OTLP gRPC receiver.
//!
//! These tests connect a tonic client to a running collector and verify the
//! configured services accept data and the rest answer `Unimplemented`.

use super::common::*;
use collector::Supervisor;
use shared::config::PipelineConfig;
use shared::otlp::proto::collector::logs::v1::logs_service_client::LogsServiceClient;
use shared::otlp::proto::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use shared::otlp::proto::collector::trace::v1::trace_service_client::TraceServiceClient;
use shared::otlp::{encode_logs, encode_metrics, encode_traces};
use shared::models::{MetricPoint, Resource};
use shared::storage::{LogStore, MetricStore, TraceStore};
use tonic::codec::CompressionEncoding;

fn all_signals_to_memory() -> shared::config::CollectorConfig {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.traces = Some(PipelineConfig::new(["mem"]).with_batch(10, 20));
    config.pipelines.metrics = Some(PipelineConfig::new(["mem"]).with_batch(10, 20));
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]).with_batch(10, 20));
    config
}

#[tokio::test]
async fn test_grpc_traces_service() {
    let handle = Supervisor::start(all_signals_to_memory()).await.unwrap();
    let url = format!("http://{}", handle.grpc_addr().unwrap());

    let mut client = TraceServiceClient::connect(url).await.unwrap();
    let response = client.export(encode_traces(&spans(2, "web"))).await.unwrap();
    assert!(response.into_inner().partial_success.is_none());

    let store = handle.memory_store("mem").unwrap().traces.clone();
    eventually("spans stored", || store.span_count().unwrap() == 2).await;
    let trace = store.get_trace(trace_id()).unwrap();
    assert_eq!(trace.span_count(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_grpc_metrics_service() {
    let handle = Supervisor::start(all_signals_to_memory()).await.unwrap();
    let url = format!("http://{}", handle.grpc_addr().unwrap());

    let point = MetricPoint::counter("jobs_total", 3.0, Resource::for_service("worker").shared());
    let mut client = MetricsServiceClient::connect(url).await.unwrap();
    client.export(encode_metrics(&[point])).await.unwrap();

    let store = handle.memory_store("mem").unwrap().metrics.clone();
    eventually("point stored", || store.count().unwrap() == 1).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_grpc_logs_service_accepts_gzip() {
    let handle = Supervisor::start(all_signals_to_memory()).await.unwrap();
    let url = format!("http://{}", handle.grpc_addr().unwrap());

    let mut client = LogsServiceClient::connect(url)
        .await
        .unwrap()
        .send_compressed(CompressionEncoding::Gzip);
    client.export(encode_logs(&logs(4, "api"))).await.unwrap();

    let store = handle.memory_store("mem").unwrap().logs.clone();
    eventually("logs stored", || store.count().unwrap() == 4).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_grpc_unconfigured_service_is_unimplemented() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]));
    let handle = Supervisor::start(config).await.unwrap();
    let url = format!("http://{}", handle.grpc_addr().unwrap());

    let mut client = TraceServiceClient::connect(url).await.unwrap();
    let status = client.export(encode_traces(&spans(1, "web"))).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unimplemented);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_grpc_shutting_down_is_unavailable() {
    let handle = Supervisor::start(all_signals_to_memory()).await.unwrap();
    let url = format!("http://{}", handle.grpc_addr().unwrap());
    let mut client = LogsServiceClient::connect(url).await.unwrap();

    handle.ingresses().close();
    let status = client.export(encode_logs(&logs(1, "api"))).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unavailable);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_grpc_oversized_message_counts_as_rejected() {
    let mut config = all_signals_to_memory();
    config.receivers.max_request_bytes = 1024;
    let handle = Supervisor::start(config).await.unwrap();
    let url = format!("http://{}", handle.grpc_addr().unwrap());

    let mut client = LogsServiceClient::connect(url).await.unwrap();
    let status = client.export(encode_logs(&logs(200, "api"))).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::OutOfRange);

    let report = handle.shutdown().await;
    assert_eq!(report.counters.logs.rejected, 1);
    assert_eq!(report.counters.logs.received, 0);
}
