//! Admission control and ingest error handling at the HTTP receiver.

use super::common::*;
use collector::Supervisor;
use prost::Message;
use shared::config::{MemoryLimits, PipelineConfig, ProcessorConfig};
use shared::otlp::proto::collector::trace::v1::ExportTraceServiceResponse;
use shared::otlp::{encode_logs, encode_traces};

fn limited_config(limits: MemoryLimits) -> shared::config::CollectorConfig {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config
        .processors
        .insert("memory".to_string(), ProcessorConfig::MemoryLimiter(limits));
    // A long deadline keeps admitted records, and their memory, in the accumulator.
    config.pipelines.logs = Some(
        PipelineConfig::new(["mem"])
            .with_processor("memory")
            .with_batch(1000, 60_000),
    );
    config
}

#[tokio::test]
async fn test_soft_limit_answers_too_many_requests() {
    let handle = Supervisor::start(limited_config(MemoryLimits::new(1, 1 << 30)))
        .await
        .unwrap();
    let addr = handle.http_addr().unwrap();
    let body = encode_logs(&logs(2, "api")).encode_to_vec();

    assert_eq!(post_otlp(addr, "/v1/logs", body.clone()).await.status(), 200);
    assert!(handle.budget().used() > 0);
    let refused = post_otlp(addr, "/v1/logs", body).await;
    assert_eq!(refused.status(), 429);

    let report = handle.shutdown().await;
    assert_eq!(report.counters.logs.received, 2);
    assert_eq!(report.counters.logs.rejected, 2);
    assert_eq!(report.counters.logs.exported, 2);
}

#[tokio::test]
async fn test_hard_limit_answers_service_unavailable() {
    let handle = Supervisor::start(limited_config(MemoryLimits::new(1, 2)))
        .await
        .unwrap();
    let addr = handle.http_addr().unwrap();
    let body = encode_logs(&logs(2, "api")).encode_to_vec();

    assert_eq!(post_otlp(addr, "/v1/logs", body.clone()).await.status(), 200);
    assert!(handle.budget().is_refusing());

    let refused = post_otlp(addr, "/v1/logs", body).await;
    assert_eq!(refused.status(), 503);
    let error: serde_json::Value = refused.json().await.unwrap();
    assert!(error["message"].as_str().unwrap().contains("resource exhausted"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_memory_is_released_after_delivery() {
    let mut config = limited_config(MemoryLimits::new(1, 1 << 30));
    config.pipelines.logs = Some(
        PipelineConfig::new(["mem"])
            .with_processor("memory")
            .with_batch(1000, 20),
    );
    let handle = Supervisor::start(config).await.unwrap();
    let addr = handle.http_addr().unwrap();
    let body = encode_logs(&logs(2, "api")).encode_to_vec();

    assert_eq!(post_otlp(addr, "/v1/logs", body.clone()).await.status(), 200);
    let budget = handle.budget().clone();
    eventually("budget released", || budget.used() == 0).await;
    assert_eq!(post_otlp(addr, "/v1/logs", body).await.status(), 200);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_malformed_payload_is_bad_request() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]));
    let handle = Supervisor::start(config).await.unwrap();

    let response = post_otlp(handle.http_addr().unwrap(), "/v1/logs", vec![0xff, 0xff, 0xff]).await;
    assert_eq!(response.status(), 400);
    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(error["code"], 400);

    let store = handle.memory_store("mem").unwrap().logs.clone();
    let report = handle.shutdown().await;
    assert_eq!(shared::storage::LogStore::count(store.as_ref()).unwrap(), 0);
    assert_eq!(report.counters.logs.rejected, 1);
    assert_eq!(report.counters.logs.received, 0);
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.receivers.max_request_bytes = 1024;
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]));
    let handle = Supervisor::start(config).await.unwrap();

    let response = post_otlp(handle.http_addr().unwrap(), "/v1/logs", vec![0u8; 8192]).await;
    assert_eq!(response.status(), 413);

    let report = handle.shutdown().await;
    assert_eq!(report.counters.logs.rejected, 1);
    assert_eq!(report.counters.logs.received, 0);
}

#[tokio::test]
async fn test_invalid_records_are_rejected_individually() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.traces = Some(PipelineConfig::new(["mem"]).with_batch(10, 20));
    let handle = Supervisor::start(config).await.unwrap();

    let mut request = encode_traces(&spans(2, "web"));
    request.resource_spans[0].scope_spans[0].spans[1].trace_id = vec![1, 2, 3];
    let response = post_otlp(handle.http_addr().unwrap(), "/v1/traces", request.encode_to_vec()).await;
    assert_eq!(response.status(), 200);

    let body = response.bytes().await.unwrap();
    let partial = ExportTraceServiceResponse::decode(body).unwrap().partial_success.unwrap();
    assert_eq!(partial.rejected_spans, 1);
    assert!(!partial.error_message.is_empty());

    let store = handle.memory_store("mem").unwrap().traces.clone();
    eventually("valid span stored", || {
        shared::storage::TraceStore::span_count(store.as_ref()).unwrap() == 1
    })
    .await;

    let report = handle.shutdown().await;
    assert_eq!(report.counters.traces.received, 1);
    assert_eq!(report.counters.traces.rejected, 1);
}

#[tokio::test]
async fn test_unconfigured_signal_is_not_routed() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]));
    let handle = Supervisor::start(config).await.unwrap();

    let body = encode_traces(&spans(1, "web")).encode_to_vec();
    let response = post_otlp(handle.http_addr().unwrap(), "/v1/traces", body).await;
    assert_eq!(response.status(), 404);

    handle.shutdown().await;
}
