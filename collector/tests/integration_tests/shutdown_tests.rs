//! Shutdown: fail-fast ingress, forced flush and bounded grace.

use super::common::*;
use collector::{IngestError, Supervisor};
use prost::Message;
use shared::config::{PipelineConfig, RetryConfig};
use shared::otlp::{encode_logs, encode_traces, Decoded};
use shared::storage::LogStore;

#[tokio::test]
async fn test_shutdown_flushes_pending_records() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]).with_batch(1000, 60_000));
    let handle = Supervisor::start(config).await.unwrap();

    let body = encode_logs(&logs(5, "api")).encode_to_vec();
    assert_eq!(post_otlp(handle.http_addr().unwrap(), "/v1/logs", body).await.status(), 200);

    let store = handle.memory_store("mem").unwrap().logs.clone();
    assert_eq!(store.count().unwrap(), 0);

    let report = handle.shutdown().await;
    assert_eq!(store.count().unwrap(), 5);
    assert_eq!(report.counters.logs.exported, 5);
    assert_eq!(report.abandoned_records, 0);
}

#[tokio::test]
async fn test_ingest_fails_fast_after_shutdown() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]));
    let handle = Supervisor::start(config).await.unwrap();
    let ingress = handle.ingresses().logs.clone().unwrap();

    handle.shutdown().await;

    let error = tokio_test::assert_err!(ingress.submit(Decoded::default()).await);
    assert_eq!(error, IngestError::ShuttingDown);
}

#[tokio::test]
async fn test_deliveries_are_abandoned_after_grace_period() {
    let sink = Sink::hanging().await;
    let mut config = base_config();
    config.service.shutdown_grace_ms = 200;
    add_otlp_exporter(
        &mut config,
        "tempo",
        &sink,
        RetryConfig {
            attempt_timeout_ms: 60_000,
            ..fast_retry()
        },
    );
    config.pipelines.traces = Some(PipelineConfig::new(["tempo"]).with_batch(2, 60_000));
    let handle = Supervisor::start(config).await.unwrap();

    let body = encode_traces(&spans(4, "web")).encode_to_vec();
    assert_eq!(post_otlp(handle.http_addr().unwrap(), "/v1/traces", body).await.status(), 200);
    eventually("first attempt in flight", || sink.requests().len() == 1).await;

    let report = handle.shutdown().await;
    assert_eq!(report.abandoned_batches, 2);
    assert_eq!(report.abandoned_records, 4);
    assert_eq!(report.counters.traces.permanent_failures, 4);
    assert_eq!(report.counters.traces.exported, 0);
}

#[tokio::test]
async fn test_grace_period_lets_slow_deliveries_finish() {
    let sink = Sink::ok().await;
    let mut config = base_config();
    add_otlp_exporter(&mut config, "tempo", &sink, fast_retry());
    config.pipelines.traces = Some(PipelineConfig::new(["tempo"]).with_batch(1, 60_000));
    let handle = Supervisor::start(config).await.unwrap();

    let body = encode_traces(&spans(3, "web")).encode_to_vec();
    post_otlp(handle.http_addr().unwrap(), "/v1/traces", body).await;

    let report = handle.shutdown().await;
    assert_eq!(sink.requests().len(), 3);
    assert_eq!(report.counters.traces.exported, 3);
    assert_eq!(report.workers[0].delivered_batches, 3);
}
