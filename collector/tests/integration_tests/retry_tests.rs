//! Delivery retries against a real HTTP destination.

use super::common::*;
use axum::http::StatusCode;
use collector::telemetry::Counter;
use collector::Supervisor;
use prost::Message;
use shared::config::{PipelineConfig, RetryConfig};
use shared::models::SignalType;
use shared::otlp::{encode_logs, encode_traces};
use shared::storage::TraceStore;

fn logs_to(sink: &Sink, retry: RetryConfig) -> shared::config::CollectorConfig {
    let mut config = base_config();
    add_otlp_exporter(&mut config, "upstream", sink, retry);
    config.pipelines.logs = Some(PipelineConfig::new(["upstream"]).with_batch(10, 20));
    config
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_delivered() {
    let sink = Sink::start(vec![StatusCode::SERVICE_UNAVAILABLE, StatusCode::TOO_MANY_REQUESTS]).await;
    let handle = Supervisor::start(logs_to(&sink, fast_retry())).await.unwrap();

    let body = encode_logs(&logs(2, "api")).encode_to_vec();
    post_otlp(handle.http_addr().unwrap(), "/v1/logs", body).await;

    let counters = handle.counters().clone();
    eventually("delivery after retries", || {
        counters.signal(SignalType::Logs).get(Counter::Exported) == 2
    })
    .await;
    assert_eq!(sink.requests().len(), 3);
    assert_eq!(counters.signal(SignalType::Logs).get(Counter::Retried), 2);
    // Every attempt carries the same payload.
    let requests = sink.requests();
    assert!(requests.iter().all(|r| r.body == requests[0].body));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let sink = Sink::start(vec![StatusCode::BAD_REQUEST]).await;
    let handle = Supervisor::start(logs_to(&sink, fast_retry())).await.unwrap();

    let body = encode_logs(&logs(2, "api")).encode_to_vec();
    let response = post_otlp(handle.http_addr().unwrap(), "/v1/logs", body).await;
    // The producer never sees destination errors.
    assert_eq!(response.status(), 200);

    let counters = handle.counters().clone();
    eventually("permanent failure", || {
        counters.signal(SignalType::Logs).get(Counter::PermanentFailures) == 2
    })
    .await;
    assert_eq!(sink.requests().len(), 1);
    assert_eq!(counters.signal(SignalType::Logs).get(Counter::Retried), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let sink = Sink::start(vec![StatusCode::BAD_GATEWAY; 10]).await;
    let retry = RetryConfig {
        max_attempts: 3,
        ..fast_retry()
    };
    let handle = Supervisor::start(logs_to(&sink, retry)).await.unwrap();

    let body = encode_logs(&logs(1, "api")).encode_to_vec();
    post_otlp(handle.http_addr().unwrap(), "/v1/logs", body).await;

    let counters = handle.counters().clone();
    eventually("budget exhausted", || {
        counters.signal(SignalType::Logs).get(Counter::PermanentFailures) == 1
    })
    .await;
    assert_eq!(sink.requests().len(), 3);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_stuck_destination_does_not_delay_siblings() {
    let stuck = Sink::hanging().await;
    let mut config = base_config();
    config.service.shutdown_grace_ms = 100;
    add_otlp_exporter(
        &mut config,
        "stuck",
        &stuck,
        RetryConfig {
            attempt_timeout_ms: 60_000,
            ..fast_retry()
        },
    );
    add_memory_exporter(&mut config, "mem");
    config.pipelines.traces = Some(PipelineConfig::new(["stuck", "mem"]).with_batch(1, 20));
    let handle = Supervisor::start(config).await.unwrap();

    let body = encode_traces(&spans(3, "web")).encode_to_vec();
    post_otlp(handle.http_addr().unwrap(), "/v1/traces", body).await;

    let store = handle.memory_store("mem").unwrap().traces.clone();
    eventually("sibling delivered", || store.span_count().unwrap() == 3).await;
    eventually("stuck destination got its attempt", || stuck.requests().len() == 1).await;

    let report = handle.shutdown().await;
    let stuck_report = report.workers.iter().find(|w| w.name == "stuck").unwrap();
    assert_eq!(stuck_report.abandoned_records, 3);
}
