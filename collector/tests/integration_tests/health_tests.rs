//! Service port: health, readiness and scrape availability.

use super::common::*;
use collector::Supervisor;
use prost::Message;
use serde_json::Value;
use shared::config::{PipelineConfig, RetryConfig};
use shared::otlp::encode_logs;

#[tokio::test]
async fn test_health_and_liveness() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]));
    let handle = Supervisor::start(config).await.unwrap();

    let response = get(handle.service_addr(), "/health").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "trisignal-collector");

    let body: Value = get(handle.service_addr(), "/health/live").await.json().await.unwrap();
    assert_eq!(body["status"], "alive");

    let response = get(handle.service_addr(), "/health/ready").await;
    assert_eq!(response.status(), 200);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_readiness_waits_for_first_delivery_cycle() {
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
    config.pipelines.logs = Some(PipelineConfig::new(["stuck"]).with_batch(1, 20));
    let handle = Supervisor::start(config).await.unwrap();
    assert!(handle.is_ready());

    let body = encode_logs(&logs(1, "api")).encode_to_vec();
    post_otlp(handle.http_addr().unwrap(), "/v1/logs", body).await;
    eventually("attempt in flight", || !stuck.requests().is_empty()).await;

    let response = get(handle.service_addr(), "/health/ready").await;
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "not_ready");
    assert_eq!(body["pending"][0]["name"], "stuck");
    assert_eq!(body["pending"][0]["in_flight"], true);
    assert!(!handle.is_ready());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_scrape_endpoint_requires_prometheus_exporter() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]));
    let handle = Supervisor::start(config).await.unwrap();

    assert_eq!(get(handle.service_addr(), "/metrics").await.status(), 404);

    handle.shutdown().await;
}
