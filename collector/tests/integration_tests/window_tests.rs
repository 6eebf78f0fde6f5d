//! Records held by the batch deadline across all three pipelines.

use super::common::*;
use collector::Supervisor;
use prost::Message;
use shared::config::PipelineConfig;
use shared::models::{MetricPoint, Resource};
use shared::otlp::{encode_logs, encode_metrics, encode_traces};
use shared::storage::{LogQuery, LogStore, MetricQuery, MetricStore, TraceStore};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test]
async fn test_small_batches_wait_for_the_deadline() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.traces = Some(PipelineConfig::new(["mem"]).with_batch(100, 5000));
    config.pipelines.metrics = Some(PipelineConfig::new(["mem"]).with_batch(100, 5000));
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]).with_batch(100, 5000));
    let handle = Supervisor::start(config).await.unwrap();
    let addr = handle.http_addr().unwrap();

    let point = MetricPoint::counter("requests_total", 1.0, Resource::for_service("checkout").shared());
    let trace_body = encode_traces(&spans(1, "checkout")).encode_to_vec();
    assert_eq!(post_otlp(addr, "/v1/traces", trace_body).await.status(), 200);
    let metric_body = encode_metrics(&[point]).encode_to_vec();
    assert_eq!(post_otlp(addr, "/v1/metrics", metric_body).await.status(), 200);
    let log_body = encode_logs(&logs(1, "checkout")).encode_to_vec();
    assert_eq!(post_otlp(addr, "/v1/logs", log_body).await.status(), 200);

    let stores = handle.memory_store("mem").unwrap().clone();
    sleep(Duration::from_millis(4500)).await;
    assert_eq!(stores.traces.span_count().unwrap(), 0);
    assert_eq!(stores.metrics.count().unwrap(), 0);
    assert_eq!(stores.logs.count().unwrap(), 0);

    sleep(Duration::from_millis(1000)).await;
    eventually("one record of each signal", || {
        stores.traces.span_count().unwrap() == 1
            && stores.metrics.count().unwrap() == 1
            && stores.logs.count().unwrap() == 1
    })
    .await;

    let trace = stores.traces.get_trace(trace_id()).unwrap();
    assert_eq!(trace.spans[0].resource.service_name(), "checkout");
    let points = stores.metrics.query(MetricQuery::new("requests_total")).unwrap();
    assert_eq!(points.points[0].resource.service_name(), "checkout");
    let records = stores.logs.query(LogQuery::new()).unwrap();
    assert_eq!(records.logs[0].resource.service_name(), "checkout");

    let report = handle.shutdown().await;
    assert_eq!(report.workers.len(), 3);
    for worker in &report.workers {
        assert_eq!(worker.delivered_batches, 1, "{}", worker.name);
    }
}
