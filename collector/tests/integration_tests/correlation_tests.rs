//! Trace context survives every pipeline, so stored logs, spans and
//! exemplars can be joined on it.

use super::common::*;
use collector::Supervisor;
use prost::Message;
use shared::config::{ExporterConfig, PipelineConfig, PrometheusExporterConfig};
use shared::models::{Exemplar, HistogramData, LogRecord, MetricPoint, Resource, Severity};
use shared::otlp::{encode_logs, encode_metrics, encode_traces};
use shared::storage::{LogQuery, LogStore, TraceStore};

#[tokio::test]
async fn test_logs_join_spans_on_trace_context() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.traces = Some(PipelineConfig::new(["mem"]).with_batch(10, 20));
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]).with_batch(10, 20));
    let handle = Supervisor::start(config).await.unwrap();
    let addr = handle.http_addr().unwrap();

    let span_list = spans(1, "checkout");
    let span = &span_list[0];
    let log = LogRecord::new(Severity::Error, "payment declined", span.resource.clone())
        .with_trace_context(span.trace_id, span.span_id);
    let unrelated = LogRecord::new(Severity::Info, "heartbeat", span.resource.clone());

    post_otlp(addr, "/v1/traces", encode_traces(&span_list).encode_to_vec()).await;
    post_otlp(addr, "/v1/logs", encode_logs(&[log, unrelated]).encode_to_vec()).await;

    let stores = handle.memory_store("mem").unwrap().clone();
    eventually("both signals stored", || {
        stores.traces.span_count().unwrap() == 1 && stores.logs.count().unwrap() == 2
    })
    .await;

    let trace = stores.traces.get_trace(span.trace_id).unwrap();
    let root = trace.span(span.span_id).unwrap();
    let correlated = stores
        .logs
        .query(LogQuery::for_span(root.trace_id, root.span_id))
        .unwrap();
    assert_eq!(correlated.total_count, 1);
    assert_eq!(correlated.logs[0].body, "payment declined");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_trace_context_attributes_are_normalised() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]).with_batch(10, 20));
    let handle = Supervisor::start(config).await.unwrap();

    // JSON log lines carry the context as plain attributes.
    let log = LogRecord::new(Severity::Info, "order created", Resource::for_service("api").shared())
        .with_attribute("trace_id", TRACE_ID)
        .with_attribute("span_id", SPAN_ID);
    post_otlp(handle.http_addr().unwrap(), "/v1/logs", encode_logs(&[log]).encode_to_vec()).await;

    let store = handle.memory_store("mem").unwrap().logs.clone();
    eventually("log stored", || store.count().unwrap() == 1).await;
    let stored = store.query(LogQuery::new().with_trace_id(trace_id())).unwrap();
    assert_eq!(stored.total_count, 1);
    assert_eq!(stored.logs[0].trace_id, Some(trace_id()));
    assert_eq!(stored.logs[0].span_id, Some(span_id()));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_exemplars_reach_openmetrics_scrape() {
    let mut config = base_config();
    config.exporters.insert(
        "prom".to_string(),
        ExporterConfig::Prometheus(PrometheusExporterConfig::default()),
    );
    config.pipelines.metrics = Some(PipelineConfig::new(["prom"]).with_batch(10, 20));
    let handle = Supervisor::start(config).await.unwrap();

    let data = HistogramData {
        bounds: vec![0.1, 0.5, 1.0],
        bucket_counts: vec![1, 2, 0, 0],
        sum: 0.9,
        count: 3,
    };
    let point = MetricPoint::histogram("request_seconds", data, Resource::for_service("api").shared())
        .with_exemplar(Exemplar {
            trace_id: trace_id(),
            span_id: span_id(),
            timestamp: chrono::Utc::now(),
            value: 0.3,
        });
    post_otlp(
        handle.http_addr().unwrap(),
        "/v1/metrics",
        encode_metrics(&[point]).encode_to_vec(),
    )
    .await;

    let registry = handle.scrape_registry().unwrap().clone();
    eventually("histogram scraped", || registry.series_count() == 1).await;

    let text = reqwest::Client::new()
        .get(format!("http://{}/metrics", handle.service_addr()))
        .header("accept", "application/openmetrics-text; version=1.0.0")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let bucket = text
        .lines()
        .find(|l| l.starts_with("request_seconds_bucket") && l.contains("le=\"0.5\""))
        .unwrap();
    assert!(bucket.contains(&format!("trace_id=\"{TRACE_ID}\"")));
    assert!(text.ends_with("# EOF\n"));

    handle.shutdown().await;
}
