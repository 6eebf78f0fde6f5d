//! End-to-end flow from the OTLP HTTP receiver to each destination family.

use super::common::*;
use collector::Supervisor;
use prost::Message;
use shared::config::{
    AttributeScope, AttributesProcessorConfig, ExporterConfig, LabelHint, LokiExporterConfig,
    PipelineConfig, PrometheusExporterConfig, ProcessorConfig,
};
use shared::models::{MetricPoint, Resource};
use shared::otlp::proto::collector::trace::v1::ExportTraceServiceRequest;
use shared::otlp::proto::common::v1::any_value::Value as AnyValueKind;
use shared::otlp::{encode_logs, encode_metrics, encode_traces};
use shared::storage::{LogQuery, LogStore};
use std::collections::BTreeMap;

#[tokio::test]
async fn test_logs_reach_memory_store() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]).with_batch(100, 20));
    let handle = Supervisor::start(config).await.unwrap();

    let body = encode_logs(&logs(3, "checkout")).encode_to_vec();
    let response = post_otlp(handle.http_addr().unwrap(), "/v1/logs", body).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/x-protobuf");

    let store = handle.memory_store("mem").unwrap().logs.clone();
    eventually("logs delivered", || store.count().unwrap() == 3).await;
    let result = store.query(LogQuery::new().with_service("checkout")).unwrap();
    assert_eq!(result.total_count, 3);
    assert_eq!(result.logs[0].resource.service_name(), "checkout");

    let report = handle.shutdown().await;
    assert_eq!(report.counters.logs.received, 3);
    assert_eq!(report.counters.logs.exported, 3);
    assert_eq!(report.counters.logs.rejected, 0);
}

#[tokio::test]
async fn test_batches_are_cut_at_max_batch_size() {
    let mut config = base_config();
    add_memory_exporter(&mut config, "mem");
    config.pipelines.logs = Some(PipelineConfig::new(["mem"]).with_batch(2, 60_000));
    let handle = Supervisor::start(config).await.unwrap();

    let body = encode_logs(&logs(5, "checkout")).encode_to_vec();
    post_otlp(handle.http_addr().unwrap(), "/v1/logs", body).await;

    let store = handle.memory_store("mem").unwrap().logs.clone();
    eventually("two full batches", || store.count().unwrap() == 4).await;

    // The fifth record waits for the deadline; shutdown flushes it.
    let report = handle.shutdown().await;
    assert_eq!(store.count().unwrap(), 5);
    assert_eq!(report.workers[0].delivered_batches, 3);
}

#[tokio::test]
async fn test_traces_forwarded_over_otlp_http_with_resource_enrichment() {
    let sink = Sink::ok().await;
    let mut config = base_config();
    add_otlp_exporter(&mut config, "tempo", &sink, fast_retry());
    config.processors.insert(
        "env".to_string(),
        ProcessorConfig::Resource {
            attributes: BTreeMap::from([("deployment.environment".to_string(), "lab".into())]),
        },
    );
    config.pipelines.traces = Some(
        PipelineConfig::new(["tempo"])
            .with_processor("env")
            .with_batch(10, 20),
    );
    let handle = Supervisor::start(config).await.unwrap();

    let body = encode_traces(&spans(2, "web")).encode_to_vec();
    let response = post_otlp(handle.http_addr().unwrap(), "/v1/traces", body).await;
    assert_eq!(response.status(), 200);

    eventually("spans forwarded", || !sink.requests().is_empty()).await;
    let request = &sink.requests()[0];
    assert_eq!(request.path, "/v1/traces");
    assert_eq!(request.headers["content-type"], "application/x-protobuf");

    let forwarded = ExportTraceServiceRequest::decode(request.body.clone()).unwrap();
    let resource_spans = &forwarded.resource_spans[0];
    let names: Vec<&str> = resource_spans.scope_spans[0]
        .spans
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(names, ["operation-1", "operation-2"]);

    let environment = resource_spans
        .resource
        .as_ref()
        .unwrap()
        .attributes
        .iter()
        .find(|kv| kv.key == "deployment.environment")
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| v.value.as_ref());
    assert!(matches!(environment, Some(AnyValueKind::StringValue(v)) if v == "lab"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_logs_pushed_to_loki_with_promoted_labels() {
    let sink = Sink::ok().await;
    let mut config = base_config();
    config.exporters.insert(
        "loki".to_string(),
        ExporterConfig::Loki(LokiExporterConfig {
            endpoint: sink.url(),
            tenant_id: Some("lab".to_string()),
            retry: fast_retry(),
        }),
    );
    config.processors.insert(
        "labels".to_string(),
        ProcessorConfig::Attributes(AttributesProcessorConfig {
            label_hints: vec![LabelHint {
                key: "region".to_string(),
                scope: AttributeScope::Record,
                label: None,
            }],
            ..AttributesProcessorConfig::default()
        }),
    );
    config.pipelines.logs = Some(
        PipelineConfig::new(["loki"])
            .with_processor("labels")
            .with_batch(10, 20),
    );
    let handle = Supervisor::start(config).await.unwrap();

    let records: Vec<_> = logs(2, "checkout")
        .into_iter()
        .map(|r| r.with_attribute("region", "eu"))
        .collect();
    post_otlp(handle.http_addr().unwrap(), "/v1/logs", encode_logs(&records).encode_to_vec()).await;

    eventually("push request", || !sink.requests().is_empty()).await;
    let request = &sink.requests()[0];
    assert_eq!(request.path, "/loki/api/v1/push");
    assert_eq!(request.headers["x-scope-orgid"], "lab");

    let push: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    let stream = &push["streams"][0];
    assert_eq!(stream["stream"]["service_name"], "checkout");
    assert_eq!(stream["stream"]["region"], "eu");
    assert_eq!(stream["values"].as_array().unwrap().len(), 2);
    assert_eq!(stream["values"][0][2]["level"], "info");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_metrics_exposed_on_scrape_endpoint() {
    let mut config = base_config();
    config.exporters.insert(
        "prom".to_string(),
        ExporterConfig::Prometheus(PrometheusExporterConfig::default()),
    );
    config.pipelines.metrics = Some(PipelineConfig::new(["prom"]).with_batch(10, 20));
    let handle = Supervisor::start(config).await.unwrap();

    let point = MetricPoint::gauge("queue_depth", 7.0, Resource::for_service("worker").shared())
        .with_attribute("queue", "emails");
    let response = post_otlp(
        handle.http_addr().unwrap(),
        "/v1/metrics",
        encode_metrics(&[point]).encode_to_vec(),
    )
    .await;
    assert_eq!(response.status(), 200);

    let registry = handle.scrape_registry().unwrap().clone();
    eventually("series scraped", || registry.series_count() == 1).await;

    let text = get(handle.service_addr(), "/metrics").await.text().await.unwrap();
    assert!(text.contains("# TYPE queue_depth gauge"));
    assert!(text.contains("queue=\"emails\""));
    assert!(text.contains("service_name=\"worker\""));

    handle.shutdown().await;
}
