//! Conversions from the signal model back into OTLP export requests.
//!
//! Used by exporters that push to OTLP-speaking destinations. Consecutive
//! records sharing a resource and instrumentation scope are grouped into one
//! block, so batch order is kept on the wire.

use super::conversions::{SCOPE_NAME_ATTRIBUTE, SCOPE_VERSION_ATTRIBUTE};
use crate::models::{
    AttributeValue, Attributes, LogRecord, MetricKind, MetricPoint, MetricValue, Record, Resource,
    Span, SpanKind, SpanStatus,
};
use crate::otlp::proto;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Converts a `DateTime<Utc>` to OTLP nanoseconds since epoch.
#[must_use]
pub fn datetime_to_nanos(dt: DateTime<Utc>) -> u64 {
    dt.timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0)
}

fn attribute_to_any_value(value: &AttributeValue) -> proto::common::v1::AnyValue {
    use proto::common::v1::any_value::Value;

    let value = match value {
        AttributeValue::String(s) => Value::StringValue(s.clone()),
        AttributeValue::Bool(b) => Value::BoolValue(*b),
        AttributeValue::Int(i) => Value::IntValue(*i),
        AttributeValue::Double(d) => Value::DoubleValue(*d),
    };
    proto::common::v1::AnyValue { value: Some(value) }
}

/// Converts attributes to OTLP key-value pairs, in order.
#[must_use]
pub fn attributes_to_key_values(attributes: &Attributes) -> Vec<proto::common::v1::KeyValue> {
    attributes
        .iter()
        .map(|(k, v)| proto::common::v1::KeyValue {
            key: k.to_string(),
            value: Some(attribute_to_any_value(v)),
        })
        .collect()
}

/// Converts a resource to its OTLP form.
#[must_use]
pub fn resource_to_proto(resource: &Resource) -> proto::resource::v1::Resource {
    proto::resource::v1::Resource {
        attributes: attributes_to_key_values(resource.attributes()),
        ..Default::default()
    }
}

/// Splits the scope attributes folded in at decode time back out.
fn split_scope(
    attributes: &Attributes,
) -> (
    Option<proto::common::v1::InstrumentationScope>,
    Vec<proto::common::v1::KeyValue>,
) {
    let name = attributes.get_str(SCOPE_NAME_ATTRIBUTE);
    let version = attributes.get_str(SCOPE_VERSION_ATTRIBUTE);
    let scope = (name.is_some() || version.is_some()).then(|| {
        proto::common::v1::InstrumentationScope {
            name: name.unwrap_or_default().to_string(),
            version: version.unwrap_or_default().to_string(),
            ..Default::default()
        }
    });
    let rest = attributes
        .iter()
        .filter(|(k, _)| *k != SCOPE_NAME_ATTRIBUTE && *k != SCOPE_VERSION_ATTRIBUTE)
        .map(|(k, v)| proto::common::v1::KeyValue {
            key: k.to_string(),
            value: Some(attribute_to_any_value(v)),
        })
        .collect();
    (scope, rest)
}

struct ResourceGroup<I> {
    resource: Arc<Resource>,
    scopes: Vec<(Option<proto::common::v1::InstrumentationScope>, Vec<I>)>,
}

/// Groups converted items by consecutive resource, then by consecutive scope.
fn group<T: Record, I>(
    records: &[T],
    mut convert: impl FnMut(&T, Vec<proto::common::v1::KeyValue>) -> I,
) -> Vec<ResourceGroup<I>> {
    let mut groups: Vec<ResourceGroup<I>> = Vec::new();
    for record in records {
        let (scope, attributes) = split_scope(record.attributes());
        let item = convert(record, attributes);

        let same_resource = groups.last().is_some_and(|g| {
            Arc::ptr_eq(&g.resource, record.resource()) || *g.resource == **record.resource()
        });
        if !same_resource {
            groups.push(ResourceGroup {
                resource: Arc::clone(record.resource()),
                scopes: Vec::new(),
            });
        }
        let Some(current) = groups.last_mut() else {
            continue;
        };
        match current.scopes.last_mut() {
            Some((last_scope, items)) if *last_scope == scope => items.push(item),
            _ => current.scopes.push((scope, vec![item])),
        }
    }
    groups
}

fn span_kind_to_proto(kind: SpanKind) -> i32 {
    use proto::trace::v1::span::SpanKind as OtlpSpanKind;

    let kind = match kind {
        SpanKind::Unspecified => OtlpSpanKind::Unspecified,
        SpanKind::Internal => OtlpSpanKind::Internal,
        SpanKind::Server => OtlpSpanKind::Server,
        SpanKind::Client => OtlpSpanKind::Client,
        SpanKind::Producer => OtlpSpanKind::Producer,
        SpanKind::Consumer => OtlpSpanKind::Consumer,
    };
    kind as i32
}

fn span_status_to_proto(span: &Span) -> Option<proto::trace::v1::Status> {
    use proto::trace::v1::status::StatusCode;

    let code = match span.status {
        SpanStatus::Unset if span.status_message.is_empty() => return None,
        SpanStatus::Unset => StatusCode::Unset,
        SpanStatus::Ok => StatusCode::Ok,
        SpanStatus::Error => StatusCode::Error,
    };
    Some(proto::trace::v1::Status {
        message: span.status_message.clone(),
        code: code as i32,
    })
}

fn span_to_proto(span: &Span, attributes: Vec<proto::common::v1::KeyValue>) -> proto::trace::v1::Span {
    proto::trace::v1::Span {
        trace_id: span.trace_id.to_vec(),
        span_id: span.span_id.to_vec(),
        parent_span_id: span.parent_span_id.map(|p| p.to_vec()).unwrap_or_default(),
        name: span.name.clone(),
        kind: span_kind_to_proto(span.kind),
        start_time_unix_nano: datetime_to_nanos(span.start_time),
        end_time_unix_nano: datetime_to_nanos(span.end_time),
        attributes,
        events: span
            .events
            .iter()
            .map(|e| proto::trace::v1::span::Event {
                time_unix_nano: datetime_to_nanos(e.timestamp),
                name: e.name.clone(),
                attributes: attributes_to_key_values(&e.attributes),
                ..Default::default()
            })
            .collect(),
        status: span_status_to_proto(span),
        ..Default::default()
    }
}

/// Builds a trace export request from a batch of spans.
#[must_use]
pub fn encode_traces(spans: &[Span]) -> proto::collector::trace::v1::ExportTraceServiceRequest {
    let resource_spans = group(spans, span_to_proto)
        .into_iter()
        .map(|g| proto::trace::v1::ResourceSpans {
            resource: Some(resource_to_proto(&g.resource)),
            scope_spans: g
                .scopes
                .into_iter()
                .map(|(scope, spans)| proto::trace::v1::ScopeSpans {
                    scope,
                    spans,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    proto::collector::trace::v1::ExportTraceServiceRequest { resource_spans }
}

fn log_to_proto(record: &LogRecord, attributes: Vec<proto::common::v1::KeyValue>) -> proto::logs::v1::LogRecord {
    proto::logs::v1::LogRecord {
        time_unix_nano: datetime_to_nanos(record.timestamp),
        severity_number: record.severity.to_number(),
        severity_text: record.severity_text.clone(),
        body: Some(proto::common::v1::AnyValue {
            value: Some(proto::common::v1::any_value::Value::StringValue(
                record.body.clone(),
            )),
        }),
        attributes,
        trace_id: record.trace_id.map(|t| t.to_vec()).unwrap_or_default(),
        span_id: record.span_id.map(|s| s.to_vec()).unwrap_or_default(),
        ..Default::default()
    }
}

/// Builds a logs export request from a batch of log records.
#[must_use]
pub fn encode_logs(records: &[LogRecord]) -> proto::collector::logs::v1::ExportLogsServiceRequest {
    let resource_logs = group(records, log_to_proto)
        .into_iter()
        .map(|g| proto::logs::v1::ResourceLogs {
            resource: Some(resource_to_proto(&g.resource)),
            scope_logs: g
                .scopes
                .into_iter()
                .map(|(scope, log_records)| proto::logs::v1::ScopeLogs {
                    scope,
                    log_records,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    proto::collector::logs::v1::ExportLogsServiceRequest { resource_logs }
}

fn exemplars_to_proto(point: &MetricPoint) -> Vec<proto::metrics::v1::Exemplar> {
    point
        .exemplars
        .iter()
        .map(|e| proto::metrics::v1::Exemplar {
            time_unix_nano: datetime_to_nanos(e.timestamp),
            trace_id: e.trace_id.to_vec(),
            span_id: e.span_id.to_vec(),
            value: Some(proto::metrics::v1::exemplar::Value::AsDouble(e.value)),
            ..Default::default()
        })
        .collect()
}

fn metric_to_proto(
    point: &MetricPoint,
    attributes: Vec<proto::common::v1::KeyValue>,
) -> proto::metrics::v1::Metric {
    use proto::metrics::v1::metric::Data;
    use proto::metrics::v1::AggregationTemporality;

    let start_time_unix_nano = point.start_time.map(datetime_to_nanos).unwrap_or_default();
    let time_unix_nano = datetime_to_nanos(point.timestamp);
    let cumulative = AggregationTemporality::Cumulative as i32;

    let data = match &point.value {
        MetricValue::Histogram(h) => Data::Histogram(proto::metrics::v1::Histogram {
            data_points: vec![proto::metrics::v1::HistogramDataPoint {
                attributes,
                start_time_unix_nano,
                time_unix_nano,
                count: h.count,
                sum: Some(h.sum),
                bucket_counts: h.bucket_counts.clone(),
                explicit_bounds: h.bounds.clone(),
                exemplars: exemplars_to_proto(point),
                ..Default::default()
            }],
            aggregation_temporality: cumulative,
        }),
        MetricValue::Number(value) => {
            let data_point = proto::metrics::v1::NumberDataPoint {
                attributes,
                start_time_unix_nano,
                time_unix_nano,
                exemplars: exemplars_to_proto(point),
                value: Some(proto::metrics::v1::number_data_point::Value::AsDouble(*value)),
                ..Default::default()
            };
            if point.kind == MetricKind::Counter {
                Data::Sum(proto::metrics::v1::Sum {
                    data_points: vec![data_point],
                    aggregation_temporality: cumulative,
                    is_monotonic: true,
                })
            } else {
                Data::Gauge(proto::metrics::v1::Gauge {
                    data_points: vec![data_point],
                })
            }
        }
    };

    proto::metrics::v1::Metric {
        name: point.name.clone(),
        description: point.description.clone(),
        unit: point.unit.clone(),
        data: Some(data),
        ..Default::default()
    }
}

/// Builds a metrics export request from a batch of metric points.
#[must_use]
pub fn encode_metrics(
    points: &[MetricPoint],
) -> proto::collector::metrics::v1::ExportMetricsServiceRequest {
    let resource_metrics = group(points, metric_to_proto)
        .into_iter()
        .map(|g| proto::metrics::v1::ResourceMetrics {
            resource: Some(resource_to_proto(&g.resource)),
            scope_metrics: g
                .scopes
                .into_iter()
                .map(|(scope, metrics)| proto::metrics::v1::ScopeMetrics {
                    scope,
                    metrics,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    proto::collector::metrics::v1::ExportMetricsServiceRequest { resource_metrics }
}
