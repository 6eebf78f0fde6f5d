//! Conversions from OTLP protobuf types into the signal model.
//!
//! Each `decode_*` function walks one export request. A record that fails
//! conversion or validation is rejected on its own and counted; the rest of
//! the request is still admitted.

use crate::models::{
    ids, AttributeValue, Attributes, Exemplar, HistogramData, IdError, LogRecord,
    LogValidationError, MetricKind, MetricPoint, MetricValidationError, MetricValue, Resource,
    Severity, Span, SpanEvent, SpanId, SpanKind, SpanStatus, SpanValidationError, TraceId,
};
use crate::otlp::proto;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

/// Record attribute carrying the instrumentation scope name.
pub const SCOPE_NAME_ATTRIBUTE: &str = "otel.scope.name";
/// Record attribute carrying the instrumentation scope version.
pub const SCOPE_VERSION_ATTRIBUTE: &str = "otel.scope.version";

/// Why a single record was rejected during decoding.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    /// The trace id bytes are malformed.
    #[error("invalid trace id: {0}")]
    TraceId(IdError),

    /// The span id bytes are malformed.
    #[error("invalid span id: {0}")]
    SpanId(IdError),

    /// The parent span id bytes are malformed.
    #[error("invalid parent span id: {0}")]
    ParentSpanId(IdError),

    /// The span failed validation.
    #[error(transparent)]
    Span(#[from] SpanValidationError),

    /// The metric point failed validation.
    #[error(transparent)]
    Metric(#[from] MetricValidationError),

    /// The log record failed validation.
    #[error(transparent)]
    Log(#[from] LogValidationError),

    /// A metric carried no data.
    #[error("metric {0} has no data")]
    MissingData(String),

    /// A data point carried no value.
    #[error("data point of {0} has no value")]
    MissingValue(String),

    /// The metric type is not carried by this pipeline.
    #[error("unsupported metric type {kind} for {name}")]
    Unsupported {
        /// Metric name.
        name: String,
        /// OTLP data type.
        kind: &'static str,
    },
}

/// Result of decoding one export request.
#[derive(Debug)]
pub struct Decoded<T> {
    /// Records that converted and validated.
    pub records: Vec<T>,
    /// One entry per rejected record.
    pub rejected: Vec<DecodeError>,
}

impl<T> Default for Decoded<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl<T> Decoded<T> {
    /// Number of rejected records.
    #[must_use]
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    /// A short summary of the rejections, for partial success responses.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        let first = self.rejected.first()?;
        Some(format!(
            "{} records rejected; first error: {first}",
            self.rejected.len()
        ))
    }

    fn push(&mut self, result: Result<T, DecodeError>) {
        match result {
            Ok(record) => self.records.push(record),
            Err(e) => self.rejected.push(e),
        }
    }
}

/// Converts an OTLP timestamp (nanoseconds since epoch) to a `DateTime<Utc>`.
pub(crate) fn timestamp_to_datetime(nanos: u64) -> DateTime<Utc> {
    let duration = Duration::from_nanos(nanos);
    DateTime::<Utc>::from(UNIX_EPOCH + duration)
}

/// Converts OTLP `AnyValue` to a scalar attribute.
///
/// Arrays and key-value lists are flattened to JSON text, bytes to base64.
#[must_use]
pub fn any_value_to_attribute(value: &proto::common::v1::AnyValue) -> Option<AttributeValue> {
    use proto::common::v1::any_value::Value;

    match value.value.as_ref()? {
        Value::StringValue(s) => Some(AttributeValue::String(s.clone())),
        Value::BoolValue(b) => Some(AttributeValue::Bool(*b)),
        Value::IntValue(i) => Some(AttributeValue::Int(*i)),
        Value::DoubleValue(d) => Some(AttributeValue::Double(*d)),
        Value::BytesValue(b) => {
            use base64::Engine;
            Some(AttributeValue::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            ))
        }
        Value::ArrayValue(_) | Value::KvlistValue(_) => {
            Some(AttributeValue::String(any_value_to_json(value).to_string()))
        }
    }
}

/// Converts OTLP `AnyValue` to `serde_json::Value`.
fn any_value_to_json(value: &proto::common::v1::AnyValue) -> serde_json::Value {
    use proto::common::v1::any_value::Value;

    match &value.value {
        Some(Value::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Value::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Value::IntValue(i)) => serde_json::Value::Number((*i).into()),
        Some(Value::DoubleValue(d)) => serde_json::Number::from_f64(*d)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Some(Value::ArrayValue(arr)) => {
            serde_json::Value::Array(arr.values.iter().map(any_value_to_json).collect())
        }
        Some(Value::KvlistValue(kv)) => {
            let mut map = serde_json::Map::new();
            for pair in &kv.values {
                if let Some(ref v) = pair.value {
                    map.insert(pair.key.clone(), any_value_to_json(v));
                }
            }
            serde_json::Value::Object(map)
        }
        Some(Value::BytesValue(b)) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        None => serde_json::Value::Null,
    }
}

/// Converts OTLP key-value pairs to ordered attributes, skipping empty values.
#[must_use]
pub fn key_values_to_attributes(attributes: &[proto::common::v1::KeyValue]) -> Attributes {
    attributes
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .and_then(any_value_to_attribute)
                .map(|v| (kv.key.clone(), v))
        })
        .collect()
}

/// Converts an OTLP resource, shared by every record of its block.
#[must_use]
pub fn convert_resource(resource: Option<&proto::resource::v1::Resource>) -> Arc<Resource> {
    let attributes = resource
        .map(|r| key_values_to_attributes(&r.attributes))
        .unwrap_or_default();
    Arc::new(Resource::new(attributes))
}

/// Record attributes with the instrumentation scope folded in.
fn record_attributes(
    attributes: &[proto::common::v1::KeyValue],
    scope: Option<&proto::common::v1::InstrumentationScope>,
) -> Attributes {
    let mut converted = key_values_to_attributes(attributes);
    if let Some(scope) = scope {
        if !scope.name.is_empty() {
            converted.insert_if_absent(SCOPE_NAME_ATTRIBUTE, scope.name.clone());
        }
        if !scope.version.is_empty() {
            converted.insert_if_absent(SCOPE_VERSION_ATTRIBUTE, scope.version.clone());
        }
    }
    converted
}

/// Converts OTLP span status to `SpanStatus`.
fn otlp_span_status_to_status(status: Option<&proto::trace::v1::Status>) -> (SpanStatus, String) {
    use proto::trace::v1::status::StatusCode;

    match status {
        Some(s) => {
            let code = match StatusCode::try_from(s.code) {
                Ok(StatusCode::Ok) => SpanStatus::Ok,
                Ok(StatusCode::Error) => SpanStatus::Error,
                Ok(StatusCode::Unset) | Err(_) => SpanStatus::Unset,
            };
            (code, s.message.clone())
        }
        None => (SpanStatus::Unset, String::new()),
    }
}

/// Converts OTLP span kind to `SpanKind`.
fn otlp_span_kind_to_kind(kind: i32) -> SpanKind {
    use proto::trace::v1::span::SpanKind as OtlpSpanKind;

    match OtlpSpanKind::try_from(kind) {
        Ok(OtlpSpanKind::Internal) => SpanKind::Internal,
        Ok(OtlpSpanKind::Server) => SpanKind::Server,
        Ok(OtlpSpanKind::Client) => SpanKind::Client,
        Ok(OtlpSpanKind::Producer) => SpanKind::Producer,
        Ok(OtlpSpanKind::Consumer) => SpanKind::Consumer,
        Ok(OtlpSpanKind::Unspecified) | Err(_) => SpanKind::Unspecified,
    }
}

/// Converts one OTLP span.
///
/// # Errors
///
/// Returns an error if an id is malformed or the span fails validation.
pub fn otlp_span_to_span(
    span: &proto::trace::v1::Span,
    resource: &Arc<Resource>,
    scope: Option<&proto::common::v1::InstrumentationScope>,
) -> Result<Span, DecodeError> {
    let trace_id = TraceId::from_slice(&span.trace_id).map_err(DecodeError::TraceId)?;
    let span_id = SpanId::from_slice(&span.span_id).map_err(DecodeError::SpanId)?;
    let parent_span_id =
        ids::optional_span_id(&span.parent_span_id).map_err(DecodeError::ParentSpanId)?;
    let (status, status_message) = otlp_span_status_to_status(span.status.as_ref());

    let events = span
        .events
        .iter()
        .map(|e| SpanEvent {
            name: e.name.clone(),
            timestamp: timestamp_to_datetime(e.time_unix_nano),
            attributes: key_values_to_attributes(&e.attributes),
        })
        .collect();

    let converted = Span {
        trace_id,
        span_id,
        parent_span_id,
        name: span.name.clone(),
        kind: otlp_span_kind_to_kind(span.kind),
        status,
        status_message,
        start_time: timestamp_to_datetime(span.start_time_unix_nano),
        end_time: timestamp_to_datetime(span.end_time_unix_nano),
        attributes: record_attributes(&span.attributes, scope),
        events,
        resource: Arc::clone(resource),
    };
    converted.validate_span()?;
    Ok(converted)
}

/// Decodes every span of a trace export request.
#[must_use]
pub fn decode_traces(
    request: &proto::collector::trace::v1::ExportTraceServiceRequest,
) -> Decoded<Span> {
    let mut decoded = Decoded::default();
    for resource_spans in &request.resource_spans {
        let resource = convert_resource(resource_spans.resource.as_ref());
        for scope_spans in &resource_spans.scope_spans {
            for span in &scope_spans.spans {
                decoded.push(otlp_span_to_span(span, &resource, scope_spans.scope.as_ref()));
            }
        }
    }
    decoded
}

/// Converts one OTLP log record.
///
/// A zero timestamp falls back to the observed timestamp, then to now.
///
/// # Errors
///
/// Returns an error if trace context is malformed.
pub fn otlp_log_to_log_record(
    log_record: &proto::logs::v1::LogRecord,
    resource: &Arc<Resource>,
    scope: Option<&proto::common::v1::InstrumentationScope>,
) -> Result<LogRecord, DecodeError> {
    let timestamp = if log_record.time_unix_nano > 0 {
        timestamp_to_datetime(log_record.time_unix_nano)
    } else if log_record.observed_time_unix_nano > 0 {
        timestamp_to_datetime(log_record.observed_time_unix_nano)
    } else {
        Utc::now()
    };

    let body = log_record
        .body
        .as_ref()
        .map(|body| match &body.value {
            Some(proto::common::v1::any_value::Value::StringValue(s)) => s.clone(),
            Some(_) => any_value_to_json(body).to_string(),
            None => String::new(),
        })
        .unwrap_or_default();

    let trace_id = ids::optional_trace_id(&log_record.trace_id).map_err(DecodeError::TraceId)?;
    let span_id = ids::optional_span_id(&log_record.span_id).map_err(DecodeError::SpanId)?;

    let mut record = LogRecord {
        timestamp,
        severity: Severity::from_number(log_record.severity_number),
        severity_text: log_record.severity_text.clone(),
        body,
        attributes: record_attributes(&log_record.attributes, scope),
        trace_id,
        span_id,
        index_labels: Vec::new(),
        resource: Arc::clone(resource),
    };
    record.normalize_trace_context()?;
    Ok(record)
}

/// Decodes every record of a logs export request.
#[must_use]
pub fn decode_logs(
    request: &proto::collector::logs::v1::ExportLogsServiceRequest,
) -> Decoded<LogRecord> {
    let mut decoded = Decoded::default();
    for resource_logs in &request.resource_logs {
        let resource = convert_resource(resource_logs.resource.as_ref());
        for scope_logs in &resource_logs.scope_logs {
            for log_record in &scope_logs.log_records {
                decoded.push(otlp_log_to_log_record(
                    log_record,
                    &resource,
                    scope_logs.scope.as_ref(),
                ));
            }
        }
    }
    decoded
}

fn convert_exemplars(exemplars: &[proto::metrics::v1::Exemplar]) -> Vec<Exemplar> {
    use proto::metrics::v1::exemplar::Value;

    // Exemplars only exist for navigation; ones without trace context are skipped.
    exemplars
        .iter()
        .filter_map(|e| {
            let trace_id = TraceId::from_slice(&e.trace_id).ok()?;
            let span_id = SpanId::from_slice(&e.span_id).ok()?;
            #[allow(clippy::cast_precision_loss)]
            let value = match e.value.as_ref()? {
                Value::AsDouble(d) => *d,
                Value::AsInt(i) => *i as f64,
            };
            Some(Exemplar {
                trace_id,
                span_id,
                timestamp: timestamp_to_datetime(e.time_unix_nano),
                value,
            })
        })
        .collect()
}

fn start_time(nanos: u64) -> Option<DateTime<Utc>> {
    (nanos > 0).then(|| timestamp_to_datetime(nanos))
}

/// Converts an OTLP number data point.
fn otlp_number_data_point_to_point(
    metric: &proto::metrics::v1::Metric,
    kind: MetricKind,
    point: &proto::metrics::v1::NumberDataPoint,
    resource: &Arc<Resource>,
    scope: Option<&proto::common::v1::InstrumentationScope>,
) -> Result<MetricPoint, DecodeError> {
    use proto::metrics::v1::number_data_point::Value;

    #[allow(clippy::cast_precision_loss)]
    let value = match point.value {
        Some(Value::AsDouble(d)) => d,
        Some(Value::AsInt(i)) => i as f64,
        None => return Err(DecodeError::MissingValue(metric.name.clone())),
    };

    let converted = MetricPoint {
        name: metric.name.clone(),
        kind,
        value: MetricValue::Number(value),
        attributes: record_attributes(&point.attributes, scope),
        timestamp: timestamp_to_datetime(point.time_unix_nano),
        start_time: start_time(point.start_time_unix_nano),
        unit: metric.unit.clone(),
        description: metric.description.clone(),
        exemplars: convert_exemplars(&point.exemplars),
        resource: Arc::clone(resource),
    };
    converted.validate_point()?;
    Ok(converted)
}

/// Converts an OTLP histogram data point.
fn otlp_histogram_data_point_to_point(
    metric: &proto::metrics::v1::Metric,
    point: &proto::metrics::v1::HistogramDataPoint,
    resource: &Arc<Resource>,
    scope: Option<&proto::common::v1::InstrumentationScope>,
) -> Result<MetricPoint, DecodeError> {
    let data = HistogramData {
        bounds: point.explicit_bounds.clone(),
        bucket_counts: point.bucket_counts.clone(),
        sum: point.sum.unwrap_or(0.0),
        count: point.count,
    };

    let converted = MetricPoint {
        name: metric.name.clone(),
        kind: MetricKind::Histogram,
        value: MetricValue::Histogram(data),
        attributes: record_attributes(&point.attributes, scope),
        timestamp: timestamp_to_datetime(point.time_unix_nano),
        start_time: start_time(point.start_time_unix_nano),
        unit: metric.unit.clone(),
        description: metric.description.clone(),
        exemplars: convert_exemplars(&point.exemplars),
        resource: Arc::clone(resource),
    };
    converted.validate_point()?;
    Ok(converted)
}

/// Converts one OTLP metric into its data points.
///
/// Monotonic sums become counters, other sums gauges. Exponential histograms
/// and summaries are rejected per data point.
pub fn otlp_metric_to_points(
    metric: &proto::metrics::v1::Metric,
    resource: &Arc<Resource>,
    scope: Option<&proto::common::v1::InstrumentationScope>,
) -> Vec<Result<MetricPoint, DecodeError>> {
    use proto::metrics::v1::metric::Data;

    let unsupported = |kind: &'static str, n: usize| -> Vec<Result<MetricPoint, DecodeError>> {
        (0..n)
            .map(|_| {
                Err(DecodeError::Unsupported {
                    name: metric.name.clone(),
                    kind,
                })
            })
            .collect()
    };

    match &metric.data {
        Some(Data::Gauge(gauge)) => gauge
            .data_points
            .iter()
            .map(|p| otlp_number_data_point_to_point(metric, MetricKind::Gauge, p, resource, scope))
            .collect(),
        Some(Data::Sum(sum)) => {
            let kind = if sum.is_monotonic {
                MetricKind::Counter
            } else {
                MetricKind::Gauge
            };
            sum.data_points
                .iter()
                .map(|p| otlp_number_data_point_to_point(metric, kind, p, resource, scope))
                .collect()
        }
        Some(Data::Histogram(histogram)) => histogram
            .data_points
            .iter()
            .map(|p| otlp_histogram_data_point_to_point(metric, p, resource, scope))
            .collect(),
        Some(Data::ExponentialHistogram(h)) => unsupported("exponential_histogram", h.data_points.len()),
        Some(Data::Summary(s)) => unsupported("summary", s.data_points.len()),
        None => vec![Err(DecodeError::MissingData(metric.name.clone()))],
    }
}

/// Decodes every data point of a metrics export request.
#[must_use]
pub fn decode_metrics(
    request: &proto::collector::metrics::v1::ExportMetricsServiceRequest,
) -> Decoded<MetricPoint> {
    let mut decoded = Decoded::default();
    for resource_metrics in &request.resource_metrics {
        let resource = convert_resource(resource_metrics.resource.as_ref());
        for scope_metrics in &resource_metrics.scope_metrics {
            for metric in &scope_metrics.metrics {
                for result in otlp_metric_to_points(metric, &resource, scope_metrics.scope.as_ref()) {
                    decoded.push(result);
                }
            }
        }
    }
    decoded
}


#[cfg(test)]
#[path = "conversions_test.rs"]
mod conversions_test;
