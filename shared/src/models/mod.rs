//! Signal model for the Trisignal pipeline.
//!
//! Spans, metric points and log records all reference one shared [`Resource`]
//! describing their producer, and carry typed trace/span identifiers so the
//! three signals can be joined downstream.

pub mod ids;
pub mod log;
pub mod metric;
pub mod resource;
pub mod signal;
pub mod trace;

pub use ids::{IdError, SpanId, TraceId};
pub use log::{LogRecord, LogValidationError, Severity, SPAN_ID_ATTRIBUTE, TRACE_ID_ATTRIBUTE};
pub use metric::{
    Exemplar, HistogramData, MetricKind, MetricPoint, MetricValidationError, MetricValue,
    SeriesGuard, SeriesKey,
};
pub use resource::{
    AttributeValue, Attributes, Resource, DEPLOYMENT_ENVIRONMENT, SERVICE_INSTANCE_ID,
    SERVICE_NAME, SERVICE_VERSION, UNKNOWN_SERVICE,
};
pub use signal::{CorrelationKey, Record, SignalType};
pub use trace::{Span, SpanEvent, SpanKind, SpanStatus, SpanValidationError, Trace};
