//! Trace and span data models.
//!
//! Defines the span record carried by the traces pipeline.

use super::ids::{SpanId, TraceId};
use super::resource::{AttributeValue, Attributes, Resource};
use super::signal::{CorrelationKey, Record, SignalType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Status code for a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// No status was set by the instrumentation.
    #[default]
    Unset,
    /// The operation was marked successful.
    Ok,
    /// The operation failed.
    Error,
}

impl SpanStatus {
    /// Lowercase name, as used in label values and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// The producer did not set a kind.
    #[default]
    Unspecified,
    /// An internal operation.
    Internal,
    /// The span represents a server handling a request.
    Server,
    /// The span represents a client making a request.
    Client,
    /// The span represents a producer sending a message.
    Producer,
    /// The span represents a consumer receiving a message.
    Consumer,
}

impl SpanKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Internal => "internal",
            Self::Server => "server",
            Self::Client => "client",
            Self::Producer => "producer",
            Self::Consumer => "consumer",
        }
    }
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event within a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    /// The name of the event.
    pub name: String,
    /// Timestamp when the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Additional attributes for the event.
    pub attributes: Attributes,
}

/// A span representing a unit of work in a distributed trace.
///
/// # Example
///
/// ```
/// use shared::models::{Resource, Span, SpanId, SpanKind, TraceId};
///
/// let trace_id = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap();
/// let span_id = SpanId::from_hex("b7ad6b7169203331").unwrap();
/// let span = Span::new(trace_id, span_id, "GET /api/users", Resource::for_service("api").shared())
///     .with_kind(SpanKind::Server)
///     .with_attribute("http.method", "GET");
///
/// assert!(span.validate_span().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    /// Identifier of the trace this span belongs to.
    pub trace_id: TraceId,
    /// Identifier of this span.
    pub span_id: SpanId,
    /// The parent span, `None` for root spans.
    pub parent_span_id: Option<SpanId>,
    /// The operation name.
    pub name: String,
    /// The kind of span.
    pub kind: SpanKind,
    /// The status of the span.
    pub status: SpanStatus,
    /// Optional status description.
    pub status_message: String,
    /// Timestamp when the span started.
    pub start_time: DateTime<Utc>,
    /// Timestamp when the span ended.
    pub end_time: DateTime<Utc>,
    /// Span attributes.
    pub attributes: Attributes,
    /// Events recorded during the span.
    pub events: Vec<SpanEvent>,
    /// The producer resource.
    pub resource: Arc<Resource>,
}

/// Errors that can occur during span validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpanValidationError {
    /// The span name is empty.
    #[error("Span name cannot be empty")]
    EmptyName,

    /// The span references itself as parent.
    #[error("Span cannot be its own parent")]
    SelfParent,

    /// The end time is before the start time.
    #[error("End time cannot be before start time")]
    InvalidTimeRange,
}

impl Span {
    /// Creates a new span with the current time as both start and end.
    #[must_use]
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        name: impl Into<String>,
        resource: Arc<Resource>,
    ) -> Self {
        let now = Utc::now();
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            name: name.into(),
            kind: SpanKind::default(),
            status: SpanStatus::default(),
            status_message: String::new(),
            start_time: now,
            end_time: now,
            attributes: Attributes::new(),
            events: Vec::new(),
            resource,
        }
    }

    /// Sets the parent span ID.
    #[must_use]
    pub fn with_parent(mut self, parent_span_id: SpanId) -> Self {
        self.parent_span_id = Some(parent_span_id);
        self
    }

    /// Sets the span kind.
    #[must_use]
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the span status.
    #[must_use]
    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets start and end time.
    #[must_use]
    pub fn with_times(mut self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    /// Adds an attribute to the span.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.upsert(key, value);
        self
    }

    /// Adds an event to the span.
    #[must_use]
    pub fn with_event(mut self, name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp,
            attributes: Attributes::new(),
        });
        self
    }

    /// Returns the duration of the span.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.duration().num_milliseconds()
    }

    /// Returns true if this is a root span (no parent).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// The key logs and exemplars use to point back at this span.
    #[must_use]
    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::new(self.trace_id, self.span_id)
    }

    /// Validates the span.
    ///
    /// Identifier validity is guaranteed by the id types. Parent references are
    /// not checked here, since a parent may arrive in a later batch.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The name is empty
    /// - The span lists itself as parent
    /// - The end time is before the start time
    pub fn validate_span(&self) -> Result<(), SpanValidationError> {
        if self.name.is_empty() {
            return Err(SpanValidationError::EmptyName);
        }
        if self.parent_span_id == Some(self.span_id) {
            return Err(SpanValidationError::SelfParent);
        }
        if self.end_time < self.start_time {
            return Err(SpanValidationError::InvalidTimeRange);
        }
        Ok(())
    }
}

impl Record for Span {
    const SIGNAL: SignalType = SignalType::Traces;

    fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    fn set_resource(&mut self, resource: Arc<Resource>) {
        self.resource = resource;
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.name.len()
            + self.status_message.len()
            + self.attributes.estimated_size()
            + self
                .events
                .iter()
                .map(|e| std::mem::size_of::<SpanEvent>() + e.name.len() + e.attributes.estimated_size())
                .sum::<usize>()
    }
}

/// A trace consisting of multiple spans.
#[derive(Debug, Clone)]
pub struct Trace {
    /// The trace ID.
    pub trace_id: TraceId,

    /// All spans in this trace.
    pub spans: Vec<Span>,

    root_span_index: Option<usize>,
}

impl Trace {
    /// Creates a new trace from a collection of spans.
    #[must_use]
    pub fn from_spans(spans: Vec<Span>) -> Option<Self> {
        let trace_id = spans.first()?.trace_id;
        let root_span_index = spans.iter().position(Span::is_root);

        Some(Self {
            trace_id,
            spans,
            root_span_index,
        })
    }

    /// Returns the root span if it exists.
    #[must_use]
    pub fn root_span(&self) -> Option<&Span> {
        self.root_span_index.map(|i| &self.spans[i])
    }

    /// Returns the total duration of the trace (from earliest start to latest end).
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let start = self.spans.iter().map(|s| s.start_time).min()?;
        let end = self.spans.iter().map(|s| s.end_time).max()?;

        Some(end - start)
    }

    /// Returns the number of spans in this trace.
    #[must_use]
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Finds a span by id.
    #[must_use]
    pub fn span(&self, span_id: SpanId) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    /// Spans whose parent has not been observed in this trace.
    #[must_use]
    pub fn orphans(&self) -> Vec<&Span> {
        let known: HashSet<SpanId> = self.spans.iter().map(|s| s.span_id).collect();
        self.spans
            .iter()
            .filter(|s| s.parent_span_id.is_some_and(|p| !known.contains(&p)))
            .collect()
    }

    /// Returns all services involved in this trace.
    #[must_use]
    pub fn services(&self) -> Vec<&str> {
        let mut services: Vec<&str> = self.spans.iter().map(|s| s.resource.service_name()).collect();
        services.sort_unstable();
        services.dedup();
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_id() -> TraceId {
        TraceId::from_bytes([0xaa; 16]).unwrap()
    }

    fn span_id(n: u8) -> SpanId {
        SpanId::from_bytes([n; 8]).unwrap()
    }

    fn resource(service: &str) -> Arc<Resource> {
        Resource::for_service(service).shared()
    }

    #[test]
    fn test_span_new() {
        let span = Span::new(trace_id(), span_id(1), "GET /api", resource("api-service"));

        assert_eq!(span.name, "GET /api");
        assert_eq!(span.resource.service_name(), "api-service");
        assert!(span.is_root());
        assert_eq!(span.status, SpanStatus::Unset);
    }

    #[test]
    fn test_span_with_parent() {
        let span = Span::new(trace_id(), span_id(2), "DB query", resource("db")).with_parent(span_id(1));

        assert!(!span.is_root());
        assert_eq!(span.parent_span_id, Some(span_id(1)));
    }

    #[test]
    fn test_span_with_attributes() {
        let span = Span::new(trace_id(), span_id(1), "HTTP request", resource("api"))
            .with_attribute("http.method", "GET")
            .with_attribute("http.status_code", 200)
            .with_attribute("success", true);

        assert_eq!(span.attributes.len(), 3);
        assert_eq!(span.attributes.get_str("http.method"), Some("GET"));
    }

    #[test]
    fn test_span_duration() {
        let start = Utc::now();
        let end = start + Duration::milliseconds(40);

        let span = Span::new(trace_id(), span_id(1), "operation", resource("svc")).with_times(start, end);

        assert_eq!(span.duration_ms(), 40);
    }

    #[test]
    fn test_span_validation_success() {
        let span = Span::new(trace_id(), span_id(1), "operation", resource("svc"));
        assert!(span.validate_span().is_ok());
    }

    #[test]
    fn test_span_validation_empty_name() {
        let span = Span::new(trace_id(), span_id(1), "", resource("svc"));
        assert_eq!(span.validate_span(), Err(SpanValidationError::EmptyName));
    }

    #[test]
    fn test_span_validation_self_parent() {
        let span = Span::new(trace_id(), span_id(1), "op", resource("svc")).with_parent(span_id(1));
        assert_eq!(span.validate_span(), Err(SpanValidationError::SelfParent));
    }

    #[test]
    fn test_span_validation_invalid_time_range() {
        let start = Utc::now();
        let end = start - Duration::seconds(1);

        let span = Span::new(trace_id(), span_id(1), "operation", resource("svc")).with_times(start, end);

        assert_eq!(span.validate_span(), Err(SpanValidationError::InvalidTimeRange));
    }

    #[test]
    fn test_trace_from_spans() {
        let root = Span::new(trace_id(), span_id(1), "root", resource("api"));
        let child = Span::new(trace_id(), span_id(2), "child", resource("db")).with_parent(span_id(1));

        let trace = Trace::from_spans(vec![root, child]).unwrap();

        assert_eq!(trace.trace_id, trace_id());
        assert_eq!(trace.span_count(), 2);
        assert!(trace.root_span().is_some());
        assert!(trace.orphans().is_empty());
    }

    #[test]
    fn test_trace_reports_orphans() {
        let child = Span::new(trace_id(), span_id(2), "child", resource("db")).with_parent(span_id(9));
        let trace = Trace::from_spans(vec![child]).unwrap();

        assert!(trace.root_span().is_none());
        assert_eq!(trace.orphans().len(), 1);
    }

    #[test]
    fn test_trace_services() {
        let spans = vec![
            Span::new(trace_id(), span_id(1), "op1", resource("api")),
            Span::new(trace_id(), span_id(2), "op2", resource("db")),
            Span::new(trace_id(), span_id(3), "op3", resource("api")),
        ];

        let trace = Trace::from_spans(spans).unwrap();
        assert_eq!(trace.services(), vec!["api", "db"]);
    }

    #[test]
    fn test_estimated_size_grows_with_attributes() {
        let small = Span::new(trace_id(), span_id(1), "op", resource("api"));
        let large = small.clone().with_attribute("payload", "x".repeat(1024));
        assert!(large.estimated_size() > small.estimated_size() + 1000);
    }

    #[test]
    fn test_span_status_display() {
        assert_eq!(SpanStatus::Unset.to_string(), "unset");
        assert_eq!(SpanStatus::Ok.to_string(), "ok");
        assert_eq!(SpanStatus::Error.to_string(), "error");
    }
}
