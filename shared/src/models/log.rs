//! Log record data model.

use super::ids::{IdError, SpanId, TraceId};
use super::resource::{AttributeValue, Attributes, Resource};
use super::signal::{CorrelationKey, Record, SignalType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Attribute key some producers use to carry the active trace id.
pub const TRACE_ID_ATTRIBUTE: &str = "trace_id";
/// Attribute key some producers use to carry the active span id.
pub const SPAN_ID_ATTRIBUTE: &str = "span_id";

/// Log severity, bucketed from the OTLP severity number ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// No severity set.
    #[default]
    Unspecified,
    /// Trace-level.
    Trace,
    /// Debug-level.
    Debug,
    /// Informational.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
    /// Fatal.
    Fatal,
}

impl Severity {
    /// Maps an OTLP severity number to a severity bucket.
    #[must_use]
    pub fn from_number(number: i32) -> Self {
        match number {
            1..=4 => Self::Trace,
            5..=8 => Self::Debug,
            9..=12 => Self::Info,
            13..=16 => Self::Warn,
            17..=20 => Self::Error,
            21..=24 => Self::Fatal,
            _ => Self::Unspecified,
        }
    }

    /// The first OTLP severity number of this bucket.
    #[must_use]
    pub fn to_number(self) -> i32 {
        match self {
            Self::Unspecified => 0,
            Self::Trace => 1,
            Self::Debug => 5,
            Self::Info => 9,
            Self::Warn => 13,
            Self::Error => 17,
            Self::Fatal => 21,
        }
    }

    /// Lowercase name, as used for the `level` label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unknown",
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during log validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogValidationError {
    /// A trace id attribute is not a 128-bit hex id.
    #[error("invalid trace_id attribute: {0}")]
    InvalidTraceId(IdError),

    /// A span id attribute is not a 64-bit hex id.
    #[error("invalid span_id attribute: {0}")]
    InvalidSpanId(IdError),

    /// A trace id attribute disagrees with the record's trace context.
    #[error("trace_id attribute does not match the record trace context")]
    TraceIdMismatch,
}

/// One timestamped, attributed line of output.
///
/// # Example
///
/// ```
/// use shared::models::{LogRecord, Resource, Severity};
///
/// let mut record = LogRecord::new(Severity::Info, "user logged in", Resource::for_service("auth").shared())
///     .with_attribute("trace_id", "0af7651916cd43dd8448eb211c80319c")
///     .with_attribute("span_id", "b7ad6b7169203331");
///
/// record.normalize_trace_context().unwrap();
/// assert!(record.correlation_key().is_some());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Severity bucket.
    pub severity: Severity,
    /// Severity text as sent by the producer.
    pub severity_text: String,
    /// The log line.
    pub body: String,
    /// Record attributes.
    pub attributes: Attributes,
    /// Trace that was active when the record was produced.
    pub trace_id: Option<TraceId>,
    /// Span that was active when the record was produced.
    pub span_id: Option<SpanId>,
    /// Labels promoted to indexed fields at the log store.
    pub index_labels: Vec<(String, String)>,
    /// The producer resource.
    pub resource: Arc<Resource>,
}

impl LogRecord {
    /// Creates a log record stamped with the current time.
    #[must_use]
    pub fn new(severity: Severity, body: impl Into<String>, resource: Arc<Resource>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            severity_text: String::new(),
            body: body.into(),
            attributes: Attributes::new(),
            trace_id: None,
            span_id: None,
            index_labels: Vec::new(),
            resource,
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.upsert(key, value);
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the trace context.
    #[must_use]
    pub fn with_trace_context(mut self, trace_id: TraceId, span_id: SpanId) -> Self {
        self.trace_id = Some(trace_id);
        self.span_id = Some(span_id);
        self
    }

    /// Lifts trace context carried in `trace_id`/`span_id` attributes into the
    /// typed fields and checks its format.
    ///
    /// The attributes are left in place so downstream attribute searches keep
    /// matching.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute is not a valid id, or disagrees with
    /// trace context that was already set.
    pub fn normalize_trace_context(&mut self) -> Result<(), LogValidationError> {
        if let Some(text) = self.attributes.get_str(TRACE_ID_ATTRIBUTE) {
            let parsed = TraceId::from_hex(text).map_err(LogValidationError::InvalidTraceId)?;
            match self.trace_id {
                Some(existing) if existing != parsed => {
                    return Err(LogValidationError::TraceIdMismatch)
                }
                _ => self.trace_id = Some(parsed),
            }
        }
        if let Some(text) = self.attributes.get_str(SPAN_ID_ATTRIBUTE) {
            let parsed = SpanId::from_hex(text).map_err(LogValidationError::InvalidSpanId)?;
            if self.span_id.is_none() {
                self.span_id = Some(parsed);
            }
        }
        Ok(())
    }

    /// The span this record was emitted under, when both ids are known.
    #[must_use]
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        Some(CorrelationKey::new(self.trace_id?, self.span_id?))
    }
}

impl Record for LogRecord {
    const SIGNAL: SignalType = SignalType::Logs;

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

    fn index_labels_mut(&mut self) -> Option<&mut Vec<(String, String)>> {
        Some(&mut self.index_labels)
    }

    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.body.len()
            + self.severity_text.len()
            + self.attributes.estimated_size()
            + self
                .index_labels
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}
