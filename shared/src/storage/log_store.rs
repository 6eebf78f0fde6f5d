//! Log store read and write API.
//!
//! Provides the `LogStore` trait the log destination is consumed through and
//! an `InMemoryLogStore` implementation for development and testing. Queries
//! support label equality, body substring and regex search, and the
//! span-correlation lookup.

use crate::models::{LogRecord, Severity, SpanId, TraceId, SPAN_ID_ATTRIBUTE, TRACE_ID_ATTRIBUTE};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors that can occur during log store operations.
#[derive(Debug, Error)]
pub enum LogStoreError {
    /// Failed to acquire lock on the store.
    #[error("Failed to acquire lock on log store")]
    LockError,

    /// The body regex does not compile.
    #[error("Invalid body pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Query parameters for retrieving log records.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Filter records starting from this time (inclusive).
    pub start_time: Option<DateTime<Utc>>,

    /// Filter records up to this time (exclusive).
    pub end_time: Option<DateTime<Utc>>,

    /// Only records at or above this severity.
    pub min_severity: Option<Severity>,

    /// Filter by resource service name (exact match).
    pub service: Option<String>,

    /// Filter by trace id.
    pub trace_id: Option<TraceId>,

    /// Filter by span id.
    pub span_id: Option<SpanId>,

    /// Index labels that must all be present with these values.
    pub labels: Vec<(String, String)>,

    /// Case-insensitive substring the body must contain.
    pub body_contains: Option<String>,

    /// Regular expression the body must match.
    pub body_regex: Option<String>,

    /// Maximum number of records to return.
    pub limit: Option<usize>,

    /// Number of records to skip (for pagination).
    pub offset: Option<usize>,
}

impl LogQuery {
    /// Creates a new empty query (returns all records).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records emitted under one span.
    ///
    /// Trace ids do not identify a producer, so combine this with
    /// [`LogQuery::with_service`] to exclude other subsystems sharing the trace.
    ///
    /// # Example
    ///
    /// ```
    /// use shared::models::{SpanId, TraceId};
    /// use shared::storage::LogQuery;
    ///
    /// let trace_id = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap();
    /// let span_id = SpanId::from_hex("b7ad6b7169203331").unwrap();
    /// let query = LogQuery::for_span(trace_id, span_id).with_service("checkout");
    /// assert_eq!(query.service.as_deref(), Some("checkout"));
    /// ```
    #[must_use]
    pub fn for_span(trace_id: TraceId, span_id: SpanId) -> Self {
        Self {
            trace_id: Some(trace_id),
            span_id: Some(span_id),
            ..Self::default()
        }
    }

    /// Sets the start time filter.
    #[must_use]
    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Sets the end time filter.
    #[must_use]
    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Sets the maximum number of results.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset for pagination.
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Sets the minimum severity.
    #[must_use]
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Sets the service name filter (exact match).
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets the trace id filter.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Adds a label equality filter.
    #[must_use]
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((name.into(), value.into()));
        self
    }

    /// Sets the body substring filter (case-insensitive).
    #[must_use]
    pub fn with_body_contains(mut self, pattern: impl Into<String>) -> Self {
        self.body_contains = Some(pattern.into());
        self
    }

    /// Sets the body regex filter.
    #[must_use]
    pub fn with_body_regex(mut self, pattern: impl Into<String>) -> Self {
        self.body_regex = Some(pattern.into());
        self
    }
}

/// Result of a log query operation.
#[derive(Debug, Clone)]
pub struct LogQueryResult {
    /// The records matching the query.
    pub logs: Vec<LogRecord>,

    /// Total count of matching records (before limit/offset applied).
    pub total_count: usize,
}

/// Trait for log storage implementations.
///
/// Implementations must be thread-safe (Send + Sync).
pub trait LogStore: Send + Sync {
    /// Inserts multiple log records into the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn insert_batch(&self, records: Vec<LogRecord>) -> Result<(), LogStoreError>;

    /// Queries records based on the provided parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the body regex is invalid or the store is unavailable.
    fn query(&self, query: LogQuery) -> Result<LogQueryResult, LogStoreError>;

    /// Returns the total number of records in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the count operation fails.
    fn count(&self) -> Result<usize, LogStoreError>;

    /// Clears all records from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the clear operation fails.
    fn clear(&self) -> Result<(), LogStoreError>;
}

/// In-memory log store implementation.
///
/// Stores records in a `Vec` protected by a `RwLock`.
///
/// **Note:** Data is not persisted across restarts.
///
/// # Example
///
/// ```
/// use shared::models::{LogRecord, Resource, Severity};
/// use shared::storage::{InMemoryLogStore, LogQuery, LogStore};
///
/// let store = InMemoryLogStore::new();
/// let record = LogRecord::new(Severity::Info, "User logged in", Resource::for_service("auth").shared());
/// store.insert_batch(vec![record]).unwrap();
///
/// let result = store.query(LogQuery::new().with_service("auth")).unwrap();
/// assert_eq!(result.logs.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    logs: Arc<RwLock<Vec<LogRecord>>>,
}

impl InMemoryLogStore {
    /// Creates a new empty in-memory log store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            logs: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Creates a new in-memory log store wrapped in an Arc.
    #[must_use]
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

/// Trace context of a record, from the typed fields or, failing that, the
/// attributes the producer wrote.
fn record_trace_id(record: &LogRecord) -> Option<TraceId> {
    record.trace_id.or_else(|| {
        record
            .attributes
            .get_str(TRACE_ID_ATTRIBUTE)
            .and_then(|s| TraceId::from_hex(s).ok())
    })
}

fn record_span_id(record: &LogRecord) -> Option<SpanId> {
    record.span_id.or_else(|| {
        record
            .attributes
            .get_str(SPAN_ID_ATTRIBUTE)
            .and_then(|s| SpanId::from_hex(s).ok())
    })
}

impl LogStore for InMemoryLogStore {
    fn insert_batch(&self, records: Vec<LogRecord>) -> Result<(), LogStoreError> {
        let mut logs = self.logs.write().map_err(|_| LogStoreError::LockError)?;
        logs.extend(records);
        Ok(())
    }

    fn query(&self, query: LogQuery) -> Result<LogQueryResult, LogStoreError> {
        let body_regex = query.body_regex.as_deref().map(Regex::new).transpose()?;
        let body_pattern = query.body_contains.as_ref().map(|s| s.to_lowercase());

        let logs = self.logs.read().map_err(|_| LogStoreError::LockError)?;

        let filtered: Vec<LogRecord> = logs
            .iter()
            .filter(|log| {
                if let Some(start) = query.start_time {
                    if log.timestamp < start {
                        return false;
                    }
                }
                if let Some(end) = query.end_time {
                    if log.timestamp >= end {
                        return false;
                    }
                }
                if let Some(min) = query.min_severity {
                    if log.severity < min {
                        return false;
                    }
                }
                if let Some(ref service) = query.service {
                    if log.resource.service_name() != service {
                        return false;
                    }
                }
                if query.trace_id.is_some() && record_trace_id(log) != query.trace_id {
                    return false;
                }
                if query.span_id.is_some() && record_span_id(log) != query.span_id {
                    return false;
                }
                let labels_match = query
                    .labels
                    .iter()
                    .all(|wanted| log.index_labels.contains(wanted));
                if !labels_match {
                    return false;
                }
                if let Some(ref pattern) = body_pattern {
                    if !log.body.to_lowercase().contains(pattern) {
                        return false;
                    }
                }
                if let Some(ref regex) = body_regex {
                    if !regex.is_match(&log.body) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        let total_count = filtered.len();

        let offset = query.offset.unwrap_or(0);
        let result: Vec<LogRecord> = filtered
            .into_iter()
            .skip(offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(LogQueryResult {
            logs: result,
            total_count,
        })
    }

    fn count(&self) -> Result<usize, LogStoreError> {
        let logs = self.logs.read().map_err(|_| LogStoreError::LockError)?;
        Ok(logs.len())
    }

    fn clear(&self) -> Result<(), LogStoreError> {
        let mut logs = self.logs.write().map_err(|_| LogStoreError::LockError)?;
        logs.clear();
        Ok(())
    }
}
