//! Trace store read and write API.
//!
//! Provides the `TraceStore` trait the trace destination is consumed through
//! and an `InMemoryTraceStore` implementation for development and testing.
//! Spans are keyed by trace id; lookups return whole traces and tag searches
//! return matching trace ids.

use crate::models::{AttributeValue, Span, SpanStatus, Trace, TraceId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors that can occur during trace store operations.
#[derive(Debug, Error)]
pub enum TraceStoreError {
    /// Failed to acquire lock on the store.
    #[error("Failed to acquire lock on trace store")]
    LockError,

    /// Trace not found.
    #[error("Trace not found: {0}")]
    NotFound(TraceId),
}

/// Search over stored traces.
///
/// Every set filter must hold for a trace to match. Tag filters are matched
/// against a single span, so `(a, 1)` and `(b, 2)` only match a trace in
/// which one span carries both.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    /// Some span's resource has this `service.name`.
    pub service: Option<String>,
    /// Some span starts at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Some span starts before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Trace duration lower bound.
    pub min_duration: Option<Duration>,
    /// Trace duration upper bound.
    pub max_duration: Option<Duration>,
    /// Some span ends with this status.
    pub status: Option<SpanStatus>,
    /// Tags, looked up in span attributes first and resource attributes second.
    pub tags: Vec<(String, AttributeValue)>,
    /// Cap on returned traces; `total_count` is unaffected.
    pub limit: Option<usize>,
}

impl TraceQuery {
    /// Matches every trace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by service name.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Restricts to traces with a span starting in `[since, until)`.
    #[must_use]
    pub fn within(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    /// Keeps traces lasting at least `duration`.
    #[must_use]
    pub fn slower_than(mut self, duration: Duration) -> Self {
        self.min_duration = Some(duration);
        self
    }

    /// Keeps traces lasting at most `duration`.
    #[must_use]
    pub fn faster_than(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Filters by span status.
    #[must_use]
    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds a tag filter.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Caps the number of returned traces.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn carries_tags(&self, span: &Span) -> bool {
        self.tags.iter().all(|(key, value)| {
            span.attributes
                .get(key)
                .or_else(|| span.resource.attributes().get(key))
                == Some(value)
        })
    }

    fn span_filter(&self, span: &Span) -> bool {
        self.service
            .as_deref()
            .is_none_or(|service| span.resource.service_name() == service)
            && self.since.is_none_or(|since| span.start_time >= since)
            && self.until.is_none_or(|until| span.start_time < until)
    }

    fn matches(&self, trace: &Trace) -> bool {
        let within_bounds = trace.duration().is_none_or(|duration| {
            self.min_duration.is_none_or(|min| duration >= min)
                && self.max_duration.is_none_or(|max| duration <= max)
        });
        within_bounds
            && trace.spans.iter().any(|s| self.span_filter(s))
            && self
                .status
                .is_none_or(|status| trace.spans.iter().any(|s| s.status == status))
            && (self.tags.is_empty() || trace.spans.iter().any(|s| self.carries_tags(s)))
    }
}

/// Matching traces, most recent first.
#[derive(Debug, Clone)]
pub struct TraceQueryResult {
    /// The page of matches.
    pub traces: Vec<Trace>,
    /// Matches before `limit` was applied.
    pub total_count: usize,
}

/// Trait for trace storage implementations.
///
/// Implementations must be thread-safe (Send + Sync).
pub trait TraceStore: Send + Sync {
    /// Inserts spans, grouped by `trace_id`.
    ///
    /// A span whose id is already stored for its trace replaces the stored
    /// copy, so a redelivered batch does not duplicate spans.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn insert_spans(&self, spans: Vec<Span>) -> Result<(), TraceStoreError>;

    /// Retrieves a trace by its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the trace is not found or the operation fails.
    fn get_trace(&self, trace_id: TraceId) -> Result<Trace, TraceStoreError>;

    /// Runs a search.
    ///
    /// # Errors
    ///
    /// Returns an error if the query operation fails.
    fn query(&self, query: TraceQuery) -> Result<TraceQueryResult, TraceStoreError>;

    /// Ids of the traces matching a query, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query operation fails.
    fn find_trace_ids(&self, query: TraceQuery) -> Result<Vec<TraceId>, TraceStoreError> {
        Ok(self
            .query(query)?
            .traces
            .into_iter()
            .map(|t| t.trace_id)
            .collect())
    }

    /// Returns the total number of spans in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the count operation fails.
    fn span_count(&self) -> Result<usize, TraceStoreError>;

    /// Returns the number of unique traces in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the count operation fails.
    fn trace_count(&self) -> Result<usize, TraceStoreError>;

    /// Clears all traces from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the clear operation fails.
    fn clear(&self) -> Result<(), TraceStoreError>;
}

/// In-memory trace store implementation.
#[derive(Debug, Default)]
pub struct InMemoryTraceStore {
    spans: Arc<RwLock<HashMap<TraceId, Vec<Span>>>>,
}

impl InMemoryTraceStore {
    /// Creates a new empty in-memory trace store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory trace store wrapped in an Arc.
    #[must_use]
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl TraceStore for InMemoryTraceStore {
    fn insert_spans(&self, new_spans: Vec<Span>) -> Result<(), TraceStoreError> {
        let mut spans = self.spans.write().map_err(|_| TraceStoreError::LockError)?;
        for span in new_spans {
            let stored = spans.entry(span.trace_id).or_default();
            match stored.iter_mut().find(|s| s.span_id == span.span_id) {
                Some(existing) => *existing = span,
                None => stored.push(span),
            }
        }
        Ok(())
    }

    fn get_trace(&self, trace_id: TraceId) -> Result<Trace, TraceStoreError> {
        let spans = self.spans.read().map_err(|_| TraceStoreError::LockError)?;
        spans
            .get(&trace_id)
            .and_then(|s| Trace::from_spans(s.clone()))
            .ok_or(TraceStoreError::NotFound(trace_id))
    }

    fn query(&self, query: TraceQuery) -> Result<TraceQueryResult, TraceStoreError> {
        let spans = self.spans.read().map_err(|_| TraceStoreError::LockError)?;

        let mut traces: Vec<(Option<DateTime<Utc>>, Trace)> = spans
            .values()
            .filter_map(|s| Trace::from_spans(s.clone()))
            .filter(|trace| query.matches(trace))
            .map(|trace| (trace.spans.iter().map(|s| s.start_time).min(), trace))
            .collect();
        traces.sort_by(|(a, _), (b, _)| b.cmp(a));

        let total_count = traces.len();
        traces.truncate(query.limit.unwrap_or(total_count));
        Ok(TraceQueryResult {
            traces: traces.into_iter().map(|(_, trace)| trace).collect(),
            total_count,
        })
    }

    fn span_count(&self) -> Result<usize, TraceStoreError> {
        let spans = self.spans.read().map_err(|_| TraceStoreError::LockError)?;
        Ok(spans.values().map(Vec::len).sum())
    }

    fn trace_count(&self) -> Result<usize, TraceStoreError> {
        let spans = self.spans.read().map_err(|_| TraceStoreError::LockError)?;
        Ok(spans.len())
    }

    fn clear(&self) -> Result<(), TraceStoreError> {
        self.spans
            .write()
            .map_err(|_| TraceStoreError::LockError)?
            .clear();
        Ok(())
    }
}
