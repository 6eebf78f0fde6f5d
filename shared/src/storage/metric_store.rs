//! Metric store read and write API.
//!
//! Provides the `MetricStore` trait the metrics destination is consumed
//! through and an `InMemoryMetricStore` implementation for development and
//! testing. Supports range queries and histogram quantiles over bucket data.

use crate::models::{AttributeValue, MetricPoint, MetricValue, SeriesKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors that can occur during metric store operations.
#[derive(Debug, Error)]
pub enum MetricStoreError {
    /// Failed to acquire lock on the store.
    #[error("Failed to acquire lock on metric store")]
    LockError,

    /// Histograms of one metric disagree on their bucket bounds.
    #[error("Histogram bounds differ between series of {0}")]
    IncompatibleBuckets(String),
}

/// Range query over one metric.
#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    /// Metric name (exact match).
    pub name: Option<String>,

    /// Filter by resource service name.
    pub service: Option<String>,

    /// Point attributes that must match.
    pub attributes: Vec<(String, AttributeValue)>,

    /// Filter points starting from this time (inclusive).
    pub start_time: Option<DateTime<Utc>>,

    /// Filter points up to this time (exclusive).
    pub end_time: Option<DateTime<Utc>>,

    /// Maximum number of points to return.
    pub limit: Option<usize>,
}

impl MetricQuery {
    /// Creates a query for one metric name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Sets the service filter.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Adds an attribute filter.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Sets the time range `[start, end)`.
    #[must_use]
    pub fn with_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    /// Sets the maximum number of results.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, point: &MetricPoint) -> bool {
        if self.name.as_ref().is_some_and(|n| &point.name != n) {
            return false;
        }
        if let Some(ref service) = self.service {
            if point.resource.service_name() != service {
                return false;
            }
        }
        if self.start_time.is_some_and(|start| point.timestamp < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| point.timestamp >= end) {
            return false;
        }
        self.attributes
            .iter()
            .all(|(key, value)| point.attributes.get(key) == Some(value))
    }
}

/// Result of a metric query operation.
#[derive(Debug, Clone)]
pub struct MetricQueryResult {
    /// Matching points in timestamp order.
    pub points: Vec<MetricPoint>,

    /// Total count of matching points (before limit applied).
    pub total_count: usize,
}

/// Estimates a quantile from cumulative bucket counts, interpolating linearly
/// inside the bucket the rank falls into.
///
/// `cumulative_counts` has one entry per bound plus a final `+Inf` bucket.
/// Returns `None` for an empty histogram, a quantile outside `[0, 1]`, or
/// when there are no finite bounds. A rank landing in the `+Inf` bucket
/// yields the highest finite bound.
///
/// # Examples
///
/// ```
/// use shared::storage::histogram_quantile;
///
/// // 10 observations in (0, 1], 10 in (1, 2].
/// let q = histogram_quantile(0.75, &[1.0, 2.0], &[10, 20, 20]).unwrap();
/// assert!((q - 1.5).abs() < 1e-9);
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn histogram_quantile(quantile: f64, bounds: &[f64], cumulative_counts: &[u64]) -> Option<f64> {
    if !(0.0..=1.0).contains(&quantile) || bounds.is_empty() {
        return None;
    }
    if cumulative_counts.len() != bounds.len() + 1 {
        return None;
    }
    let total = *cumulative_counts.last()? as f64;
    if total == 0.0 {
        return None;
    }

    let rank = quantile * total;
    let index = cumulative_counts
        .iter()
        .position(|&count| count as f64 >= rank)?;

    if index == bounds.len() {
        return bounds.last().copied();
    }
    let upper = bounds[index];
    let (lower, below) = if index == 0 {
        if upper <= 0.0 {
            return Some(upper);
        }
        (0.0, 0.0)
    } else {
        (bounds[index - 1], cumulative_counts[index - 1] as f64)
    };

    let in_bucket = cumulative_counts[index] as f64 - below;
    if in_bucket == 0.0 {
        return Some(upper);
    }
    Some(lower + (upper - lower) * ((rank - below) / in_bucket))
}

/// Trait for metric storage implementations.
///
/// Implementations must be thread-safe (Send + Sync).
pub trait MetricStore: Send + Sync {
    /// Inserts multiple points into the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn insert_batch(&self, points: Vec<MetricPoint>) -> Result<(), MetricStoreError>;

    /// Points matching a range query, in timestamp order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query operation fails.
    fn query(&self, query: MetricQuery) -> Result<MetricQueryResult, MetricStoreError>;

    /// Quantile over the histogram series matching a query.
    ///
    /// The latest point of every matching series is taken and their buckets
    /// are summed before interpolating, like `histogram_quantile(q, sum by (le) (...))`.
    ///
    /// # Errors
    ///
    /// Returns an error if the series disagree on bucket bounds.
    fn histogram_quantile(
        &self,
        quantile: f64,
        query: MetricQuery,
    ) -> Result<Option<f64>, MetricStoreError>;

    /// Returns the total number of points in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the count operation fails.
    fn count(&self) -> Result<usize, MetricStoreError>;

    /// Clears all points from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the clear operation fails.
    fn clear(&self) -> Result<(), MetricStoreError>;
}

/// In-memory metric store implementation.
///
/// # Example
///
/// ```
/// use shared::models::{MetricPoint, Resource};
/// use shared::storage::{InMemoryMetricStore, MetricQuery, MetricStore};
///
/// let store = InMemoryMetricStore::new();
/// let resource = Resource::for_service("api").shared();
/// store
///     .insert_batch(vec![MetricPoint::counter("requests_total", 1.0, resource)])
///     .unwrap();
///
/// let result = store.query(MetricQuery::new("requests_total")).unwrap();
/// assert_eq!(result.points.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryMetricStore {
    points: Arc<RwLock<Vec<MetricPoint>>>,
}

impl InMemoryMetricStore {
    /// Creates a new empty in-memory metric store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            points: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Creates a new in-memory metric store wrapped in an Arc.
    #[must_use]
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl MetricStore for InMemoryMetricStore {
    fn insert_batch(&self, new_points: Vec<MetricPoint>) -> Result<(), MetricStoreError> {
        let mut points = self.points.write().map_err(|_| MetricStoreError::LockError)?;
        points.extend(new_points);
        Ok(())
    }

    fn query(&self, query: MetricQuery) -> Result<MetricQueryResult, MetricStoreError> {
        let points = self.points.read().map_err(|_| MetricStoreError::LockError)?;

        let mut filtered: Vec<MetricPoint> =
            points.iter().filter(|p| query.matches(p)).cloned().collect();
        filtered.sort_by_key(|p| p.timestamp);

        let total_count = filtered.len();
        filtered.truncate(query.limit.unwrap_or(usize::MAX));

        Ok(MetricQueryResult {
            points: filtered,
            total_count,
        })
    }

    fn histogram_quantile(
        &self,
        quantile: f64,
        query: MetricQuery,
    ) -> Result<Option<f64>, MetricStoreError> {
        let points = self.points.read().map_err(|_| MetricStoreError::LockError)?;

        let mut latest: HashMap<SeriesKey, &MetricPoint> = HashMap::new();
        for point in points.iter().filter(|p| query.matches(p)) {
            if !matches!(point.value, MetricValue::Histogram(_)) {
                continue;
            }
            let entry = latest.entry(point.series_key()).or_insert(point);
            if point.timestamp >= entry.timestamp {
                *entry = point;
            }
        }

        let mut bounds: Option<&[f64]> = None;
        let mut summed: Vec<u64> = Vec::new();
        for point in latest.values() {
            let Some(histogram) = point.value.as_histogram() else {
                continue;
            };
            match bounds {
                None => {
                    bounds = Some(histogram.bounds.as_slice());
                    summed = histogram.cumulative_counts();
                }
                Some(b) if b == histogram.bounds.as_slice() => {
                    for (total, count) in summed.iter_mut().zip(histogram.cumulative_counts()) {
                        *total += count;
                    }
                }
                Some(_) => return Err(MetricStoreError::IncompatibleBuckets(point.name.clone())),
            }
        }

        Ok(bounds.and_then(|b| histogram_quantile(quantile, b, &summed)))
    }

    fn count(&self) -> Result<usize, MetricStoreError> {
        let points = self.points.read().map_err(|_| MetricStoreError::LockError)?;
        Ok(points.len())
    }

    fn clear(&self) -> Result<(), MetricStoreError> {
        let mut points = self.points.write().map_err(|_| MetricStoreError::LockError)?;
        points.clear();
        Ok(())
    }
}
