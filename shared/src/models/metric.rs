//! Metric data model.
//!
//! Defines the `MetricPoint` record carried by the metrics pipeline and the
//! [`SeriesGuard`] that enforces per-series invariants across batches.

use super::ids::{SpanId, TraceId};
use super::resource::{AttributeValue, Attributes, Resource};
use super::signal::{Record, SignalType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// A cumulative value that only increases within a producer session.
    Counter,
    /// A value that can go up or down.
    Gauge,
    /// A distribution over fixed buckets.
    Histogram,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Gauge => write!(f, "gauge"),
            Self::Histogram => write!(f, "histogram"),
        }
    }
}

/// Histogram data for distribution metrics.
///
/// `bucket_counts[i]` counts observations `<= bounds[i]` and greater than the
/// previous bound; the last count is the overflow bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramData {
    /// Upper bucket bounds, strictly increasing.
    pub bounds: Vec<f64>,
    /// Per-bucket (non-cumulative) counts, one more than `bounds`.
    pub bucket_counts: Vec<u64>,
    /// The sum of all observed values.
    pub sum: f64,
    /// The total count of observations.
    pub count: u64,
}

impl HistogramData {
    /// Cumulative counts per bound, followed by the `+Inf` total.
    #[must_use]
    pub fn cumulative_counts(&self) -> Vec<u64> {
        self.bucket_counts
            .iter()
            .scan(0u64, |acc, c| {
                *acc += c;
                Some(*acc)
            })
            .collect()
    }
}

/// The value of a metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// A numeric value, for counters and gauges.
    Number(f64),
    /// Bucket data, for histograms.
    Histogram(HistogramData),
}

impl MetricValue {
    /// Returns the number if this is a numeric value.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Histogram(_) => None,
        }
    }

    /// Returns the histogram data if this is a histogram value.
    #[must_use]
    pub fn as_histogram(&self) -> Option<&HistogramData> {
        match self {
            Self::Number(_) => None,
            Self::Histogram(h) => Some(h),
        }
    }
}

/// A sampled reference from an aggregate to a trace that contributed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    /// Trace of the sampled measurement.
    pub trace_id: TraceId,
    /// Span of the sampled measurement.
    pub span_id: SpanId,
    /// When the measurement was taken.
    pub timestamp: DateTime<Utc>,
    /// The measured value.
    pub value: f64,
}

/// One timestamped measurement of a named series.
///
/// # Example
///
/// ```
/// use shared::models::{MetricPoint, Resource};
///
/// let point = MetricPoint::counter("requests_total", 1.0, Resource::for_service("api").shared())
///     .with_attribute("method", "GET");
///
/// assert!(point.validate_point().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    /// Metric name.
    pub name: String,
    /// Metric kind.
    pub kind: MetricKind,
    /// The measured value.
    pub value: MetricValue,
    /// Series attributes.
    pub attributes: Attributes,
    /// When the point was recorded.
    pub timestamp: DateTime<Utc>,
    /// Start of the accumulation window for cumulative points.
    pub start_time: Option<DateTime<Utc>>,
    /// Unit, as sent by the producer.
    pub unit: String,
    /// Human description.
    pub description: String,
    /// Trace references attached to this point.
    pub exemplars: Vec<Exemplar>,
    /// The producer resource.
    pub resource: Arc<Resource>,
}

/// Errors that can occur during metric validation.
#[derive(Debug, Error, PartialEq)]
pub enum MetricValidationError {
    /// The metric name is empty.
    #[error("Metric name cannot be empty")]
    EmptyName,

    /// A numeric value is NaN or infinite.
    #[error("Metric value must be finite")]
    NonFiniteValue,

    /// The value shape does not match the kind.
    #[error("Metric kind {kind} does not match its value")]
    KindMismatch {
        /// Declared kind.
        kind: MetricKind,
    },

    /// Counters cannot be negative.
    #[error("Counter value cannot be negative: {0}")]
    NegativeCounter(f64),

    /// Bucket counts must be one longer than bounds.
    #[error("Histogram has {bounds} bounds but {counts} bucket counts")]
    BucketMismatch {
        /// Number of bounds.
        bounds: usize,
        /// Number of bucket counts.
        counts: usize,
    },

    /// Bounds must be finite and strictly increasing.
    #[error("Histogram bounds must be finite and strictly increasing")]
    UnsortedBounds,

    /// A counter series went backwards within one producer session.
    #[error("Counter {name} decreased from {previous} to {current}")]
    CounterDecreased {
        /// Metric name.
        name: String,
        /// Last accepted value.
        previous: f64,
        /// Rejected value.
        current: f64,
    },

    /// Histogram bounds changed for a metric name.
    #[error("Histogram {name} changed its bucket bounds")]
    BoundsChanged {
        /// Metric name.
        name: String,
    },
}

impl MetricPoint {
    /// Creates a point with the given kind and value.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: MetricKind,
        value: MetricValue,
        resource: Arc<Resource>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            attributes: Attributes::new(),
            timestamp: Utc::now(),
            start_time: None,
            unit: String::new(),
            description: String::new(),
            exemplars: Vec::new(),
            resource,
        }
    }

    /// Creates a counter point.
    #[must_use]
    pub fn counter(name: impl Into<String>, value: f64, resource: Arc<Resource>) -> Self {
        Self::new(name, MetricKind::Counter, MetricValue::Number(value), resource)
    }

    /// Creates a gauge point.
    #[must_use]
    pub fn gauge(name: impl Into<String>, value: f64, resource: Arc<Resource>) -> Self {
        Self::new(name, MetricKind::Gauge, MetricValue::Number(value), resource)
    }

    /// Creates a histogram point.
    #[must_use]
    pub fn histogram(name: impl Into<String>, data: HistogramData, resource: Arc<Resource>) -> Self {
        Self::new(name, MetricKind::Histogram, MetricValue::Histogram(data), resource)
    }

    /// Adds a series attribute.
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

    /// Sets the accumulation start time.
    #[must_use]
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Attaches an exemplar.
    #[must_use]
    pub fn with_exemplar(mut self, exemplar: Exemplar) -> Self {
        self.exemplars.push(exemplar);
        self
    }

    /// Sets the unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Validates the shape of the point on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, a value is not finite, the value
    /// does not fit the kind, a counter is negative, or histogram buckets are
    /// malformed.
    pub fn validate_point(&self) -> Result<(), MetricValidationError> {
        if self.name.is_empty() {
            return Err(MetricValidationError::EmptyName);
        }
        match (&self.value, self.kind) {
            (MetricValue::Number(v), MetricKind::Counter | MetricKind::Gauge) => {
                if !v.is_finite() {
                    return Err(MetricValidationError::NonFiniteValue);
                }
                if self.kind == MetricKind::Counter && *v < 0.0 {
                    return Err(MetricValidationError::NegativeCounter(*v));
                }
            }
            (MetricValue::Histogram(h), MetricKind::Histogram) => {
                if h.bucket_counts.len() != h.bounds.len() + 1 {
                    return Err(MetricValidationError::BucketMismatch {
                        bounds: h.bounds.len(),
                        counts: h.bucket_counts.len(),
                    });
                }
                let ordered = h.bounds.iter().all(|b| b.is_finite())
                    && h.bounds.windows(2).all(|w| w[0] < w[1]);
                if !ordered {
                    return Err(MetricValidationError::UnsortedBounds);
                }
                if !h.sum.is_finite() {
                    return Err(MetricValidationError::NonFiniteValue);
                }
            }
            (_, kind) => return Err(MetricValidationError::KindMismatch { kind }),
        }
        Ok(())
    }

    /// Identity of the series this point belongs to.
    #[must_use]
    pub fn series_key(&self) -> SeriesKey {
        let mut attributes: Vec<(String, String)> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        attributes.sort();
        SeriesKey {
            producer: self.resource.identity(),
            name: self.name.clone(),
            attributes,
        }
    }
}

impl Record for MetricPoint {
    const SIGNAL: SignalType = SignalType::Metrics;

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
        let value = match &self.value {
            MetricValue::Number(_) => 0,
            MetricValue::Histogram(h) => (h.bounds.len() + h.bucket_counts.len()) * 8,
        };
        std::mem::size_of::<Self>()
            + self.name.len()
            + self.unit.len()
            + self.description.len()
            + self.attributes.estimated_size()
            + self.exemplars.len() * std::mem::size_of::<Exemplar>()
            + value
    }
}

/// Identity of a metric series: producer session, name and sorted attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    /// `service.name` plus `service.instance.id` of the producer.
    pub producer: String,
    /// Metric name.
    pub name: String,
    /// Attributes rendered as text, sorted by key.
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
struct CounterState {
    start_time: Option<DateTime<Utc>>,
    value: f64,
}

/// Tracks counters and histogram layouts across batches.
///
/// Counter values are checked per series within a producer session; a point
/// whose start time is later than the tracked one starts a new session.
/// Histogram bounds are fixed per metric name for the lifetime of the guard.
/// When `max_series` series are tracked, new series pass unchecked.
#[derive(Debug)]
pub struct SeriesGuard {
    counters: HashMap<SeriesKey, CounterState>,
    bounds: HashMap<String, Vec<f64>>,
    max_series: usize,
}

impl SeriesGuard {
    /// Creates a guard tracking at most `max_series` counter series.
    #[must_use]
    pub fn new(max_series: usize) -> Self {
        Self {
            counters: HashMap::new(),
            bounds: HashMap::new(),
            max_series,
        }
    }

    /// Number of tracked counter series.
    #[must_use]
    pub fn tracked_series(&self) -> usize {
        self.counters.len()
    }

    /// Checks a point against earlier points and records it when accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if a counter decreased within its session or a
    /// histogram changed its bounds.
    pub fn check(&mut self, point: &MetricPoint) -> Result<(), MetricValidationError> {
        match (&point.value, point.kind) {
            (MetricValue::Number(value), MetricKind::Counter) => self.check_counter(point, *value),
            (MetricValue::Histogram(h), MetricKind::Histogram) => {
                match self.bounds.get(&point.name) {
                    Some(known) if known != &h.bounds => Err(MetricValidationError::BoundsChanged {
                        name: point.name.clone(),
                    }),
                    Some(_) => Ok(()),
                    None => {
                        self.bounds.insert(point.name.clone(), h.bounds.clone());
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn check_counter(&mut self, point: &MetricPoint, value: f64) -> Result<(), MetricValidationError> {
        let key = point.series_key();
        let next = CounterState {
            start_time: point.start_time,
            value,
        };
        let room = self.counters.len() < self.max_series;
        match self.counters.get_mut(&key) {
            Some(state) => {
                let new_session = match (state.start_time, point.start_time) {
                    (Some(known), Some(start)) => start > known,
                    _ => false,
                };
                if !new_session && value < state.value {
                    return Err(MetricValidationError::CounterDecreased {
                        name: point.name.clone(),
                        previous: state.value,
                        current: value,
                    });
                }
                *state = next;
            }
            None if room => {
                self.counters.insert(key, next);
                if self.counters.len() == self.max_series {
                    tracing::warn!(
                        max_series = self.max_series,
                        "Series tracker is full; new counter series are no longer checked"
                    );
                }
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resource::SERVICE_INSTANCE_ID;
    use chrono::Duration;

    fn resource() -> Arc<Resource> {
        Resource::for_service("api").shared()
    }

    fn histogram(bounds: Vec<f64>, counts: Vec<u64>) -> HistogramData {
        let count = counts.iter().sum();
        HistogramData {
            bounds,
            bucket_counts: counts,
            sum: 1.0,
            count,
        }
    }

    #[test]
    fn test_counter_validation() {
        assert!(MetricPoint::counter("requests_total", 1.0, resource())
            .validate_point()
            .is_ok());
        assert_eq!(
            MetricPoint::counter("requests_total", -1.0, resource()).validate_point(),
            Err(MetricValidationError::NegativeCounter(-1.0))
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        assert_eq!(
            MetricPoint::gauge("", 1.0, resource()).validate_point(),
            Err(MetricValidationError::EmptyName)
        );
    }

    #[test]
    fn test_non_finite_rejected() {
        assert_eq!(
            MetricPoint::gauge("temp", f64::NAN, resource()).validate_point(),
            Err(MetricValidationError::NonFiniteValue)
        );
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let point = MetricPoint::new(
            "latency",
            MetricKind::Histogram,
            MetricValue::Number(1.0),
            resource(),
        );
        assert_eq!(
            point.validate_point(),
            Err(MetricValidationError::KindMismatch {
                kind: MetricKind::Histogram
            })
        );
    }

    #[test]
    fn test_histogram_bucket_mismatch() {
        let point = MetricPoint::histogram("latency", histogram(vec![0.1, 0.5], vec![1, 2]), resource());
        assert_eq!(
            point.validate_point(),
            Err(MetricValidationError::BucketMismatch { bounds: 2, counts: 2 })
        );
    }

    #[test]
    fn test_histogram_unsorted_bounds() {
        let point = MetricPoint::histogram("latency", histogram(vec![0.5, 0.1], vec![1, 2, 3]), resource());
        assert_eq!(point.validate_point(), Err(MetricValidationError::UnsortedBounds));
    }

    #[test]
    fn test_cumulative_counts() {
        let h = histogram(vec![0.1, 0.5], vec![1, 2, 3]);
        assert_eq!(h.cumulative_counts(), vec![1, 3, 6]);
    }

    #[test]
    fn test_series_key_ignores_attribute_order() {
        let a = MetricPoint::counter("c", 1.0, resource())
            .with_attribute("x", "1")
            .with_attribute("y", "2");
        let b = MetricPoint::counter("c", 1.0, resource())
            .with_attribute("y", "2")
            .with_attribute("x", "1");
        assert_eq!(a.series_key(), b.series_key());
    }

    #[test]
    fn test_guard_rejects_decreasing_counter() {
        let mut guard = SeriesGuard::new(100);
        guard.check(&MetricPoint::counter("c", 5.0, resource())).unwrap();
        guard.check(&MetricPoint::counter("c", 7.0, resource())).unwrap();
        let err = guard.check(&MetricPoint::counter("c", 6.0, resource())).unwrap_err();
        assert!(matches!(err, MetricValidationError::CounterDecreased { .. }));
    }

    #[test]
    fn test_guard_separates_series_by_attributes() {
        let mut guard = SeriesGuard::new(100);
        guard
            .check(&MetricPoint::counter("c", 5.0, resource()).with_attribute("route", "/a"))
            .unwrap();
        guard
            .check(&MetricPoint::counter("c", 1.0, resource()).with_attribute("route", "/b"))
            .unwrap();
        assert_eq!(guard.tracked_series(), 2);
    }

    #[test]
    fn test_guard_new_instance_is_new_session() {
        let mut guard = SeriesGuard::new(100);
        let first = Resource::for_service("api").with_attribute(SERVICE_INSTANCE_ID, "a").shared();
        let restarted = Resource::for_service("api").with_attribute(SERVICE_INSTANCE_ID, "b").shared();
        guard.check(&MetricPoint::counter("c", 10.0, first)).unwrap();
        guard.check(&MetricPoint::counter("c", 1.0, restarted)).unwrap();
    }

    #[test]
    fn test_guard_later_start_time_resets_session() {
        let mut guard = SeriesGuard::new(100);
        let start = Utc::now();
        guard
            .check(&MetricPoint::counter("c", 10.0, resource()).with_start_time(start))
            .unwrap();
        guard
            .check(&MetricPoint::counter("c", 1.0, resource()).with_start_time(start + Duration::seconds(30)))
            .unwrap();
    }

    #[test]
    fn test_guard_fixes_histogram_bounds_per_name() {
        let mut guard = SeriesGuard::new(100);
        guard
            .check(&MetricPoint::histogram("latency", histogram(vec![0.1], vec![1, 1]), resource()))
            .unwrap();
        let err = guard
            .check(&MetricPoint::histogram("latency", histogram(vec![0.2], vec![1, 1]), resource()))
            .unwrap_err();
        assert_eq!(
            err,
            MetricValidationError::BoundsChanged {
                name: "latency".to_string()
            }
        );
    }

    #[test]
    fn test_guard_stops_tracking_at_capacity() {
        let mut guard = SeriesGuard::new(1);
        guard
            .check(&MetricPoint::counter("a", 5.0, resource()))
            .unwrap();
        guard
            .check(&MetricPoint::counter("b", 5.0, resource()))
            .unwrap();
        guard
            .check(&MetricPoint::counter("b", 1.0, resource()))
            .unwrap();
        assert_eq!(guard.tracked_series(), 1);
    }

    #[test]
    fn test_guard_keeps_checking_tracked_series_when_full() {
        let mut guard = SeriesGuard::new(1);
        guard
            .check(&MetricPoint::counter("a", 5.0, resource()))
            .unwrap();
        guard
            .check(&MetricPoint::counter("a", 7.0, resource()))
            .unwrap();
        assert!(guard
            .check(&MetricPoint::counter("a", 6.0, resource()))
            .is_err());
        assert_eq!(guard.tracked_series(), 1);
    }
}
