//! Signal types and the behaviour every record shares.

use super::ids::{SpanId, TraceId};
use super::resource::{Attributes, Resource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The three independent signal pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    /// Distributed trace spans.
    Traces,
    /// Metric points.
    Metrics,
    /// Log records.
    Logs,
}

impl SignalType {
    /// All signal types in pipeline order.
    pub const ALL: [Self; 3] = [Self::Traces, Self::Metrics, Self::Logs];

    /// Lowercase name used in configuration, logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Traces => "traces",
            Self::Metrics => "metrics",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single telemetry record flowing through one pipeline.
pub trait Record: Clone + fmt::Debug + Send + Sync + 'static {
    /// The pipeline this record type travels through.
    const SIGNAL: SignalType;

    /// The producer resource.
    fn resource(&self) -> &Arc<Resource>;

    /// Replaces the producer resource.
    fn set_resource(&mut self, resource: Arc<Resource>);

    /// Record-level attributes.
    fn attributes(&self) -> &Attributes;

    /// Mutable record-level attributes.
    fn attributes_mut(&mut self) -> &mut Attributes;

    /// Index labels promoted for the destination, when the record type has any.
    fn index_labels_mut(&mut self) -> Option<&mut Vec<(String, String)>> {
        None
    }

    /// Approximate in-memory size, used by admission control.
    ///
    /// The shared resource is not counted since it is not owned by the record.
    fn estimated_size(&self) -> usize;
}

/// The (trace, span) pair used to navigate between signals.
///
/// A key only identifies; holding one never keeps a span alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    /// Trace the record belongs to.
    pub trace_id: TraceId,
    /// Span that was active when the record was produced.
    pub span_id: SpanId,
}

impl CorrelationKey {
    /// Creates a correlation key.
    #[must_use]
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trace_id, self.span_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_type_display() {
        assert_eq!(SignalType::Traces.to_string(), "traces");
        assert_eq!(SignalType::Metrics.to_string(), "metrics");
        assert_eq!(SignalType::Logs.to_string(), "logs");
    }

    #[test]
    fn test_signal_type_serde_lowercase() {
        let parsed: SignalType = serde_json::from_str("\"logs\"").unwrap();
        assert_eq!(parsed, SignalType::Logs);
    }
}
