//! Per-signal pipeline wiring.

use crate::models::SignalType;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Batch accumulator thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatchConfig {
    /// Records per batch.
    #[validate(range(min = 1, message = "max_batch_size must be positive"))]
    pub max_batch_size: usize,

    /// Longest wait since the first buffered record.
    #[validate(range(min = 1, message = "max_wait_ms must be positive"))]
    pub max_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 512,
            max_wait_ms: 5000,
        }
    }
}

/// One signal's pipeline: ordered processors, fan-out exporters and batching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    /// Processor names, applied in order.
    #[serde(default)]
    pub processors: Vec<String>,

    /// Exporter names; every batch goes to each of them.
    #[validate(length(min = 1, message = "at least one exporter is required"))]
    pub exporters: Vec<String>,

    /// Accumulator thresholds.
    #[serde(default)]
    #[validate(nested)]
    pub batch: BatchConfig,
}

impl PipelineConfig {
    /// Creates a pipeline exporting to the given exporters.
    #[must_use]
    pub fn new<I, S>(exporters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            processors: Vec::new(),
            exporters: exporters.into_iter().map(Into::into).collect(),
            batch: BatchConfig::default(),
        }
    }

    /// Appends a processor reference.
    #[must_use]
    pub fn with_processor(mut self, name: impl Into<String>) -> Self {
        self.processors.push(name.into());
        self
    }

    /// Sets the batch thresholds.
    #[must_use]
    pub fn with_batch(mut self, max_batch_size: usize, max_wait_ms: u64) -> Self {
        self.batch = BatchConfig {
            max_batch_size,
            max_wait_ms,
        };
        self
    }
}

/// The three optional pipelines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelinesConfig {
    /// Trace pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traces: Option<PipelineConfig>,
    /// Metrics pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PipelineConfig>,
    /// Logs pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<PipelineConfig>,
}

impl PipelinesConfig {
    /// The pipeline for a signal, if configured.
    #[must_use]
    pub fn get(&self, signal: SignalType) -> Option<&PipelineConfig> {
        match signal {
            SignalType::Traces => self.traces.as_ref(),
            SignalType::Metrics => self.metrics.as_ref(),
            SignalType::Logs => self.logs.as_ref(),
        }
    }

    /// Configured pipelines with their signal.
    pub fn iter(&self) -> impl Iterator<Item = (SignalType, &PipelineConfig)> {
        SignalType::ALL
            .into_iter()
            .filter_map(|signal| self.get(signal).map(|p| (signal, p)))
    }

    /// Returns true if no pipeline is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}
