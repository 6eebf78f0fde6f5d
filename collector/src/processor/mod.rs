//! Processor chain.
//!
//! A pipeline's processor names are resolved once at startup into a list of
//! boxed stages. At runtime a request's records pass through every stage in
//! order; a stage may drop individual records (counted in the
//! [`StageContext`]) or refuse the whole request with a [`StageError`].

mod attributes;
mod memory_limiter;
mod resource;

pub use attributes::{AttributesProcessor, REDACTED};
pub use memory_limiter::MemoryLimiter;
pub use resource::ResourceProcessor;

use crate::admission::{AdmissionError, MemoryBudget, MemoryPermit};
use shared::config::{CollectorConfig, ConfigErrors, PipelineConfig, ProcessorConfig};
use shared::models::{MetricPoint, Record, SeriesGuard};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Refusal of a whole request by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StageError {
    /// Memory admission refused the request.
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

/// Per-request state threaded through the chain.
#[derive(Debug, Default)]
pub struct StageContext {
    rejected: usize,
    first_rejection: Option<String>,
    permit: MemoryPermit,
}

impl StageContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one dropped record.
    pub fn reject(&mut self, reason: impl FnOnce() -> String) {
        self.rejected += 1;
        if self.first_rejection.is_none() {
            self.first_rejection = Some(reason());
        }
    }

    /// Records dropped so far.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Reason of the first dropped record.
    #[must_use]
    pub fn first_rejection(&self) -> Option<&str> {
        self.first_rejection.as_deref()
    }

    /// Attaches memory reserved for the request.
    pub fn hold(&mut self, permit: MemoryPermit) {
        self.permit.merge(permit);
    }

    /// Takes the memory reserved for the request.
    pub fn take_permit(&mut self) -> MemoryPermit {
        std::mem::take(&mut self.permit)
    }
}

/// One stage of a processor chain.
pub trait Processor<T: Record>: Send + Sync {
    /// Name of the definition this stage was built from.
    fn name(&self) -> &str;

    /// Processes the records of one request.
    ///
    /// # Errors
    ///
    /// Returns an error when the whole request must be refused.
    fn process(&self, records: Vec<T>, ctx: &mut StageContext) -> Result<Vec<T>, StageError>;
}

/// The resolved, ordered stages of one pipeline.
pub struct ProcessorChain<T: Record> {
    stages: Vec<Box<dyn Processor<T>>>,
}

impl<T: Record> ProcessorChain<T> {
    /// Creates a chain from already built stages.
    #[must_use]
    pub fn new(stages: Vec<Box<dyn Processor<T>>>) -> Self {
        Self { stages }
    }

    /// Resolves a pipeline's processor list.
    ///
    /// When the pipeline does not start with a `memory_limiter`, an implicit
    /// one is prepended so every pipeline draws from `budget`.
    ///
    /// # Errors
    ///
    /// Returns an error if a processor name is not defined.
    pub fn build(
        pipeline: &PipelineConfig,
        config: &CollectorConfig,
        budget: &Arc<MemoryBudget>,
    ) -> Result<Self, ConfigErrors> {
        let mut stages: Vec<Box<dyn Processor<T>>> = Vec::with_capacity(pipeline.processors.len() + 1);
        let mut problems = Vec::new();

        for name in &pipeline.processors {
            match config.processors.get(name) {
                Some(ProcessorConfig::MemoryLimiter(_)) => {
                    stages.push(Box::new(MemoryLimiter::new(name, Arc::clone(budget))));
                }
                Some(ProcessorConfig::Resource { attributes }) => {
                    stages.push(Box::new(ResourceProcessor::new(name, attributes)));
                }
                Some(ProcessorConfig::Attributes(options)) => {
                    stages.push(Box::new(AttributesProcessor::new(name, options)));
                }
                None => problems.push(format!(
                    "{} pipeline: processor {name} is not defined",
                    T::SIGNAL
                )),
            }
        }

        if !problems.is_empty() {
            return Err(ConfigErrors { problems });
        }

        let has_limiter = pipeline
            .processors
            .first()
            .and_then(|name| config.processors.get(name))
            .is_some_and(|p| matches!(p, ProcessorConfig::MemoryLimiter(_)));
        if !has_limiter {
            stages.insert(0, Box::new(MemoryLimiter::implicit(Arc::clone(budget))));
        }

        Ok(Self { stages })
    }

    /// Names of the stages, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true when the chain has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage in order.
    ///
    /// # Errors
    ///
    /// Returns the first stage refusal.
    pub fn run(&self, mut records: Vec<T>, ctx: &mut StageContext) -> Result<Vec<T>, StageError> {
        for stage in &self.stages {
            if records.is_empty() {
                break;
            }
            records = stage.process(records, ctx)?;
        }
        Ok(records)
    }
}

/// Rejects metric points that break per-series invariants.
pub struct SeriesCheck {
    guard: Mutex<SeriesGuard>,
}

impl SeriesCheck {
    /// Creates a check tracking at most `max_series` counter series.
    #[must_use]
    pub fn new(max_series: usize) -> Self {
        Self {
            guard: Mutex::new(SeriesGuard::new(max_series)),
        }
    }
}

impl Processor<MetricPoint> for SeriesCheck {
    fn name(&self) -> &str {
        "series_check"
    }

    fn process(
        &self,
        points: Vec<MetricPoint>,
        ctx: &mut StageContext,
    ) -> Result<Vec<MetricPoint>, StageError> {
        let mut guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(points
            .into_iter()
            .filter(|point| match guard.check(point) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(metric = %point.name, error = %e, "Rejected metric point");
                    ctx.reject(|| e.to_string());
                    false
                }
            })
            .collect())
    }
}
