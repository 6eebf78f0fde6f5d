//! Declarative configuration document for Trisignal.
//!
//! The document lists enabled receivers, named processor and exporter
//! definitions, and per-signal pipelines referencing them. It is loaded once
//! at startup and never changes afterwards.
//!
//! Field ranges are checked with `validator`; wiring rules (references,
//! ordering, signal compatibility) are checked by
//! [`CollectorConfig::validate_wiring`]. [`CollectorConfig::check`] runs both
//! and reports every problem at once.
//!
//! # Example
//!
//! ```
//! use shared::config::{CollectorConfig, ExporterConfig, MemoryExporterConfig, PipelineConfig};
//!
//! let mut config = CollectorConfig::default();
//! assert!(config.check().is_err());
//!
//! config
//!     .exporters
//!     .insert("mem".to_string(), ExporterConfig::Memory(MemoryExporterConfig::default()));
//! config.pipelines.traces = Some(PipelineConfig::new(["mem"]));
//! assert!(config.check().is_ok());
//! ```

pub mod exporters;
pub mod pipeline;
pub mod processors;
pub mod receivers;
pub mod service;

pub use exporters::{
    Compression, ExporterConfig, LokiExporterConfig, MemoryExporterConfig, OtlpHttpExporterConfig,
    PrometheusExporterConfig, RetryConfig,
};
pub use pipeline::{BatchConfig, PipelineConfig, PipelinesConfig};
pub use processors::{
    sanitize_label_name, ActionKind, AttributeAction, AttributeScope, AttributesProcessorConfig,
    LabelHint, MemoryLimits, ProcessorConfig, MAX_LABEL_HINTS, PROTECTED_RECORD_KEYS,
};
pub use receivers::{ListenerConfig, ReceiversConfig, DEFAULT_GRPC_ADDRESS, DEFAULT_HTTP_ADDRESS};
pub use service::{LogFormat, ServiceConfig, DEFAULT_SERVICE_ADDRESS};

use crate::models::SignalType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Every problem found in a configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigErrors {
    /// One line per problem.
    pub problems: Vec<String>,
}

/// The complete configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CollectorConfig {
    /// Receiver bindings and ingress limits.
    #[validate(nested)]
    pub receivers: ReceiversConfig,

    /// Named processor definitions.
    pub processors: BTreeMap<String, ProcessorConfig>,

    /// Named exporter definitions.
    pub exporters: BTreeMap<String, ExporterConfig>,

    /// Per-signal pipelines.
    pub pipelines: PipelinesConfig,

    /// Process-level settings.
    #[validate(nested)]
    pub service: ServiceConfig,
}

impl CollectorConfig {
    /// Runs field validation and wiring checks.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn check(&self) -> Result<(), ConfigErrors> {
        let mut problems = Vec::new();
        if let Err(errors) = self.validate() {
            flatten_validation_errors("", &errors, &mut problems);
        }
        for (name, exporter) in &self.exporters {
            if let Err(errors) = exporter.retry().validate() {
                flatten_validation_errors(&format!("exporters.{name}.retry"), &errors, &mut problems);
            }
        }
        for (signal, pipeline) in self.pipelines.iter() {
            if let Err(errors) = pipeline.validate() {
                flatten_validation_errors(&format!("pipelines.{signal}"), &errors, &mut problems);
            }
        }
        problems.sort();
        problems.extend(self.validate_wiring());

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigErrors { problems })
        }
    }

    /// Checks references, processor ordering and signal compatibility.
    #[must_use]
    pub fn validate_wiring(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.pipelines.is_empty() {
            problems.push("no pipelines configured".to_string());
        }
        if !self.receivers.any_enabled() {
            problems.push("no receivers enabled".to_string());
        }
        if let Err(e) = self.service.memory.check() {
            problems.push(format!("service.memory: {e}"));
        }

        let limiters = self
            .processors
            .values()
            .filter(|p| matches!(p, ProcessorConfig::MemoryLimiter(_)))
            .count();
        if limiters > 1 {
            problems.push(format!(
                "{limiters} memory_limiter processors defined; the memory budget is process-wide, define one"
            ));
        }
        for (name, processor) in &self.processors {
            problems.extend(processor.problems(name));
        }
        for (name, exporter) in &self.exporters {
            problems.extend(exporter.problems(name));
        }

        for (signal, pipeline) in self.pipelines.iter() {
            problems.extend(self.pipeline_problems(signal, pipeline));
        }
        problems
    }

    fn pipeline_problems(&self, signal: SignalType, pipeline: &PipelineConfig) -> Vec<String> {
        let mut problems = Vec::new();
        let mut label_count = 0;

        for (index, name) in pipeline.processors.iter().enumerate() {
            match self.processors.get(name) {
                None => problems.push(format!(
                    "pipelines.{signal}: unknown processor '{name}'"
                )),
                Some(ProcessorConfig::MemoryLimiter(_)) if index != 0 => problems.push(format!(
                    "pipelines.{signal}: memory_limiter '{name}' must be the first processor"
                )),
                Some(ProcessorConfig::Attributes(attributes)) => {
                    if !attributes.label_hints.is_empty() && signal != SignalType::Logs {
                        problems.push(format!(
                            "pipelines.{signal}: processor '{name}' has label_hints, which only apply to logs"
                        ));
                    }
                    label_count += attributes.label_hints.len();
                }
                Some(_) => {}
            }
        }
        if label_count > MAX_LABEL_HINTS {
            problems.push(format!(
                "pipelines.{signal}: {label_count} label hints in total, at most {MAX_LABEL_HINTS} allowed"
            ));
        }

        let mut seen = Vec::new();
        for name in &pipeline.exporters {
            if seen.contains(&name) {
                problems.push(format!("pipelines.{signal}: exporter '{name}' listed twice"));
                continue;
            }
            seen.push(name);
            match self.exporters.get(name) {
                None => problems.push(format!("pipelines.{signal}: unknown exporter '{name}'")),
                Some(exporter) if !exporter.supports(signal) => problems.push(format!(
                    "pipelines.{signal}: exporter '{name}' of type {} cannot export {signal}",
                    exporter.kind()
                )),
                Some(_) => {}
            }
        }
        problems
    }

    /// The memory limits in effect: the single `memory_limiter` definition if
    /// one exists, otherwise `service.memory`.
    #[must_use]
    pub fn memory_limits(&self) -> MemoryLimits {
        self.processors
            .values()
            .find_map(|p| match p {
                ProcessorConfig::MemoryLimiter(limits) => Some(*limits),
                _ => None,
            })
            .unwrap_or(self.service.memory)
    }

    /// Returns true if any pipeline exports to a prometheus exporter.
    #[must_use]
    pub fn has_scrape_exporter(&self) -> bool {
        self.exporters
            .values()
            .any(|e| matches!(e, ExporterConfig::Prometheus(_)))
    }
}

fn flatten_validation_errors(prefix: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Struct(inner) => flatten_validation_errors(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    flatten_validation_errors(&format!("{path}[{index}]"), inner, out);
                }
            }
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| error.code.to_string(), ToString::to_string);
                    out.push(format!("{path}: {message}"));
                }
            }
        }
    }
}
