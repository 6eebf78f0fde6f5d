//! Processor definitions.
//!
//! Processors are declared once under `[processors.<name>]` and referenced by
//! name from the pipelines. The `type` key selects the kind.

use crate::models::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest number of label hints a logs pipeline may carry.
///
/// Log stores index every label combination as a separate stream, so the set
/// must stay small.
pub const MAX_LABEL_HINTS: usize = 15;

/// Record attribute keys that carry trace context and may not be changed.
pub const PROTECTED_RECORD_KEYS: [&str; 2] = ["trace_id", "span_id"];

/// Process-wide memory limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    /// Usage at which new batches are refused with backpressure.
    pub soft_limit_bytes: usize,
    /// Usage at which the receivers stop accepting until below the soft limit.
    pub hard_limit_bytes: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            soft_limit_bytes: 384 * 1024 * 1024,
            hard_limit_bytes: 512 * 1024 * 1024,
        }
    }
}

impl MemoryLimits {
    /// Creates a pair of limits.
    #[must_use]
    pub fn new(soft_limit_bytes: usize, hard_limit_bytes: usize) -> Self {
        Self {
            soft_limit_bytes,
            hard_limit_bytes,
        }
    }

    /// Checks that the soft limit lies strictly below the hard limit.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn check(&self) -> Result<(), String> {
        if self.soft_limit_bytes == 0 {
            return Err("soft_limit_bytes must be positive".to_string());
        }
        if self.soft_limit_bytes >= self.hard_limit_bytes {
            return Err(format!(
                "soft_limit_bytes ({}) must be below hard_limit_bytes ({})",
                self.soft_limit_bytes, self.hard_limit_bytes
            ));
        }
        Ok(())
    }
}

/// Where an attribute action or label hint looks up its key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeScope {
    /// The record's own attributes.
    #[default]
    Record,
    /// The shared resource attributes.
    Resource,
}

/// What an attribute action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Set the key only if it is absent.
    Insert,
    /// Set the key only if it is present.
    Update,
    /// Set the key whether or not it is present.
    Upsert,
    /// Remove the key.
    Delete,
    /// Replace the value of a present key with a fixed marker.
    Redact,
}

impl ActionKind {
    /// Returns true for kinds that write a configured value.
    #[must_use]
    pub fn needs_value(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Upsert)
    }

    /// Returns true for kinds that remove information.
    #[must_use]
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Delete | Self::Redact)
    }
}

/// One step of an `attributes` processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeAction {
    /// Attribute key.
    pub key: String,
    /// Action to perform.
    pub action: ActionKind,
    /// Value written by insert, update and upsert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<AttributeValue>,
    /// Attribute set the action applies to.
    #[serde(default)]
    pub scope: AttributeScope,
}

/// Promotes one attribute to an indexed label at the log store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelHint {
    /// Attribute key to read.
    pub key: String,
    /// Attribute set to read it from.
    #[serde(default)]
    pub scope: AttributeScope,
    /// Label name at the destination. Defaults to the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl LabelHint {
    /// The destination label name, sanitised.
    #[must_use]
    pub fn label_name(&self) -> String {
        sanitize_label_name(self.label.as_deref().unwrap_or(&self.key))
    }
}

/// Rewrites a name into `[a-zA-Z_][a-zA-Z0-9_]*`.
///
/// # Examples
///
/// ```
/// use shared::config::sanitize_label_name;
///
/// assert_eq!(sanitize_label_name("service.name"), "service_name");
/// assert_eq!(sanitize_label_name("9lives"), "_9lives");
/// ```
#[must_use]
pub fn sanitize_label_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Options of an `attributes` processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributesProcessorConfig {
    /// Ordered actions.
    pub actions: Vec<AttributeAction>,
    /// Attributes to promote to log store labels.
    pub label_hints: Vec<LabelHint>,
    /// Records that end up with more record attributes are dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attributes: Option<usize>,
}

/// A named processor definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorConfig {
    /// Admission control against the process-wide memory budget.
    MemoryLimiter(MemoryLimits),
    /// Inserts resource attributes if absent.
    Resource {
        /// Attributes to insert.
        #[serde(default)]
        attributes: BTreeMap<String, AttributeValue>,
    },
    /// Attribute actions and label hints.
    Attributes(AttributesProcessorConfig),
}

impl ProcessorConfig {
    /// The `type` name used in configuration documents.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MemoryLimiter(_) => "memory_limiter",
            Self::Resource { .. } => "resource",
            Self::Attributes(_) => "attributes",
        }
    }

    /// Problems that do not depend on how the processor is wired.
    #[must_use]
    pub fn problems(&self, name: &str) -> Vec<String> {
        let mut problems = Vec::new();
        match self {
            Self::MemoryLimiter(limits) => {
                if let Err(e) = limits.check() {
                    problems.push(format!("processor '{name}': {e}"));
                }
            }
            Self::Resource { attributes } => {
                if attributes.keys().any(String::is_empty) {
                    problems.push(format!("processor '{name}': attribute keys must not be empty"));
                }
            }
            Self::Attributes(config) => {
                for action in &config.actions {
                    problems.extend(action_problem(name, action));
                }
                if config.label_hints.len() > MAX_LABEL_HINTS {
                    problems.push(format!(
                        "processor '{name}': at most {MAX_LABEL_HINTS} label hints are allowed, got {}",
                        config.label_hints.len()
                    ));
                }
                let mut seen = Vec::new();
                for hint in &config.label_hints {
                    let label = hint.label_name();
                    if seen.contains(&label) {
                        problems.push(format!("processor '{name}': duplicate label '{label}'"));
                    } else {
                        seen.push(label);
                    }
                }
                if config.max_attributes == Some(0) {
                    problems.push(format!("processor '{name}': max_attributes must be positive"));
                }
            }
        }
        problems
    }
}

fn action_problem(name: &str, action: &AttributeAction) -> Option<String> {
    if action.key.is_empty() {
        return Some(format!("processor '{name}': action key must not be empty"));
    }
    if action.scope == AttributeScope::Record && PROTECTED_RECORD_KEYS.contains(&action.key.as_str())
    {
        return Some(format!(
            "processor '{name}': '{}' carries trace context and cannot be modified",
            action.key
        ));
    }
    if action.scope == AttributeScope::Resource
        && action.key == crate::models::SERVICE_NAME
        && action.action.is_destructive()
    {
        return Some(format!(
            "processor '{name}': '{}' is the cross-signal join key and cannot be removed",
            action.key
        ));
    }
    if action.action.needs_value() && action.value.is_none() {
        return Some(format!(
            "processor '{name}': action on '{}' requires a value",
            action.key
        ));
    }
    None
}
