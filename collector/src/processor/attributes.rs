//! The `attributes` stage: ordered insert/update/upsert/delete/redact
//! actions, the attribute count limit, and label hints.

use super::{Processor, StageContext, StageError};
use shared::config::{ActionKind, AttributeAction, AttributeScope, AttributesProcessorConfig};
use shared::models::{Attributes, Record, Resource};
use std::sync::Arc;

/// Replacement value of redacted attributes.
pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone)]
struct ResolvedHint {
    key: String,
    scope: AttributeScope,
    label: String,
}

/// Applies attribute actions and promotes hinted attributes to index labels.
pub struct AttributesProcessor {
    name: String,
    record_actions: Vec<AttributeAction>,
    resource_actions: Vec<AttributeAction>,
    hints: Vec<ResolvedHint>,
    max_attributes: Option<usize>,
}

impl AttributesProcessor {
    /// Creates the stage, sanitising label names once.
    #[must_use]
    pub fn new(name: impl Into<String>, options: &AttributesProcessorConfig) -> Self {
        let (resource_actions, record_actions): (Vec<_>, Vec<_>) = options
            .actions
            .iter()
            .cloned()
            .partition(|a| a.scope == AttributeScope::Resource);

        let hints = options
            .label_hints
            .iter()
            .map(|hint| ResolvedHint {
                key: hint.key.clone(),
                scope: hint.scope,
                label: hint.label_name(),
            })
            .collect();

        Self {
            name: name.into(),
            record_actions,
            resource_actions,
            hints,
            max_attributes: options.max_attributes,
        }
    }

    fn apply(attributes: &mut Attributes, actions: &[AttributeAction]) {
        for action in actions {
            match action.action {
                ActionKind::Delete => {
                    attributes.remove(&action.key);
                }
                ActionKind::Redact => {
                    attributes.update_existing(&action.key, REDACTED);
                }
                kind => {
                    let Some(value) = action.value.clone() else {
                        continue;
                    };
                    match kind {
                        ActionKind::Insert => {
                            attributes.insert_if_absent(action.key.clone(), value);
                        }
                        ActionKind::Update => {
                            attributes.update_existing(&action.key, value);
                        }
                        _ => attributes.upsert(action.key.clone(), value),
                    }
                }
            }
        }
    }

    fn rewrite_resource(&self, resource: &Resource) -> Arc<Resource> {
        let mut attributes = resource.attributes().clone();
        Self::apply(&mut attributes, &self.resource_actions);
        Resource::new(attributes).shared()
    }

    fn promote_labels<T: Record>(&self, record: &mut T) {
        if self.hints.is_empty() {
            return;
        }
        let found: Vec<(String, String)> = self
            .hints
            .iter()
            .filter_map(|hint| {
                let value = match hint.scope {
                    AttributeScope::Record => record.attributes().get(&hint.key),
                    AttributeScope::Resource => record.resource().attributes().get(&hint.key),
                }?;
                Some((hint.label.clone(), value.to_string()))
            })
            .collect();

        if let Some(labels) = record.index_labels_mut() {
            for (label, value) in found {
                match labels.iter_mut().find(|(name, _)| *name == label) {
                    Some(existing) => existing.1 = value,
                    None => labels.push((label, value)),
                }
            }
        }
    }
}

impl<T: Record> Processor<T> for AttributesProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, records: Vec<T>, ctx: &mut StageContext) -> Result<Vec<T>, StageError> {
        let mut last: Option<(Arc<Resource>, Arc<Resource>)> = None;
        let mut kept = Vec::with_capacity(records.len());

        for mut record in records {
            if !self.resource_actions.is_empty() {
                let cached = last
                    .as_ref()
                    .filter(|(original, _)| Arc::ptr_eq(original, record.resource()))
                    .map(|(_, rewritten)| Arc::clone(rewritten));
                let rewritten = match cached {
                    Some(rewritten) => rewritten,
                    None => {
                        let original = Arc::clone(record.resource());
                        let rewritten = self.rewrite_resource(&original);
                        last = Some((original, Arc::clone(&rewritten)));
                        rewritten
                    }
                };
                record.set_resource(rewritten);
            }

            Self::apply(record.attributes_mut(), &self.record_actions);

            if let Some(max) = self.max_attributes {
                let count = record.attributes().len();
                if count > max {
                    tracing::debug!(
                        processor = %self.name,
                        count,
                        max,
                        "Dropped record exceeding the attribute limit"
                    );
                    ctx.reject(|| format!("record has {count} attributes, limit is {max}"));
                    continue;
                }
            }

            self.promote_labels(&mut record);
            kept.push(record);
        }

        Ok(kept)
    }
}
