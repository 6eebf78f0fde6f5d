//! The `resource` stage: inserts process-scope attributes if absent.

use super::{Processor, StageContext, StageError};
use shared::models::{AttributeValue, Record, Resource};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Adds attributes to every record's resource, never overwriting.
pub struct ResourceProcessor {
    name: String,
    attributes: Vec<(String, AttributeValue)>,
}

impl ResourceProcessor {
    /// Creates the stage from its configured attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, attributes: &BTreeMap<String, AttributeValue>) -> Self {
        Self {
            name: name.into(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// The enriched copy of `resource`, or `None` when nothing is missing.
    fn enrich(&self, resource: &Resource) -> Option<Arc<Resource>> {
        let missing: Vec<&(String, AttributeValue)> = self
            .attributes
            .iter()
            .filter(|(k, _)| !resource.attributes().contains_key(k))
            .collect();
        if missing.is_empty() {
            return None;
        }
        let mut attributes = resource.attributes().clone();
        for (k, v) in missing {
            attributes.insert_if_absent(k.clone(), v.clone());
        }
        Some(Resource::new(attributes).shared())
    }
}

impl<T: Record> Processor<T> for ResourceProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, mut records: Vec<T>, _ctx: &mut StageContext) -> Result<Vec<T>, StageError> {
        // Records of one resource block share one `Arc`; enrich it once.
        let mut last: Option<(Arc<Resource>, Option<Arc<Resource>>)> = None;
        for record in &mut records {
            let cached = last
                .as_ref()
                .filter(|(original, _)| Arc::ptr_eq(original, record.resource()))
                .map(|(_, enriched)| enriched.clone());
            let replacement = match cached {
                Some(enriched) => enriched,
                None => {
                    let original = Arc::clone(record.resource());
                    let enriched = self.enrich(&original);
                    last = Some((original, enriched.clone()));
                    enriched
                }
            };
            if let Some(resource) = replacement {
                record.set_resource(resource);
            }
        }
        Ok(records)
    }
}
