//! The `memory_limiter` stage.

use super::{Processor, StageContext, StageError};
use crate::admission::MemoryBudget;
use shared::models::Record;
use std::sync::Arc;

/// Reserves a request's estimated size from the process budget.
pub struct MemoryLimiter {
    name: String,
    budget: Arc<MemoryBudget>,
}

impl MemoryLimiter {
    /// Creates a limiter drawing from `budget`.
    #[must_use]
    pub fn new(name: impl Into<String>, budget: Arc<MemoryBudget>) -> Self {
        Self {
            name: name.into(),
            budget,
        }
    }

    /// The limiter added to pipelines that do not configure one.
    #[must_use]
    pub fn implicit(budget: Arc<MemoryBudget>) -> Self {
        Self::new("memory_limiter", budget)
    }
}

impl<T: Record> Processor<T> for MemoryLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, records: Vec<T>, ctx: &mut StageContext) -> Result<Vec<T>, StageError> {
        let bytes: usize = records.iter().map(Record::estimated_size).sum();
        let permit = self.budget.admit(bytes)?;
        ctx.hold(permit);
        Ok(records)
    }
}
