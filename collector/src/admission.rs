//! Process-wide memory admission control.
//!
//! One [`MemoryBudget`] is shared by all three pipelines. Every admitted
//! request holds a [`MemoryPermit`] for its estimated size until the last
//! batch referencing those records is dropped by every exporter.

use shared::config::MemoryLimits;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Usage is at or above the soft limit.
    #[error("memory usage {used} bytes is above the soft limit of {soft} bytes")]
    SoftLimit {
        /// Bytes in flight.
        used: usize,
        /// Soft limit.
        soft: usize,
    },

    /// The hard limit was crossed and usage has not yet fallen below the soft limit.
    #[error("memory usage {used} bytes crossed the hard limit of {hard} bytes")]
    HardLimit {
        /// Bytes in flight.
        used: usize,
        /// Hard limit.
        hard: usize,
    },
}

/// Bytes in flight across every pipeline.
#[derive(Debug)]
pub struct MemoryBudget {
    used: AtomicUsize,
    refusing: AtomicBool,
    limits: MemoryLimits,
}

impl MemoryBudget {
    /// Creates a budget with the given limits.
    #[must_use]
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            used: AtomicUsize::new(0),
            refusing: AtomicBool::new(false),
            limits,
        }
    }

    /// Creates a budget wrapped in an `Arc`.
    #[must_use]
    pub fn new_shared(limits: MemoryLimits) -> Arc<Self> {
        Arc::new(Self::new(limits))
    }

    /// The configured limits.
    #[must_use]
    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    /// Bytes currently held by permits.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Whether new payloads are refused until usage falls below the soft limit.
    #[must_use]
    pub fn is_refusing(&self) -> bool {
        self.refusing.load(Ordering::Acquire)
    }

    /// Whether exporter queues should shed their oldest batch.
    #[must_use]
    pub fn is_shedding(&self) -> bool {
        self.used() >= self.limits.soft_limit_bytes
    }

    /// Reserves `bytes` for a new request.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::HardLimit`] while the refusal latch is set and
    /// [`AdmissionError::SoftLimit`] while usage is at or above the soft limit.
    pub fn admit(self: &Arc<Self>, bytes: usize) -> Result<MemoryPermit, AdmissionError> {
        let soft = self.limits.soft_limit_bytes;
        let hard = self.limits.hard_limit_bytes;

        let mut current = self.used.load(Ordering::Acquire);
        loop {
            if self.is_refusing() {
                if current >= soft {
                    return Err(AdmissionError::HardLimit { used: current, hard });
                }
                self.refusing.store(false, Ordering::Release);
                tracing::info!(used = current, soft, "Memory usage below soft limit, accepting again");
            }
            if current >= soft {
                return Err(AdmissionError::SoftLimit { used: current, soft });
            }

            let next = current.saturating_add(bytes);
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next > hard && !self.refusing.swap(true, Ordering::AcqRel) {
                        tracing::warn!(used = next, hard, "Hard memory limit crossed, refusing new payloads");
                    }
                    return Ok(MemoryPermit {
                        budget: Some(Arc::clone(self)),
                        bytes,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Bytes reserved from a [`MemoryBudget`], released on drop.
pub struct MemoryPermit {
    budget: Option<Arc<MemoryBudget>>,
    bytes: usize,
}

impl MemoryPermit {
    /// A permit holding nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            budget: None,
            bytes: 0,
        }
    }

    /// Bytes held by this permit.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Moves up to `bytes` into a new permit.
    #[must_use]
    pub fn split(&mut self, bytes: usize) -> Self {
        let moved = bytes.min(self.bytes);
        self.bytes -= moved;
        Self {
            budget: self.budget.clone(),
            bytes: moved,
        }
    }

    /// Takes over the bytes of another permit.
    pub fn merge(&mut self, mut other: Self) {
        if other.bytes == 0 {
            return;
        }
        match (&self.budget, &other.budget) {
            (Some(mine), Some(theirs)) if !Arc::ptr_eq(mine, theirs) => {
                // Different budgets cannot be merged; let `other` release on drop.
                return;
            }
            (None, _) => self.budget = other.budget.take(),
            _ => {}
        }
        self.bytes += other.bytes;
        other.bytes = 0;
    }
}

impl Default for MemoryPermit {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for MemoryPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPermit")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryPermit {
    fn drop(&mut self) {
        if let Some(budget) = &self.budget {
            if self.bytes > 0 {
                budget.release(self.bytes);
            }
        }
    }
}
