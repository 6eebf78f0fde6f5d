//! Retry state machine of one batch delivery.
//!
//! ```text
//! Pending -> Sending -> Succeeded
//!              |
//!              +-> AwaitingRetry -> Sending -> ... -> Succeeded | PermanentlyFailed
//! ```
//!
//! The machine only decides; the exporter worker performs the attempts and
//! sleeps, so retries and cancellation stay in one place.

use crate::error::DeliveryError;
use shared::config::RetryConfig;
use std::time::Duration;

/// Backoff and attempt budget of an exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
    /// Growth factor between retries.
    pub multiplier: f64,
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Deadline of a single attempt.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(scaled)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

/// Where a delivery currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    /// Not yet attempted.
    Pending,
    /// An attempt is in progress.
    Sending {
        /// Attempt number, 1-based.
        attempt: u32,
    },
    /// The last attempt failed transiently; waiting before the next one.
    AwaitingRetry {
        /// Number of the failed attempt.
        attempt: u32,
        /// Delay before the next attempt.
        backoff: Duration,
    },
    /// An attempt succeeded.
    Succeeded {
        /// Attempts used.
        attempts: u32,
    },
    /// The destination refused the batch or the budget ran out.
    PermanentlyFailed {
        /// Attempts used.
        attempts: u32,
        /// Last error.
        reason: String,
    },
}

impl DeliveryState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::PermanentlyFailed { .. })
    }
}

/// The delivery of one batch to one destination.
#[derive(Debug, Clone)]
pub struct Delivery {
    state: DeliveryState,
    policy: RetryPolicy,
}

impl Delivery {
    /// Starts in `Pending`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: DeliveryState::Pending,
            policy,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &DeliveryState {
        &self.state
    }

    /// The policy driving this delivery.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `Pending -> Sending`.
    pub fn begin(&mut self) {
        if self.state == DeliveryState::Pending {
            self.state = DeliveryState::Sending { attempt: 1 };
        }
    }

    /// Applies the result of the attempt in progress.
    pub fn record(&mut self, result: Result<(), DeliveryError>) {
        let DeliveryState::Sending { attempt } = self.state else {
            return;
        };
        self.state = match result {
            Ok(()) => DeliveryState::Succeeded { attempts: attempt },
            Err(DeliveryError::Transient(_)) if attempt < self.policy.max_attempts => {
                DeliveryState::AwaitingRetry {
                    attempt,
                    backoff: self.policy.backoff(attempt),
                }
            }
            Err(e) => DeliveryState::PermanentlyFailed {
                attempts: attempt,
                reason: e.to_string(),
            },
        };
    }

    /// `AwaitingRetry -> Sending` once the backoff elapsed.
    pub fn resume(&mut self) {
        if let DeliveryState::AwaitingRetry { attempt, .. } = self.state {
            self.state = DeliveryState::Sending {
                attempt: attempt + 1,
            };
        }
    }
}
