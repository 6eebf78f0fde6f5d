//! Process-level settings.

use super::processors::MemoryLimits;
use super::receivers::validate_socket_addr;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Default address of the health and scrape routes.
pub const DEFAULT_SERVICE_ADDRESS: &str = "0.0.0.0:8888";

/// Log output format of the binaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Settings that apply to the whole process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address of `/health*` and `/metrics`.
    #[validate(custom(function = "validate_socket_addr"))]
    pub address: String,

    /// How long exporters may keep delivering after shutdown begins.
    pub shutdown_grace_ms: u64,

    /// Interval of the self-observability reporter.
    #[validate(range(min = 100, message = "telemetry_interval_ms must be at least 100"))]
    pub telemetry_interval_ms: u64,

    /// Memory budget used by pipelines without an explicit `memory_limiter`.
    pub memory: MemoryLimits,

    /// Counter series tracked for monotonicity checks.
    pub max_tracked_series: usize,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_SERVICE_ADDRESS.to_string(),
            shutdown_grace_ms: 10_000,
            telemetry_interval_ms: 10_000,
            memory: MemoryLimits::default(),
            max_tracked_series: 100_000,
            log_format: LogFormat::default(),
        }
    }
}
