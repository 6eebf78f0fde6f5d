//! Exporter definitions and their retry budgets.

use crate::models::SignalType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// Retry and queueing budget of one exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    #[validate(range(min = 1, message = "initial_backoff_ms must be positive"))]
    pub initial_backoff_ms: u64,

    /// Upper bound on the delay between retries.
    pub max_backoff_ms: u64,

    /// Factor applied to the delay after each failed attempt.
    #[validate(range(min = 1.0, message = "multiplier must be at least 1.0"))]
    pub multiplier: f64,

    /// Attempts per batch, including the first.
    #[validate(range(min = 1, message = "max_attempts must be at least 1"))]
    pub max_attempts: u32,

    /// Batches that may wait for delivery.
    #[validate(range(min = 1, message = "queue_size must be at least 1"))]
    pub queue_size: usize,

    /// Deadline of a single delivery attempt.
    #[validate(range(min = 1, message = "attempt_timeout_ms must be positive"))]
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 5,
            queue_size: 64,
            attempt_timeout_ms: 5000,
        }
    }
}

/// Request compression for push exporters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Bodies are sent as is.
    #[default]
    None,
    /// Bodies are gzip-compressed.
    Gzip,
}

/// OTLP/HTTP push to a trace or metrics store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtlpHttpExporterConfig {
    /// Base URL; `/v1/traces`, `/v1/metrics` or `/v1/logs` is appended.
    pub endpoint: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request compression.
    #[serde(default)]
    pub compression: Compression,
    /// Retry budget.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Push to a Loki-compatible log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LokiExporterConfig {
    /// Base URL; `/loki/api/v1/push` is appended.
    pub endpoint: String,
    /// Sent as `X-Scope-OrgID` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Retry budget.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Scrape registry served at `/metrics` on the service port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrometheusExporterConfig {
    /// Retry budget.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// In-process stores, for development and tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryExporterConfig {
    /// Retry budget.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// A named exporter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExporterConfig {
    /// OTLP/HTTP push.
    OtlpHttp(OtlpHttpExporterConfig),
    /// Log store push.
    Loki(LokiExporterConfig),
    /// Scrape registry.
    Prometheus(PrometheusExporterConfig),
    /// In-process stores.
    Memory(MemoryExporterConfig),
}

impl ExporterConfig {
    /// The `type` name used in configuration documents.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OtlpHttp(_) => "otlp_http",
            Self::Loki(_) => "loki",
            Self::Prometheus(_) => "prometheus",
            Self::Memory(_) => "memory",
        }
    }

    /// The retry budget.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        match self {
            Self::OtlpHttp(c) => &c.retry,
            Self::Loki(c) => &c.retry,
            Self::Prometheus(c) => &c.retry,
            Self::Memory(c) => &c.retry,
        }
    }

    /// The destination endpoint, for push exporters.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::OtlpHttp(c) => Some(&c.endpoint),
            Self::Loki(c) => Some(&c.endpoint),
            Self::Prometheus(_) | Self::Memory(_) => None,
        }
    }

    /// Whether this destination family can store the given signal.
    #[must_use]
    pub fn supports(&self, signal: SignalType) -> bool {
        match self {
            Self::OtlpHttp(_) | Self::Memory(_) => true,
            Self::Loki(_) => signal == SignalType::Logs,
            Self::Prometheus(_) => signal == SignalType::Metrics,
        }
    }

    /// Problems that do not depend on how the exporter is wired.
    #[must_use]
    pub fn problems(&self, name: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(endpoint) = self.endpoint() {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                problems.push(format!(
                    "exporter '{name}': endpoint '{endpoint}' must start with http:// or https://"
                ));
            }
        }
        let retry = self.retry();
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            problems.push(format!(
                "exporter '{name}': initial_backoff_ms must not exceed max_backoff_ms"
            ));
        }
        problems
    }
}
