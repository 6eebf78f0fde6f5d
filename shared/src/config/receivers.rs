//! Receiver configuration: protocol bindings and ingress limits.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use validator::{Validate, ValidationError};

/// Default OTLP/HTTP listen address.
pub const DEFAULT_HTTP_ADDRESS: &str = "0.0.0.0:4318";
/// Default OTLP/gRPC listen address.
pub const DEFAULT_GRPC_ADDRESS: &str = "0.0.0.0:4317";

pub(crate) fn validate_socket_addr(address: &str) -> Result<(), ValidationError> {
    address.parse::<SocketAddr>().map(|_| ()).map_err(|_| {
        let mut error = ValidationError::new("socket_addr");
        error.message = Some(format!("'{address}' is not a valid socket address").into());
        error
    })
}

/// One protocol binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ListenerConfig {
    /// Whether the binding is started.
    pub enabled: bool,

    /// Address to listen on, e.g. `0.0.0.0:4318`.
    #[validate(custom(function = "validate_socket_addr"))]
    pub address: String,
}

impl ListenerConfig {
    /// Creates an enabled binding on the given address.
    #[must_use]
    pub fn enabled(address: impl Into<String>) -> Self {
        Self {
            enabled: true,
            address: address.into(),
        }
    }

    /// Returns a copy of this binding that is switched off.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Ingestion settings shared by both bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReceiversConfig {
    /// OTLP/HTTP binding.
    #[validate(nested)]
    pub http: ListenerConfig,

    /// OTLP/gRPC binding.
    #[validate(nested)]
    pub grpc: ListenerConfig,

    /// Largest accepted request body, after decompression.
    #[validate(range(min = 1024, message = "max_request_bytes must be at least 1024"))]
    pub max_request_bytes: usize,

    /// How long a request waits for ingress queue capacity.
    #[validate(range(min = 1, message = "enqueue_timeout_ms must be positive"))]
    pub enqueue_timeout_ms: u64,

    /// Capacity of each per-signal ingress queue, in requests.
    #[validate(range(min = 1, message = "queue_capacity must be positive"))]
    pub queue_capacity: usize,
}

impl Default for ReceiversConfig {
    fn default() -> Self {
        Self {
            http: ListenerConfig::enabled(DEFAULT_HTTP_ADDRESS),
            grpc: ListenerConfig::enabled(DEFAULT_GRPC_ADDRESS),
            max_request_bytes: 4 * 1024 * 1024,
            enqueue_timeout_ms: 2000,
            queue_capacity: 256,
        }
    }
}

impl ReceiversConfig {
    /// Returns true if at least one binding is enabled.
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        self.http.enabled || self.grpc.enabled
    }
}
