//! Error taxonomy of the collector.
//!
//! [`IngestError`] is the only class a producer ever sees. Delivery problems
//! stay inside the pipeline and surface as counters and log lines.

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use shared::config::ConfigErrors;
use shared::models::SignalType;
use std::net::SocketAddr;
use thiserror::Error;

/// Error response body of the HTTP receiver.
#[derive(Debug, Serialize, Deserialize)]
pub struct OtlpError {
    /// HTTP status code.
    pub code: u32,
    /// Error message.
    pub message: String,
}

/// Errors returned to producers at ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// The payload could not be decoded; nothing was admitted.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The payload exceeds `max_request_bytes`.
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit.
        limit: usize,
    },

    /// Memory usage is above the soft limit; retry later.
    #[error("memory usage above soft limit, retry later")]
    Backpressure,

    /// The hard memory limit was crossed or the ingress queue stayed full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The collector is shutting down.
    #[error("collector is shutting down")]
    ShuttingDown,
}

impl IngestError {
    /// HTTP status of this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Backpressure => StatusCode::TOO_MANY_REQUESTS,
            Self::ResourceExhausted(_) | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The HTTP error response for this error.
    #[must_use]
    pub fn into_http(self) -> (StatusCode, Json<OtlpError>) {
        let status = self.status_code();
        (
            status,
            Json(OtlpError {
                code: u32::from(status.as_u16()),
                message: self.to_string(),
            }),
        )
    }
}

impl From<IngestError> for tonic::Status {
    fn from(error: IngestError) -> Self {
        let message = error.to_string();
        match error {
            IngestError::MalformedPayload(_) => Self::invalid_argument(message),
            IngestError::PayloadTooLarge { .. }
            | IngestError::Backpressure
            | IngestError::ResourceExhausted(_) => Self::resource_exhausted(message),
            IngestError::ShuttingDown => Self::unavailable(message),
        }
    }
}

/// Outcome of one failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The attempt may succeed if repeated.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Repeating the attempt cannot succeed.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    /// Whether the retry policy may try again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Records dropped inside the pipeline without telling the producer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("data loss: {records} {signal} records dropped by {exporter} ({reason})")]
pub struct DataLoss {
    /// Pipeline the records belonged to.
    pub signal: SignalType,
    /// Exporter whose queue dropped them.
    pub exporter: String,
    /// Number of records.
    pub records: usize,
    /// Why they were dropped.
    pub reason: &'static str,
}

/// Errors that prevent the collector from starting.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The configuration document is invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigErrors),

    /// A listener address could not be bound.
    #[error("failed to bind {name} listener on {address}: {source}")]
    Bind {
        /// Listener name.
        name: &'static str,
        /// Configured address.
        address: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// An exporter could not be constructed.
    #[error("exporter {name}: {message}")]
    Exporter {
        /// Exporter name.
        name: String,
        /// What went wrong.
        message: String,
    },
}

impl CollectorError {
    pub(crate) fn bind(name: &'static str, address: &str, source: std::io::Error) -> Self {
        Self::Bind {
            name,
            address: address.to_string(),
            source,
        }
    }
}

/// Parses a listener address that passed validation.
pub(crate) fn parse_address(name: &'static str, address: &str) -> Result<SocketAddr, CollectorError> {
    address.parse().map_err(|e: std::net::AddrParseError| {
        CollectorError::bind(
            name,
            address,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
        )
    })
}
