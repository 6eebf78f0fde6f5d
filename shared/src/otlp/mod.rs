//! OpenTelemetry Protocol (OTLP) wire codec.
//!
//! The protobuf types come from `opentelemetry-proto`, which also provides the
//! serde implementations used for the OTLP/JSON encoding. This module converts
//! between those types and the signal model.
//!
//! # Example
//!
//! ```
//! use shared::otlp::{decode_traces, proto};
//!
//! let request = proto::collector::trace::v1::ExportTraceServiceRequest::default();
//! let decoded = decode_traces(&request);
//! assert!(decoded.records.is_empty());
//! ```

pub mod conversions;
pub mod encode;

pub use conversions::{
    decode_logs, decode_metrics, decode_traces, DecodeError, Decoded, SCOPE_NAME_ATTRIBUTE,
    SCOPE_VERSION_ATTRIBUTE,
};
pub use encode::{encode_logs, encode_metrics, encode_traces};

/// Generated protobuf types from the OTLP definitions.
pub use opentelemetry_proto::tonic as proto;
