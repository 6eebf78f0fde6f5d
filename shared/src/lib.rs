//! Trisignal Shared Library
//!
//! This crate contains the types shared by the Trisignal collector and its
//! command line tool.
//!
//! # Modules
//!
//! - [`models`] - Signal model for spans, metric points and log records
//! - [`otlp`] - OTLP wire codec
//! - [`config`] - Declarative pipeline configuration
//! - [`storage`] - Destination store APIs and in-memory implementations
//!
//! # Example
//!
//! ```
//! use shared::models::{LogRecord, Resource, Severity, SpanId, TraceId};
//!
//! let resource = Resource::for_service("auth-service").shared();
//! let trace_id = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap();
//! let span_id = SpanId::from_hex("b7ad6b7169203331").unwrap();
//!
//! let log = LogRecord::new(Severity::Info, "User logged in", resource)
//!     .with_attribute("user_id", "12345")
//!     .with_trace_context(trace_id, span_id);
//!
//! assert_eq!(log.correlation_key().map(|k| k.span_id), Some(span_id));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod models;
pub mod otlp;
pub mod storage;

/// Re-export common dependencies for convenience.
pub use chrono;
pub use serde;
pub use serde_json;
pub use validator;
