//! Destination store APIs.
//!
//! The three storage backends are external; this module describes the read
//! and write APIs the pipeline consumes them through. The in-memory
//! implementations back the `memory` exporter and the tests.

pub mod log_store;
pub mod metric_store;
pub mod trace_store;

pub use log_store::{InMemoryLogStore, LogQuery, LogQueryResult, LogStore, LogStoreError};
pub use metric_store::{
    histogram_quantile, InMemoryMetricStore, MetricQuery, MetricQueryResult, MetricStore,
    MetricStoreError,
};
pub use trace_store::{
    InMemoryTraceStore, TraceQuery, TraceQueryResult, TraceStore, TraceStoreError,
};
