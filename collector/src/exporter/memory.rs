//! In-process destination backed by the shared in-memory stores.

use super::Destination;
use crate::batcher::Batch;
use crate::error::DeliveryError;
use async_trait::async_trait;
use shared::models::{LogRecord, MetricPoint, Record, Span};
use shared::storage::{
    InMemoryLogStore, InMemoryMetricStore, InMemoryTraceStore, LogStore, MetricStore, TraceStore,
};
use std::marker::PhantomData;
use std::sync::Arc;

/// The stores of one `memory` exporter.
#[derive(Debug, Clone, Default)]
pub struct MemoryStores {
    /// Delivered spans.
    pub traces: Arc<InMemoryTraceStore>,
    /// Delivered metric points.
    pub metrics: Arc<InMemoryMetricStore>,
    /// Delivered log records.
    pub logs: Arc<InMemoryLogStore>,
}

impl MemoryStores {
    /// Creates empty stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Records the memory destination knows how to store.
pub trait MemorySink: Record {
    /// Writes records into the matching store.
    ///
    /// # Errors
    ///
    /// Returns the store error message.
    fn store(stores: &MemoryStores, records: Vec<Self>) -> Result<(), String>;
}

impl MemorySink for Span {
    fn store(stores: &MemoryStores, records: Vec<Self>) -> Result<(), String> {
        stores.traces.insert_spans(records).map_err(|e| e.to_string())
    }
}

impl MemorySink for MetricPoint {
    fn store(stores: &MemoryStores, records: Vec<Self>) -> Result<(), String> {
        stores.metrics.insert_batch(records).map_err(|e| e.to_string())
    }
}

impl MemorySink for LogRecord {
    fn store(stores: &MemoryStores, records: Vec<Self>) -> Result<(), String> {
        stores.logs.insert_batch(records).map_err(|e| e.to_string())
    }
}

/// Copies every batch into in-memory stores.
pub struct MemoryDestination<T> {
    stores: MemoryStores,
    _records: PhantomData<fn(T)>,
}

impl<T: MemorySink> MemoryDestination<T> {
    /// Creates a destination writing into `stores`.
    #[must_use]
    pub fn new(stores: MemoryStores) -> Self {
        Self {
            stores,
            _records: PhantomData,
        }
    }
}

#[async_trait]
impl<T: MemorySink> Destination<T> for MemoryDestination<T> {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn deliver(&self, batch: &Batch<T>) -> Result<(), DeliveryError> {
        T::store(&self.stores, batch.records().to_vec()).map_err(DeliveryError::Transient)
    }
}
