//! Log store push destination speaking the Loki push API.

use super::otlp::{http_client, status_error, transport_error};
use super::Destination;
use crate::batcher::Batch;
use crate::error::{CollectorError, DeliveryError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::config::LokiExporterConfig;
use shared::models::LogRecord;
use std::collections::BTreeMap;

const PUSH_PATH: &str = "/loki/api/v1/push";

/// Stream label carrying the producing service.
pub const SERVICE_LABEL: &str = "service_name";

/// Body of a push request.
#[derive(Debug, Serialize, PartialEq)]
pub struct PushRequest {
    /// One entry per distinct label set.
    pub streams: Vec<Stream>,
}

/// Log lines sharing a label set.
#[derive(Debug, Serialize, PartialEq)]
pub struct Stream {
    /// Index labels.
    pub stream: BTreeMap<String, String>,
    /// `[timestamp_ns, line, structured_metadata]` entries.
    pub values: Vec<(String, String, BTreeMap<&'static str, String>)>,
}

/// Groups records into streams keyed by their index labels and service.
#[must_use]
pub fn push_request(records: &[LogRecord]) -> PushRequest {
    let mut streams: BTreeMap<BTreeMap<String, String>, Stream> = BTreeMap::new();
    for record in records {
        let mut labels: BTreeMap<String, String> = record.index_labels.iter().cloned().collect();
        labels.insert(SERVICE_LABEL.to_string(), record.resource.service_name().to_string());

        let mut metadata = BTreeMap::new();
        metadata.insert("level", record.severity.as_str().to_string());
        if let Some(trace_id) = record.trace_id {
            metadata.insert("trace_id", trace_id.to_hex());
        }
        if let Some(span_id) = record.span_id {
            metadata.insert("span_id", span_id.to_hex());
        }

        let nanos = record
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();

        streams
            .entry(labels.clone())
            .or_insert_with(|| Stream {
                stream: labels,
                values: Vec::new(),
            })
            .values
            .push((nanos, record.body.clone(), metadata));
    }
    PushRequest {
        streams: streams.into_values().collect(),
    }
}

/// Pushes log batches to a Loki-compatible endpoint.
pub struct LokiDestination {
    url: String,
    tenant_id: Option<String>,
    client: Client,
}

impl LokiDestination {
    /// Creates the destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(name: &str, config: &LokiExporterConfig) -> Result<Self, CollectorError> {
        Ok(Self {
            url: format!("{}{PUSH_PATH}", config.endpoint.trim_end_matches('/')),
            tenant_id: config.tenant_id.clone(),
            client: http_client(name)?,
        })
    }

    /// Full push URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Destination<LogRecord> for LokiDestination {
    fn kind(&self) -> &'static str {
        "loki"
    }

    async fn deliver(&self, batch: &Batch<LogRecord>) -> Result<(), DeliveryError> {
        let body = push_request(batch.records());

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(tenant) = &self.tenant_id {
            request = request.header("X-Scope-OrgID", tenant);
        }

        let response = request.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status.as_u16(), &body))
        }
    }
}
