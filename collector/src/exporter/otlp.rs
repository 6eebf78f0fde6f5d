//! OTLP/HTTP protobuf push destination.

use super::Destination;
use crate::batcher::Batch;
use crate::error::{CollectorError, DeliveryError};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use prost::Message;
use reqwest::Client;
use shared::config::{Compression, OtlpHttpExporterConfig};
use shared::models::{LogRecord, MetricPoint, Record, Span};
use shared::otlp::{encode_logs, encode_metrics, encode_traces};
use std::io::Write;
use std::marker::PhantomData;
use std::time::Duration;

/// Content type of OTLP protobuf requests.
pub const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

/// Records that can be sent as an OTLP export request.
pub trait OtlpPayload: Record {
    /// Request path below the endpoint.
    const PATH: &'static str;

    /// Encodes a batch as a protobuf export request.
    fn encode_request(records: &[Self]) -> Vec<u8>;
}

impl OtlpPayload for Span {
    const PATH: &'static str = "/v1/traces";

    fn encode_request(records: &[Self]) -> Vec<u8> {
        encode_traces(records).encode_to_vec()
    }
}

impl OtlpPayload for MetricPoint {
    const PATH: &'static str = "/v1/metrics";

    fn encode_request(records: &[Self]) -> Vec<u8> {
        encode_metrics(records).encode_to_vec()
    }
}

impl OtlpPayload for LogRecord {
    const PATH: &'static str = "/v1/logs";

    fn encode_request(records: &[Self]) -> Vec<u8> {
        encode_logs(records).encode_to_vec()
    }
}

/// Determines if a status code is retryable per the OTLP specification.
///
/// Retryable: 408 (Request Timeout), 429 (Too Many Requests), 5xx (Server Errors)
pub(crate) fn is_retryable(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

/// Maps a non-success HTTP response to a delivery error.
pub(crate) fn status_error(status: u16, body: &str) -> DeliveryError {
    let message = format!("server returned {status}: {body}");
    if is_retryable(status) {
        DeliveryError::Transient(message)
    } else {
        DeliveryError::Permanent(message)
    }
}

/// Maps a transport error to a delivery error. Transport errors are always retried.
pub(crate) fn transport_error(error: &reqwest::Error) -> DeliveryError {
    DeliveryError::Transient(format!("HTTP request failed: {error}"))
}

/// Builds the shared HTTP client of push destinations.
pub(crate) fn http_client(name: &str) -> Result<Client, CollectorError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| CollectorError::Exporter {
            name: name.to_string(),
            message: format!("failed to build HTTP client: {e}"),
        })
}

/// Pushes batches to an OTLP/HTTP endpoint.
pub struct OtlpHttpDestination<T> {
    url: String,
    headers: Vec<(String, String)>,
    compression: Compression,
    client: Client,
    _records: PhantomData<fn(T)>,
}

impl<T: OtlpPayload> OtlpHttpDestination<T> {
    /// Creates the destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(name: &str, config: &OtlpHttpExporterConfig) -> Result<Self, CollectorError> {
        Ok(Self {
            url: format!("{}{}", config.endpoint.trim_end_matches('/'), T::PATH),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            compression: config.compression,
            client: http_client(name)?,
            _records: PhantomData,
        })
    }

    /// Full request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn encode(&self, records: &[T]) -> Result<Vec<u8>, DeliveryError> {
        let buf = T::encode_request(records);
        if self.compression == Compression::Gzip {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&buf)
                .and_then(|()| encoder.finish())
                .map_err(|e| DeliveryError::Permanent(format!("failed to compress request: {e}")))
        } else {
            Ok(buf)
        }
    }
}

#[async_trait]
impl<T: OtlpPayload> Destination<T> for OtlpHttpDestination<T> {
    fn kind(&self) -> &'static str {
        "otlp_http"
    }

    async fn deliver(&self, batch: &Batch<T>) -> Result<(), DeliveryError> {
        let body = self.encode(batch.records())?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", CONTENT_TYPE_PROTOBUF)
            .body(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if self.compression == Compression::Gzip {
            request = request.header("Content-Encoding", "gzip");
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
