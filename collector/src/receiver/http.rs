//! OTLP HTTP receiver endpoints.
//!
//! Implements OpenTelemetry Protocol HTTP endpoints for ingesting traces, metrics and logs.
//! Supports both protobuf (`application/x-protobuf`) and JSON (`application/json`) content
//! types, optionally gzip-compressed. Responses use the content type of the request.
//!
//! # Endpoints
//!
//! - `POST /v1/traces` - Ingest OTLP traces
//! - `POST /v1/metrics` - Ingest OTLP metrics
//! - `POST /v1/logs` - Ingest OTLP logs
//!
//! Only the endpoints of configured pipelines are mounted.

use super::{Ingress, Ingresses, OtlpExport};
use crate::error::{IngestError, OtlpError};
use crate::exporter::otlp::CONTENT_TYPE_PROTOBUF;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{post, MethodRouter},
    Json, Router,
};
use flate2::read::GzDecoder;
use prost::Message;
use shared::models::Record;
use shared::otlp::proto::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use std::io::Read;
use std::marker::PhantomData;
use tower_http::limit::RequestBodyLimitLayer;

struct IngestState<R: OtlpExport> {
    ingress: Ingress<R::Record>,
    max_request_bytes: usize,
    _request: PhantomData<fn(R)>,
}

impl<R: OtlpExport> Clone for IngestState<R> {
    fn clone(&self) -> Self {
        Self {
            ingress: self.ingress.clone(),
            max_request_bytes: self.max_request_bytes,
            _request: PhantomData,
        }
    }
}

/// Creates the OTLP routes of the configured pipelines.
pub fn otlp_routes(ingresses: &Ingresses, max_request_bytes: usize) -> Router {
    let mut router = Router::new();
    if let Some(ingress) = &ingresses.traces {
        router = router.route(
            "/v1/traces",
            route::<ExportTraceServiceRequest>(ingress, max_request_bytes),
        );
    }
    if let Some(ingress) = &ingresses.metrics {
        router = router.route(
            "/v1/metrics",
            route::<ExportMetricsServiceRequest>(ingress, max_request_bytes),
        );
    }
    if let Some(ingress) = &ingresses.logs {
        router = router.route(
            "/v1/logs",
            route::<ExportLogsServiceRequest>(ingress, max_request_bytes),
        );
    }
    router.layer(DefaultBodyLimit::disable())
}

/// One export endpoint. Refusals produced by the body limit or by decoding
/// never reach the ingress, so they are counted on the way out.
fn route<R: OtlpExport>(ingress: &Ingress<R::Record>, max_request_bytes: usize) -> MethodRouter {
    post(ingest::<R>)
        .with_state(state(ingress, max_request_bytes))
        .layer(RequestBodyLimitLayer::new(max_request_bytes))
        .layer(middleware::map_response_with_state(
            ingress.clone(),
            count_undecodable::<R::Record>,
        ))
}

async fn count_undecodable<T: Record>(
    State(ingress): State<Ingress<T>>,
    response: Response,
) -> Response {
    if matches!(
        response.status(),
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE
    ) {
        ingress.reject_undecodable();
    }
    response
}

fn state<R: OtlpExport>(ingress: &Ingress<R::Record>, max_request_bytes: usize) -> IngestState<R> {
    IngestState {
        ingress: ingress.clone(),
        max_request_bytes,
        _request: PhantomData,
    }
}

/// Determines if the request is protobuf based on Content-Type header.
fn is_protobuf(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(CONTENT_TYPE_PROTOBUF))
}

fn is_gzip(headers: &HeaderMap) -> Result<bool, IngestError> {
    match headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
    {
        None | Some("" | "identity") => Ok(false),
        Some(e) if e.eq_ignore_ascii_case("gzip") => Ok(true),
        Some(other) => Err(IngestError::MalformedPayload(format!(
            "unsupported content encoding {other}"
        ))),
    }
}

/// Inflates a gzip body, refusing anything that inflates past `limit`.
fn gunzip(body: &[u8], limit: usize) -> Result<Vec<u8>, IngestError> {
    let mut out = Vec::new();
    let ceiling = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    GzDecoder::new(body)
        .take(ceiling)
        .read_to_end(&mut out)
        .map_err(|e| {
            IngestError::MalformedPayload(format!("failed to decompress gzip body: {e}"))
        })?;
    if out.len() > limit {
        return Err(IngestError::PayloadTooLarge { limit });
    }
    Ok(out)
}

fn decode<R: OtlpExport>(headers: &HeaderMap, body: &[u8], limit: usize) -> Result<R, IngestError> {
    if body.len() > limit {
        return Err(IngestError::PayloadTooLarge { limit });
    }
    let inflated;
    let raw = if is_gzip(headers)? {
        inflated = gunzip(body, limit)?;
        inflated.as_slice()
    } else {
        body
    };

    if is_protobuf(headers) {
        R::decode(raw)
            .map_err(|e| IngestError::MalformedPayload(format!("failed to decode protobuf: {e}")))
    } else {
        serde_json::from_slice(raw)
            .map_err(|e| IngestError::MalformedPayload(format!("failed to decode JSON: {e}")))
    }
}

/// Handler of every OTLP export endpoint.
async fn ingest<R: OtlpExport>(
    State(state): State<IngestState<R>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, (StatusCode, Json<OtlpError>)> {
    let signal = <R::Record as Record>::SIGNAL;
    let request: R = decode(&headers, &body, state.max_request_bytes).map_err(|e| {
        tracing::warn!(signal = %signal, error = %e, "Failed to decode OTLP request");
        e.into_http()
    })?;

    let accepted = state
        .ingress
        .submit(request.decode_records())
        .await
        .map_err(IngestError::into_http)?;

    tracing::debug!(
        signal = %signal,
        accepted = accepted.accepted,
        rejected = accepted.rejected,
        "Processed OTLP request"
    );

    let response = R::response(&accepted);
    if is_protobuf(&headers) {
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_PROTOBUF)],
            response.encode_to_vec(),
        )
            .into_response())
    } else {
        Ok((StatusCode::OK, Json(response)).into_response())
    }
}
