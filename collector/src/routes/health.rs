//! Health check endpoints.
//!
//! `/health` and `/health/live` answer as long as the process serves HTTP.
//! `/health/ready` answers 200 once every exporter has completed a delivery
//! cycle or sits idle with nothing queued.

use super::ServiceState;
use crate::exporter::ExporterReport;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status (always "healthy" if reachable).
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Service version.
    pub version: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `ready` or `not_ready`.
    pub status: &'static str,
    /// Exporters that have not completed a delivery cycle yet.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<ExporterReport>,
}

/// Creates the health check routes.
pub fn health_routes(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .with_state(state)
}

/// Health check handler.
///
/// Returns a simple JSON response indicating the service is healthy.
/// This endpoint is intended for use by load balancers and monitoring systems.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "trisignal-collector",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "alive" }))
}

async fn readiness(State(state): State<ServiceState>) -> (StatusCode, Json<ReadinessResponse>) {
    let pending: Vec<ExporterReport> = state
        .exporters()
        .iter()
        .filter(|s| !s.is_ready())
        .map(|s| s.report())
        .collect();

    if pending.is_empty() {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                pending,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                pending,
            }),
        )
    }
}
