//! Scrape endpoint of the prometheus exporter.

use super::ServiceState;
use crate::exporter::prometheus::{CONTENT_TYPE_OPENMETRICS, CONTENT_TYPE_TEXT};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

/// Creates the scrape route.
pub fn metrics_routes(state: ServiceState) -> Router {
    Router::new().route("/metrics", get(scrape)).with_state(state)
}

fn wants_openmetrics(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/openmetrics-text"))
}

async fn scrape(State(state): State<ServiceState>, headers: HeaderMap) -> Response {
    let Some(registry) = state.scrape() else {
        return (StatusCode::NOT_FOUND, "no prometheus exporter configured\n").into_response();
    };
    let openmetrics = wants_openmetrics(&headers);
    let content_type = if openmetrics {
        CONTENT_TYPE_OPENMETRICS
    } else {
        CONTENT_TYPE_TEXT
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        registry.render(openmetrics),
    )
        .into_response()
}
