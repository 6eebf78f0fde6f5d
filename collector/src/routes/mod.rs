//! Routes of the service port.
//!
//! Health, readiness and the scrape endpoint live on their own listener,
//! apart from the OTLP receivers.

mod health;
mod metrics;

pub use health::{health_routes, HealthResponse, ReadinessResponse};
pub use metrics::metrics_routes;

use crate::exporter::{ExporterStatus, ScrapeRegistry};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// State shared by the service routes.
#[derive(Clone, Default)]
pub struct ServiceState {
    exporters: Arc<Vec<Arc<ExporterStatus>>>,
    scrape: Option<Arc<ScrapeRegistry>>,
}

impl ServiceState {
    /// Creates the state from the live exporter statuses and the scrape registry.
    #[must_use]
    pub fn new(exporters: Vec<Arc<ExporterStatus>>, scrape: Option<Arc<ScrapeRegistry>>) -> Self {
        Self {
            exporters: Arc::new(exporters),
            scrape,
        }
    }

    /// Live state of every exporter.
    #[must_use]
    pub fn exporters(&self) -> &[Arc<ExporterStatus>] {
        &self.exporters
    }

    /// Scrape registry, when a prometheus exporter is configured.
    #[must_use]
    pub fn scrape(&self) -> Option<&Arc<ScrapeRegistry>> {
        self.scrape.as_ref()
    }
}

/// Creates the service router with all routes and middleware.
pub fn service_router(state: ServiceState) -> Router {
    Router::new()
        .merge(health_routes(state.clone()))
        .merge(metrics_routes(state))
        .layer(TraceLayer::new_for_http())
}
