//! Trisignal Collector
//!
//! Receives traces, metrics and logs over OTLP (HTTP and gRPC), runs them
//! through per-signal processing pipelines and delivers them to their
//! destinations with bounded memory and at-least-once retries.
//!
//! # Architecture
//!
//! Each signal has its own pipeline:
//! - [`receiver`]: OTLP decoding and admission into a bounded ingress queue
//! - [`processor`]: memory limiter, resource enrichment and attribute rewriting
//! - [`batcher`]: size/deadline batching
//! - [`exporter`]: one worker per destination with its own queue and retries
//!
//! The [`supervisor`] wires the pipelines together and owns shutdown.
//!
//! # Example
//!
//! ```no_run
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     collector::run().await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod batcher;
pub mod config;
pub mod error;
pub mod exporter;
pub mod processor;
pub mod receiver;
pub mod routes;
pub mod supervisor;
pub mod telemetry;

pub use config::{config_path, load_config};
pub use error::{CollectorError, IngestError};
pub use supervisor::{CollectorHandle, ShutdownReport, Supervisor};

use anyhow::{Context, Result};

/// Runs the collector with the configuration found at [`config_path`].
///
/// # Errors
///
/// Returns an error if:
/// - The configuration cannot be loaded or is invalid
/// - A listener cannot be bound
pub async fn run() -> Result<()> {
    let path = config_path();
    let config = load_config(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    run_with_config(config).await
}

/// Runs the collector with the provided configuration until SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns an error if the collector cannot start.
pub async fn run_with_config(config: shared::config::CollectorConfig) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Trisignal collector starting");

    let handle = Supervisor::start(config).await?;
    shutdown_signal().await;
    let report = handle.shutdown().await;

    if report.abandoned_records > 0 {
        tracing::warn!(
            abandoned_records = report.abandoned_records,
            "Records were abandoned during shutdown"
        );
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
