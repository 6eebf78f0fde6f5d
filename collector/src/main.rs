//! Trisignal Collector Binary
//!
//! Entry point of the telemetry collector.

#![deny(unsafe_code)]

use anyhow::{Context, Result};
use shared::config::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let path = collector::config_path();
    let config = collector::load_config(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    let json = std::env::var("TRISIGNAL_LOG_FORMAT").map_or(config.service.log_format == LogFormat::Json, |v| {
        v.eq_ignore_ascii_case("json")
    });
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    collector::run_with_config(config).await
}
