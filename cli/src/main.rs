//! Trisignal CLI
//!
//! Command-line interface for operating the Trisignal collector.
//!
//! # Usage
//!
//! ```bash
//! trisignal --help
//! trisignal validate --config trisignal.toml
//! trisignal health --url http://localhost:8888
//! trisignal run --config trisignal.toml
//! ```

#![deny(unsafe_code)]

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Trisignal CLI - telemetry collector command-line interface
#[derive(Parser)]
#[command(name = "trisignal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration document
    Validate {
        /// Configuration file
        #[arg(short, long, env = "TRISIGNAL_CONFIG", default_value = collector::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Check collector readiness
    Health {
        /// Service URL of the collector
        #[arg(short, long, env = "TRISIGNAL_SERVICE_URL", default_value = "http://localhost:8888")]
        url: String,
    },
    /// Run the collector in the foreground
    Run {
        /// Configuration file
        #[arg(short, long, env = "TRISIGNAL_CONFIG", default_value = collector::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

/// Loads and checks the document, returning every problem found.
fn validate(path: &Path) -> anyhow::Result<Vec<String>> {
    let config = collector::load_config(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    Ok(config.check().err().map(|e| e.problems).unwrap_or_default())
}

async fn health(url: &str) -> anyhow::Result<()> {
    let endpoint = format!("{}/health/ready", url.trim_end_matches('/'));
    let response = reqwest::get(&endpoint)
        .await
        .with_context(|| format!("failed to reach {endpoint}"))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("invalid readiness response")?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("collector is not ready ({status})");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Validate { config }) => {
            let problems = validate(&config)?;
            if problems.is_empty() {
                println!("{}: configuration is valid", config.display());
            } else {
                for problem in &problems {
                    println!("  - {problem}");
                }
                bail!("{}: {} problem(s) found", config.display(), problems.len());
            }
        }
        Some(Commands::Health { url }) => {
            println!("Checking readiness of Trisignal collector at {url}...");
            health(&url).await?;
        }
        Some(Commands::Run { config }) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .init();
            let document = collector::load_config(&config)
                .with_context(|| format!("failed to load configuration from {}", config.display()))?;
            tracing::info!(path = %config.display(), "Configuration loaded");
            collector::run_with_config(document).await?;
        }
        None => {
            println!("Trisignal CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Use --help for usage information");
        }
    }

    Ok(())
}
