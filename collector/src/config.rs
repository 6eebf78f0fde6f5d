//! Configuration loading.
//!
//! The document is layered: compiled defaults, then the TOML file, then
//! `TRISIGNAL_` prefixed environment variables where `__` separates nesting
//! levels, e.g. `TRISIGNAL_RECEIVERS__HTTP__ADDRESS=127.0.0.1:4318`.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use shared::config::CollectorConfig;
use std::path::{Path, PathBuf};

/// Environment prefix of every override.
pub const ENV_PREFIX: &str = "TRISIGNAL_";

/// Default location of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "trisignal.toml";

/// Path of the configuration document: `TRISIGNAL_CONFIG`, or the default.
#[must_use]
pub fn config_path() -> PathBuf {
    std::env::var_os("TRISIGNAL_CONFIG").map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

/// The provider stack for `path`. A missing file contributes nothing.
#[must_use]
pub fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(CollectorConfig::default()))
        .merge(Toml::file(path))
        .merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(&["config", "log_format"])
                .split("__"),
        )
}

/// Loads the configuration document. The result is not validated yet.
///
/// # Errors
///
/// Returns an error if a layer cannot be parsed or a value has the wrong type.
pub fn load_config(path: &Path) -> Result<CollectorConfig, figment::Error> {
    let config: CollectorConfig = figment(path).extract()?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}
