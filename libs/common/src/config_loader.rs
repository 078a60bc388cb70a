//! Configuration file loading
//!
//! Picks the figment provider from the file extension and layers
//! prefixed environment variables on top.

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Config file must have an extension: {0}")]
    MissingExtension(String),

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to load configuration: {0}")]
    Extract(#[from] Box<figment::Error>),
}

pub type Result<T> = std::result::Result<T, ConfigLoadError>;

/// Build a figment for `path` with `<PREFIX>` environment overrides
///
/// Nested keys use a double underscore: `M3SRV_SCAN__PERIOD_MS=250`.
pub fn figment_for_file(path: &Path, env_prefix: Option<&str>) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ConfigLoadError::MissingExtension(path.display().to_string()))?;

    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()));
    }

    let figment = match extension {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        other => return Err(ConfigLoadError::UnsupportedFormat(other.to_string())),
    };

    Ok(match env_prefix {
        Some(prefix) => figment.merge(Env::prefixed(prefix).split("__")),
        None => figment,
    })
}

/// Load configuration from a specific file
pub fn load_config_from_file<T, P>(path: P, env_prefix: Option<&str>) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    debug!("Loading config: {}", path.display());

    let config = figment_for_file(path, env_prefix)?
        .extract()
        .map_err(|e| ConfigLoadError::Extract(Box::new(e)))?;

    info!("Config loaded: {}", path.display());
    Ok(config)
}
