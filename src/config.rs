//! Environment-driven configuration for the PII scanning server.
//!
//! This module loads and validates settings once at startup (via `init_config`) and exposes
//! a global, read-only view through `get_config`. The configuration covers:
//!
//! - Policy store connectivity (`DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`, `DB_PASSWORD`).
//! - Model access (`ML_API_KEY?` for deployments that fetch weights remotely).
//! - Detector roster defaults (`MULTI_DETECTOR_ENABLED?`, `MULTI_DETECTOR_MODELS?`).
//! - Surface options (`ENABLE_REFLECTION?`, `SERVER_PORT?`).
//! - On-disk policy location (`PII_CONFIG_DIR?`, default `config`).
//!
//! Everything has a sensible default; invalid values are flagged early with
//! descriptive errors so misconfiguration is easy to diagnose. Detection
//! thresholds and chunking parameters live in the TOML baseline, not here —
//! they are policy, not process configuration.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the scanning server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Policy store host.
    pub db_host: String,
    /// Policy store port.
    pub db_port: u16,
    /// Policy store database name.
    pub db_name: String,
    /// Policy store user.
    pub db_user: String,
    /// Policy store password, if the store requires one.
    pub db_password: Option<String>,
    /// API key for remote model weight fetches, if any.
    pub ml_api_key: Option<String>,
    /// Whether every configured model participates (false keeps only the
    /// highest-priority one).
    pub multi_detector_enabled: bool,
    /// Optional override of the model id roster, comma-separated.
    pub multi_detector_models: Option<Vec<String>>,
    /// Expose the machine-readable command catalog.
    pub enable_reflection: bool,
    /// Directory holding `detection.toml` and `models/`.
    pub config_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
            db_host: load_env_or("DB_HOST", "postgres"),
            db_port: load_env_optional("DB_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("DB_PORT".into()))
                })
                .transpose()?
                .unwrap_or(5432),
            db_name: load_env_or("DB_NAME", "pii"),
            db_user: load_env_or("DB_USER", "postgres"),
            db_password: load_env_optional("DB_PASSWORD"),
            ml_api_key: load_env_optional("ML_API_KEY"),
            multi_detector_enabled: load_bool_with_default("MULTI_DETECTOR_ENABLED", true)?,
            multi_detector_models: load_env_optional("MULTI_DETECTOR_MODELS").map(|value| {
                value
                    .split(',')
                    .map(|model| model.trim().to_string())
                    .filter(|model| !model.is_empty())
                    .collect()
            }),
            enable_reflection: load_bool_with_default("ENABLE_REFLECTION", false)?,
            config_dir: PathBuf::from(load_env_or("PII_CONFIG_DIR", "config")),
        })
    }
}

fn load_bool_with_default(key: &str, default: bool) -> Result<bool, ConfigError> {
    match load_env_optional(key) {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
        None => Ok(default),
    }
}

fn load_env_or(key: &str, default: &str) -> String {
    load_env_optional(key).unwrap_or_else(|| default.to_string())
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        db_host = %config.db_host,
        db_port = config.db_port,
        db_name = %config.db_name,
        server_port = ?config.server_port,
        multi_detector_enabled = config.multi_detector_enabled,
        enable_reflection = config.enable_reflection,
        config_dir = %config.config_dir.display(),
        has_ml_api_key = config.ml_api_key.is_some(),
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
