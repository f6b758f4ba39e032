//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Engine tuning comes from an optional TOML file named by `MASTERY_CONFIG`.

pub mod engine;

pub use engine::{
    BatchConfig, BreakerConfig, CohortConfig, EngineConfig, IngestConfig, PredictorConfig,
    RecommendConfig, RetryConfig,
};

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Deployment label attached to exported telemetry.
    pub environment: Option<String>,
    pub engine_config_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            environment: std::env::var("MASTERY_ENV").ok(),
            engine_config_path: std::env::var("MASTERY_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// Engine tuning: the TOML file if one is configured, defaults otherwise.
    pub fn engine(&self) -> Result<EngineConfig> {
        match self.engine_config_path {
            Some(ref path) => EngineConfig::load(path),
            None => Ok(EngineConfig::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
