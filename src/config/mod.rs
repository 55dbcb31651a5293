//! Typed configuration.
//!
//! Connection details and secrets come from environment variables
//! ([`Config::from_env`]); pipeline tuning comes from a TOML file
//! ([`Settings::load`]). Telemetry reads its own variables
//! ([`crate::telemetry::TelemetryConfig::from_env`]). Both load once at startup and fail fast.

pub mod settings;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub use settings::{
    ControllerSettings, LaunchMode, ModelSettings, PopulationSettings, Settings, WorkerSettings,
};

#[derive(Debug)]
pub struct Config {
    /// Queue database.
    pub database_url: SecretString,
    /// Source feed database. Defaults to the queue database.
    pub source_database_url: SecretString,
    /// Base URL of the inference endpoint.
    pub ollama_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let database_url = required_var("DATABASE_URL")?;
        let source_database_url =
            std::env::var("SOURCE_DATABASE_URL").unwrap_or_else(|_| database_url.clone());
        Ok(Self {
            database_url: SecretString::from(database_url),
            source_database_url: SecretString::from(source_database_url),
            ollama_url: std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
