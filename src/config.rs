//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimitConfig;

/// Prefix for environment variable overrides, e.g. `TOLLGATE__LIMITER__POINTS`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for a Tollgate deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Default rate limit policy
    pub limiter: RateLimitConfig,

    /// In-memory storage settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Identifiers exempt from limiting
    #[serde(default)]
    pub bypass: Vec<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// In-memory storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Seconds between sweeps of expired entries
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StorageSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl TollgateConfig {
    /// Load configuration from a YAML file, layered with `TOLLGATE__`
    /// environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TollgateError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bypass"),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let loaded: TollgateConfig = settings
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let loaded: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate the limiter policy and storage settings.
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;

        if self.storage.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "storage.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
