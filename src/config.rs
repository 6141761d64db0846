//! Service configuration for processes embedding the rate limiter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimiterError, Result};
use crate::ratelimit::{StoreSettings, DEFAULT_MAX_ATTEMPTS};

/// Prefix for environment variable overrides, e.g. `BUCKETGATE__STORE__MAX_ATTEMPTS`.
pub const ENV_PREFIX: &str = "BUCKETGATE";

/// Main configuration for a rate limiter process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rate limit rules file
    pub config_path: Option<String>,
}

/// Bucket store retry and timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Compare-and-set attempts before the store is reported unavailable
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between attempts in milliseconds
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Timeout for each backend call in milliseconds
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: 0,
            operation_timeout_ms: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl StoreConfig {
    /// Settings for a `TokenBucketStore`.
    pub fn settings(&self) -> StoreSettings {
        StoreSettings {
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            operation_timeout: self.operation_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Load configuration from a file, with environment variable overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading service configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RateLimiterError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| RateLimiterError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RateLimiterError::Config(e.to_string()))
    }
}
