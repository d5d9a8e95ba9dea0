//! Pipeline configuration loaded from JSON.
//!
//! ```
//! use collector_core::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json_str(
//!     r#"{"max_concurrency": 4, "rate_limit": {"per_second": 10.0, "burst": 2}}"#,
//! )
//! .unwrap();
//! assert_eq!(config.max_concurrency, Some(4));
//! assert!(config.row_per_line);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::{LimiterError, MAX_CONCURRENCY, RateLimiter};
use crate::pipeline::DEFAULT_QUEUE_CAPACITY;

/// Largest accepted row queue bound.
pub const MAX_QUEUE_CAPACITY: usize = 65_536;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid JSON for [`PipelineConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field has an out-of-range value.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Token bucket settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub per_second: f64,
    /// Requests allowed back to back after idling.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

fn default_row_per_line() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Settings shared by every run of a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Maximum downloads in flight. Unlimited when absent.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Download pacing. Unpaced when absent.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Inferred loaders emit one row per line instead of one per artifact.
    #[serde(default = "default_row_per_line")]
    pub row_per_line: bool,
    /// Bound of the queue between loader and mapper chain.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            rate_limit: None,
            row_per_line: default_row_per_line(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Parses and validates JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown fields and
    /// [`ConfigError::InvalidValue`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`PipelineConfig::from_json_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Checks every field's range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(concurrency) = self.max_concurrency
            && !(1..=MAX_CONCURRENCY).contains(&concurrency)
        {
            return Err(ConfigError::invalid(
                "max_concurrency",
                format!("{concurrency} is outside 1..={MAX_CONCURRENCY}"),
            ));
        }

        if let Some(rate) = self.rate_limit {
            if !(rate.per_second.is_finite() && rate.per_second > 0.0) {
                return Err(ConfigError::invalid(
                    "rate_limit.per_second",
                    format!("{} must be a positive number", rate.per_second),
                ));
            }
            if rate.burst == 0 {
                return Err(ConfigError::invalid(
                    "rate_limit.burst",
                    "must be at least 1",
                ));
            }
        }

        if !(1..=MAX_QUEUE_CAPACITY).contains(&self.queue_capacity) {
            return Err(ConfigError::invalid(
                "queue_capacity",
                format!("{} is outside 1..={MAX_QUEUE_CAPACITY}", self.queue_capacity),
            ));
        }

        Ok(())
    }

    /// Builds the limiter these settings describe.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the limiter rejects a value.
    pub fn build_limiter(&self) -> Result<RateLimiter, ConfigError> {
        let rate = self.rate_limit.map(|rate| (rate.per_second, rate.burst));
        RateLimiter::new(rate, self.max_concurrency).map_err(|error| {
            let field = match error {
                LimiterError::InvalidRate { .. } => "rate_limit.per_second",
                LimiterError::InvalidBurst { .. } => "rate_limit.burst",
                LimiterError::InvalidConcurrency { .. } | LimiterError::SemaphoreClosed => {
                    "max_concurrency"
                }
            };
            ConfigError::invalid(field, error.to_string())
        })
    }
}
