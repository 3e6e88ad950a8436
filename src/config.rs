//! Broker configuration.
//!
//! Holds the knobs consumed by the broker: the queue store URL, the
//! blocking-pop timeout, and the deprecated cap on total concurrent
//! workers. Per-type concurrency travels with the workers list itself,
//! since it carries the execution engines.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a broker instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis connection URL for the shared queue store.
    pub redis_url: String,
    /// Timeout of one blocking pop attempt in the poll loops.
    pub poll_timeout: Duration,
    /// Deprecated cap on total concurrent executions across all pools.
    /// `None` leaves concurrency bounded per worker type only.
    pub nb_workers: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            poll_timeout: Duration::from_secs(10),
            nb_workers: None,
        }
    }
}

impl BrokerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBS_REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `JOBS_POLL_TIMEOUT_SECS`: blocking-pop timeout in seconds (default: 10)
    /// - `JOBS_NB_WORKERS`: deprecated global worker cap (default: unset)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("JOBS_REDIS_URL") {
            config.redis_url = url;
        }

        if let Ok(secs) = std::env::var("JOBS_POLL_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| ConfigError::InvalidValue {
                key: "JOBS_POLL_TIMEOUT_SECS".to_string(),
                message: format!("'{secs}' is not a number of seconds"),
            })?;
            config.poll_timeout = Duration::from_secs(secs);
        }

        if let Ok(slots) = std::env::var("JOBS_NB_WORKERS") {
            let slots: usize = slots.parse().map_err(|_| ConfigError::InvalidValue {
                key: "JOBS_NB_WORKERS".to_string(),
                message: format!("'{slots}' is not a worker count"),
            })?;
            config.nb_workers = Some(slots);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url must not be empty".to_string(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_timeout must be at least one second".to_string(),
            ));
        }
        if self.nb_workers == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "nb_workers must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = BrokerConfig::default();

        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.poll_timeout, Duration::from_secs(10));
        assert!(config.nb_workers.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = BrokerConfig {
            redis_url: String::new(),
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BrokerConfig {
            nb_workers: Some(0),
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BrokerConfig {
            poll_timeout: Duration::ZERO,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "JOBS_NB_WORKERS".to_string(),
            message: "'abc' is not a worker count".to_string(),
        };
        assert!(err.to_string().contains("JOBS_NB_WORKERS"));
        assert!(err.to_string().contains("abc"));
    }
}
