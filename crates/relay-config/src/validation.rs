//! Configuration validation module.
//!
//! Collects every problem in one pass so a bad deployment fails fast with
//! the full list instead of one error per restart.

use crate::AppConfig;
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Rejected by the execution core's own checks.
    Jobs(String),
    /// Value must be at least 1.
    Zero { name: String },
    /// Value must not be blank.
    Empty { name: String },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: usize, maximum: usize },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Timeout value must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// The lock would expire before it is renewed.
    RenewNotBelowLock { renew_ms: u64, lock_ms: u64 },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jobs(message) => write!(f, "{}", message),
            Self::Zero { name } => write!(f, "'{}' must be at least 1", name),
            Self::Empty { name } => write!(f, "'{}' must not be empty", name),
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(
                    f,
                    "Pool size {} exceeds maximum allowed ({})",
                    value, maximum
                )
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::RenewNotBelowLock { renew_ms, lock_ms } => {
                write!(
                    f,
                    "Lock renew time ({}ms) must be shorter than lock duration ({}ms)",
                    renew_ms, lock_ms
                )
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: usize = 1000;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = config.jobs.validate() {
            errors.push(ConfigValidationError::Jobs(e.to_string()));
        }
        Self::validate_logging(config, &mut errors);
        Self::validate_driver(&config.jobs.driver, &mut errors);
        Self::validate_worker(&config.jobs.worker, &mut errors);
        Self::validate_heartbeat(&config.jobs.heartbeat, &mut errors);
        Self::validate_queue(&config.jobs.queue, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_logging(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.logging.filter.trim().is_empty() {
            errors.push(ConfigValidationError::Empty {
                name: "logging.filter".to_string(),
            });
        }
    }

    fn validate_driver(config: &relay_jobs::config::DriverConfig, errors: &mut Vec<ConfigValidationError>) {
        if let Some(redis_url) = &config.redis_url {
            match Url::parse(redis_url) {
                Ok(url) if matches!(url.scheme(), "redis" | "rediss") => {}
                Ok(url) => errors.push(ConfigValidationError::InvalidUrl {
                    url_type: "Redis".to_string(),
                    message: format!("unsupported scheme '{}'", url.scheme()),
                }),
                Err(e) => errors.push(ConfigValidationError::InvalidUrl {
                    url_type: "Redis".to_string(),
                    message: e.to_string(),
                }),
            }
        }

        if config.pool_size == 0 {
            errors.push(ConfigValidationError::Zero {
                name: "jobs.driver.pool_size".to_string(),
            });
        } else if config.pool_size > Self::MAX_POOL_SIZE {
            errors.push(ConfigValidationError::PoolSizeTooLarge {
                value: config.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        if config.connect_timeout_secs == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "jobs.driver.connect_timeout_secs".to_string(),
                value: 0,
            });
        }

        if config.key_prefix.trim().is_empty() {
            errors.push(ConfigValidationError::Empty {
                name: "jobs.driver.key_prefix".to_string(),
            });
        }
    }

    fn validate_worker(config: &relay_jobs::config::WorkerConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.poll_interval_ms == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "jobs.worker.poll_interval_ms".to_string(),
                value: 0,
            });
        }
        if config.stalled_check_interval_ms == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "jobs.worker.stalled_check_interval_ms".to_string(),
                value: 0,
            });
        }
    }

    fn validate_heartbeat(config: &relay_jobs::config::HeartbeatConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.lock_duration_ms == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "jobs.heartbeat.lock_duration_ms".to_string(),
                value: 0,
            });
        } else if config.lock_renew_time_ms >= config.lock_duration_ms {
            errors.push(ConfigValidationError::RenewNotBelowLock {
                renew_ms: config.lock_renew_time_ms,
                lock_ms: config.lock_duration_ms,
            });
        }
    }

    fn validate_queue(config: &relay_jobs::config::QueueConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.attempts == 0 {
            errors.push(ConfigValidationError::Zero {
                name: "jobs.queue.attempts".to_string(),
            });
        }
        if let Some(backoff) = &config.backoff {
            if backoff.strategy.trim().is_empty() {
                errors.push(ConfigValidationError::Empty {
                    name: "jobs.queue.backoff.strategy".to_string(),
                });
            }
        }
    }
}

/// Formats validation errors into a human-readable string.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
