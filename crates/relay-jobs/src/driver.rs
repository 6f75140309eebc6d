//! Driver selection and the startup durability check.

use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::lock::LockService;
use crate::memory::InMemoryDriver;
use crate::queue::{DriverKind, QueueDriver};
use crate::redis::{create_pool, RedisDriver, RedisDriverSettings, RedisKeys, RedisLockBackend};
use crate::retry::BackoffResolver;
use std::sync::Arc;
use tracing::{info, warn};

/// Queue driver and cycle lock service chosen at startup.
#[derive(Clone)]
pub struct Backend {
    /// Queue driver.
    pub driver: Arc<dyn QueueDriver>,
    /// Cycle lock service on the same backend.
    pub locks: LockService,
    /// Running in-memory although a durable broker was wanted.
    pub degraded: bool,
}

impl Backend {
    /// Process-local backend.
    pub fn in_memory(degraded: bool) -> Self {
        Self {
            driver: Arc::new(InMemoryDriver::new()),
            locks: LockService::in_memory(),
            degraded,
        }
    }

    /// Driver kind.
    pub fn kind(&self) -> DriverKind {
        self.driver.kind()
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// Pick the queue driver.
///
/// With `redis_url` set, connects and `PING`s Redis. Without it, or when
/// Redis is unreachable, falls back to the in-memory engine unless
/// `require_durable` is set; `allow_in_memory_fallback` lets a required
/// durable driver degrade anyway. A refused fallback is
/// [`JobError::DriverUnavailable`].
pub async fn connect_driver(config: &JobsConfig) -> JobResult<Backend> {
    let driver = &config.driver;
    let must_be_durable = driver.require_durable && !driver.allow_in_memory_fallback;

    let failure = match driver.redis_url.as_deref() {
        None => "jobs.driver.redis_url is not set".to_string(),
        Some(_) => match create_pool(driver).await {
            Ok(pool) => {
                let keys = RedisKeys::new(&driver.key_prefix);
                let queue = RedisDriver::new(
                    pool.clone(),
                    keys.clone(),
                    BackoffResolver::new(),
                    RedisDriverSettings::from_config(config),
                );
                info!(key_prefix = %driver.key_prefix, "Using Redis queue driver");
                return Ok(Backend {
                    driver: Arc::new(queue),
                    locks: LockService::new(Arc::new(RedisLockBackend::new(pool, keys))),
                    degraded: false,
                });
            }
            Err(e) => e.to_string(),
        },
    };

    if must_be_durable {
        return Err(JobError::DriverUnavailable(format!(
            "durable queue driver required: {}",
            failure
        )));
    }

    let degraded = driver.require_durable || driver.redis_url.is_some();
    if degraded {
        warn!(reason = %failure, "Durable queue driver unavailable, running in-memory");
    } else {
        info!("Using in-memory queue driver");
    }

    Ok(Backend::in_memory(degraded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_without_url() {
        let backend = connect_driver(&JobsConfig::default()).await.unwrap();
        assert_eq!(backend.kind(), DriverKind::InMemory);
        assert!(!backend.degraded);
    }

    #[tokio::test]
    async fn test_required_durable_refuses_fallback() {
        let mut config = JobsConfig::default();
        config.driver.require_durable = true;

        let err = connect_driver(&config).await.unwrap_err();
        assert!(matches!(err, JobError::DriverUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fallback_override_degrades() {
        let mut config = JobsConfig::default();
        config.driver.require_durable = true;
        config.driver.allow_in_memory_fallback = true;

        let backend = connect_driver(&config).await.unwrap();
        assert_eq!(backend.kind(), DriverKind::InMemory);
        assert!(backend.degraded);
    }

    #[tokio::test]
    async fn test_unreachable_redis_required() {
        let mut config = JobsConfig::default();
        config.driver.redis_url = Some("redis://127.0.0.1:1".into());
        config.driver.connect_timeout_secs = 1;
        config.driver.require_durable = true;

        let err = connect_driver(&config).await.unwrap_err();
        assert!(matches!(err, JobError::DriverUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_redis_optional_degrades() {
        let mut config = JobsConfig::default();
        config.driver.redis_url = Some("redis://127.0.0.1:1".into());
        config.driver.connect_timeout_secs = 1;

        let backend = connect_driver(&config).await.unwrap();
        assert_eq!(backend.kind(), DriverKind::InMemory);
        assert!(backend.degraded);
    }
}
