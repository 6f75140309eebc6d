//! Redis-backed queue driver and lock backend.

mod lock;
mod queue;

pub use lock::RedisLockBackend;
pub use queue::{RedisDriver, RedisDriverSettings};

use crate::config::DriverConfig;
use crate::error::{JobError, JobResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool and verify it with `PING`.
pub async fn create_pool(config: &DriverConfig) -> JobResult<Pool> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| JobError::Configuration("jobs.driver.redis_url is not set".to_string()))?;

    info!("Creating Redis connection pool for job queue...");

    let cfg = Config::from_url(url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    let ping = async {
        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok::<(), JobError>(())
    };
    tokio::time::timeout(config.connect_timeout(), ping)
        .await
        .map_err(|_| JobError::DriverUnavailable(format!("Redis did not answer within {:?}", config.connect_timeout())))?
        .map_err(|e| JobError::DriverUnavailable(e.to_string()))?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Known queue names (set).
    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Persisted queue options (string, JSON).
    pub fn options(&self, queue: &str) -> String {
        format!("{}:queue:{}:options", self.prefix, queue)
    }

    /// Waiting job IDs in insertion order (list).
    pub fn waiting(&self, queue: &str) -> String {
        format!("{}:queue:{}:waiting", self.prefix, queue)
    }

    /// Active job IDs (set).
    pub fn active(&self, queue: &str) -> String {
        format!("{}:queue:{}:active", self.prefix, queue)
    }

    /// Delayed job IDs scored by ready time in ms (sorted set).
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.prefix, queue)
    }

    /// Retained completed job IDs, newest first (list).
    pub fn completed(&self, queue: &str) -> String {
        format!("{}:queue:{}:completed", self.prefix, queue)
    }

    /// Retained failed job IDs, newest first (list).
    pub fn failed(&self, queue: &str) -> String {
        format!("{}:queue:{}:failed", self.prefix, queue)
    }

    /// Monotone completed/failed counters (hash).
    pub fn stats(&self, queue: &str) -> String {
        format!("{}:queue:{}:stats", self.prefix, queue)
    }

    /// Prefix shared by job and job lock keys.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    /// Job data (string, JSON).
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Job processing lock (string holding the token, with TTL).
    pub fn job_lock(&self, job_id: &str) -> String {
        format!("{}:job:{}:lock", self.prefix, job_id)
    }

    /// Cycle lock for `resource`.
    pub fn lock(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("relay")
    }
}

/// Lua scripts. Each runs atomically on the server.
pub(crate) mod scripts {
    /// KEYS[1] lock key. ARGV[1] token, ARGV[2] ttl ms.
    pub const COMPARE_AND_PEXPIRE: &str = r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("pexpire", KEYS[1], ARGV[2])
        else
            return 0
        end
    "#;

    /// KEYS[1] lock key. ARGV[1] token.
    pub const COMPARE_AND_DELETE: &str = r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
    "#;

    /// KEYS[1] waiting, KEYS[2] active, KEYS[3] job lock.
    /// ARGV[1] job id, ARGV[2] token, ARGV[3] lock ttl ms.
    pub const CLAIM: &str = r#"
        if redis.call("lrem", KEYS[1], 1, ARGV[1]) == 0 then
            return 0
        end
        redis.call("set", KEYS[3], ARGV[2], "PX", ARGV[3])
        redis.call("sadd", KEYS[2], ARGV[1])
        return 1
    "#;

    /// KEYS[1] delayed, KEYS[2] waiting. ARGV[1] now ms.
    pub const PROMOTE: &str = r#"
        local ready = redis.call("zrangebyscore", KEYS[1], "-inf", ARGV[1])
        for _, id in ipairs(ready) do
            redis.call("zrem", KEYS[1], id)
            redis.call("rpush", KEYS[2], id)
        end
        return #ready
    "#;

    /// KEYS[1] active, KEYS[2] waiting. ARGV[1] job key prefix.
    pub const RECOVER_STALLED: &str = r#"
        local recovered = 0
        for _, id in ipairs(redis.call("smembers", KEYS[1])) do
            if redis.call("exists", ARGV[1] .. id .. ":lock") == 0 then
                redis.call("srem", KEYS[1], id)
                redis.call("rpush", KEYS[2], id)
                recovered = recovered + 1
            end
        end
        return recovered
    "#;

    /// KEYS[1] active, KEYS[2] job, KEYS[3] job lock, KEYS[4] stats,
    /// KEYS[5] delayed, KEYS[6] terminal list.
    /// ARGV[1] job id, ARGV[2] job json, ARGV[3] token, ARGV[4] outcome
    /// ("retry", "completed" or "failed"), ARGV[5] ready-at ms,
    /// ARGV[6] "1" to retain, ARGV[7] keep_last, ARGV[8] job key prefix.
    ///
    /// Returns 0 if the job is no longer active here (the stalled check
    /// handed it to someone else).
    pub const SETTLE: &str = r#"
        if redis.call("srem", KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        if redis.call("get", KEYS[3]) == ARGV[3] then
            redis.call("del", KEYS[3])
        end
        if ARGV[4] == "retry" then
            redis.call("set", KEYS[2], ARGV[2])
            redis.call("zadd", KEYS[5], ARGV[5], ARGV[1])
            return 1
        end
        redis.call("hincrby", KEYS[4], ARGV[4], 1)
        if ARGV[6] == "1" then
            local keep_last = tonumber(ARGV[7])
            redis.call("set", KEYS[2], ARGV[2])
            redis.call("lpush", KEYS[6], ARGV[1])
            for _, old in ipairs(redis.call("lrange", KEYS[6], keep_last, -1)) do
                redis.call("del", ARGV[8] .. old)
            end
            redis.call("ltrim", KEYS[6], 0, keep_last - 1)
        else
            redis.call("del", KEYS[2])
        end
        return 1
    "#;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test");

        assert_eq!(keys.waiting("default"), "test:queue:default:waiting");
        assert_eq!(keys.job("123"), "test:job:123");
        assert_eq!(keys.job_lock("123"), "test:job:123:lock");
        assert_eq!(keys.lock("scheduler:us"), "test:lock:scheduler:us");
    }

    #[test]
    fn test_job_lock_shares_job_prefix() {
        let keys = RedisKeys::default();
        let lock = keys.job_lock("abc");
        assert!(lock.starts_with(&keys.job_prefix()));
        assert_eq!(format!("{}abc:lock", keys.job_prefix()), lock);
    }

    #[tokio::test]
    async fn test_create_pool_requires_url() {
        let err = create_pool(&DriverConfig::default()).await.unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }
}
