//! Redis cycle lock backend.

use super::{scripts, RedisKeys};
use crate::error::JobResult;
use crate::lock::LockBackend;
use async_trait::async_trait;
use deadpool_redis::Pool;
use std::time::Duration;

/// [`LockBackend`] on `SET NX PX` with token-checked renew and release.
pub struct RedisLockBackend {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisLockBackend {
    /// Backend over `pool`, namespacing keys with `keys`.
    pub fn new(pool: Pool, keys: RedisKeys) -> Self {
        Self { pool, keys }
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> JobResult<bool> {
        let mut conn = self.pool.get().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(resource))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(result.is_some())
    }

    async fn renew(&self, resource: &str, token: &str, ttl: Duration) -> JobResult<bool> {
        let mut conn = self.pool.get().await?;
        let renewed: i32 = redis::Script::new(scripts::COMPARE_AND_PEXPIRE)
            .key(self.keys.lock(resource))
            .arg(token)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut *conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, resource: &str, token: &str) -> JobResult<bool> {
        let mut conn = self.pool.get().await?;
        let released: i32 = redis::Script::new(scripts::COMPARE_AND_DELETE)
            .key(self.keys.lock(resource))
            .arg(token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_ms_has_floor() {
        assert_eq!(ttl_ms(Duration::ZERO), 1);
        assert_eq!(ttl_ms(Duration::from_secs(30)), 30_000);
    }
}
