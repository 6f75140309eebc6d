//! Distributed cycle lock.
//!
//! A short-lived, renewable mutual-exclusion token. Acquisition never
//! blocks: a held lock yields `None` and the caller skips its work.
//! [`LockHandle::release`] is infallible and idempotent, and an unreleased
//! handle releases itself on drop.

use crate::error::JobResult;
use crate::tasks::panic_message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Storage for lock entries.
///
/// Implementations must be safe to call concurrently from many processes
/// and must never wait for a held lock.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take `resource` for `token` if nobody holds it.
    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> JobResult<bool>;

    /// Push expiry out to `ttl` from now if `token` still holds `resource`.
    async fn renew(&self, resource: &str, token: &str, ttl: Duration) -> JobResult<bool>;

    /// Drop `resource` if `token` still holds it.
    async fn release(&self, resource: &str, token: &str) -> JobResult<bool>;
}

/// Hands out [`LockHandle`]s backed by a [`LockBackend`].
#[derive(Clone)]
pub struct LockService {
    backend: Arc<dyn LockBackend>,
}

impl LockService {
    /// Service over `backend`.
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Process-local service.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLockBackend::new()))
    }

    /// Try to take `resource` for `ttl`. Returns `None` when it is held.
    pub async fn acquire_lock(&self, resource: &str, ttl: Duration) -> JobResult<Option<LockHandle>> {
        let token = Uuid::new_v4().to_string();

        if !self.backend.try_acquire(resource, &token, ttl).await? {
            debug!(resource = %resource, "Lock held elsewhere");
            return Ok(None);
        }

        debug!(resource = %resource, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(Some(LockHandle {
            resource: resource.to_string(),
            token,
            expires_at: Mutex::new(expiry(ttl)),
            released: AtomicBool::new(false),
            backend: self.backend.clone(),
        }))
    }
}

impl fmt::Debug for LockService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockService").finish_non_exhaustive()
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}

/// A held lock.
pub struct LockHandle {
    resource: String,
    token: String,
    expires_at: Mutex<DateTime<Utc>>,
    released: AtomicBool,
    backend: Arc<dyn LockBackend>,
}

impl LockHandle {
    /// Locked resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Holder token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Last known expiry.
    pub fn expires_at(&self) -> DateTime<Utc> {
        *self.expires_at.lock()
    }

    /// Returns true once released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Extend the lock to `ttl` from now. Returns false if it was lost.
    pub async fn renew(&self, ttl: Duration) -> JobResult<bool> {
        if self.is_released() {
            return Ok(false);
        }

        let renewed = self.backend.renew(&self.resource, &self.token, ttl).await?;
        if renewed {
            *self.expires_at.lock() = expiry(ttl);
        } else {
            warn!(resource = %self.resource, "Lock lost before renewal");
        }
        Ok(renewed)
    }

    /// Release the lock. Never fails; later calls do nothing.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.backend.release(&self.resource, &self.token).await {
            Ok(true) => debug!(resource = %self.resource, "Lock released"),
            Ok(false) => debug!(resource = %self.resource, "Lock already expired at release"),
            Err(error) => {
                warn!(resource = %self.resource, error = %error, "Lock release failed, it will expire")
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        let resource = std::mem::take(&mut self.resource);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(error) = backend.release(&resource, &token).await {
                warn!(resource = %resource, error = %error, "Lock release on drop failed");
            }
        });
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("expires_at", &self.expires_at())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Run `body` while holding `resource`.
///
/// Returns `Ok(None)` without running `body` when the lock is held
/// elsewhere. The lock is released whether `body` returns or panics; a
/// panic is resumed after release.
pub async fn with_lock<F, Fut, T>(
    service: &LockService,
    resource: &str,
    ttl: Duration,
    body: F,
) -> JobResult<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let Some(lock) = service.acquire_lock(resource, ttl).await? else {
        return Ok(None);
    };

    let outcome = AssertUnwindSafe(body()).catch_unwind().await;
    lock.release().await;

    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(panic) => {
            warn!(resource = %resource, panic = %panic_message(&*panic), "Locked section panicked");
            std::panic::resume_unwind(panic)
        }
    }
}

/// Process-local [`LockBackend`].
///
/// Expiry follows tokio's clock, so paused-time tests can expire locks.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockBackend {
    /// Empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every lock. For test harnesses.
    pub fn reset(&self) {
        self.entries.lock().clear();
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> JobResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some((_, expires)) = entries.get(resource) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(resource.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn renew(&self, resource: &str, token: &str, ttl: Duration) -> JobResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(resource) {
            Some((holder, expires)) if holder == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, token: &str) -> JobResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get(resource) {
            Some((holder, _)) if holder == token => {
                entries.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
