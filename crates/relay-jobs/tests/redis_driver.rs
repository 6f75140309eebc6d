//! Integration tests for the Redis driver and cycle lock.
//!
//! These tests run against a real Redis using testcontainers.
//! Requires Docker; run with `--ignored`.

use relay_jobs::config::DriverConfig;
use relay_jobs::prelude::*;
use relay_jobs::redis::{create_pool, RedisDriver, RedisDriverSettings, RedisKeys, RedisLockBackend};
use relay_jobs::{
    with_heartbeat, BackoffOptions, BackoffResolver, HeartbeatOptions, JobContext, LockService,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::{Redis, REDIS_PORT};
use uuid::Uuid;

/// Redis container plus a pool on it.
struct TestRedis {
    _container: ContainerAsync<Redis>,
    pool: deadpool_redis::Pool,
}

impl TestRedis {
    async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");
        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("Failed to get Redis port");

        let config = DriverConfig {
            redis_url: Some(format!("redis://127.0.0.1:{port}")),
            pool_size: 8,
            ..DriverConfig::default()
        };
        let pool = create_pool(&config).await.expect("Failed to connect to Redis");

        Self {
            _container: container,
            pool,
        }
    }

    /// A driver with its own key prefix, polling fast.
    fn driver(&self, lock_duration: Duration) -> RedisDriver {
        self.driver_with_window(lock_duration, 100)
    }

    fn driver_with_window(&self, lock_duration: Duration, scan_window: usize) -> RedisDriver {
        RedisDriver::new(
            self.pool.clone(),
            RedisKeys::new(format!("test-{}", Uuid::new_v4())),
            BackoffResolver::new(),
            RedisDriverSettings {
                poll_interval: Duration::from_millis(20),
                stalled_check_interval: Duration::from_millis(100),
                lock_duration,
                scan_window,
            },
        )
    }
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cycle_lock_single_winner() {
    let redis = TestRedis::new().await;
    let keys = RedisKeys::new(format!("test-{}", Uuid::new_v4()));
    let replica_a = LockService::new(Arc::new(RedisLockBackend::new(redis.pool.clone(), keys.clone())));
    let replica_b = LockService::new(Arc::new(RedisLockBackend::new(redis.pool.clone(), keys)));

    let ttl = Duration::from_secs(30);
    let (a, b) = tokio::join!(
        replica_a.acquire_lock("scheduler:us", ttl),
        replica_b.acquire_lock("scheduler:us", ttl)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_some() ^ b.is_some());

    let held = a.or(b).unwrap();
    assert!(held.renew(ttl).await.unwrap());
    held.release().await;
    held.release().await;

    assert!(replica_a.acquire_lock("scheduler:us", ttl).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_jobs_complete_with_group_cap() {
    let redis = TestRedis::new().await;
    let driver = redis.driver(Duration::from_secs(30));

    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let proc = {
        let active = active.clone();
        let max_active = max_active.clone();
        processor(move |_, _| {
            let active = active.clone();
            let max_active = max_active.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    driver
        .create_worker(
            "workflows",
            with_heartbeat(proc, HeartbeatOptions::default()),
            WorkerOptions::new(3).with_group_concurrency(1),
        )
        .await
        .unwrap();

    for _ in 0..3 {
        driver
            .add("workflows", serde_json::json!({}), JobOptions::default().group("orgA"))
            .await
            .unwrap();
    }

    let driver = &driver;
    let done = wait_until(Duration::from_secs(10), move || async move {
        driver.get_job_counts("workflows").await.unwrap().completed == 3
    })
    .await;
    assert!(done);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    driver.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_saturated_group_does_not_hide_later_jobs() {
    let redis = TestRedis::new().await;
    // Five capped jobs ahead of the one that fits span three scan windows.
    let driver = redis.driver_with_window(Duration::from_secs(30), 2);

    let release = Arc::new(tokio::sync::Notify::new());
    let proc = {
        let release = release.clone();
        processor(move |_, ctx: JobContext| {
            let release = release.clone();
            async move {
                if ctx.group_id.as_deref() == Some("orgA") {
                    release.notified().await;
                }
                Ok(())
            }
        })
    };
    driver
        .create_worker(
            "workflows",
            proc,
            WorkerOptions::new(2).with_group_concurrency(1),
        )
        .await
        .unwrap();

    for _ in 0..5 {
        driver
            .add("workflows", serde_json::json!({}), JobOptions::default().group("orgA"))
            .await
            .unwrap();
    }
    let late = driver
        .add("workflows", serde_json::json!({}), JobOptions::default().group("orgB"))
        .await
        .unwrap();

    let driver = &driver;
    let late_id = &late.id;
    let done = wait_until(Duration::from_secs(10), move || async move {
        driver
            .get_job("workflows", late_id)
            .await
            .unwrap()
            .is_some_and(|job| job.status == JobStatus::Completed)
    })
    .await;
    assert!(done);

    let counts = driver.get_job_counts("workflows").await.unwrap();
    assert_eq!(counts.active, 1);
    assert_eq!(counts.waiting, 4);
    assert_eq!(counts.completed, 1);

    release.notify_waiters();
    driver.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_retry_then_permanent_failure() {
    let redis = TestRedis::new().await;
    let driver = redis.driver(Duration::from_secs(30));
    let calls = Arc::new(AtomicUsize::new(0));

    let proc = {
        let calls = calls.clone();
        processor(move |_, _| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(JobError::failed("upstream down"))
            }
        })
    };
    driver.create_worker("flaky", proc, WorkerOptions::new(1)).await.unwrap();

    let job = driver
        .add(
            "flaky",
            serde_json::json!({}),
            JobOptions::default().attempts(2).backoff(BackoffOptions::fixed(100)),
        )
        .await
        .unwrap();

    let driver = &driver;
    let failed = wait_until(Duration::from_secs(10), move || async move {
        driver.get_job_counts("flaky").await.unwrap().failed == 1
    })
    .await;
    assert!(failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stored = driver.get_job("flaky", &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts_made, 2);

    driver.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_expired_lock_requeues_without_consuming_attempt() {
    let redis = TestRedis::new().await;
    // Short lock and no heartbeat: the first run's lock lapses mid-job.
    let driver = redis.driver(Duration::from_millis(200));
    let calls = Arc::new(AtomicUsize::new(0));

    let proc = {
        let calls = calls.clone();
        processor(move |_, ctx| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(600)).await;
                }
                assert_eq!(ctx.attempt, 1);
                Ok(())
            }
        })
    };
    driver.create_worker("stalls", proc, WorkerOptions::new(2)).await.unwrap();

    driver
        .add("stalls", serde_json::json!({}), JobOptions::default().attempts(1))
        .await
        .unwrap();

    let driver = &driver;
    let calls = &calls;
    let redelivered = wait_until(Duration::from_secs(5), move || async move {
        calls.load(Ordering::SeqCst) >= 2
    })
    .await;
    assert!(redelivered);

    let settled = wait_until(Duration::from_secs(5), move || async move {
        driver.get_job_counts("stalls").await.unwrap().completed == 1
    })
    .await;
    assert!(settled);

    // The stale first run must not settle the job a second time.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let counts = driver.get_job_counts("stalls").await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 0);

    driver.close().await.unwrap();
}
