//! Dispatch, concurrency and retry behaviour of the in-memory engine.

mod common;

use common::{advance, drain, ConcurrencyTracker};
use futures::future::BoxFuture;
use relay_jobs::kinds::WorkflowExecution;
use relay_jobs::prelude::*;
use relay_jobs::{BackoffOptions, JobData, JobLock, JobLockExtender, Processor};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::assert_ok;

fn tracked_processor(tracker: Arc<ConcurrencyTracker>, work_ms: u64) -> Processor {
    processor(move |job, ctx| {
        let tracker = tracker.clone();
        async move {
            let group = ctx.group_id.clone().unwrap_or_default();
            let label = job.payload["label"].as_str().unwrap_or_default().to_string();
            tracker.enter(&group, &label);
            tokio::time::sleep(Duration::from_millis(work_ms)).await;
            tracker.exit(&group);
            Ok(())
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_group_cap_isolates_noisy_tenant() {
    let driver = InMemoryDriver::new();
    let tracker = Arc::new(ConcurrencyTracker::default());
    driver
        .create_worker(
            "workflows",
            tracked_processor(tracker.clone(), 100),
            WorkerOptions::new(3).with_group_concurrency(1),
        )
        .await
        .unwrap();

    for n in 1..=3 {
        driver
            .add(
                "workflows",
                serde_json::json!({ "label": format!("a{n}") }),
                JobOptions::default().group("orgA"),
            )
            .await
            .unwrap();
    }
    driver
        .add(
            "workflows",
            serde_json::json!({ "label": "b1" }),
            JobOptions::default().group("orgB"),
        )
        .await
        .unwrap();
    drain().await;

    let counts = driver.get_job_counts("workflows").await.unwrap();
    assert_eq!(counts.active, 2);
    assert_eq!(counts.waiting, 2);
    assert_eq!(tracker.started(), ["a1", "b1"]);

    advance(350).await;

    let counts = driver.get_job_counts("workflows").await.unwrap();
    assert_eq!(counts.completed, 4);
    assert_eq!(tracker.max_in_group("orgA"), 1);
    assert_eq!(tracker.max_in_group("orgB"), 1);
    assert_eq!(tracker.started(), ["a1", "b1", "a2", "a3"]);
}

#[tokio::test(start_paused = true)]
async fn test_caps_hold_under_mixed_load() {
    let driver = InMemoryDriver::new();
    let tracker = Arc::new(ConcurrencyTracker::default());
    driver
        .create_worker(
            "mixed",
            tracked_processor(tracker.clone(), 25),
            WorkerOptions::new(4).with_group_concurrency(2),
        )
        .await
        .unwrap();

    let groups = ["org-1", "org-2", "org-3"];
    for n in 0..30 {
        let group = groups[n % groups.len()];
        driver
            .add(
                "mixed",
                serde_json::json!({ "label": format!("{group}-{n}") }),
                JobOptions::default().group(group),
            )
            .await
            .unwrap();

        for snapshot in driver.worker_snapshots() {
            assert!(snapshot.active_jobs <= snapshot.concurrency);
            assert!(snapshot.active_groups.values().all(|c| *c <= snapshot.group_concurrency));
        }
    }

    for _ in 0..40 {
        advance(10).await;
        for snapshot in driver.worker_snapshots() {
            assert!(snapshot.active_jobs <= 4);
            assert!(snapshot.active_groups.values().all(|c| *c <= 2));
        }
    }

    let counts = driver.get_job_counts("mixed").await.unwrap();
    assert_eq!(counts.completed, 30);
    assert_eq!(counts.waiting + counts.active + counts.delayed, 0);
    assert_eq!(tracker.max_active(), 4);
    for group in groups {
        assert_eq!(tracker.max_in_group(group), 2);
    }
}

#[tokio::test(start_paused = true)]
async fn test_saturated_group_does_not_block_others() {
    let driver = InMemoryDriver::new();
    let tracker = Arc::new(ConcurrencyTracker::default());

    for n in 0..5 {
        driver
            .add(
                "q",
                serde_json::json!({ "label": format!("a{n}") }),
                JobOptions::default().group("busy"),
            )
            .await
            .unwrap();
    }
    driver
        .add("q", serde_json::json!({ "label": "quiet" }), JobOptions::default().group("quiet"))
        .await
        .unwrap();

    driver
        .create_worker(
            "q",
            tracked_processor(tracker.clone(), 100),
            WorkerOptions::new(2).with_group_concurrency(1),
        )
        .await
        .unwrap();
    drain().await;

    assert_eq!(tracker.started(), ["a0", "quiet"]);

    advance(550).await;
    assert_eq!(driver.get_job_counts("q").await.unwrap().completed, 6);
}

#[tokio::test(start_paused = true)]
async fn test_fixed_backoff_requeues_after_delay() {
    let driver = InMemoryDriver::new();
    let calls = Arc::new(AtomicU32::new(0));
    let attempts_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let started = Instant::now();
    let run_times = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let proc = {
        let calls = calls.clone();
        let attempts_seen = attempts_seen.clone();
        let run_times = run_times.clone();
        processor(move |_, ctx| {
            let calls = calls.clone();
            let attempts_seen = attempts_seen.clone();
            let run_times = run_times.clone();
            async move {
                attempts_seen.lock().push(ctx.attempt);
                run_times.lock().push(started.elapsed());
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(JobError::failed("flaky upstream"))
                } else {
                    Ok(())
                }
            }
        })
    };
    driver.create_worker("retry", proc, WorkerOptions::new(1)).await.unwrap();

    let job = driver
        .add(
            "retry",
            serde_json::json!({}),
            JobOptions::default().attempts(3).backoff(BackoffOptions::fixed(100)),
        )
        .await
        .unwrap();
    drain().await;

    let parked = driver.get_job("retry", &job.id).await.unwrap().unwrap();
    assert_eq!(parked.status, JobStatus::Delayed);
    assert_eq!(parked.attempts_made, 1);
    assert_eq!(driver.get_job_counts("retry").await.unwrap().delayed, 1);

    advance(90).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    advance(20).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let done = driver.get_job("retry", &job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts_made, 1);
    assert_eq!(attempts_seen.lock().as_slice(), [1, 2]);

    let times = run_times.lock().clone();
    assert!(times[1] - times[0] >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_attempts_never_exceed_max() {
    let driver = InMemoryDriver::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let proc = {
        let calls = calls.clone();
        processor(move |job, _| {
            let calls = calls.clone();
            async move {
                assert!(job.attempts_made < job.max_attempts);
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(JobError::failed("always"))
            }
        })
    };
    driver.create_worker("doomed", proc, WorkerOptions::new(1)).await.unwrap();

    let job = driver
        .add(
            "doomed",
            serde_json::json!({}),
            JobOptions::default().attempts(3).backoff(BackoffOptions::exponential(10)),
        )
        .await
        .unwrap();

    advance(100).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let failed = driver.get_job("doomed", &job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts_made, failed.max_attempts);
    assert!(failed.failed_reason.unwrap().contains("always"));

    let counts = driver.get_job_counts("doomed").await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.completed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_typed_kind_runs_grouped_by_organization() {
    let driver = InMemoryDriver::new();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let proc = {
        let seen = seen.clone();
        typed_processor::<WorkflowExecution, _, _>(move |run, ctx| {
            let seen = seen.clone();
            async move {
                seen.lock().push((run.execution_id, ctx.group_id));
                Ok(())
            }
        })
    };
    driver
        .create_worker(WorkflowExecution::QUEUE, proc, WorkerOptions::new(2))
        .await
        .unwrap();

    let run = WorkflowExecution {
        organization_id: "org-7".into(),
        workflow_id: "wf".into(),
        execution_id: "ex-1".into(),
        input: serde_json::json!({ "order": 42 }),
    };
    let job = assert_ok!(driver.add_job(&run, JobOptions::default()).await);
    assert_eq!(job.group_id(), Some("org-7"));
    drain().await;

    assert_eq!(
        seen.lock().as_slice(),
        [("ex-1".to_string(), Some("org-7".to_string()))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_group_key_resolver_overrides_job_group() {
    let driver = InMemoryDriver::new();
    let tracker = Arc::new(ConcurrencyTracker::default());
    let options = WorkerOptions::new(4)
        .with_group_concurrency(1)
        .group_key(|job| job.payload["tenant"].as_str().map(str::to_string));

    let proc = {
        let tracker = tracker.clone();
        processor(move |job, _| {
            let tracker = tracker.clone();
            async move {
                let tenant = job.payload["tenant"].as_str().unwrap_or_default().to_string();
                tracker.enter(&tenant, &tenant);
                tokio::time::sleep(Duration::from_millis(50)).await;
                tracker.exit(&tenant);
                Ok(())
            }
        })
    };
    driver.create_worker("resolved", proc, options).await.unwrap();

    for _ in 0..3 {
        driver
            .add("resolved", serde_json::json!({ "tenant": "t-1" }), JobOptions::default())
            .await
            .unwrap();
    }
    drain().await;
    assert_eq!(driver.get_job_counts("resolved").await.unwrap().active, 1);

    advance(200).await;
    assert_eq!(driver.get_job_counts("resolved").await.unwrap().completed, 3);
    assert_eq!(tracker.max_in_group("t-1"), 1);
}

struct RefusingExtender {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl JobLockExtender for RefusingExtender {
    async fn extend_lock(
        &self,
        _job_id: &JobId,
        _token: &str,
        _duration: Duration,
    ) -> JobResult<chrono::DateTime<chrono::Utc>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(JobError::LockLost("token mismatch".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_job_fails_with_heartbeat_timeout() {
    let driver = InMemoryDriver::new();
    let extender = Arc::new(RefusingExtender {
        calls: AtomicUsize::new(0),
    });

    let stalled = processor(|_, _| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<(), JobError>(())
    });
    let wrapped = with_heartbeat(
        stalled,
        HeartbeatOptions::default()
            .interval(Duration::from_millis(500))
            .timeout(Duration::from_millis(1000)),
    );
    let locked: Processor = {
        let extender = extender.clone();
        Arc::new(move |job: JobData, mut ctx: JobContext| -> BoxFuture<'static, JobResult<()>> {
            ctx.lock = Some(JobLock::new("token", extender.clone()));
            wrapped(job, ctx)
        })
    };
    driver.create_worker("stalls", locked, WorkerOptions::new(1)).await.unwrap();

    let job = driver
        .add("stalls", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();

    advance(1600).await;

    let failed = driver.get_job("stalls", &job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.failed_reason.unwrap().contains("Heartbeat timeout"));

    let calls_at_detection = extender.calls.load(Ordering::SeqCst);
    assert_eq!(calls_at_detection, 2);
    advance(5000).await;
    assert_eq!(extender.calls.load(Ordering::SeqCst), calls_at_detection);
}
