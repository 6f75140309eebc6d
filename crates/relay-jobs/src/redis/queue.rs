//! Redis queue driver.
//!
//! Queue state lives in Redis so several processes can share queues.
//! Each worker runs a poll loop that promotes due delayed jobs, then claims
//! the first waiting job its group caps allow. A claim atomically moves the
//! job ID to the active set and takes a processing lock with a TTL; the
//! heartbeat wrapper renews that lock through [`JobLockExtender`]. Active
//! jobs whose lock expired are put back in `waiting` by a periodic stalled
//! check without consuming an attempt.

use super::{scripts, RedisKeys};
use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::job::{JobData, JobId, JobLock, JobLockExtender, JobOptions, JobStatus};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::{DriverKind, JobCounts, QueueDriver, QueueOptions};
use crate::retry::BackoffResolver;
use crate::tasks::panic_message;
use crate::worker::{Processor, Worker, WorkerHandle, WorkerOptions, WorkerSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Timing knobs for the Redis driver.
#[derive(Debug, Clone)]
pub struct RedisDriverSettings {
    /// Idle poll period per worker.
    pub poll_interval: Duration,
    /// Period of the stalled-job check.
    pub stalled_check_interval: Duration,
    /// Processing lock TTL.
    pub lock_duration: Duration,
    /// Waiting jobs inspected per claim attempt.
    pub scan_window: usize,
}

impl Default for RedisDriverSettings {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

impl RedisDriverSettings {
    /// Settings from the jobs configuration.
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            poll_interval: config.worker.poll_interval(),
            stalled_check_interval: config.worker.stalled_check_interval(),
            lock_duration: config.heartbeat.lock_duration(),
            scan_window: 100,
        }
    }
}

/// Which terminal or retry transition `settle` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Completed,
    Failed,
    Retry,
}

impl Settlement {
    fn as_str(self) -> &'static str {
        match self {
            Settlement::Completed => "completed",
            Settlement::Failed => "failed",
            Settlement::Retry => "retry",
        }
    }
}

/// Redis-backed [`QueueDriver`].
#[derive(Clone)]
pub struct RedisDriver {
    inner: Arc<RedisInner>,
}

struct RedisInner {
    pool: Pool,
    keys: RedisKeys,
    backoff: BackoffResolver,
    settings: RedisDriverSettings,
    queues: RwLock<HashMap<String, QueueOptions>>,
    workers: RwLock<Vec<Arc<RedisWorker>>>,
    worker_seq: AtomicU64,
    shutdown: CancellationToken,
}

struct RedisWorker {
    id: String,
    queue: String,
    state: Mutex<Worker>,
    wake: Notify,
}

impl RedisDriver {
    /// Driver over `pool`. Starts the stalled-job check.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        pool: Pool,
        keys: RedisKeys,
        backoff: BackoffResolver,
        settings: RedisDriverSettings,
    ) -> Self {
        let inner = Arc::new(RedisInner {
            pool,
            keys,
            backoff,
            settings,
            queues: RwLock::new(HashMap::new()),
            workers: RwLock::new(Vec::new()),
            worker_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(stalled_check_loop(inner.clone()));

        Self { inner }
    }

    /// Requeue active jobs whose processing lock expired.
    pub async fn recover_stalled(&self, queue: &str) -> JobResult<u64> {
        self.inner.recover_stalled(queue).await
    }

    /// Move due delayed jobs of `queue` to `waiting`.
    pub async fn promote_delayed(&self, queue: &str) -> JobResult<u64> {
        self.inner.promote_delayed(queue).await
    }
}

impl RedisInner {
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn lock_ms(&self) -> u64 {
        u64::try_from(self.settings.lock_duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Queue options, cached after the first read.
    async fn queue_options(&self, queue: &str) -> JobResult<QueueOptions> {
        if let Some(options) = self.queues.read().get(queue) {
            return Ok(options.clone());
        }

        let mut conn = self.conn().await?;
        let stored: Option<String> = conn.get(self.keys.options(queue)).await?;
        let options = match stored {
            Some(json) => serde_json::from_str(&json)?,
            None => QueueOptions::default(),
        };
        let _: () = conn.sadd(self.keys.queues(), queue).await?;

        self.queues
            .write()
            .insert(queue.to_string(), options.clone());
        Ok(options)
    }

    fn wake_workers(&self, queue: &str) {
        for worker in self.workers.read().iter().filter(|w| w.queue == queue) {
            worker.wake.notify_one();
        }
    }

    async fn promote_delayed(&self, queue: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let moved: u64 = redis::Script::new(scripts::PROMOTE)
            .key(self.keys.delayed(queue))
            .key(self.keys.waiting(queue))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut *conn)
            .await?;

        if moved > 0 {
            debug!(queue = %queue, count = moved, "Promoted delayed jobs");
        }
        Ok(moved)
    }

    async fn recover_stalled(&self, queue: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let recovered: u64 = redis::Script::new(scripts::RECOVER_STALLED)
            .key(self.keys.active(queue))
            .key(self.keys.waiting(queue))
            .arg(self.keys.job_prefix())
            .invoke_async(&mut *conn)
            .await?;

        if recovered > 0 {
            warn!(queue = %queue, count = recovered, "Recovered stalled jobs");
            self.wake_workers(queue);
        }
        Ok(recovered)
    }

    /// First waiting job whose group fits `worker`, paging through the whole
    /// waiting list `window` ids at a time.
    async fn pick(
        &self,
        conn: &mut deadpool_redis::Connection,
        worker: &RedisWorker,
        window: isize,
    ) -> JobResult<Option<(JobData, Option<String>)>> {
        let queue = worker.queue.as_str();
        let mut start: isize = 0;

        loop {
            let ids: Vec<String> = conn
                .lrange(self.keys.waiting(queue), start, start + window - 1)
                .await?;
            if ids.is_empty() {
                return Ok(None);
            }

            let job_keys: Vec<String> = ids.iter().map(|id| self.keys.job(id)).collect();
            let stored: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&job_keys)
                .query_async(&mut **conn)
                .await?;

            let mut removed: isize = 0;
            for (id, json) in ids.iter().zip(stored) {
                let job = match json.as_deref().map(JobData::from_json) {
                    Some(Ok(job)) => job,
                    Some(Err(e)) => {
                        error!(job_id = %id, error = %e, "Dropping unreadable job");
                        let _: () = conn.lrem(self.keys.waiting(queue), 1, id).await?;
                        removed += 1;
                        continue;
                    }
                    None => {
                        let _: () = conn.lrem(self.keys.waiting(queue), 1, id).await?;
                        removed += 1;
                        continue;
                    }
                };

                let group = {
                    let state = worker.state.lock();
                    let group = state.resolve_group(&job);
                    state.can_process_group(group.as_deref()).then_some(group)
                };
                if let Some(group) = group {
                    return Ok(Some((job, group)));
                }
            }

            let page = isize::try_from(ids.len()).unwrap_or(window);
            if page < window {
                return Ok(None);
            }
            start += page - removed;
        }
    }

    /// Claim and start jobs until the worker is full or nothing fits.
    async fn fill(self: &Arc<Self>, worker: &Arc<RedisWorker>) -> JobResult<()> {
        let queue = worker.queue.as_str();
        self.promote_delayed(queue).await?;

        let mut conn = self.conn().await?;
        let window = isize::try_from(self.settings.scan_window).unwrap_or(100).max(1);

        loop {
            if !worker.state.lock().has_capacity() {
                return Ok(());
            }

            let Some((mut job, group)) = self.pick(&mut conn, worker, window).await? else {
                return Ok(());
            };

            let token = Uuid::new_v4().to_string();
            let claimed: i32 = redis::Script::new(scripts::CLAIM)
                .key(self.keys.waiting(queue))
                .key(self.keys.active(queue))
                .key(self.keys.job_lock(job.id.as_str()))
                .arg(job.id.as_str())
                .arg(&token)
                .arg(self.lock_ms())
                .invoke_async(&mut *conn)
                .await?;
            if claimed == 0 {
                continue;
            }

            {
                let mut state = worker.state.lock();
                state.increment_active_jobs();
                state.mark_group_started(group.as_deref());
                WorkerMetrics::update_active(&worker.id, state.active_jobs());
            }

            // The job is claimed and counted against the worker from here on,
            // so it is always spawned; settling rewrites the record anyway.
            job.status = JobStatus::Active;
            job.processed_at = Some(Utc::now());
            let written: JobResult<()> = async {
                let _: () = conn.set(self.keys.job(job.id.as_str()), job.to_json()?).await?;
                Ok(())
            }
            .await;
            if let Err(e) = written {
                warn!(job_id = %job.id, queue = %queue, error = %e, "Failed to mark job active");
            }

            debug!(
                job_id = %job.id,
                queue = %queue,
                worker_id = %worker.id,
                group = group.as_deref().unwrap_or("-"),
                attempt = job.attempts_made + 1,
                "Dispatching job"
            );
            self.spawn_job(worker.clone(), job, group, token);
        }
    }

    fn spawn_job(
        self: &Arc<Self>,
        worker: Arc<RedisWorker>,
        job: JobData,
        group: Option<String>,
        token: String,
    ) {
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let started = Instant::now();
            let extender: Arc<dyn JobLockExtender> = inner.clone();
            let mut ctx = job.to_context(&worker.id, Some(JobLock::new(token.clone(), extender)));
            ctx.group_id = group.clone();

            let processor = worker.state.lock().processor();
            let run = {
                let job = job.clone();
                async move { processor(job, ctx).await }
            };
            let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(JobError::failed(format!(
                    "processor panicked: {}",
                    panic_message(&*panic)
                ))),
            };

            {
                let mut state = worker.state.lock();
                state.decrement_active_jobs();
                state.mark_group_finished(group.as_deref());
                state.record_outcome(outcome.is_ok());
                WorkerMetrics::update_active(&worker.id, state.active_jobs());
            }

            let job_id = job.id.clone();
            if let Err(e) = inner.settle(job, &token, outcome, started.elapsed()).await {
                error!(job_id = %job_id, error = %e, "Failed to settle job");
            }
            worker.wake.notify_one();
        });
    }

    async fn settle(
        &self,
        mut job: JobData,
        token: &str,
        outcome: JobResult<()>,
        elapsed: Duration,
    ) -> JobResult<()> {
        let queue = job.queue.clone();
        let retention = self.queue_options(&queue).await?.retention;
        let mut ready_at = 0i64;

        let settlement = match &outcome {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.finished_at = Some(Utc::now());
                Settlement::Completed
            }
            Err(error) => {
                job.record_failure(error);
                if error.is_retryable() && !job.is_exhausted() {
                    let delay =
                        self.backoff
                            .resolve(job.opts.backoff.as_ref(), job.attempts_made, error);
                    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                    ready_at = Utc::now().timestamp_millis().saturating_add(delay_ms);
                    job.status = JobStatus::Delayed;
                    Settlement::Retry
                } else {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(Utc::now());
                    Settlement::Failed
                }
            }
        };

        let keep = match settlement {
            Settlement::Completed => retention.keeps(true),
            Settlement::Failed => retention.keeps(false),
            Settlement::Retry => true,
        };
        let terminal = match settlement {
            Settlement::Completed => self.keys.completed(&queue),
            _ => self.keys.failed(&queue),
        };

        let mut conn = self.conn().await?;
        let settled: i32 = redis::Script::new(scripts::SETTLE)
            .key(self.keys.active(&queue))
            .key(self.keys.job(job.id.as_str()))
            .key(self.keys.job_lock(job.id.as_str()))
            .key(self.keys.stats(&queue))
            .key(self.keys.delayed(&queue))
            .key(terminal)
            .arg(job.id.as_str())
            .arg(job.to_json()?)
            .arg(token)
            .arg(settlement.as_str())
            .arg(ready_at)
            .arg(if keep { "1" } else { "0" })
            .arg(retention.keep_last.max(1))
            .arg(self.keys.job_prefix())
            .invoke_async(&mut *conn)
            .await?;

        if settled == 0 {
            warn!(job_id = %job.id, queue = %queue, "Job was requeued by the stalled check before it settled");
            return Ok(());
        }

        match (settlement, outcome) {
            (Settlement::Completed, _) => {
                JobMetrics::job_completed(&queue, elapsed);
                debug!(job_id = %job.id, queue = %queue, "Job completed");
            }
            (Settlement::Retry, Err(error)) => {
                JobMetrics::job_retried(&queue, job.attempts_made);
                warn!(
                    job_id = %job.id,
                    queue = %queue,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    error = %error,
                    "Job failed, scheduling retry"
                );
            }
            (_, Err(error)) => {
                JobMetrics::job_failed(&queue, error.reason(), elapsed);
                warn!(
                    job_id = %job.id,
                    queue = %queue,
                    attempts = job.attempts_made,
                    reason = error.reason(),
                    error = %error,
                    "Job failed permanently"
                );
            }
            (_, Ok(())) => {}
        }

        Ok(())
    }
}

#[async_trait]
impl JobLockExtender for RedisInner {
    async fn extend_lock(
        &self,
        job_id: &JobId,
        token: &str,
        duration: Duration,
    ) -> JobResult<DateTime<Utc>> {
        let mut conn = self.conn().await?;
        let ttl_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1);
        let extended: i32 = redis::Script::new(scripts::COMPARE_AND_PEXPIRE)
            .key(self.keys.job_lock(job_id.as_str()))
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;

        if extended == 0 {
            return Err(JobError::LockLost(format!("job {job_id}")));
        }
        Ok(Utc::now() + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero()))
    }
}

async fn worker_loop(inner: Arc<RedisInner>, worker: Arc<RedisWorker>) {
    info!(worker_id = %worker.id, queue = %worker.queue, "Worker poll loop started");

    loop {
        if let Err(e) = inner.fill(&worker).await {
            warn!(worker_id = %worker.id, error = %e, "Worker poll failed");
        }

        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            () = worker.wake.notified() => {}
            () = tokio::time::sleep(inner.settings.poll_interval) => {}
        }
    }

    info!(worker_id = %worker.id, "Worker poll loop stopped");
}

async fn stalled_check_loop(inner: Arc<RedisInner>) {
    let period = inner.settings.stalled_check_interval.max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let queues: Vec<String> = inner.queues.read().keys().cloned().collect();
        for queue in queues {
            if let Err(e) = inner.recover_stalled(&queue).await {
                warn!(queue = %queue, error = %e, "Stalled job check failed");
            }
        }
    }
}

#[async_trait]
impl QueueDriver for RedisDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Redis
    }

    async fn create_queue(&self, name: &str, options: QueueOptions) -> JobResult<()> {
        let mut conn = self.inner.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.inner.keys.options(name), serde_json::to_string(&options)?)
            .ignore()
            .sadd(self.inner.keys.queues(), name)
            .ignore()
            .query_async(&mut *conn)
            .await?;

        self.inner.queues.write().insert(name.to_string(), options);
        info!(queue = %name, "Queue created");
        Ok(())
    }

    async fn add(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> JobResult<JobData> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::QueueClosed(queue.to_string()));
        }

        let options = self.inner.queue_options(queue).await?;
        let opts = opts.merged_with(&options.default_job_options);
        let mut job = JobData::new(queue, payload, opts);
        let delay = job.opts.initial_delay();
        if delay.is_some() {
            job.status = JobStatus::Delayed;
        }

        let job_id = job.id.as_str().to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.inner.keys.job(&job_id), job.to_json()?)
            .ignore();
        match delay {
            Some(delay) => {
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let ready_at = Utc::now().timestamp_millis().saturating_add(delay_ms);
                pipe.zadd(self.inner.keys.delayed(queue), &job_id, ready_at).ignore();
            }
            None => {
                pipe.rpush(self.inner.keys.waiting(queue), &job_id).ignore();
            }
        }

        let mut conn = self.inner.conn().await?;
        let _: () = pipe.query_async(&mut *conn).await?;

        JobMetrics::job_enqueued(queue);
        debug!(job_id = %job.id, queue = %queue, delayed = delay.is_some(), "Job enqueued");
        self.inner.wake_workers(queue);
        Ok(job)
    }

    async fn create_worker(
        &self,
        queue: &str,
        processor: Processor,
        options: WorkerOptions,
    ) -> JobResult<WorkerHandle> {
        self.inner.queue_options(queue).await?;

        let seq = self.inner.worker_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{queue}-worker-{}-{seq}", &Uuid::new_v4().simple().to_string()[..8]);
        let worker = Worker::new(id.clone(), queue, processor, options);
        info!(
            worker_id = %id,
            queue = %queue,
            concurrency = worker.concurrency(),
            group_concurrency = worker.group_concurrency(),
            "Worker registered"
        );

        let worker = Arc::new(RedisWorker {
            id: id.clone(),
            queue: queue.to_string(),
            state: Mutex::new(worker),
            wake: Notify::new(),
        });
        self.inner.workers.write().push(worker.clone());
        tokio::spawn(worker_loop(self.inner.clone(), worker));

        Ok(WorkerHandle {
            id,
            queue: queue.to_string(),
        })
    }

    async fn get_job_counts(&self, queue: &str) -> JobResult<JobCounts> {
        let mut conn = self.inner.conn().await?;
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, Option<u64>, Option<u64>) =
            redis::pipe()
                .llen(self.inner.keys.waiting(queue))
                .scard(self.inner.keys.active(queue))
                .zcard(self.inner.keys.delayed(queue))
                .hget(self.inner.keys.stats(queue), "completed")
                .hget(self.inner.keys.stats(queue), "failed")
                .query_async(&mut *conn)
                .await?;

        let counts = JobCounts {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            delayed,
        };
        JobMetrics::update_queue_counts(queue, &counts);
        Ok(counts)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<JobData>> {
        let mut conn = self.inner.conn().await?;
        let stored: Option<String> = conn.get(self.inner.keys.job(id.as_str())).await?;
        let Some(json) = stored else {
            return Ok(None);
        };
        let mut job = JobData::from_json(&json)?;
        if job.queue != queue {
            return Ok(None);
        }

        // Promotion does not rewrite the job record.
        if job.status == JobStatus::Delayed {
            let score: Option<f64> = conn.zscore(self.inner.keys.delayed(queue), id.as_str()).await?;
            if score.is_none() {
                job.status = JobStatus::Waiting;
            }
        }
        Ok(Some(job))
    }

    fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.inner
            .workers
            .read()
            .iter()
            .map(|w| w.state.lock().snapshot())
            .collect()
    }

    async fn health_check(&self) -> JobResult<()> {
        let mut conn = self.inner.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    async fn close(&self) -> JobResult<()> {
        self.inner.shutdown.cancel();
        info!("Redis driver closed; poll loops stopping");
        Ok(())
    }
}
