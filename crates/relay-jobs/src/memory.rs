//! In-memory queue driver.
//!
//! A complete single-process job queue. Every state transition happens
//! under one mutex and `schedule` runs to completion before the lock is
//! released, so counters and job states never disagree. Processors run on
//! spawned tasks outside the lock; their results come back through
//! `settle`, which re-runs `schedule`.
//!
//! Used when no durable broker is configured (development, tests and
//! degraded mode). State is lost when the process exits.

use crate::error::{JobError, JobResult};
use crate::job::{JobContext, JobData, JobId, JobOptions, JobStatus};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::{DriverKind, JobCounts, QueueDriver, QueueOptions};
use crate::retry::BackoffResolver;
use crate::tasks::{panic_message, ScheduledTask};
use crate::worker::{Processor, Worker, WorkerHandle, WorkerOptions, WorkerSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// In-memory [`QueueDriver`].
#[derive(Clone)]
pub struct InMemoryDriver {
    engine: Arc<Engine>,
}

impl InMemoryDriver {
    /// Driver with the built-in backoff strategies.
    pub fn new() -> Self {
        Self::with_backoff(BackoffResolver::new())
    }

    /// Driver resolving retry delays with `backoff`.
    pub fn with_backoff(backoff: BackoffResolver) -> Self {
        Self {
            engine: Arc::new(Engine {
                state: Mutex::new(EngineState::default()),
                backoff,
                worker_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Drop every queue, worker and timer. For test harnesses.
    pub fn reset(&self) {
        let mut state = self.engine.state.lock();
        for queue in state.queues.values() {
            queue.timers.cancel();
        }
        state.queues.clear();
    }
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

struct Engine {
    state: Mutex<EngineState>,
    backoff: BackoffResolver,
    worker_seq: AtomicU64,
}

#[derive(Default)]
struct EngineState {
    queues: HashMap<String, QueueState>,
}

struct QueueState {
    options: QueueOptions,
    waiting: VecDeque<JobData>,
    active: HashMap<JobId, ActiveJob>,
    delayed: HashMap<JobId, DelayedJob>,
    completed: u64,
    failed: u64,
    retained_completed: VecDeque<JobData>,
    retained_failed: VecDeque<JobData>,
    workers: Vec<Worker>,
    timers: CancellationToken,
    closed: bool,
}

struct ActiveJob {
    job: JobData,
    worker_id: String,
    group: Option<String>,
    started: Instant,
}

struct DelayedJob {
    job: JobData,
    _timer: ScheduledTask,
}

/// A job handed to a processor by `schedule`.
struct Dispatch {
    processor: Processor,
    job: JobData,
    ctx: JobContext,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            waiting: VecDeque::new(),
            active: HashMap::new(),
            delayed: HashMap::new(),
            completed: 0,
            failed: 0,
            retained_completed: VecDeque::new(),
            retained_failed: VecDeque::new(),
            workers: Vec::new(),
            timers: CancellationToken::new(),
            closed: false,
        }
    }

    fn counts(&self) -> JobCounts {
        JobCounts {
            waiting: self.waiting.len() as u64,
            active: self.active.len() as u64,
            completed: self.completed,
            failed: self.failed,
            delayed: self.delayed.len() as u64,
        }
    }

    fn retain(&mut self, job: JobData) {
        let completed = job.status == JobStatus::Completed;
        if !self.options.retention.keeps(completed) {
            return;
        }
        let keep_last = self.options.retention.keep_last;
        let retained = if completed {
            &mut self.retained_completed
        } else {
            &mut self.retained_failed
        };
        retained.push_back(job);
        while retained.len() > keep_last {
            retained.pop_front();
        }
    }

    fn find(&self, id: &JobId) -> Option<JobData> {
        if let Some(active) = self.active.get(id) {
            return Some(active.job.clone());
        }
        if let Some(delayed) = self.delayed.get(id) {
            return Some(delayed.job.clone());
        }
        self.waiting
            .iter()
            .chain(self.retained_completed.iter())
            .chain(self.retained_failed.iter())
            .find(|job| &job.id == id)
            .cloned()
    }

    /// Pick jobs for workers with spare capacity.
    ///
    /// Workers take turns, one job each per round, until no worker can take
    /// another job. Each worker takes the first waiting job whose group is
    /// below its per-group cap, so a saturated group never blocks others.
    fn schedule(&mut self) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        if self.closed {
            return dispatches;
        }

        loop {
            let mut progressed = false;

            for index in 0..self.workers.len() {
                if self.waiting.is_empty() {
                    return dispatches;
                }
                if !self.workers[index].has_capacity() {
                    continue;
                }

                let position = {
                    let worker = &self.workers[index];
                    self.waiting
                        .iter()
                        .position(|job| worker.can_process_group(worker.resolve_group(job).as_deref()))
                };
                let Some(mut job) = position.and_then(|pos| self.waiting.remove(pos)) else {
                    continue;
                };

                let worker = &mut self.workers[index];
                let group = worker.resolve_group(&job);
                worker.increment_active_jobs();
                worker.mark_group_started(group.as_deref());
                WorkerMetrics::update_active(worker.id(), worker.active_jobs());

                job.status = JobStatus::Active;
                job.processed_at = Some(Utc::now());

                let mut ctx = job.to_context(worker.id(), None);
                ctx.group_id = group.clone();

                debug!(
                    job_id = %job.id,
                    queue = %job.queue,
                    worker_id = %worker.id(),
                    group = group.as_deref().unwrap_or("-"),
                    attempt = ctx.attempt,
                    "Dispatching job"
                );

                dispatches.push(Dispatch {
                    processor: worker.processor(),
                    job: job.clone(),
                    ctx,
                });
                self.active.insert(
                    job.id.clone(),
                    ActiveJob {
                        worker_id: worker.id().to_string(),
                        group,
                        started: Instant::now(),
                        job,
                    },
                );
                progressed = true;
            }

            if !progressed {
                return dispatches;
            }
        }
    }
}

impl Engine {
    /// Run one scheduling pass on `queue` and start the picked jobs.
    fn schedule(self: &Arc<Self>, queue: &str) {
        let dispatches = {
            let mut state = self.state.lock();
            match state.queues.get_mut(queue) {
                Some(q) => q.schedule(),
                None => return,
            }
        };

        for dispatch in dispatches {
            self.spawn(dispatch);
        }
    }

    fn spawn(self: &Arc<Self>, dispatch: Dispatch) {
        let engine = Arc::clone(self);
        let Dispatch { processor, job, ctx } = dispatch;
        let queue = job.queue.clone();
        let job_id = job.id.clone();

        tokio::spawn(async move {
            // The call itself sits inside the guard: a processor may panic
            // before it hands back a future.
            let run = async move { processor(job, ctx).await };
            let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(JobError::failed(format!(
                    "processor panicked: {}",
                    panic_message(&*panic)
                ))),
            };
            engine.settle(&queue, &job_id, outcome);
        });
    }

    /// Record a finished attempt and re-run `schedule`.
    fn settle(self: &Arc<Self>, queue: &str, job_id: &JobId, outcome: JobResult<()>) {
        {
            let mut state = self.state.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(active) = q.active.remove(job_id) else {
                return;
            };

            if let Some(worker) = q.workers.iter_mut().find(|w| w.id() == active.worker_id) {
                worker.decrement_active_jobs();
                worker.mark_group_finished(active.group.as_deref());
                worker.record_outcome(outcome.is_ok());
                WorkerMetrics::update_active(worker.id(), worker.active_jobs());
            }

            let elapsed = active.started.elapsed();
            let mut job = active.job;

            match outcome {
                Ok(()) => {
                    job.status = JobStatus::Completed;
                    job.finished_at = Some(Utc::now());
                    q.completed += 1;
                    JobMetrics::job_completed(queue, elapsed);
                    debug!(job_id = %job.id, queue = %queue, "Job completed");
                    q.retain(job);
                }
                Err(error) => {
                    job.record_failure(&error);
                    let retry = error.is_retryable() && !job.is_exhausted() && !q.closed;

                    if retry {
                        let delay =
                            self.backoff
                                .resolve(job.opts.backoff.as_ref(), job.attempts_made, &error);
                        warn!(
                            job_id = %job.id,
                            queue = %queue,
                            attempt = job.attempts_made,
                            max_attempts = job.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Job failed, scheduling retry"
                        );
                        JobMetrics::job_retried(queue, job.attempts_made);
                        self.delay(q, job, delay);
                    } else {
                        warn!(
                            job_id = %job.id,
                            queue = %queue,
                            attempts = job.attempts_made,
                            reason = error.reason(),
                            error = %error,
                            "Job failed permanently"
                        );
                        job.status = JobStatus::Failed;
                        job.finished_at = Some(Utc::now());
                        q.failed += 1;
                        JobMetrics::job_failed(queue, error.reason(), elapsed);
                        q.retain(job);
                    }
                }
            }
        }

        self.schedule(queue);
    }

    /// Park `job` in the delayed set until its timer re-queues it.
    fn delay(self: &Arc<Self>, q: &mut QueueState, mut job: JobData, delay: Duration) {
        job.status = JobStatus::Delayed;

        let engine: Weak<Engine> = Arc::downgrade(self);
        let queue = job.queue.clone();
        let job_id = job.id.clone();
        let timer = ScheduledTask::after_with_token(delay, q.timers.child_token(), async move {
            if let Some(engine) = engine.upgrade() {
                engine.promote(&queue, &job_id);
            }
        });

        q.delayed.insert(job.id.clone(), DelayedJob { job, _timer: timer });
    }

    /// Move a delayed job back to the tail of `waiting`.
    fn promote(self: &Arc<Self>, queue: &str, job_id: &JobId) {
        {
            let mut state = self.state.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(delayed) = q.delayed.remove(job_id) else {
                return;
            };
            let mut job = delayed.job;
            job.status = JobStatus::Waiting;
            q.waiting.push_back(job);
        }

        self.schedule(queue);
    }
}

#[async_trait]
impl QueueDriver for InMemoryDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::InMemory
    }

    async fn create_queue(&self, name: &str, options: QueueOptions) -> JobResult<()> {
        let mut state = self.engine.state.lock();
        match state.queues.get_mut(name) {
            Some(existing) => existing.options = options,
            None => {
                state.queues.insert(name.to_string(), QueueState::new(options));
                info!(queue = %name, "Queue created");
            }
        }
        Ok(())
    }

    async fn add(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> JobResult<JobData> {
        let job = {
            let mut state = self.engine.state.lock();
            let q = state
                .queues
                .entry(queue.to_string())
                .or_insert_with(|| QueueState::new(QueueOptions::default()));
            if q.closed {
                return Err(JobError::QueueClosed(queue.to_string()));
            }

            let opts = opts.merged_with(&q.options.default_job_options);
            let mut job = JobData::new(queue, payload, opts);
            JobMetrics::job_enqueued(queue);

            match job.opts.initial_delay() {
                Some(delay) => {
                    debug!(job_id = %job.id, queue = %queue, delay_ms = delay.as_millis() as u64, "Job enqueued with delay");
                    job.status = JobStatus::Delayed;
                    self.engine.delay(q, job.clone(), delay);
                }
                None => {
                    debug!(job_id = %job.id, queue = %queue, "Job enqueued");
                    q.waiting.push_back(job.clone());
                }
            }
            job
        };

        self.engine.schedule(queue);
        Ok(job)
    }

    async fn create_worker(
        &self,
        queue: &str,
        processor: Processor,
        options: WorkerOptions,
    ) -> JobResult<WorkerHandle> {
        let seq = self.engine.worker_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{queue}-worker-{seq}");

        {
            let mut state = self.engine.state.lock();
            let q = state
                .queues
                .entry(queue.to_string())
                .or_insert_with(|| QueueState::new(QueueOptions::default()));
            let worker = Worker::new(id.clone(), queue, processor, options);
            info!(
                worker_id = %id,
                queue = %queue,
                concurrency = worker.concurrency(),
                group_concurrency = worker.group_concurrency(),
                "Worker registered"
            );
            q.workers.push(worker);
        }

        self.engine.schedule(queue);
        Ok(WorkerHandle {
            id,
            queue: queue.to_string(),
        })
    }

    async fn get_job_counts(&self, queue: &str) -> JobResult<JobCounts> {
        let state = self.engine.state.lock();
        let counts = state
            .queues
            .get(queue)
            .map(QueueState::counts)
            .ok_or_else(|| JobError::NotFound(format!("queue {queue}")))?;
        JobMetrics::update_queue_counts(queue, &counts);
        Ok(counts)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<JobData>> {
        let state = self.engine.state.lock();
        Ok(state.queues.get(queue).and_then(|q| q.find(id)))
    }

    fn queue_names(&self) -> Vec<String> {
        let state = self.engine.state.lock();
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        let state = self.engine.state.lock();
        let mut snapshots: Vec<WorkerSnapshot> = state
            .queues
            .values()
            .flat_map(|q| q.workers.iter().map(Worker::snapshot))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    async fn health_check(&self) -> JobResult<()> {
        Ok(())
    }

    async fn close(&self) -> JobResult<()> {
        let mut state = self.engine.state.lock();
        for (name, q) in state.queues.iter_mut() {
            q.closed = true;
            q.timers.cancel();
            let dropped = q.waiting.len() + q.delayed.len();
            q.waiting.clear();
            q.delayed.clear();
            info!(queue = %name, dropped, in_flight = q.active.len(), "Queue closed");
        }
        Ok(())
    }
}
