//! Worker capacity bookkeeping.
//!
//! A [`Worker`] never pulls jobs on its own. The queue driver asks it
//! whether it has room (globally and for a tenant group) and updates its
//! counters when it dispatches or settles a job, so the dispatch algorithm
//! lives in exactly one place.

use crate::error::JobResult;
use crate::job::{JobContext, JobData, JobPayload};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Job processor registered with a worker.
pub type Processor =
    Arc<dyn Fn(JobData, JobContext) -> BoxFuture<'static, JobResult<()>> + Send + Sync>;

/// Resolves the tenant group for a job at dispatch time.
pub type GroupKeyFn = Arc<dyn Fn(&JobData) -> Option<String> + Send + Sync>;

/// Build a [`Processor`] from an async closure.
pub fn processor<F, Fut>(f: F) -> Processor
where
    F: Fn(JobData, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult<()>> + Send + 'static,
{
    Arc::new(move |job: JobData, ctx: JobContext| -> BoxFuture<'static, JobResult<()>> {
        Box::pin(f(job, ctx))
    })
}

/// Build a [`Processor`] that deserializes the payload into `P` first.
///
/// A payload that fails to deserialize fails the attempt with a
/// non-retryable serialization error.
pub fn typed_processor<P, F, Fut>(f: F) -> Processor
where
    P: JobPayload,
    F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult<()>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |job: JobData, ctx: JobContext| -> BoxFuture<'static, JobResult<()>> {
        let f = f.clone();
        Box::pin(async move {
            let payload: P = job.deserialize()?;
            f(payload, ctx).await
        })
    })
}

/// Caller-supplied worker settings.
#[derive(Clone, Default)]
pub struct WorkerOptions {
    /// Max simultaneous active jobs. Normalized to at least 1.
    pub concurrency: usize,

    /// Max simultaneous active jobs per tenant group. Defaults to
    /// `concurrency` and is clamped to it.
    pub group_concurrency: Option<usize>,

    group_key: Option<GroupKeyFn>,
}

impl WorkerOptions {
    /// Options with the given global concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            group_concurrency: None,
            group_key: None,
        }
    }

    /// Sets the per-group cap.
    pub fn with_group_concurrency(mut self, group_concurrency: usize) -> Self {
        self.group_concurrency = Some(group_concurrency);
        self
    }

    /// Resolve groups with `f` instead of the job's own `group_id`.
    pub fn group_key(
        mut self,
        f: impl Fn(&JobData) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.group_key = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("concurrency", &self.concurrency)
            .field("group_concurrency", &self.group_concurrency)
            .field("group_key", &self.group_key.is_some())
            .finish()
    }
}

/// Normalize `(concurrency, group_concurrency)`.
pub fn normalize_concurrency(concurrency: usize, group_concurrency: Option<usize>) -> (usize, usize) {
    let concurrency = concurrency.max(1);
    let group_concurrency = group_concurrency.unwrap_or(concurrency).clamp(1, concurrency);
    (concurrency, group_concurrency)
}

/// Handle returned when a worker is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Worker ID.
    pub id: String,
    /// Queue the worker consumes.
    pub queue: String,
}

/// A consumer attached to one queue.
pub struct Worker {
    id: String,
    queue: String,
    concurrency: usize,
    group_concurrency: usize,
    active_jobs: usize,
    active_groups: HashMap<String, usize>,
    processed: u64,
    failed: u64,
    processor: Processor,
    group_key: Option<GroupKeyFn>,
}

impl Worker {
    /// Create a worker with normalized concurrency settings.
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        processor: Processor,
        options: WorkerOptions,
    ) -> Self {
        let (concurrency, group_concurrency) =
            normalize_concurrency(options.concurrency, options.group_concurrency);

        Self {
            id: id.into(),
            queue: queue.into(),
            concurrency,
            group_concurrency,
            active_jobs: 0,
            active_groups: HashMap::new(),
            processed: 0,
            failed: 0,
            processor,
            group_key: options.group_key,
        }
    }

    /// Worker ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Global cap.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Per-group cap.
    pub fn group_concurrency(&self) -> usize {
        self.group_concurrency
    }

    /// Jobs currently active on this worker.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs
    }

    /// Jobs currently active for `group`.
    pub fn active_in_group(&self, group: &str) -> usize {
        self.active_groups.get(group).copied().unwrap_or(0)
    }

    /// Returns true if another job may start.
    pub fn has_capacity(&self) -> bool {
        self.active_jobs < self.concurrency
    }

    /// Returns true if another job of `group` may start. Ungrouped jobs are
    /// bounded by the global cap only.
    pub fn can_process_group(&self, group: Option<&str>) -> bool {
        match group {
            Some(group) => self.active_in_group(group) < self.group_concurrency,
            None => true,
        }
    }

    /// Count a started job against `group`.
    pub fn mark_group_started(&mut self, group: Option<&str>) {
        if let Some(group) = group {
            *self.active_groups.entry(group.to_string()).or_insert(0) += 1;
        }
    }

    /// Release a finished job from `group`.
    pub fn mark_group_finished(&mut self, group: Option<&str>) {
        let Some(group) = group else {
            return;
        };
        if let Some(count) = self.active_groups.get_mut(group) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.active_groups.remove(group);
            }
        }
    }

    /// Count a started job.
    pub fn increment_active_jobs(&mut self) {
        self.active_jobs += 1;
    }

    /// Release a finished job.
    pub fn decrement_active_jobs(&mut self) {
        self.active_jobs = self.active_jobs.saturating_sub(1);
    }

    /// Record a settled job.
    pub fn record_outcome(&mut self, success: bool) {
        if success {
            self.processed += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Tenant group for `job` as seen by this worker.
    pub fn resolve_group(&self, job: &JobData) -> Option<String> {
        match &self.group_key {
            Some(resolve) => resolve(job),
            None => job.opts.group_id.clone(),
        }
    }

    /// The registered processor.
    pub fn processor(&self) -> Processor {
        self.processor.clone()
    }

    /// Point-in-time view for diagnostics.
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            queue: self.queue.clone(),
            concurrency: self.concurrency,
            group_concurrency: self.group_concurrency,
            active_jobs: self.active_jobs,
            active_groups: self.active_groups.clone(),
            processed: self.processed,
            failed: self.failed,
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("concurrency", &self.concurrency)
            .field("group_concurrency", &self.group_concurrency)
            .field("active_jobs", &self.active_jobs)
            .field("active_groups", &self.active_groups)
            .finish_non_exhaustive()
    }
}

/// Worker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Worker ID.
    pub id: String,

    /// Queue name.
    pub queue: String,

    /// Configured global cap.
    pub concurrency: usize,

    /// Configured per-group cap.
    pub group_concurrency: usize,

    /// Active jobs.
    pub active_jobs: usize,

    /// Active jobs per group.
    pub active_groups: HashMap<String, usize>,

    /// Jobs completed.
    pub processed: u64,

    /// Failed attempts.
    pub failed: u64,
}
