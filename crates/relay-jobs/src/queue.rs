//! Queue driver abstraction.

use crate::error::JobResult;
use crate::job::{JobData, JobId, JobOptions, JobPayload};
use crate::worker::{Processor, WorkerHandle, WorkerOptions, WorkerSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which backend a driver stores jobs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Single-process engine; state is lost on restart.
    InMemory,
    /// Redis-compatible durable broker.
    Redis,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::InMemory => write!(f, "in_memory"),
            DriverKind::Redis => write!(f, "redis"),
        }
    }
}

/// What to keep once a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Discard completed jobs immediately.
    #[serde(default)]
    pub remove_on_complete: bool,

    /// Discard failed jobs immediately.
    #[serde(default)]
    pub remove_on_fail: bool,

    /// How many terminal jobs of each kind to keep for audit.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

fn default_keep_last() -> usize {
    1000
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            remove_on_complete: false,
            remove_on_fail: false,
            keep_last: default_keep_last(),
        }
    }
}

impl RetentionPolicy {
    /// Keep nothing.
    pub fn discard() -> Self {
        Self {
            remove_on_complete: true,
            remove_on_fail: true,
            keep_last: 0,
        }
    }

    /// Whether a job ending in `completed` (or failed) state is retained.
    pub fn keeps(&self, completed: bool) -> bool {
        let removed = if completed {
            self.remove_on_complete
        } else {
            self.remove_on_fail
        };
        !removed && self.keep_last > 0
    }
}

/// Queue-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Defaults merged into every job's options.
    #[serde(default)]
    pub default_job_options: JobOptions,

    /// Terminal job retention.
    #[serde(default)]
    pub retention: RetentionPolicy,
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Waiting jobs.
    pub waiting: u64,
    /// Active jobs.
    pub active: u64,
    /// Completed jobs (monotone).
    pub completed: u64,
    /// Permanently failed jobs (monotone).
    pub failed: u64,
    /// Delayed jobs.
    pub delayed: u64,
}

/// A job queue backend.
///
/// Implementations own all queue and worker state; callers only go through
/// these operations.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Backend kind.
    fn kind(&self) -> DriverKind;

    /// Create (or reconfigure) a queue.
    async fn create_queue(&self, name: &str, options: QueueOptions) -> JobResult<()>;

    /// Enqueue a job at the tail of `queue`.
    async fn add(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> JobResult<JobData>;

    /// Register a consumer and immediately attempt dispatch.
    async fn create_worker(
        &self,
        queue: &str,
        processor: Processor,
        options: WorkerOptions,
    ) -> JobResult<WorkerHandle>;

    /// Job counts for `queue`.
    async fn get_job_counts(&self, queue: &str) -> JobResult<JobCounts>;

    /// Look up a job, including retained terminal jobs.
    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<JobData>>;

    /// Names of known queues.
    fn queue_names(&self) -> Vec<String>;

    /// Snapshots of the workers registered in this process.
    fn worker_snapshots(&self) -> Vec<WorkerSnapshot>;

    /// Verify the backend is reachable.
    async fn health_check(&self) -> JobResult<()>;

    /// Stop dispatching and cancel pending timers. In-flight jobs run on.
    async fn close(&self) -> JobResult<()>;
}

/// Typed helpers over any [`QueueDriver`].
#[async_trait]
pub trait QueueDriverExt: QueueDriver {
    /// Enqueue a typed payload on its queue, filling the group from the
    /// payload when the caller did not set one.
    async fn add_job<P: JobPayload>(&self, payload: &P, opts: JobOptions) -> JobResult<JobData> {
        let value = serde_json::to_value(payload)?;
        let mut opts = opts;
        if opts.group_id.is_none() {
            opts.group_id = payload.group_key();
        }
        self.add(P::QUEUE, value, opts).await
    }

    /// Total jobs currently in flight across this process's workers.
    fn active_in_process(&self) -> usize {
        self.worker_snapshots().iter().map(|w| w.active_jobs).sum()
    }
}

impl<D: QueueDriver + ?Sized> QueueDriverExt for D {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_keeps() {
        let keep = RetentionPolicy::default();
        assert!(keep.keeps(true));
        assert!(keep.keeps(false));

        let discard = RetentionPolicy::discard();
        assert!(!discard.keeps(true));
        assert!(!discard.keeps(false));

        let audit_failures = RetentionPolicy {
            remove_on_complete: true,
            ..RetentionPolicy::default()
        };
        assert!(!audit_failures.keeps(true));
        assert!(audit_failures.keeps(false));
    }

    #[test]
    fn test_driver_kind_display() {
        assert_eq!(DriverKind::InMemory.to_string(), "in_memory");
        assert_eq!(DriverKind::Redis.to_string(), "redis");
    }
}
