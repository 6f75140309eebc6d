//! Job records, options and execution context.

use crate::error::{JobError, JobResult};
use crate::retry::BackoffOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new time-ordered job ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued and eligible for dispatch.
    #[default]
    Waiting,
    /// Being processed by a worker.
    Active,
    /// Waiting for a retry or initial-delay timer.
    Delayed,
    /// Finished successfully.
    Completed,
    /// Permanently failed.
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Delayed => write!(f, "delayed"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-job options. Unset fields fall back to the queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum attempts, including the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Backoff applied between failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffOptions>,

    /// Initial delay before the job becomes eligible, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Tenant group used for per-group concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl JobOptions {
    /// Sets the maximum attempts.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the backoff.
    pub fn backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Sets an initial delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the tenant group.
    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Fills every unset field from `defaults`.
    pub fn merged_with(self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            attempts: self.attempts.or(defaults.attempts),
            backoff: self.backoff.or_else(|| defaults.backoff.clone()),
            delay_ms: self.delay_ms.or(defaults.delay_ms),
            group_id: self.group_id.or_else(|| defaults.group_id.clone()),
        }
    }

    /// Initial delay as a `Duration`, if any.
    pub fn initial_delay(&self) -> Option<Duration> {
        self.delay_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// A job as stored by a queue driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    /// Job ID.
    pub id: JobId,

    /// Queue name (the job kind).
    pub queue: String,

    /// Serialized job payload.
    pub payload: serde_json::Value,

    /// Failed attempts so far.
    pub attempts_made: u32,

    /// Maximum attempts, at least 1.
    pub max_attempts: u32,

    /// Effective options after merging queue defaults.
    pub opts: JobOptions,

    /// Current lifecycle state.
    pub status: JobStatus,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the current or last attempt started.
    pub processed_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,

    /// Error from the last failed attempt.
    pub failed_reason: Option<String>,
}

impl JobData {
    /// Creates a waiting job. `max_attempts` is normalized to at least 1.
    pub fn new(queue: impl Into<String>, payload: serde_json::Value, opts: JobOptions) -> Self {
        let max_attempts = opts.attempts.unwrap_or(1).max(1);
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            attempts_made: 0,
            max_attempts,
            opts,
            status: JobStatus::Waiting,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            failed_reason: None,
        }
    }

    /// Tenant group recorded on the job itself.
    pub fn group_id(&self) -> Option<&str> {
        self.opts.group_id.as_deref()
    }

    /// Deserialize the job payload.
    pub fn deserialize<P: DeserializeOwned>(&self) -> JobResult<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Check if max attempts reached.
    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Count a failed attempt. Never exceeds `max_attempts`.
    pub fn record_failure(&mut self, error: &JobError) {
        self.attempts_made = (self.attempts_made + 1).min(self.max_attempts);
        self.failed_reason = Some(error.to_string());
    }

    /// Create job context for execution.
    pub fn to_context(&self, worker_id: &str, lock: Option<JobLock>) -> JobContext {
        JobContext {
            job_id: self.id.clone(),
            queue: self.queue.clone(),
            attempt: self.attempts_made + 1,
            max_attempts: self.max_attempts,
            group_id: self.opts.group_id.clone(),
            started_at: Utc::now(),
            worker_id: worker_id.to_string(),
            lock,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Renews a job's processing lock in the backing store.
#[async_trait]
pub trait JobLockExtender: Send + Sync {
    /// Extend the lock held with `token` by `duration`. Returns the new expiry.
    async fn extend_lock(
        &self,
        job_id: &JobId,
        token: &str,
        duration: Duration,
    ) -> JobResult<DateTime<Utc>>;
}

/// A job's processing lock, present when the driver supports lock extension.
#[derive(Clone)]
pub struct JobLock {
    token: String,
    extender: Arc<dyn JobLockExtender>,
}

impl JobLock {
    /// Wrap a lock token and its extender.
    pub fn new(token: impl Into<String>, extender: Arc<dyn JobLockExtender>) -> Self {
        Self {
            token: token.into(),
            extender,
        }
    }

    /// The lock token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Extend the lock by `duration`.
    pub async fn extend(&self, job_id: &JobId, duration: Duration) -> JobResult<DateTime<Utc>> {
        self.extender.extend_lock(job_id, &self.token, duration).await
    }
}

impl fmt::Debug for JobLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLock").field("token", &self.token).finish()
    }
}

/// Job execution context.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Queue name.
    pub queue: String,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Maximum attempts allowed.
    pub max_attempts: u32,

    /// Tenant group, if any.
    pub group_id: Option<String>,

    /// Attempt started at this time.
    pub started_at: DateTime<Utc>,

    /// Worker ID processing this job.
    pub worker_id: String,

    /// Processing lock, when the driver keeps one.
    pub lock: Option<JobLock>,
}

impl JobContext {
    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

/// A typed job payload bound to one queue.
///
/// The tenant key is explicit: implementors return the group the job
/// belongs to instead of the engine probing the payload shape.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue this payload is enqueued on.
    const QUEUE: &'static str;

    /// Tenant group for per-group concurrency.
    fn group_key(&self) -> Option<String> {
        None
    }
}
