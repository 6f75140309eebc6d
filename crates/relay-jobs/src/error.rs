//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job execution failed.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// The heartbeat loop saw no successful heartbeat within the timeout.
    #[error("Heartbeat timeout for job {job_id}: no successful heartbeat for {elapsed_ms}ms")]
    HeartbeatTimeout { job_id: String, elapsed_ms: u64 },

    /// Job was cancelled.
    #[error("Job was cancelled")]
    Cancelled,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Queue has been closed.
    #[error("Queue is closed: {0}")]
    QueueClosed(String),

    /// Invalid job state.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// A trigger was claimed by a worker outside its declared region.
    #[error("Cross-region violation for trigger {trigger_id}: trigger region {trigger_region}, worker region {worker_region}")]
    CrossRegion {
        trigger_id: String,
        trigger_region: String,
        worker_region: String,
    },

    /// The processing lock for a job is no longer held by this worker.
    #[error("Lock lost: {0}")]
    LockLost(String),

    /// The queue driver cannot be reached.
    #[error("Queue driver unavailable: {0}")]
    DriverUnavailable(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Trigger store or handler error.
    #[error("Trigger error: {0}")]
    Trigger(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if this error consumes an attempt and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::ExecutionFailed(_)
                | JobError::HeartbeatTimeout { .. }
                | JobError::Redis(_)
                | JobError::Pool(_)
                | JobError::LockLost(_)
                | JobError::Worker(_)
                | JobError::Trigger(_)
                | JobError::Internal(_)
        )
    }

    /// Stable label used in metrics and span fields.
    pub fn reason(&self) -> &'static str {
        match self {
            JobError::ExecutionFailed(_) => "execution_failed",
            JobError::HeartbeatTimeout { .. } => "heartbeat_timeout",
            JobError::Cancelled => "cancelled",
            JobError::Serialization(_) => "serialization",
            JobError::Redis(_) | JobError::Pool(_) => "redis",
            JobError::NotFound(_) => "not_found",
            JobError::QueueClosed(_) => "queue_closed",
            JobError::InvalidState { .. } => "invalid_state",
            JobError::CrossRegion { .. } => "cross_region",
            JobError::LockLost(_) => "lock_lost",
            JobError::DriverUnavailable(_) => "driver_unavailable",
            JobError::Worker(_) => "worker",
            JobError::Trigger(_) => "trigger",
            JobError::Configuration(_) => "configuration",
            JobError::Internal(_) => "internal",
        }
    }

    /// Shorthand for an execution failure.
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::ExecutionFailed(message.into())
    }
}

impl From<relay_core::RelayError> for JobError {
    fn from(err: relay_core::RelayError) -> Self {
        JobError::Internal(err.to_string())
    }
}

impl From<JobError> for relay_core::RelayError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::DriverUnavailable(message) => {
                relay_core::RelayError::unavailable("queue-driver", message)
            }
            JobError::Configuration(message) => relay_core::RelayError::Configuration(message),
            other => relay_core::RelayError::Jobs(other.to_string()),
        }
    }
}
