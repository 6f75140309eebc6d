//! Metrics for the execution core.
//!
//! Emitted through the `metrics` facade; the host process picks the exporter.

use crate::queue::JobCounts;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "relay_jobs_enqueued_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "relay_jobs_completed_total";
    /// Total jobs failed permanently.
    pub const JOBS_FAILED_TOTAL: &str = "relay_jobs_failed_total";
    /// Total jobs moved to delayed for a retry.
    pub const JOBS_RETRIED_TOTAL: &str = "relay_jobs_retried_total";
    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "relay_job_duration_seconds";
    /// Jobs per queue and state.
    pub const QUEUE_JOBS: &str = "relay_queue_jobs";
    /// Active jobs per worker.
    pub const WORKER_ACTIVE_JOBS: &str = "relay_worker_active_jobs";

    /// Successful heartbeats.
    pub const HEARTBEAT_RENEWALS_TOTAL: &str = "relay_heartbeat_renewals_total";
    /// Jobs failed by the heartbeat timeout.
    pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "relay_heartbeat_timeouts_total";

    /// Cycle lock acquired.
    pub const CYCLE_LOCK_ACQUIRED_TOTAL: &str = "relay_cycle_lock_acquired_total";
    /// Cycle skipped because another process holds the lock.
    pub const CYCLE_LOCK_SKIPPED_TOTAL: &str = "relay_cycle_lock_skipped_total";
    /// Polling triggers handed to their handler.
    pub const POLLING_TRIGGERS_DISPATCHED_TOTAL: &str = "relay_polling_triggers_dispatched_total";
    /// Polling triggers whose handler failed.
    pub const POLLING_TRIGGER_FAILURES_TOTAL: &str = "relay_polling_trigger_failures_total";
    /// Triggers refused for region mismatch.
    pub const CROSS_REGION_VIOLATIONS_TOTAL: &str = "relay_cross_region_violations_total";
    /// Polling cycle duration in seconds.
    pub const POLLING_CYCLE_DURATION_SECONDS: &str = "relay_polling_cycle_duration_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Job counters
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs that failed permanently"
    );
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of job retries");
    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );
    describe_gauge!(names::QUEUE_JOBS, "Jobs per queue and state");
    describe_gauge!(names::WORKER_ACTIVE_JOBS, "Active jobs per worker");

    // Heartbeat
    describe_counter!(
        names::HEARTBEAT_RENEWALS_TOTAL,
        "Total number of successful job heartbeats"
    );
    describe_counter!(
        names::HEARTBEAT_TIMEOUTS_TOTAL,
        "Total number of jobs failed by heartbeat timeout"
    );

    // Scheduler
    describe_counter!(
        names::CYCLE_LOCK_ACQUIRED_TOTAL,
        "Polling cycles that acquired the cycle lock"
    );
    describe_counter!(
        names::CYCLE_LOCK_SKIPPED_TOTAL,
        "Polling cycles skipped because the lock was held elsewhere"
    );
    describe_counter!(
        names::POLLING_TRIGGERS_DISPATCHED_TOTAL,
        "Polling triggers dispatched to their handler"
    );
    describe_counter!(
        names::POLLING_TRIGGER_FAILURES_TOTAL,
        "Polling triggers whose handler failed"
    );
    describe_counter!(
        names::CROSS_REGION_VIOLATIONS_TOTAL,
        "Triggers refused because their region differs from the worker's"
    );
    describe_histogram!(
        names::POLLING_CYCLE_DURATION_SECONDS,
        "Polling cycle duration in seconds"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str) {
        counter!(names::JOBS_ENQUEUED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed permanently.
    pub fn job_failed(queue: &str, reason: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job scheduled for retry.
    pub fn job_retried(queue: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Update queue size gauges.
    pub fn update_queue_counts(queue: &str, counts: &JobCounts) {
        for (state, value) in [
            ("waiting", counts.waiting),
            ("active", counts.active),
            ("delayed", counts.delayed),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ] {
            gauge!(
                names::QUEUE_JOBS,
                "queue" => queue.to_string(),
                "state" => state
            )
            .set(value as f64);
        }
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update a worker's active job gauge.
    pub fn update_active(worker_id: &str, active: usize) {
        gauge!(names::WORKER_ACTIVE_JOBS, "worker_id" => worker_id.to_string())
            .set(active as f64);
    }
}

/// Heartbeat metrics recorder.
#[derive(Clone)]
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    /// Record a successful heartbeat.
    pub fn renewed(queue: &str) {
        counter!(names::HEARTBEAT_RENEWALS_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a heartbeat timeout.
    pub fn timed_out(queue: &str) {
        counter!(names::HEARTBEAT_TIMEOUTS_TOTAL, "queue" => queue.to_string()).increment(1);
    }
}

/// Scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a cycle lock acquisition.
    pub fn lock_acquired(resource: &str) {
        counter!(names::CYCLE_LOCK_ACQUIRED_TOTAL, "resource" => resource.to_string())
            .increment(1);
    }

    /// Record a skipped cycle.
    pub fn lock_skipped(resource: &str) {
        counter!(names::CYCLE_LOCK_SKIPPED_TOTAL, "resource" => resource.to_string())
            .increment(1);
    }

    /// Record a trigger dispatched.
    pub fn trigger_dispatched(region: &str) {
        counter!(
            names::POLLING_TRIGGERS_DISPATCHED_TOTAL,
            "region" => region.to_string()
        )
        .increment(1);
    }

    /// Record a trigger handler failure.
    pub fn trigger_failed(region: &str, reason: &str) {
        counter!(
            names::POLLING_TRIGGER_FAILURES_TOTAL,
            "region" => region.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Record a cross-region violation.
    pub fn cross_region_violation(trigger_region: &str, worker_region: &str) {
        counter!(
            names::CROSS_REGION_VIOLATIONS_TOTAL,
            "trigger_region" => trigger_region.to_string(),
            "worker_region" => worker_region.to_string()
        )
        .increment(1);
    }

    /// Record a finished cycle.
    pub fn cycle_duration(region: &str, duration: Duration) {
        histogram!(
            names::POLLING_CYCLE_DURATION_SECONDS,
            "region" => region.to_string()
        )
        .record(duration.as_secs_f64());
    }
}
