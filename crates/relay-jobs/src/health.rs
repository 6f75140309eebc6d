//! Health and diagnostics.

use crate::queue::{DriverKind, JobCounts, QueueDriver};
use crate::scheduler::{PollingCycleRunner, SchedulerStats};
use crate::worker::WorkerSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Everything is reachable.
    Healthy,
    /// Serving, but on the in-memory fallback.
    Degraded,
    /// The queue backend does not answer.
    Unhealthy,
}

/// Counts for one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    /// Queue name.
    pub name: String,
    /// Job counts.
    pub counts: JobCounts,
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Queue backend.
    pub driver: DriverKind,
    /// Running on the fallback engine.
    pub degraded: bool,
    /// Backend error, when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-queue counts, sorted by name.
    pub queues: Vec<QueueHealth>,
    /// Workers in this process.
    pub workers: Vec<WorkerSnapshot>,
    /// Polling scheduler statistics, if one runs here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerStats>,
    /// When the snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Is the process able to serve jobs.
    pub fn is_serving(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

/// Builds [`HealthReport`]s.
pub struct HealthMonitor {
    driver: Arc<dyn QueueDriver>,
    degraded: bool,
    scheduler: Option<Arc<PollingCycleRunner>>,
}

impl HealthMonitor {
    /// Monitor for `driver`.
    pub fn new(driver: Arc<dyn QueueDriver>, degraded: bool) -> Self {
        Self {
            driver,
            degraded,
            scheduler: None,
        }
    }

    /// Include the polling scheduler in reports.
    pub fn with_scheduler(mut self, scheduler: Arc<PollingCycleRunner>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Take a snapshot. Also refreshes the queue gauges.
    pub async fn report(&self) -> HealthReport {
        let (status, error) = match self.driver.health_check().await {
            Ok(()) if self.degraded => (HealthStatus::Degraded, None),
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e) => {
                warn!(error = %e, driver = %self.driver.kind(), "Queue driver health check failed");
                (HealthStatus::Unhealthy, Some(e.to_string()))
            }
        };

        let mut names = self.driver.queue_names();
        names.sort();

        let mut queues = Vec::with_capacity(names.len());
        if status != HealthStatus::Unhealthy {
            for name in names {
                match self.driver.get_job_counts(&name).await {
                    Ok(counts) => queues.push(QueueHealth { name, counts }),
                    Err(e) => warn!(queue = %name, error = %e, "Failed to read job counts"),
                }
            }
        }

        let mut workers = self.driver.worker_snapshots();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        HealthReport {
            status,
            driver: self.driver.kind(),
            degraded: self.degraded,
            error,
            queues,
            workers,
            scheduler: self.scheduler.as_ref().map(|s| s.stats()),
            checked_at: Utc::now(),
        }
    }
}
