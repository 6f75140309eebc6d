//! Relay Jobs - Execution Queue and Coordination Core
//!
//! Dispatches tenant-owned jobs onto bounded worker pools and runs the
//! periodic polling cycle under a distributed lock:
//! - Queue drivers: a Redis-backed durable driver and an in-memory engine
//! - Workers with a global cap and a per-tenant-group cap
//! - Retries with named backoff strategies
//! - Heartbeats that renew the job's processing lock and detect stalls
//! - A per-tick cycle lock so one scheduler replica runs each cycle
//! - Region affinity for polling triggers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Relay Jobs Architecture                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  PollingCycleRunner ──acquire──▶ LockService (Redis / memory)    │
//! │     │ claim due triggers                                         │
//! │     ▼                                                            │
//! │  TriggerHandler ──add──┐         Producers ──add──┐              │
//! │                        ▼                          ▼              │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │              QueueDriver (Redis / in-memory)             │    │
//! │  │   waiting ──▶ active ──▶ completed | failed              │    │
//! │  │                  │                                       │    │
//! │  │                  └──retry──▶ delayed ──timer──▶ waiting  │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                           │ schedule()                           │
//! │                           ▼                                      │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │  Worker (concurrency, group_concurrency per tenant)      │    │
//! │  │     └── with_heartbeat(processor)                        │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_jobs::prelude::*;
//! use relay_jobs::kinds::WorkflowExecution;
//!
//! let driver = InMemoryDriver::new();
//! let run = typed_processor::<WorkflowExecution, _, _>(|run, ctx| async move {
//!     tracing::info!(org = %run.organization_id, job_id = %ctx.job_id, "Running workflow");
//!     Ok(())
//! });
//! driver
//!     .create_worker(
//!         WorkflowExecution::QUEUE,
//!         with_heartbeat(run, HeartbeatOptions::default()),
//!         WorkerOptions::new(8).with_group_concurrency(2),
//!     )
//!     .await?;
//! driver.add_job(&workflow, JobOptions::default().attempts(3)).await?;
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod job;
pub mod kinds;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod redis;
pub mod retry;
pub mod scheduler;
pub mod tasks;
pub mod trigger;
pub mod worker;

pub use config::JobsConfig;
pub use driver::{connect_driver, Backend};
pub use error::{JobError, JobResult};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use heartbeat::{with_heartbeat, HeartbeatEvent, HeartbeatOptions};
pub use job::{JobContext, JobData, JobId, JobLock, JobLockExtender, JobOptions, JobPayload, JobStatus};
pub use lock::{with_lock, InMemoryLockBackend, LockBackend, LockHandle, LockService};
pub use memory::InMemoryDriver;
pub use metrics::{register_metrics, HeartbeatMetrics, JobMetrics, SchedulerMetrics, WorkerMetrics};
pub use queue::{DriverKind, JobCounts, QueueDriver, QueueDriverExt, QueueOptions, RetentionPolicy};
pub use retry::{BackoffOptions, BackoffResolver, RetryStrategy};
pub use scheduler::{CycleOutcome, CycleReport, PollingConfig, PollingCycleRunner, SchedulerStats};
pub use tasks::ScheduledTask;
pub use trigger::{ClaimRequest, EnqueueTriggerHandler, InMemoryTriggerStore, Trigger, TriggerHandler, TriggerStore};
pub use worker::{processor, typed_processor, Processor, WorkerHandle, WorkerOptions, WorkerSnapshot};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::heartbeat::{with_heartbeat, HeartbeatOptions};
    pub use crate::job::{JobOptions, JobPayload, JobStatus};
    pub use crate::memory::InMemoryDriver;
    pub use crate::queue::{QueueDriver, QueueDriverExt};
    pub use crate::retry::BackoffOptions;
    pub use crate::worker::{processor, typed_processor, WorkerOptions};
    pub use crate::{JobContext, JobError, JobId, JobResult};
}
