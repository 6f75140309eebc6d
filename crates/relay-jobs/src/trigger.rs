//! Polling triggers and their store.

use crate::error::JobResult;
use crate::job::JobOptions;
use crate::kinds::PollingTriggerRun;
use crate::queue::{QueueDriver, QueueDriverExt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A persisted, due-for-execution polling unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger ID.
    pub id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Region the trigger's data must stay in.
    pub region: String,
    /// When the trigger is next due.
    pub next_poll_at: DateTime<Utc>,
    /// Connector-specific settings, opaque here.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Trigger {
    /// A trigger due at `next_poll_at`.
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        region: impl Into<String>,
        next_poll_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            region: region.into(),
            next_poll_at,
            config: serde_json::Value::Null,
        }
    }

    /// Returns true if the trigger may run in `region`. Case-insensitive.
    pub fn runs_in(&self, region: &str) -> bool {
        self.region.eq_ignore_ascii_case(region)
    }
}

/// Claim request.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Max triggers to claim.
    pub limit: usize,
    /// Claim triggers due at or before this instant.
    pub now: DateTime<Utc>,
    /// Region of the claiming worker.
    pub region: String,
}

/// Source of due polling triggers.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Claim up to `limit` due triggers. A claimed trigger is not returned
    /// to any other caller until it is due again.
    async fn claim_due_polling_triggers(&self, request: &ClaimRequest) -> JobResult<Vec<Trigger>>;
}

/// Runs a claimed trigger.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    /// Handle one trigger.
    async fn handle(&self, trigger: &Trigger) -> JobResult<()>;
}

/// Process-local [`TriggerStore`].
///
/// Claiming pushes a trigger's `next_poll_at` out by the store's lease, so
/// concurrent cycles never claim it twice. Region is not filtered here;
/// the cycle runner checks it per trigger.
#[derive(Debug)]
pub struct InMemoryTriggerStore {
    triggers: Mutex<HashMap<String, Trigger>>,
    lease: Duration,
}

impl InMemoryTriggerStore {
    /// Empty store; claims lease triggers for `lease`.
    pub fn new(lease: Duration) -> Self {
        Self {
            triggers: Mutex::new(HashMap::new()),
            lease,
        }
    }

    /// Add or replace a trigger.
    pub fn insert(&self, trigger: Trigger) {
        self.triggers.lock().insert(trigger.id.clone(), trigger);
    }

    /// Look up a trigger.
    pub fn get(&self, id: &str) -> Option<Trigger> {
        self.triggers.lock().get(id).cloned()
    }

    /// Number of stored triggers.
    pub fn len(&self) -> usize {
        self.triggers.lock().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every trigger. For test harnesses.
    pub fn reset(&self) {
        self.triggers.lock().clear();
    }
}

impl Default for InMemoryTriggerStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl TriggerStore for InMemoryTriggerStore {
    async fn claim_due_polling_triggers(&self, request: &ClaimRequest) -> JobResult<Vec<Trigger>> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::zero());
        let mut triggers = self.triggers.lock();

        let mut due: Vec<&mut Trigger> = triggers
            .values_mut()
            .filter(|t| t.next_poll_at <= request.now)
            .collect();
        due.sort_by(|a, b| a.next_poll_at.cmp(&b.next_poll_at).then_with(|| a.id.cmp(&b.id)));

        let claimed: Vec<Trigger> = due
            .into_iter()
            .take(request.limit)
            .map(|trigger| {
                let claimed = trigger.clone();
                trigger.next_poll_at = request.now + lease;
                claimed
            })
            .collect();

        debug!(count = claimed.len(), region = %request.region, "Claimed due triggers");
        Ok(claimed)
    }
}

/// [`TriggerHandler`] that enqueues a [`PollingTriggerRun`] job, so polling
/// work goes through the worker pool.
pub struct EnqueueTriggerHandler {
    driver: Arc<dyn QueueDriver>,
    options: JobOptions,
}

impl EnqueueTriggerHandler {
    /// Handler enqueueing on `driver`.
    pub fn new(driver: Arc<dyn QueueDriver>) -> Self {
        Self {
            driver,
            options: JobOptions::default(),
        }
    }

    /// Options for the enqueued jobs.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl TriggerHandler for EnqueueTriggerHandler {
    async fn handle(&self, trigger: &Trigger) -> JobResult<()> {
        let run = PollingTriggerRun {
            organization_id: trigger.organization_id.clone(),
            trigger_id: trigger.id.clone(),
            region: trigger.region.clone(),
            scheduled_for: trigger.next_poll_at,
        };
        let job = self.driver.add_job(&run, self.options.clone()).await?;
        debug!(trigger_id = %trigger.id, job_id = %job.id, "Enqueued polling trigger run");
        Ok(())
    }
}
