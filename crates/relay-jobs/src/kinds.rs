//! Built-in job kinds.
//!
//! Every kind names its queue and is keyed by the owning organization, so
//! per-group concurrency isolates tenants.

use crate::job::JobPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run one workflow for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Owning organization.
    pub organization_id: String,
    /// Workflow definition.
    pub workflow_id: String,
    /// Execution record created by the caller.
    pub execution_id: String,
    /// Trigger input.
    #[serde(default)]
    pub input: serde_json::Value,
}

impl JobPayload for WorkflowExecution {
    const QUEUE: &'static str = "workflow-execution";

    fn group_key(&self) -> Option<String> {
        Some(self.organization_id.clone())
    }
}

/// Poll one due trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingTriggerRun {
    /// Owning organization.
    pub organization_id: String,
    /// Claimed trigger.
    pub trigger_id: String,
    /// Region the trigger is pinned to.
    pub region: String,
    /// When the trigger became due.
    pub scheduled_for: DateTime<Utc>,
}

impl JobPayload for PollingTriggerRun {
    const QUEUE: &'static str = "polling-trigger";

    fn group_key(&self) -> Option<String> {
        Some(self.organization_id.clone())
    }
}

/// Re-encrypt one batch of a tenant's secrets under a new key version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotationBatch {
    /// Owning organization.
    pub organization_id: String,
    /// Key version to rotate to.
    pub target_key_version: u32,
    /// First record of the batch.
    pub offset: u64,
    /// Records in the batch.
    pub limit: u32,
}

impl JobPayload for KeyRotationBatch {
    const QUEUE: &'static str = "key-rotation";

    fn group_key(&self) -> Option<String> {
        Some(self.organization_id.clone())
    }
}

/// Queues for every built-in kind.
pub const BUILTIN_QUEUES: [&str; 3] = [
    WorkflowExecution::QUEUE,
    PollingTriggerRun::QUEUE,
    KeyRotationBatch::QUEUE,
];
