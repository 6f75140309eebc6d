//! Processors the standalone binary registers for the built-in job kinds.
//!
//! Embedding hosts register their own executors through
//! [`AppBuilder::with_processor`](crate::app::AppBuilder::with_processor);
//! these only acknowledge the work so queues drain in development.

use relay_jobs::kinds::{KeyRotationBatch, PollingTriggerRun, WorkflowExecution};
use relay_jobs::{typed_processor, JobPayload, Processor};
use tracing::info;

/// `(queue, processor)` pairs for every built-in kind.
pub fn default_processors() -> Vec<(&'static str, Processor)> {
    vec![
        (WorkflowExecution::QUEUE, workflow_execution()),
        (PollingTriggerRun::QUEUE, polling_trigger_run()),
        (KeyRotationBatch::QUEUE, key_rotation_batch()),
    ]
}

fn workflow_execution() -> Processor {
    typed_processor::<WorkflowExecution, _, _>(|run, ctx| async move {
        info!(
            job_id = %ctx.job_id,
            organization_id = %run.organization_id,
            workflow_id = %run.workflow_id,
            execution_id = %run.execution_id,
            attempt = ctx.attempt,
            "Workflow execution received"
        );
        Ok(())
    })
}

fn polling_trigger_run() -> Processor {
    typed_processor::<PollingTriggerRun, _, _>(|run, ctx| async move {
        info!(
            job_id = %ctx.job_id,
            organization_id = %run.organization_id,
            trigger_id = %run.trigger_id,
            region = %run.region,
            scheduled_for = %run.scheduled_for,
            "Polling trigger run received"
        );
        Ok(())
    })
}

fn key_rotation_batch() -> Processor {
    typed_processor::<KeyRotationBatch, _, _>(|batch, ctx| async move {
        info!(
            job_id = %ctx.job_id,
            organization_id = %batch.organization_id,
            target_key_version = batch.target_key_version,
            offset = batch.offset,
            limit = batch.limit,
            "Key rotation batch received"
        );
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_jobs::kinds::BUILTIN_QUEUES;
    use relay_jobs::{InMemoryDriver, JobOptions, QueueDriver, QueueDriverExt, WorkerOptions};

    #[test]
    fn test_covers_every_builtin_queue() {
        let mut queues: Vec<_> = default_processors().into_iter().map(|(q, _)| q).collect();
        queues.sort_unstable();
        let mut builtin = BUILTIN_QUEUES.to_vec();
        builtin.sort_unstable();
        assert_eq!(queues, builtin);
    }

    #[tokio::test]
    async fn test_processors_decode_payloads() {
        let driver = InMemoryDriver::new();
        for (queue, processor) in default_processors() {
            driver
                .create_worker(queue, processor, WorkerOptions::new(1))
                .await
                .unwrap();
        }

        let batch = KeyRotationBatch {
            organization_id: "org-a".into(),
            target_key_version: 2,
            offset: 0,
            limit: 100,
        };
        driver.add_job(&batch, JobOptions::default()).await.unwrap();
        driver
            .add(
                WorkflowExecution::QUEUE,
                serde_json::json!({ "unexpected": true }),
                JobOptions::default(),
            )
            .await
            .unwrap();

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let rotation = driver.get_job_counts(KeyRotationBatch::QUEUE).await.unwrap();
        assert_eq!(rotation.completed, 1);
        let workflows = driver.get_job_counts(WorkflowExecution::QUEUE).await.unwrap();
        assert_eq!(workflows.failed, 1);
    }
}
