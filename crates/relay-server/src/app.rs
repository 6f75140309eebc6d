//! Application builder.

use relay_config::AppConfig;
use relay_core::RelayResult;
use relay_jobs::kinds::BUILTIN_QUEUES;
use relay_jobs::{
    connect_driver, with_heartbeat, Backend, EnqueueTriggerHandler, HealthMonitor, HealthReport,
    InMemoryTriggerStore, JobResult, PollingCycleRunner, Processor, QueueDriver, QueueDriverExt,
    TriggerStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Application builder for constructing the execution host.
pub struct AppBuilder {
    config: Option<AppConfig>,
    processors: Vec<(String, Processor)>,
    trigger_store: Option<Arc<dyn TriggerStore>>,
}

impl AppBuilder {
    /// Creates a new application builder.
    pub fn new() -> Self {
        Self {
            config: None,
            processors: Vec::new(),
            trigger_store: None,
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Registers a processor for `queue`. It is wrapped with the heartbeat
    /// and started with the configured worker options.
    pub fn with_processor(mut self, queue: impl Into<String>, processor: Processor) -> Self {
        self.processors.push((queue.into(), processor));
        self
    }

    /// Uses `store` for due polling triggers instead of the in-memory one.
    pub fn with_trigger_store(mut self, store: Arc<dyn TriggerStore>) -> Self {
        self.trigger_store = Some(store);
        self
    }

    /// Connects the driver, creates queues and workers, and prepares the
    /// scheduler. Nothing is dispatched by the scheduler until [`App::start`].
    pub async fn build(self) -> RelayResult<App> {
        let config = self.config.unwrap_or_default();
        let jobs = &config.jobs;

        let backend = connect_driver(jobs).await?;

        let queue_options = jobs.queue.queue_options();
        for queue in BUILTIN_QUEUES {
            backend.driver.create_queue(queue, queue_options.clone()).await?;
        }

        for (queue, processor) in self.processors {
            if !BUILTIN_QUEUES.contains(&queue.as_str()) {
                backend.driver.create_queue(&queue, queue_options.clone()).await?;
            }
            let processor = with_heartbeat(processor, jobs.heartbeat.options());
            let handle = backend
                .driver
                .create_worker(&queue, processor, jobs.worker.worker_options())
                .await?;
            info!(queue = %queue, worker_id = %handle.id, "Worker registered");
        }

        let scheduler = if jobs.scheduler.enabled {
            let store = self.trigger_store.unwrap_or_else(|| -> Arc<dyn TriggerStore> {
                Arc::new(InMemoryTriggerStore::default())
            });
            let handler = Arc::new(EnqueueTriggerHandler::new(backend.driver.clone()));
            Some(Arc::new(PollingCycleRunner::new(
                jobs.scheduler.polling_config(),
                backend.locks.clone(),
                store,
                handler,
            )))
        } else {
            info!("Polling scheduler disabled");
            None
        };

        let mut health = HealthMonitor::new(backend.driver.clone(), backend.degraded);
        if let Some(scheduler) = &scheduler {
            health = health.with_scheduler(scheduler.clone());
        }

        Ok(App {
            config,
            backend,
            scheduler,
            scheduler_task: None,
            health,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running execution host: queue driver, workers and polling scheduler.
pub struct App {
    config: AppConfig,
    backend: Backend,
    scheduler: Option<Arc<PollingCycleRunner>>,
    scheduler_task: Option<JoinHandle<JobResult<()>>>,
    health: HealthMonitor,
}

impl App {
    /// Starts the polling scheduler loop, if enabled.
    pub fn start(&mut self) {
        if self.scheduler_task.is_some() {
            return;
        }
        if let Some(scheduler) = &self.scheduler {
            let scheduler = scheduler.clone();
            self.scheduler_task = Some(tokio::spawn(async move { scheduler.start().await }));
        }
    }

    /// Configuration the app was built with.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The selected queue driver.
    pub fn driver(&self) -> Arc<dyn QueueDriver> {
        self.backend.driver.clone()
    }

    /// The polling scheduler, if enabled.
    pub fn scheduler(&self) -> Option<&Arc<PollingCycleRunner>> {
        self.scheduler.as_ref()
    }

    /// Point-in-time health report.
    pub async fn health(&self) -> HealthReport {
        self.health.report().await
    }

    /// Stops taking new work and waits for in-flight cycles and jobs.
    ///
    /// The scheduler loop finishes its current cycle, the driver stops
    /// dispatching, then running jobs get up to `shutdown_timeout_secs` to
    /// settle. Jobs still running after that are left to the broker's
    /// stalled-job recovery.
    pub async fn shutdown(self) -> RelayResult<()> {
        let timeout = self.config.jobs.worker.shutdown_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
        if let Some(mut task) = self.scheduler_task {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "Scheduler loop exited with error"),
                Ok(Err(e)) => error!(error = %e, "Scheduler task panicked"),
                Err(_) => {
                    warn!("Timed out waiting for the polling cycle to finish, aborting it");
                    task.abort();
                }
            }
        }

        self.backend.driver.close().await?;

        loop {
            let active = self.backend.driver.active_in_process();
            if active == 0 {
                info!("All in-flight jobs settled");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "Shutdown timeout reached with jobs still running");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        Ok(())
    }
}
