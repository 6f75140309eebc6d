//! Polling cycle runner.
//!
//! Several replicas tick on the same interval. Each tick tries the cycle
//! lock; the replica that gets it claims due triggers and dispatches them,
//! the rest skip the tick. No leader is elected.

use crate::error::{JobError, JobResult};
use crate::lock::{with_lock, LockService};
use crate::metrics::SchedulerMetrics;
use crate::tasks::panic_message;
use crate::trigger::{ClaimRequest, Trigger, TriggerHandler, TriggerStore};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, field, info, info_span, warn, Instrument};
use uuid::Uuid;

const MIN_CYCLE_LOCK_TTL: Duration = Duration::from_secs(30);
const MIN_CYCLE_LOCK_SLACK: Duration = Duration::from_secs(5);

/// Cycle lock TTL for a cycle interval: long enough to outlive one cycle,
/// short enough that a crashed holder's lock lapses before the next tick
/// after that.
pub fn cycle_lock_ttl(interval: Duration) -> Duration {
    (interval + interval.max(MIN_CYCLE_LOCK_SLACK)).max(MIN_CYCLE_LOCK_TTL)
}

/// Runner settings.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Max triggers claimed per cycle.
    pub batch_size: usize,
    /// Region this process serves.
    pub region: String,
    /// Cycle lock resource.
    pub lock_resource: String,
}

impl PollingConfig {
    /// Cycle lock TTL.
    pub fn lock_ttl(&self) -> Duration {
        cycle_lock_ttl(self.interval)
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Triggers claimed from the store.
    pub claimed: usize,
    /// Triggers handled successfully.
    pub dispatched: usize,
    /// Triggers whose handler failed or panicked.
    pub failed: usize,
    /// Triggers refused for being outside this region.
    pub cross_region: usize,
    /// Wall time of the cycle.
    pub duration_ms: u64,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another holder had the cycle lock.
    LockSkipped,
    /// The cycle ran.
    Completed(CycleReport),
}

/// Runner statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    /// Runner ID.
    pub id: String,
    /// Region served.
    pub region: String,
    /// Is the tick loop running.
    pub running: bool,
    /// Cycles that ran under the lock.
    pub cycles_run: u64,
    /// Ticks skipped on lock contention.
    pub cycles_skipped: u64,
    /// Cycles that ended in an error (claim failure, lock backend failure).
    pub cycles_failed: u64,
    /// Last completed cycle.
    pub last_cycle: Option<CycleReport>,
    /// When the last cycle completed.
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Runs polling cycles under the distributed cycle lock.
pub struct PollingCycleRunner {
    /// Unique runner ID.
    id: String,

    /// Runner settings.
    config: PollingConfig,

    /// Cycle lock service.
    locks: LockService,

    /// Due trigger source.
    store: Arc<dyn TriggerStore>,

    /// Per-trigger handler.
    handler: Arc<dyn TriggerHandler>,

    /// Statistics.
    stats: RwLock<SchedulerStats>,

    /// Shutdown signal. Stays cancelled once stopped.
    shutdown: CancellationToken,

    /// Running flag.
    running: AtomicBool,
}

impl PollingCycleRunner {
    /// Create a runner.
    pub fn new(
        config: PollingConfig,
        locks: LockService,
        store: Arc<dyn TriggerStore>,
        handler: Arc<dyn TriggerHandler>,
    ) -> Self {
        let id = format!("scheduler-{}", Uuid::new_v4());
        let stats = SchedulerStats {
            id: id.clone(),
            region: config.region.clone(),
            ..SchedulerStats::default()
        };

        Self {
            id,
            config,
            locks,
            store,
            handler,
            stats: RwLock::new(stats),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Runner ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runner settings.
    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats.read().clone();
        stats.running = self.running.load(Ordering::SeqCst);
        stats
    }

    /// Run one tick: take the cycle lock or skip, then claim and dispatch.
    ///
    /// Per-trigger failures are counted, never returned. An error here means
    /// the lock backend or the trigger store failed; the lock has been
    /// released either way.
    pub async fn run_cycle(&self) -> JobResult<CycleOutcome> {
        let resource = self.config.lock_resource.as_str();
        let span = info_span!(
            "relay.polling_cycle",
            runner_id = %self.id,
            region = %self.config.region,
            resource = %resource,
            claimed = field::Empty,
            dispatched = field::Empty,
            outcome = field::Empty,
        );

        async {
            let started = Instant::now();
            let locked = with_lock(&self.locks, resource, self.config.lock_ttl(), move || async move {
                SchedulerMetrics::lock_acquired(resource);
                self.dispatch_due(started).await
            })
            .await;

            let span = tracing::Span::current();
            match locked {
                Ok(None) => {
                    SchedulerMetrics::lock_skipped(resource);
                    debug!("Cycle lock held elsewhere, skipping tick");
                    span.record("outcome", "lock_skipped");
                    self.stats.write().cycles_skipped += 1;
                    Ok(CycleOutcome::LockSkipped)
                }
                Ok(Some(Ok(report))) => {
                    span.record("claimed", report.claimed);
                    span.record("dispatched", report.dispatched);
                    span.record("outcome", "completed");
                    SchedulerMetrics::cycle_duration(&self.config.region, started.elapsed());
                    {
                        let mut stats = self.stats.write();
                        stats.cycles_run += 1;
                        stats.last_cycle = Some(report.clone());
                        stats.last_cycle_at = Some(Utc::now());
                    }
                    Ok(CycleOutcome::Completed(report))
                }
                Ok(Some(Err(e))) | Err(e) => {
                    span.record("outcome", "failed");
                    self.stats.write().cycles_failed += 1;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch_due(&self, started: Instant) -> JobResult<CycleReport> {
        let request = ClaimRequest {
            limit: self.config.batch_size,
            now: Utc::now(),
            region: self.config.region.clone(),
        };
        let triggers = self.store.claim_due_polling_triggers(&request).await?;

        let mut report = CycleReport {
            claimed: triggers.len(),
            ..CycleReport::default()
        };

        for trigger in &triggers {
            if !trigger.runs_in(&self.config.region) {
                self.refuse_cross_region(trigger);
                report.cross_region += 1;
                continue;
            }

            match AssertUnwindSafe(self.handler.handle(trigger)).catch_unwind().await {
                Ok(Ok(())) => {
                    SchedulerMetrics::trigger_dispatched(&self.config.region);
                    report.dispatched += 1;
                }
                Ok(Err(e)) => {
                    warn!(
                        trigger_id = %trigger.id,
                        organization_id = %trigger.organization_id,
                        error = %e,
                        "Trigger handler failed"
                    );
                    SchedulerMetrics::trigger_failed(&self.config.region, e.reason());
                    report.failed += 1;
                }
                Err(panic) => {
                    error!(
                        trigger_id = %trigger.id,
                        organization_id = %trigger.organization_id,
                        panic = %panic_message(&*panic),
                        "Trigger handler panicked"
                    );
                    SchedulerMetrics::trigger_failed(&self.config.region, "panicked");
                    report.failed += 1;
                }
            }
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(report)
    }

    fn refuse_cross_region(&self, trigger: &Trigger) {
        let violation = JobError::CrossRegion {
            trigger_id: trigger.id.clone(),
            trigger_region: trigger.region.clone(),
            worker_region: self.config.region.clone(),
        };
        warn!(
            trigger_id = %trigger.id,
            organization_id = %trigger.organization_id,
            trigger_region = %trigger.region,
            worker_region = %self.config.region,
            error = %violation,
            "Refusing trigger outside this region"
        );
        SchedulerMetrics::cross_region_violation(&trigger.region, &self.config.region);
    }

    /// Tick until [`stop`](Self::stop) is called. A cycle in flight when the
    /// stop signal arrives finishes first. A stop issued before the loop
    /// begins is honoured: the loop exits without running a cycle.
    pub async fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Scheduler already running".to_string()));
        }

        info!(
            runner_id = %self.id,
            region = %self.config.region,
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            "Starting polling scheduler"
        );

        let mut ticker = interval(self.config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    info!(runner_id = %self.id, "Received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            error!(runner_id = %self.id, error = %e, "Polling cycle failed");
                        }
                        Err(panic) => {
                            self.stats.write().cycles_failed += 1;
                            error!(
                                runner_id = %self.id,
                                panic = %panic_message(&*panic),
                                "Polling cycle panicked"
                            );
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(runner_id = %self.id, "Polling scheduler stopped");

        Ok(())
    }

    /// Stop the tick loop. A stopped runner does not start again.
    pub fn stop(&self) {
        info!(runner_id = %self.id, "Stopping polling scheduler...");
        self.shutdown.cancel();
    }

    /// Is the tick loop running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PollingCycleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingCycleRunner")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}
