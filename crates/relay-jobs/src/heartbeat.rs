//! Heartbeat and lock-renewal wrapper for job processors.
//!
//! [`with_heartbeat`] wraps a processor so that every attempt runs next to
//! a heartbeat loop. Each tick renews the job's processing lock (when the
//! driver keeps one) and reports to an optional observer. If no heartbeat
//! succeeds for `heartbeat_timeout`, the attempt fails with
//! [`JobError::HeartbeatTimeout`] and the processor future is dropped.

use crate::error::{JobError, JobResult};
use crate::job::{JobContext, JobData};
use crate::metrics::HeartbeatMetrics;
use crate::worker::Processor;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info_span, warn, Instrument, Span};

/// Default processing lock TTL.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);

/// Default lock renewal period.
pub const DEFAULT_LOCK_RENEW_TIME: Duration = Duration::from_secs(15);

/// Heartbeat interval floor.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);

/// Called after every successful heartbeat.
pub type HeartbeatObserver = Arc<dyn Fn(&JobContext, &HeartbeatEvent) + Send + Sync>;

/// What a heartbeat observer is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEvent {
    /// When the heartbeat happened.
    pub timestamp: DateTime<Utc>,
    /// New lock expiry, when a lock was renewed.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Successful heartbeats so far for this attempt.
    pub renew_count: u64,
}

/// Caller-supplied heartbeat settings. Unset fields use the defaults.
#[derive(Clone, Default)]
pub struct HeartbeatOptions {
    /// Processing lock TTL.
    pub lock_duration: Option<Duration>,
    /// Lock renewal period.
    pub lock_renew_time: Option<Duration>,
    /// Heartbeat interval. Defaults to `lock_renew_time`.
    pub heartbeat_interval: Option<Duration>,
    /// Time without a successful heartbeat before the job fails.
    /// Defaults to four lock durations.
    pub heartbeat_timeout: Option<Duration>,
    /// Observer invoked after each successful heartbeat.
    pub observer: Option<HeartbeatObserver>,
}

impl HeartbeatOptions {
    /// Sets the interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Sets the observer.
    pub fn observer(
        mut self,
        observer: impl Fn(&JobContext, &HeartbeatEvent) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }
}

impl fmt::Debug for HeartbeatOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatOptions")
            .field("lock_duration", &self.lock_duration)
            .field("lock_renew_time", &self.lock_renew_time)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Effective heartbeat timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Processing lock TTL.
    pub lock_duration: Duration,
    /// Lock renewal period.
    pub lock_renew_time: Duration,
    /// Tick period, at least [`MIN_HEARTBEAT_INTERVAL`].
    pub interval: Duration,
    /// Failure threshold, at least two intervals.
    pub timeout: Duration,
}

impl HeartbeatSettings {
    /// Apply defaults and floors.
    pub fn resolve(options: &HeartbeatOptions) -> Self {
        let lock_duration = options.lock_duration.unwrap_or(DEFAULT_LOCK_DURATION);
        let lock_renew_time = options.lock_renew_time.unwrap_or(DEFAULT_LOCK_RENEW_TIME);
        let interval = options
            .heartbeat_interval
            .unwrap_or(lock_renew_time)
            .max(MIN_HEARTBEAT_INTERVAL);
        let timeout = options
            .heartbeat_timeout
            .unwrap_or(lock_duration.saturating_mul(4))
            .max(interval.saturating_mul(2));

        Self {
            lock_duration,
            lock_renew_time,
            interval,
            timeout,
        }
    }
}

/// Wrap `processor` with a heartbeat loop and a per-job span.
pub fn with_heartbeat(processor: Processor, options: HeartbeatOptions) -> Processor {
    let settings = HeartbeatSettings::resolve(&options);
    let observer = options.observer;

    Arc::new(move |job: JobData, ctx: JobContext| -> BoxFuture<'static, JobResult<()>> {
        let processor = processor.clone();
        let observer = observer.clone();
        let span = info_span!(
            "relay.job",
            job.id = %ctx.job_id,
            queue = %ctx.queue,
            attempt = ctx.attempt,
            status = field::Empty,
            duration_ms = field::Empty,
            heartbeat.renew_count = field::Empty,
        );
        Box::pin(run_attempt(processor, job, ctx, settings, observer).instrument(span))
    })
}

async fn run_attempt(
    processor: Processor,
    job: JobData,
    ctx: JobContext,
    settings: HeartbeatSettings,
    observer: Option<HeartbeatObserver>,
) -> JobResult<()> {
    let started = Instant::now();
    let renew_count = Arc::new(AtomicU64::new(0));
    let stop = CancellationToken::new();

    let heartbeat = heartbeat_loop(
        ctx.clone(),
        settings,
        observer,
        renew_count.clone(),
        stop.clone(),
    );
    tokio::pin!(heartbeat);
    let mut work = processor(job, ctx);

    // The heartbeat loop only returns Ok after `stop` is cancelled, so the
    // second branch can only win with an error.
    let result = tokio::select! {
        result = &mut work => {
            stop.cancel();
            let _ = heartbeat.await;
            result
        }
        Err(error) = &mut heartbeat => Err(error),
    };

    let span = Span::current();
    let status = match &result {
        Ok(()) => "completed",
        Err(error) => error.reason(),
    };
    span.record("status", status);
    span.record("duration_ms", started.elapsed().as_millis() as u64);
    span.record("heartbeat.renew_count", renew_count.load(Ordering::SeqCst));

    result
}

async fn heartbeat_loop(
    ctx: JobContext,
    settings: HeartbeatSettings,
    observer: Option<HeartbeatObserver>,
    renew_count: Arc<AtomicU64>,
    stop: CancellationToken,
) -> JobResult<()> {
    let mut last_success = Instant::now();

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            () = tokio::time::sleep(settings.interval) => {}
        }

        let elapsed = last_success.elapsed();
        if elapsed > settings.timeout {
            HeartbeatMetrics::timed_out(&ctx.queue);
            warn!(
                job_id = %ctx.job_id,
                queue = %ctx.queue,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = settings.timeout.as_millis() as u64,
                "Heartbeat timeout"
            );
            return Err(JobError::HeartbeatTimeout {
                job_id: ctx.job_id.to_string(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        let lock_expires_at = match &ctx.lock {
            Some(lock) => {
                let extend = lock.extend(&ctx.job_id, settings.lock_duration);
                match tokio::time::timeout(settings.interval, extend).await {
                    Ok(Ok(expires_at)) => Some(expires_at),
                    Ok(Err(error)) => {
                        warn!(job_id = %ctx.job_id, error = %error, "Failed to extend job lock");
                        continue;
                    }
                    Err(_) => {
                        warn!(job_id = %ctx.job_id, "Job lock extension timed out");
                        continue;
                    }
                }
            }
            None => None,
        };

        last_success = Instant::now();
        let count = renew_count.fetch_add(1, Ordering::SeqCst) + 1;
        HeartbeatMetrics::renewed(&ctx.queue);
        Span::current().record("heartbeat.renew_count", count);
        debug!(job_id = %ctx.job_id, renew_count = count, "Heartbeat");

        if let Some(observer) = &observer {
            observer(
                &ctx,
                &HeartbeatEvent {
                    timestamp: Utc::now(),
                    lock_expires_at,
                    renew_count: count,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobLock, JobLockExtender, JobOptions};
    use crate::worker::processor;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct CountingExtender {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingExtender {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobLockExtender for CountingExtender {
        async fn extend_lock(
            &self,
            _job_id: &JobId,
            _token: &str,
            duration: Duration,
        ) -> JobResult<DateTime<Utc>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(JobError::LockLost("token mismatch".into()));
            }
            Ok(Utc::now() + chrono::Duration::from_std(duration).unwrap())
        }
    }

    fn job_with_lock(extender: Arc<CountingExtender>) -> (JobData, JobContext) {
        let job = JobData::new("q", serde_json::json!({}), JobOptions::default());
        let ctx = job.to_context("w1", Some(JobLock::new("token-1", extender)));
        (job, ctx)
    }

    fn sleeping(duration: Duration) -> Processor {
        processor(move |_, _| async move {
            tokio::time::sleep(duration).await;
            Ok::<(), JobError>(())
        })
    }

    #[test]
    fn test_settings_defaults() {
        let settings = HeartbeatSettings::resolve(&HeartbeatOptions::default());
        assert_eq!(settings.lock_duration, Duration::from_secs(60));
        assert_eq!(settings.interval, Duration::from_secs(15));
        assert_eq!(settings.timeout, Duration::from_secs(240));
    }

    #[test]
    fn test_settings_floors() {
        let settings = HeartbeatSettings::resolve(
            &HeartbeatOptions::default()
                .interval(Duration::from_millis(10))
                .timeout(Duration::from_millis(100)),
        );
        assert_eq!(settings.interval, MIN_HEARTBEAT_INTERVAL);
        assert_eq!(settings.timeout, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_count_increases_while_running() {
        let extender = CountingExtender::new(false);
        let counts = Arc::new(Mutex::new(Vec::new()));
        let seen = counts.clone();

        let wrapped = with_heartbeat(
            sleeping(Duration::from_millis(1100)),
            HeartbeatOptions::default()
                .interval(Duration::from_millis(250))
                .observer(move |_, event| {
                    assert!(event.lock_expires_at.is_some());
                    seen.lock().push(event.renew_count);
                }),
        );

        let (job, ctx) = job_with_lock(extender.clone());
        wrapped(job, ctx).await.unwrap();

        let counts = counts.lock().clone();
        assert_eq!(counts, vec![1, 2, 3, 4]);
        assert_eq!(extender.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_renewals_time_out_the_job() {
        let extender = CountingExtender::new(true);
        let wrapped = with_heartbeat(
            sleeping(Duration::from_secs(60)),
            HeartbeatOptions::default()
                .interval(Duration::from_millis(250))
                .timeout(Duration::from_millis(500)),
        );

        let (job, ctx) = job_with_lock(extender.clone());
        let err = wrapped(job, ctx).await.unwrap_err();

        assert!(matches!(err, JobError::HeartbeatTimeout { .. }));
        assert_eq!(err.reason(), "heartbeat_timeout");
        let calls_at_detection = extender.calls();
        assert_eq!(calls_at_detection, 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(extender.calls(), calls_at_detection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_error_passes_through_and_stops_loop() {
        let extender = CountingExtender::new(false);
        let wrapped = with_heartbeat(
            processor(|_, _| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Err::<(), _>(JobError::failed("application error"))
            }),
            HeartbeatOptions::default().interval(Duration::from_millis(250)),
        );

        let (job, ctx) = job_with_lock(extender.clone());
        let err = wrapped(job, ctx).await.unwrap_err();
        assert!(matches!(err, JobError::ExecutionFailed(_)));
        assert_eq!(extender.calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(extender.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_lock_heartbeats_still_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();
        let wrapped = with_heartbeat(
            sleeping(Duration::from_millis(600)),
            HeartbeatOptions::default()
                .interval(Duration::from_millis(250))
                .observer(move |_, event| {
                    assert!(event.lock_expires_at.is_none());
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        );

        let job = JobData::new("q", serde_json::json!({}), JobOptions::default());
        let ctx = job.to_context("w1", None);
        wrapped(job, ctx).await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
