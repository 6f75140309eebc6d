//! Job queue configuration.

use crate::error::{JobError, JobResult};
use crate::heartbeat::HeartbeatOptions;
use crate::job::JobOptions;
use crate::queue::{QueueOptions, RetentionPolicy};
use crate::retry::BackoffOptions;
use crate::scheduler::PollingConfig;
use crate::worker::WorkerOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the execution core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Queue driver selection and connection.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Heartbeat and lock renewal.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Queue defaults.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Polling cycle scheduler.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl JobsConfig {
    /// Check invariants that serde defaults cannot express.
    pub fn validate(&self) -> JobResult<()> {
        if self.worker.concurrency == 0 {
            return Err(JobError::Configuration(
                "jobs.worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(JobError::Configuration(
                "jobs.scheduler.batch_size must be at least 1".to_string(),
            ));
        }
        if self.scheduler.region.trim().is_empty() {
            return Err(JobError::Configuration(
                "jobs.scheduler.region must not be empty".to_string(),
            ));
        }
        if self.scheduler.interval_ms == 0 {
            return Err(JobError::Configuration(
                "jobs.scheduler.interval_ms must be positive".to_string(),
            ));
        }
        if self.driver.require_durable
            && self.driver.redis_url.is_none()
            && !self.driver.allow_in_memory_fallback
        {
            return Err(JobError::Configuration(
                "jobs.driver.require_durable is set but no redis_url is configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Queue driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Redis URL. The in-memory driver is used when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all queue and lock keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Refuse to start without a reachable durable broker.
    #[serde(default)]
    pub require_durable: bool,

    /// Development override: run in-memory when the broker is unreachable.
    #[serde(default)]
    pub allow_in_memory_fallback: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
            require_durable: false,
            allow_in_memory_fallback: false,
        }
    }
}

impl DriverConfig {
    /// Returns connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "relay".to_string()
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Max simultaneous jobs per worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Max simultaneous jobs per tenant group.
    #[serde(default)]
    pub group_concurrency: Option<usize>,

    /// Redis polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How often the Redis driver looks for jobs whose lock expired.
    #[serde(default = "default_stalled_check_interval")]
    pub stalled_check_interval_ms: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            group_concurrency: None,
            poll_interval_ms: default_poll_interval(),
            stalled_check_interval_ms: default_stalled_check_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    100
}

fn default_stalled_check_interval() -> u64 {
    30_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl WorkerConfig {
    /// Worker options for a queue.
    pub fn worker_options(&self) -> WorkerOptions {
        let options = WorkerOptions::new(self.concurrency);
        match self.group_concurrency {
            Some(group) => options.with_group_concurrency(group),
            None => options,
        }
    }

    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns stalled check interval as Duration.
    pub fn stalled_check_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_check_interval_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Processing lock TTL in milliseconds.
    #[serde(default = "default_lock_duration")]
    pub lock_duration_ms: u64,

    /// Lock renewal period in milliseconds.
    #[serde(default = "default_lock_renew_time")]
    pub lock_renew_time_ms: u64,

    /// Heartbeat interval override.
    #[serde(default)]
    pub interval_ms: Option<u64>,

    /// Heartbeat timeout override.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            lock_duration_ms: default_lock_duration(),
            lock_renew_time_ms: default_lock_renew_time(),
            interval_ms: None,
            timeout_ms: None,
        }
    }
}

fn default_lock_duration() -> u64 {
    60_000
}

fn default_lock_renew_time() -> u64 {
    15_000
}

impl HeartbeatConfig {
    /// Heartbeat wrapper options.
    pub fn options(&self) -> HeartbeatOptions {
        HeartbeatOptions {
            lock_duration: Some(Duration::from_millis(self.lock_duration_ms)),
            lock_renew_time: Some(Duration::from_millis(self.lock_renew_time_ms)),
            heartbeat_interval: self.interval_ms.map(Duration::from_millis),
            heartbeat_timeout: self.timeout_ms.map(Duration::from_millis),
            observer: None,
        }
    }

    /// Processing lock TTL used by the Redis driver.
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }
}

/// Queue defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default maximum attempts.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Default backoff.
    #[serde(default)]
    pub backoff: Option<BackoffOptions>,

    /// Terminal job retention.
    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff: None,
            retention: RetentionPolicy::default(),
        }
    }
}

fn default_attempts() -> u32 {
    1
}

impl QueueConfig {
    /// Queue options built from the defaults.
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            default_job_options: JobOptions {
                attempts: Some(self.attempts),
                backoff: self.backoff.clone(),
                ..JobOptions::default()
            },
            retention: self.retention.clone(),
        }
    }
}

/// Polling scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run the polling cycle loop in this process.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Cycle interval in milliseconds.
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Max triggers claimed per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Region this process serves.
    #[serde(default = "default_region")]
    pub region: String,

    /// Lock resource prefix.
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            interval_ms: default_interval(),
            batch_size: default_batch_size(),
            region: default_region(),
            lock_prefix: default_lock_prefix(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_interval() -> u64 {
    60_000
}

fn default_batch_size() -> usize {
    50
}

fn default_region() -> String {
    "us".to_string()
}

fn default_lock_prefix() -> String {
    "scheduler".to_string()
}

impl SchedulerConfig {
    /// Cycle lock resource name.
    pub fn lock_resource(&self) -> String {
        format!("{}:{}", self.lock_prefix, self.region)
    }

    /// Returns interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Runner settings.
    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig {
            interval: self.interval(),
            batch_size: self.batch_size,
            region: self.region.clone(),
            lock_resource: self.lock_resource(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.heartbeat.lock_duration_ms, 60_000);
        assert_eq!(config.heartbeat.lock_renew_time_ms, 15_000);
        assert_eq!(config.queue.attempts, 1);
        assert_eq!(config.scheduler.interval_ms, 60_000);
        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.scheduler.lock_resource(), "scheduler:us");
        assert!(config.driver.redis_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: JobsConfig = serde_json::from_value(serde_json::json!({
            "worker": { "concurrency": 8, "group_concurrency": 2 },
            "scheduler": { "region": "eu" },
            "queue": { "attempts": 3, "backoff": { "strategy": "fixed", "delay_ms": 100 } }
        }))
        .unwrap();

        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.group_concurrency, Some(2));
        assert_eq!(config.scheduler.lock_resource(), "scheduler:eu");

        let options = config.queue.queue_options();
        assert_eq!(options.default_job_options.attempts, Some(3));
        assert_eq!(options.default_job_options.backoff, Some(BackoffOptions::fixed(100)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = JobsConfig::default();
        config.worker.concurrency = 0;
        assert!(matches!(config.validate(), Err(JobError::Configuration(_))));

        let mut config = JobsConfig::default();
        config.scheduler.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = JobsConfig::default();
        config.scheduler.region = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_require_durable_needs_url() {
        let mut config = JobsConfig::default();
        config.driver.require_durable = true;
        assert!(config.validate().is_err());

        config.driver.allow_in_memory_fallback = true;
        assert!(config.validate().is_ok());

        config.driver.allow_in_memory_fallback = false;
        config.driver.redis_url = Some("redis://localhost:6379".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_options_from_config() {
        let config = WorkerConfig {
            concurrency: 3,
            group_concurrency: Some(1),
            ..WorkerConfig::default()
        };
        let options = config.worker_options();
        assert_eq!(options.concurrency, 3);
        assert_eq!(options.group_concurrency, Some(1));
    }
}
