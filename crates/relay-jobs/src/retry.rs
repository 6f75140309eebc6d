//! Backoff strategies for failed jobs.
//!
//! A job names its strategy (`"fixed"`, `"exponential"`, `"linear"` or a
//! custom name registered on the [`BackoffResolver`]). A name nobody knows
//! resolves to a zero delay, so the job is re-queued immediately.

use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default cap for computed delays (1 hour).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);

/// Backoff settings carried on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffOptions {
    /// Strategy name.
    pub strategy: String,

    /// Base delay in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

impl BackoffOptions {
    /// Creates options for an arbitrary strategy name.
    pub fn new(strategy: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            strategy: strategy.into(),
            delay_ms,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(delay_ms: u64) -> Self {
        Self::new(RetryStrategy::Fixed.name(), delay_ms)
    }

    /// Delay doubles with each failed attempt.
    pub fn exponential(delay_ms: u64) -> Self {
        Self::new(RetryStrategy::Exponential.name(), delay_ms)
    }

    /// Delay grows by `delay_ms` with each failed attempt.
    pub fn linear(delay_ms: u64) -> Self {
        Self::new(RetryStrategy::Linear.name(), delay_ms)
    }
}

/// Built-in retry strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff.
    Exponential,
    /// Linear backoff.
    Linear,
}

impl RetryStrategy {
    /// Look up a built-in strategy by name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "fixed" => Some(RetryStrategy::Fixed),
            "exponential" => Some(RetryStrategy::Exponential),
            "linear" => Some(RetryStrategy::Linear),
            _ => None,
        }
    }

    /// Strategy name as used in job options.
    pub fn name(self) -> &'static str {
        match self {
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Linear => "linear",
        }
    }

    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_for_attempt(self, base_ms: u64, attempts_made: u32, max: Duration) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let delay_ms = match self {
            RetryStrategy::Fixed => base_ms,
            RetryStrategy::Exponential => {
                let exp = (attempts_made - 1).min(31);
                base_ms.saturating_mul(1u64 << exp)
            }
            RetryStrategy::Linear => base_ms.saturating_mul(u64::from(attempts_made)),
        };

        Duration::from_millis(delay_ms).min(max)
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Custom strategy: `(attempts_made, options, error) -> delay`.
///
/// Returning `None` means the strategy could not resolve a delay; the job
/// is retried immediately.
pub type BackoffFn =
    Arc<dyn Fn(u32, &BackoffOptions, &JobError) -> Option<Duration> + Send + Sync>;

/// Resolves a job's backoff settings to a concrete delay.
#[derive(Clone)]
pub struct BackoffResolver {
    custom: HashMap<String, BackoffFn>,
    max_delay: Duration,
}

impl Default for BackoffResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffResolver {
    /// Resolver with only the built-in strategies.
    pub fn new() -> Self {
        Self {
            custom: HashMap::new(),
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Cap every computed delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Register a named strategy. Custom names shadow built-ins.
    pub fn register(
        mut self,
        name: impl Into<String>,
        strategy: impl Fn(u32, &BackoffOptions, &JobError) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.custom.insert(name.into(), Arc::new(strategy));
        self
    }

    /// Returns true if `name` resolves to a strategy.
    pub fn knows(&self, name: &str) -> bool {
        self.custom.contains_key(name) || RetryStrategy::from_name(name).is_some()
    }

    /// Delay before re-queueing a job that has failed `attempts_made` times.
    pub fn resolve(
        &self,
        backoff: Option<&BackoffOptions>,
        attempts_made: u32,
        error: &JobError,
    ) -> Duration {
        let Some(options) = backoff else {
            return Duration::ZERO;
        };

        if let Some(strategy) = self.custom.get(&options.strategy) {
            return strategy(attempts_made, options, error)
                .map_or(Duration::ZERO, |delay| delay.min(self.max_delay));
        }

        match RetryStrategy::from_name(&options.strategy) {
            Some(strategy) => {
                strategy.delay_for_attempt(options.delay_ms, attempts_made, self.max_delay)
            }
            None => {
                debug!(strategy = %options.strategy, "Unknown backoff strategy, retrying immediately");
                Duration::ZERO
            }
        }
    }
}

impl fmt::Debug for BackoffResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffResolver")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> JobError {
        JobError::failed("boom")
    }

    #[test]
    fn test_no_backoff_is_immediate() {
        let resolver = BackoffResolver::new();
        assert_eq!(resolver.resolve(None, 1, &err()), Duration::ZERO);
    }

    #[test]
    fn test_fixed_backoff() {
        let resolver = BackoffResolver::new();
        let opts = BackoffOptions::fixed(100);
        assert_eq!(resolver.resolve(Some(&opts), 1, &err()), Duration::from_millis(100));
        assert_eq!(resolver.resolve(Some(&opts), 2, &err()), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff() {
        let resolver = BackoffResolver::new();
        let opts = BackoffOptions::exponential(1000);

        assert_eq!(resolver.resolve(Some(&opts), 1, &err()), Duration::from_millis(1000));
        assert_eq!(resolver.resolve(Some(&opts), 2, &err()), Duration::from_millis(2000));
        assert_eq!(resolver.resolve(Some(&opts), 3, &err()), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_backoff() {
        let opts = BackoffOptions::linear(1000);
        let resolver = BackoffResolver::new();

        assert_eq!(resolver.resolve(Some(&opts), 1, &err()), Duration::from_millis(1000));
        assert_eq!(resolver.resolve(Some(&opts), 3, &err()), Duration::from_millis(3000));
    }

    #[test]
    fn test_max_delay_cap() {
        let resolver = BackoffResolver::new().with_max_delay(Duration::from_secs(10));
        let opts = BackoffOptions::exponential(1000);
        assert_eq!(resolver.resolve(Some(&opts), 30, &err()), Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_strategy_is_immediate() {
        let resolver = BackoffResolver::new();
        let opts = BackoffOptions::new("fibonacci", 500);
        assert!(!resolver.knows("fibonacci"));
        assert_eq!(resolver.resolve(Some(&opts), 2, &err()), Duration::ZERO);
    }

    #[test]
    fn test_custom_strategy() {
        let resolver = BackoffResolver::new()
            .register("jittered", |attempts, opts, _| {
                Some(Duration::from_millis(opts.delay_ms + u64::from(attempts)))
            })
            .register("unresolved", |_, _, _| None);

        let opts = BackoffOptions::new("jittered", 10);
        assert!(resolver.knows("jittered"));
        assert_eq!(resolver.resolve(Some(&opts), 2, &err()), Duration::from_millis(12));

        let opts = BackoffOptions::new("unresolved", 10);
        assert_eq!(resolver.resolve(Some(&opts), 2, &err()), Duration::ZERO);
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in [RetryStrategy::Fixed, RetryStrategy::Exponential, RetryStrategy::Linear] {
            assert_eq!(RetryStrategy::from_name(strategy.name()), Some(strategy));
        }
    }
}
