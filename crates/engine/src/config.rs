//! Engine configuration.
//!
//! Every knob has a default; `from_env` overrides them from `STEPWISE_*`
//! environment variables. Values that do not parse are logged and ignored.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::models::{Backoff, RetryPolicy};
use crate::EngineError;

/// Tuning knobs for the engine and its worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker units started by `WorkerPool::start_configured`.
    pub max_concurrency: usize,
    /// Retry policy for workflows assembled step by step through the registry.
    pub default_retry: RetryPolicy,
    /// Deadline applied to steps that do not declare their own.
    pub default_step_timeout: Option<Duration>,
    /// How long finished runs stay in memory before `archive_completed`
    /// drops them.
    pub retention: Duration,
    /// How often a running worker pool calls `archive_completed`.
    /// `None` leaves archiving to the caller.
    pub archive_interval: Option<Duration>,
    /// Pause before an engine transition that failed on the state store is
    /// attempted again.
    pub store_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_retry: RetryPolicy::default(),
            default_step_timeout: None,
            retention: Duration::from_secs(3600),
            archive_interval: Some(Duration::from_secs(60)),
            store_retry_delay: Duration::from_secs(1),
        }
    }
}

fn env_var<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "ignoring invalid environment variable");
            None
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// `STEPWISE_MAX_CONCURRENCY`, `STEPWISE_MAX_ATTEMPTS`,
    /// `STEPWISE_RETRY_BASE_MS`, `STEPWISE_STEP_TIMEOUT_MS`,
    /// `STEPWISE_RETENTION_SECS`, `STEPWISE_ARCHIVE_INTERVAL_SECS` (0 turns
    /// periodic archiving off) and `STEPWISE_STORE_RETRY_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_concurrency = env_var::<usize>("STEPWISE_MAX_CONCURRENCY")
            .unwrap_or(defaults.max_concurrency);

        let max_attempts = env_var::<u32>("STEPWISE_MAX_ATTEMPTS")
            .unwrap_or(defaults.default_retry.max_attempts);

        let backoff = match env_var::<u64>("STEPWISE_RETRY_BASE_MS") {
            Some(ms) => Backoff::exponential(Duration::from_millis(ms)),
            None => defaults.default_retry.backoff.clone(),
        };
        let default_retry = RetryPolicy::new(max_attempts, backoff);

        let default_step_timeout = env_var::<u64>("STEPWISE_STEP_TIMEOUT_MS")
            .map(Duration::from_millis)
            .or(defaults.default_step_timeout);

        let retention = env_var::<u64>("STEPWISE_RETENTION_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.retention);

        let archive_interval = match env_var::<u64>("STEPWISE_ARCHIVE_INTERVAL_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.archive_interval,
        };

        let store_retry_delay = env_var::<u64>("STEPWISE_STORE_RETRY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.store_retry_delay);

        Self {
            max_concurrency,
            default_retry,
            default_step_timeout,
            retention,
            archive_interval,
            store_retry_delay,
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be at least 1".into()));
        }
        if self.default_retry.max_attempts == 0 {
            return Err(EngineError::Config("max_attempts must be at least 1".into()));
        }
        if self.archive_interval == Some(Duration::ZERO) {
            return Err(EngineError::Config("archive_interval must not be zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_retry.max_attempts, 3);
        assert_eq!(config.default_step_timeout, None);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = EngineConfig { max_concurrency: 0, ..EngineConfig::default() };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn zero_attempts_or_archive_interval_is_rejected() {
        let mut config = EngineConfig::default();
        config.default_retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig { archive_interval: Some(Duration::ZERO), ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }

    // Only this test touches STEPWISE_* variables, so it cannot race others.
    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("STEPWISE_MAX_CONCURRENCY", "9");
        std::env::set_var("STEPWISE_MAX_ATTEMPTS", "5");
        std::env::set_var("STEPWISE_STEP_TIMEOUT_MS", "250");
        std::env::set_var("STEPWISE_RETENTION_SECS", "not-a-number");
        std::env::set_var("STEPWISE_ARCHIVE_INTERVAL_SECS", "0");
        let overridden = EngineConfig::from_env();

        // Zero attempts is clamped; values beyond u32 are ignored, not truncated.
        std::env::set_var("STEPWISE_MAX_ATTEMPTS", "0");
        let clamped = EngineConfig::from_env();
        std::env::set_var("STEPWISE_MAX_ATTEMPTS", "4294967297");
        let overflowed = EngineConfig::from_env();

        for key in [
            "STEPWISE_MAX_CONCURRENCY",
            "STEPWISE_MAX_ATTEMPTS",
            "STEPWISE_STEP_TIMEOUT_MS",
            "STEPWISE_RETENTION_SECS",
            "STEPWISE_ARCHIVE_INTERVAL_SECS",
        ] {
            std::env::remove_var(key);
        }

        assert_eq!(overridden.max_concurrency, 9);
        assert_eq!(overridden.default_retry.max_attempts, 5);
        assert_eq!(overridden.default_step_timeout, Some(Duration::from_millis(250)));
        assert_eq!(overridden.retention, Duration::from_secs(3600));
        assert_eq!(overridden.archive_interval, None);

        assert_eq!(clamped.default_retry.max_attempts, 1);
        assert!(clamped.validate().is_ok());
        assert_eq!(overflowed.default_retry.max_attempts, 3);
    }
}
