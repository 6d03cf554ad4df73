//! Step-level error type.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a step handler, or synthesised by the worker running it.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`, `Timeout`, `Panicked`: retried while the policy allows.
/// - `Fatal`: the run fails immediately, remaining attempts are skipped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Transient failure; the engine should re-try the step.
    #[error("retryable step error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal step error: {0}")]
    Fatal(String),

    /// The handler did not finish before the step deadline.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked.
    #[error("step handler panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the retry policy may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Handlers written with `anyhow` can use `?` directly; such errors are
/// treated as transient.
impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_errors_skip_retries() {
        assert!(StepError::retryable("flaky").is_retryable());
        assert!(StepError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(StepError::Panicked("boom".into()).is_retryable());
        assert!(!StepError::fatal("bad input").is_retryable());
    }

    #[test]
    fn anyhow_errors_keep_their_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("fetching invoice");
        let step_err = StepError::from(err);
        assert_eq!(
            step_err,
            StepError::Retryable("fetching invoice: connection refused".into())
        );
    }
}
