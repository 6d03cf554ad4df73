//! `MockStep`: a test double for `StepHandler`.
//!
//! Useful in unit and integration tests where a real step implementation is
//! either unavailable or irrelevant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{StepContext, StepError, StepHandler};

/// Behaviour injected into `MockStep` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `failures` calls, then
    /// return the value.
    FailTimes { failures: u32, value: Value },
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub input: Value,
    pub attempt: u32,
    /// Names of the upstream steps whose outputs were visible.
    pub visible_steps: Vec<String>,
}

/// A mock step that records every call it receives and returns a
/// programmer-specified result.
///
/// Clones share the same call log, so a test can keep one clone for
/// assertions and hand the other to a workflow.
#[derive(Clone)]
pub struct MockStep {
    /// Label merged into successful outputs.
    pub name: String,
    behaviour: Arc<MockBehaviour>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    seen: Arc<AtomicU32>,
}

impl MockStep {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour: Arc::new(behaviour),
            calls: Arc::new(Mutex::new(Vec::new())),
            seen: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: u32, value: Value) -> Self {
        Self::with(name, MockBehaviour::FailTimes { failures, value })
    }

    /// Number of times this step has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Every call seen so far, in call order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn success(&self, v: &Value) -> Value {
        // Merge the step label into the value so tests can trace data flow.
        let mut out = json!({ "step": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl StepHandler for MockStep {
    async fn execute(&self, input: Value, ctx: &StepContext) -> Result<Value, StepError> {
        let mut visible_steps: Vec<String> = ctx.prior_results.keys().cloned().collect();
        visible_steps.sort();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockCall { input, attempt: ctx.attempt, visible_steps });
        let call = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(step = %self.name, call, "mock step executed");

        match self.behaviour.as_ref() {
            MockBehaviour::ReturnValue(v) => Ok(self.success(v)),
            MockBehaviour::FailRetryable(msg) => Err(StepError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(StepError::Fatal(msg.clone())),
            MockBehaviour::FailTimes { failures, value } => {
                if call <= *failures {
                    Err(StepError::Retryable(format!("{} failure {call}", self.name)))
                } else {
                    Ok(self.success(value))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx(attempt: u32) -> StepContext {
        StepContext {
            run_id: uuid::Uuid::now_v7(),
            workflow_name: "wf".into(),
            step_name: "mock".into(),
            attempt,
            prior_results: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn returning_merges_label_into_output() {
        let step = MockStep::returning("a", json!({ "n": 1 }));
        let out = step.execute(json!({}), &ctx(1)).await.unwrap();
        assert_eq!(out, json!({ "step": "a", "n": 1 }));
        assert_eq!(step.call_count(), 1);
    }

    #[tokio::test]
    async fn flaky_fails_then_succeeds() {
        let step = MockStep::flaky("f", 2, json!({ "ok": true }));
        assert!(step.execute(json!({}), &ctx(1)).await.is_err());
        assert!(step.execute(json!({}), &ctx(2)).await.is_err());
        let out = step.execute(json!({}), &ctx(3)).await.unwrap();
        assert_eq!(out["ok"], true);

        let attempts: Vec<u32> = step.calls().iter().map(|c| c.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn clones_share_the_call_log() {
        let step = MockStep::failing_fatal("x", "broken");
        let handle = step.clone();
        let err = step.execute(json!({}), &ctx(1)).await.unwrap_err();
        assert!(matches!(err, StepError::Fatal(_)));
        assert_eq!(handle.call_count(), 1);
    }
}
