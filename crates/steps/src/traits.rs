//! The `StepHandler` trait: the contract every step must fulfil.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::StepError;

/// Context passed to a step handler for one attempt.
///
/// Defined here (in the steps crate) so both the engine and individual step
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// ID of the run this attempt belongs to.
    pub run_id: uuid::Uuid,
    /// Name of the workflow being run.
    pub workflow_name: String,
    /// Name of the step being executed.
    pub step_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outputs of every step of the run that has already succeeded.
    pub prior_results: HashMap<String, Value>,
}

impl StepContext {
    /// Output of a previously succeeded step, if any.
    pub fn output_of(&self, step: &str) -> Option<&Value> {
        self.prior_results.get(step)
    }
}

/// The core step trait.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step. `input` is the run's input; outputs of upstream
    /// steps are available through `ctx.prior_results`.
    async fn execute(&self, input: Value, ctx: &StepContext) -> Result<Value, StepError>;
}
