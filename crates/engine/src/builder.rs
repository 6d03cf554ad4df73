//! Fluent construction of workflow definitions.

use steps::StepHandler;

use crate::dag::validate_steps;
use crate::models::{RetryPolicy, StepDefinition, WorkflowDefinition};
use crate::EngineError;

/// Start building a workflow called `name`.
pub fn define_workflow(name: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder::new(name)
}

/// Collects steps in any order; dependencies are resolved when
/// [`WorkflowBuilder::build`] runs, so steps may reference ones added later.
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<StepDefinition>,
    retry_policy: RetryPolicy,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Add a step with the given handler and dependencies.
    pub fn add_step(
        self,
        name: impl Into<String>,
        handler: impl StepHandler + 'static,
        depends_on: &[&str],
    ) -> Self {
        self.step(StepDefinition::new(name, handler).depends_on(depends_on.iter().copied()))
    }

    /// Add a fully configured step (timeout, retry override, ...).
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Retry policy for steps that do not set their own.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate the graph and produce the immutable definition.
    pub fn build(self) -> Result<WorkflowDefinition, EngineError> {
        validate_steps(&self.name, &self.steps)?;
        Ok(WorkflowDefinition::new(self.name, self.steps, self.retry_policy))
    }
}
