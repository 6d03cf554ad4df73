//! Step registry and workflow definition store.
//!
//! Steps can be registered one at a time (in dependency order) and the
//! workflow finalized afterwards, or a whole builder-made definition can be
//! registered at once. Either way the engine only ever runs finalized,
//! validated definitions.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::dag::validate_steps;
use crate::models::{RetryPolicy, StepDefinition, WorkflowDefinition};
use crate::EngineError;

/// Steps accumulated for a workflow that may not be finalized yet.
#[derive(Debug)]
struct Draft {
    steps: Vec<StepDefinition>,
    retry_policy: RetryPolicy,
}

/// Maps workflow names to their steps and finalized definitions.
#[derive(Debug, Default)]
pub struct Registry {
    drafts: HashMap<String, Draft>,
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    default_retry: RetryPolicy,
}

impl Registry {
    /// `default_retry` applies to workflows assembled with `register_step`.
    pub fn new(default_retry: RetryPolicy) -> Self {
        Self {
            default_retry,
            ..Self::default()
        }
    }

    /// Add one step to a workflow, creating the workflow on first use.
    ///
    /// # Errors
    /// - [`EngineError::DuplicateStep`] if the name is taken in that workflow.
    /// - [`EngineError::UnknownDependency`] if a dependency is not registered
    ///   yet; register steps in dependency order, or use the builder.
    pub fn register_step(&mut self, workflow: &str, step: StepDefinition) -> Result<(), EngineError> {
        let registered = self.drafts.get(workflow).map(|d| d.steps.as_slice()).unwrap_or_default();

        if registered.iter().any(|s| s.name == step.name) {
            return Err(EngineError::DuplicateStep {
                workflow: workflow.to_owned(),
                step: step.name,
            });
        }
        if let Some(missing) = step
            .depends_on
            .iter()
            .find(|dep| !registered.iter().any(|s| &s.name == *dep))
        {
            return Err(EngineError::UnknownDependency {
                workflow: workflow.to_owned(),
                step: step.name.clone(),
                dependency: missing.clone(),
            });
        }

        let default_retry = &self.default_retry;
        let draft = self.drafts.entry(workflow.to_owned()).or_insert_with(|| Draft {
            steps: Vec::new(),
            retry_policy: default_retry.clone(),
        });
        debug!(workflow, step = %step.name, "step registered");
        draft.steps.push(step);
        Ok(())
    }

    /// Steps of a workflow in registration order.
    pub fn steps(&self, workflow: &str) -> Result<Vec<StepDefinition>, EngineError> {
        self.drafts
            .get(workflow)
            .map(|d| d.steps.clone())
            .ok_or_else(|| EngineError::workflow_not_found(workflow))
    }

    /// Validate the accumulated steps and freeze them into a definition.
    ///
    /// Finalizing again is a no-op while the steps are unchanged.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for an unknown workflow.
    /// - [`EngineError::CyclicDependency`] if the steps do not form a DAG.
    /// - [`EngineError::WorkflowModified`] if steps were added after the
    ///   first finalize.
    pub fn finalize(&mut self, workflow: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let draft = self
            .drafts
            .get(workflow)
            .ok_or_else(|| EngineError::workflow_not_found(workflow))?;

        if let Some(existing) = self.definitions.get(workflow) {
            if existing.same_shape(&draft.steps) {
                return Ok(existing.clone());
            }
            return Err(EngineError::WorkflowModified(workflow.to_owned()));
        }

        validate_steps(workflow, &draft.steps)?;
        let definition = Arc::new(WorkflowDefinition::new(
            workflow.to_owned(),
            draft.steps.clone(),
            draft.retry_policy.clone(),
        ));
        info!(workflow, steps = draft.steps.len(), "workflow finalized");
        self.definitions.insert(workflow.to_owned(), definition.clone());
        Ok(definition)
    }

    /// Register a definition produced by the builder. It is finalized already.
    pub fn register_workflow(
        &mut self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let name = definition.name().to_owned();
        if self.drafts.contains_key(&name) || self.definitions.contains_key(&name) {
            return Err(EngineError::WorkflowExists(name));
        }

        self.drafts.insert(
            name.clone(),
            Draft {
                steps: definition.steps().to_vec(),
                retry_policy: definition.retry_policy().clone(),
            },
        );
        let definition = Arc::new(definition);
        self.definitions.insert(name.clone(), definition.clone());
        info!(workflow = %name, steps = definition.steps().len(), "workflow registered");
        Ok(definition)
    }

    /// The finalized definition of `workflow`.
    pub fn get(&self, workflow: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.definitions
            .get(workflow)
            .cloned()
            .ok_or_else(|| EngineError::workflow_not_found(workflow))
    }

    /// Forget a workflow. Runs already submitted keep their definition.
    pub fn unregister(&mut self, workflow: &str) -> bool {
        let had_draft = self.drafts.remove(workflow).is_some();
        let had_definition = self.definitions.remove(workflow).is_some();
        had_draft || had_definition
    }
}
