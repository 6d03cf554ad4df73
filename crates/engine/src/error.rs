//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::models::RunStatus;

/// Errors produced by the workflow engine (registration + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Registration errors ------

    /// Two steps of one workflow share a name.
    #[error("step '{step}' is already registered in workflow '{workflow}'")]
    DuplicateStep { workflow: String, step: String },

    /// A step depends on a step that is not (yet) part of the workflow.
    #[error("step '{step}' of workflow '{workflow}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        workflow: String,
        step: String,
        dependency: String,
    },

    /// Depth-first traversal found a back edge; `cycle` starts and ends on
    /// the same step.
    #[error("workflow '{workflow}' contains a dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency { workflow: String, cycle: Vec<String> },

    /// Steps were added after the workflow was first finalized.
    #[error("workflow '{0}' was modified after it was finalized")]
    WorkflowModified(String),

    #[error("workflow '{0}' is already registered")]
    WorkflowExists(String),

    #[error("workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    // ------ Execution errors ------

    /// A step exhausted its retry policy (or failed fatally).
    #[error("step '{step}' failed on attempt {attempt}: {message}")]
    StepExecution {
        step: String,
        attempt: u32,
        message: String,
    },

    #[error("run {run_id} is already {status}")]
    RunTerminal { run_id: Uuid, status: RunStatus },

    #[error("run {0} was cancelled")]
    RunCancelled(Uuid),

    /// The event log of a run cannot be replayed.
    #[error("corrupt event log for run {run_id}: {reason}")]
    CorruptLog { run_id: Uuid, reason: String },

    // ------ Lifecycle errors ------

    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Persistence error from the store crate.
    #[error("state store error: {0}")]
    Store(#[from] store::StoreError),
}

impl EngineError {
    pub(crate) fn workflow_not_found(name: &str) -> Self {
        Self::NotFound { kind: "workflow", name: name.to_owned() }
    }

    pub(crate) fn run_not_found(run_id: Uuid) -> Self {
        Self::NotFound { kind: "run", name: run_id.to_string() }
    }

    pub(crate) fn corrupt(run_id: Uuid, reason: impl Into<String>) -> Self {
        Self::CorruptLog { run_id, reason: reason.into() }
    }
}
