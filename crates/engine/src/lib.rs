//! `engine` crate: workflow definitions, DAG validation, the event-sourced
//! run state, and the execution engine with its worker pool.

pub mod models;
pub mod error;
pub mod config;
pub mod dag;
pub mod builder;
pub mod registry;
pub mod state;
pub mod executor;
pub mod worker;

pub use models::{
    Backoff, RetryPolicy, RunFailure, RunStatus, StepDefinition, StepState, StepStatus,
    WorkflowDefinition, WorkflowRun,
};
pub use error::EngineError;
pub use config::EngineConfig;
pub use dag::validate_steps;
pub use builder::{define_workflow, WorkflowBuilder};
pub use registry::Registry;
pub use state::load_incomplete_runs;
pub use executor::{StepTask, WorkflowEngine};
pub use worker::{WorkerHandle, WorkerPool};
