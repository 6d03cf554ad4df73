//! Core domain models for the workflow engine.
//!
//! Definitions (`WorkflowDefinition`, `StepDefinition`, `RetryPolicy`) are
//! built once and shared behind `Arc`. Run state (`WorkflowRun`, `StepState`)
//! is serialisable so snapshots can be handed to callers as JSON.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steps::StepHandler;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Delay between a failed attempt and the next one.
#[derive(Clone)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Always wait the same amount.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// Caller-supplied function of the failed attempt number.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    /// Exponential back-off capped at 30 seconds.
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential { base, max: Duration::from_secs(30) }
    }

    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => *d,
            Self::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(*max)
            }
            Self::Custom(f) => f(attempt),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// How often a failing step is attempted, and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::None)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::exponential(Duration::from_millis(100)))
    }
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// A single step of a workflow.
#[derive(Clone)]
pub struct StepDefinition {
    /// Unique within the workflow; referenced by `depends_on`.
    pub name: String,
    pub handler: Arc<dyn StepHandler>,
    /// Names of the steps that must succeed before this one is dispatched.
    pub depends_on: Vec<String>,
    /// Deadline for one attempt; overrides the engine default.
    pub timeout: Option<Duration>,
    /// Overrides the workflow retry policy for this step.
    pub retry: Option<RetryPolicy>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        Self::with_handler(name, Arc::new(handler))
    }

    pub fn with_handler(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            depends_on: Vec::new(),
            timeout: None,
            retry: None,
        }
    }

    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A validated workflow: named DAG of steps plus its retry policy.
///
/// Only produced by [`crate::WorkflowBuilder::build`] or
/// [`crate::Registry::finalize`], both of which check the graph, so every
/// instance is acyclic with resolvable dependencies.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    retry_policy: RetryPolicy,
    created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub(crate) fn new(name: String, steps: Vec<StepDefinition>, retry_policy: RetryPolicy) -> Self {
        Self { name, steps, retry_policy, created_at: Utc::now() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in registration order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    /// Steps without dependencies, in registration order.
    pub fn roots(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().filter(|s| s.depends_on.is_empty())
    }

    /// Steps that depend directly on `step`, in registration order.
    pub fn dependents<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a StepDefinition> + 'a {
        self.steps
            .iter()
            .filter(move |s| s.depends_on.iter().any(|d| d == step))
    }

    /// The step's own policy, falling back to the workflow's.
    pub fn retry_policy_for(&self, step: &str) -> &RetryPolicy {
        self.step(step)
            .and_then(|s| s.retry.as_ref())
            .unwrap_or(&self.retry_policy)
    }

    /// Same step names and dependencies, in the same order.
    pub(crate) fn same_shape(&self, steps: &[StepDefinition]) -> bool {
        self.steps.len() == steps.len()
            && self
                .steps
                .iter()
                .zip(steps)
                .all(|(a, b)| a.name == b.name && a.depends_on == b.depends_on)
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "running"   => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Lifecycle of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Swept when the run failed or was cancelled before the step ran.
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Ready     => write!(f, "ready"),
            Self::Running   => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed    => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// State of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    /// 1-based number of the current (or last) attempt.
    pub attempt: u32,
    pub output: Option<Value>,
    /// Error of the last failed attempt.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub(crate) fn pending(name: String) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            attempt: 1,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step: String,
    pub attempt: u32,
    pub error: String,
}

/// One invocation of a workflow. Snapshots handed out by the engine are
/// point-in-time copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub input: Value,
    pub status: RunStatus,
    /// One entry per step, in registration order.
    pub steps: Vec<StepState>,
    /// Set exactly when `status` is `Failed`.
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Sequence number of the last event folded into this state.
    pub last_sequence: u64,
}

impl WorkflowRun {
    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Succeeded)
    }

    /// Outputs of every succeeded step, keyed by step name.
    pub fn outputs(&self) -> HashMap<String, Value> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .filter_map(|s| s.output.clone().map(|o| (s.name.clone(), o)))
            .collect()
    }

    /// Whether every dependency of `step` has succeeded in this run.
    pub fn dependencies_met(&self, step: &StepDefinition) -> bool {
        step.depends_on.iter().all(|dep| {
            self.step(dep)
                .is_some_and(|s| s.status == StepStatus::Succeeded)
        })
    }
}
