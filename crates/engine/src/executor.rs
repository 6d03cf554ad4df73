//! Workflow execution engine.
//!
//! `WorkflowEngine` is the central orchestrator:
//! 1. Expands a submitted run into its step DAG and enqueues the root steps.
//! 2. Checks every dequeued task against the run state before a worker
//!    invokes the handler (`begin_step`).
//! 3. Folds each outcome into the run, enqueues newly ready dependents,
//!    schedules retries per policy, and decides the terminal status.
//! 4. Persists every transition to the state store *before* applying it, so
//!    a restarted engine can replay the log and `recover` interrupted runs.
//!
//! State-changing operations are serialized per run by a per-run mutex;
//! different runs never contend. Handlers run without any engine lock held.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use queue::ReadyQueue;
use steps::{StepContext, StepError, StepHandler};
use store::{EventRecord, InMemoryStore, RunEvent, StateStore};

use crate::config::EngineConfig;
use crate::models::{RunStatus, StepDefinition, StepStatus, WorkflowDefinition, WorkflowRun};
use crate::registry::Registry;
use crate::state::load_incomplete_runs;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// One pending step execution, as it travels through the ready-queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTask {
    pub run_id: Uuid,
    pub step: String,
    pub attempt: u32,
}

/// Everything a worker needs to invoke a handler outside the run lock.
struct Dispatch {
    handler: Arc<dyn StepHandler>,
    input: Value,
    ctx: StepContext,
    timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

struct RunSlot {
    run: WorkflowRun,
    definition: Arc<WorkflowDefinition>,
    status_tx: watch::Sender<RunStatus>,
}

impl RunSlot {
    fn new(run: WorkflowRun, definition: Arc<WorkflowDefinition>) -> Self {
        let (status_tx, _) = watch::channel(run.status);
        Self { run, definition, status_tx }
    }

    /// Append the event, then fold it into the in-memory run.
    async fn record(&mut self, store: &dyn StateStore, event: RunEvent) -> Result<(), EngineError> {
        let record = EventRecord::new(self.run.run_id, self.run.last_sequence + 1, event);
        store.append_event(&record).await?;
        self.run.apply(&record)?;
        self.status_tx.send_replace(self.run.status);
        Ok(())
    }

    /// Mark `step` ready for `attempt` and return the task to enqueue.
    async fn make_ready(
        &mut self,
        store: &dyn StateStore,
        step: &str,
        attempt: u32,
    ) -> Result<StepTask, EngineError> {
        self.record(store, RunEvent::StepReady { step: step.to_owned(), attempt })
            .await?;
        Ok(StepTask { run_id: self.run.run_id, step: step.to_owned(), attempt })
    }

    fn state(&self, step: &str) -> Option<(StepStatus, u32)> {
        self.run.step(step).map(|s| (s.status, s.attempt))
    }

    /// Record whatever follows from the current step states: the run outcome
    /// once every step succeeded or one failed for good, otherwise `StepReady`
    /// for each fresh `Pending` step whose dependencies are met.
    ///
    /// Idempotent, so it is safe to call again after a failed append left the
    /// run half-advanced. Steps waiting for a retry are left to their timer.
    async fn advance(&mut self, store: &dyn StateStore) -> Result<Vec<StepTask>, EngineError> {
        if self.run.is_terminal() {
            return Ok(Vec::new());
        }
        if self.run.all_succeeded() {
            self.record(store, RunEvent::RunSucceeded).await?;
            info!(run_id = %self.run.run_id, "run succeeded");
            return Ok(Vec::new());
        }
        if let Some(failed) = self.run.steps.iter().find(|s| s.status == StepStatus::Failed) {
            let event = RunEvent::RunFailed {
                step: failed.name.clone(),
                attempt: failed.attempt,
                error: failed.error.clone().unwrap_or_default(),
            };
            self.record(store, event).await?;
            error!(run_id = %self.run.run_id, "run failed");
            return Ok(Vec::new());
        }

        let definition = self.definition.clone();
        let mut ready = Vec::new();
        for step in definition.steps() {
            let fresh = self
                .run
                .step(&step.name)
                .is_some_and(|s| s.status == StepStatus::Pending && s.error.is_none());
            if fresh && self.run.dependencies_met(step) {
                ready.push(self.make_ready(store, &step.name, 1).await?);
            }
        }
        Ok(ready)
    }

    /// Bring a replayed run back to a dispatchable state.
    ///
    /// Interrupted (`Running`) steps are re-dispatched with the same attempt
    /// number and steps waiting for a retry move on to the next attempt. The
    /// rest is caught up by [`advance`](Self::advance).
    async fn resume(&mut self, store: &dyn StateStore) -> Result<Vec<StepTask>, EngineError> {
        let mut tasks = Vec::new();
        let failed = self.run.steps.iter().any(|s| s.status == StepStatus::Failed);

        if !failed {
            let definition = self.definition.clone();
            for step in definition.steps() {
                let Some(state) = self.run.step(&step.name) else {
                    continue;
                };
                let (status, attempt, retrying) = (state.status, state.attempt, state.error.is_some());
                match status {
                    StepStatus::Ready => tasks.push(StepTask {
                        run_id: self.run.run_id,
                        step: step.name.clone(),
                        attempt,
                    }),
                    StepStatus::Running => tasks.push(self.make_ready(store, &step.name, attempt).await?),
                    StepStatus::Pending if retrying => {
                        tasks.push(self.make_ready(store, &step.name, attempt + 1).await?);
                    }
                    _ => {}
                }
            }
        }

        tasks.extend(self.advance(store).await?);
        Ok(tasks)
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct EngineInner {
    registry: RwLock<Registry>,
    runs: RwLock<HashMap<Uuid, Arc<Mutex<RunSlot>>>>,
    store: Arc<dyn StateStore>,
    queue: ReadyQueue<StepTask>,
    config: EngineConfig,
}

/// Handle to an engine instance. Clones share the same engine.
///
/// There is no process-wide engine: construct one and pass it (or clones of
/// it) to whatever submits runs and to the [`crate::WorkerPool`].
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine persisting to `store`.
    pub fn new(store: Arc<dyn StateStore>, config: EngineConfig) -> Self {
        let registry = Registry::new(config.default_retry.clone());
        Self {
            inner: Arc::new(EngineInner {
                registry: RwLock::new(registry),
                runs: RwLock::new(HashMap::new()),
                store,
                queue: ReadyQueue::new(),
                config,
            }),
        }
    }

    /// Engine with default configuration and a non-durable in-memory log.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()), EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn queue(&self) -> &ReadyQueue<StepTask> {
        &self.inner.queue
    }

    fn store(&self) -> &dyn StateStore {
        self.inner.store.as_ref()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a builder-made workflow.
    pub async fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.inner.registry.write().await.register_workflow(definition)
    }

    /// Add one step to a workflow; see [`Registry::register_step`].
    pub async fn register_step(&self, workflow: &str, step: StepDefinition) -> Result<(), EngineError> {
        self.inner.registry.write().await.register_step(workflow, step)
    }

    /// Validate and freeze a workflow assembled with `register_step`.
    pub async fn finalize(&self, workflow: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.inner.registry.write().await.finalize(workflow)
    }

    pub async fn steps(&self, workflow: &str) -> Result<Vec<StepDefinition>, EngineError> {
        self.inner.registry.read().await.steps(workflow)
    }

    pub async fn workflow(&self, workflow: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.inner.registry.read().await.get(workflow)
    }

    pub async fn unregister_workflow(&self, workflow: &str) -> bool {
        self.inner.registry.write().await.unregister(workflow)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn slot(&self, run_id: Uuid) -> Result<Arc<Mutex<RunSlot>>, EngineError> {
        self.inner
            .runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or_else(|| EngineError::run_not_found(run_id))
    }

    /// Start a run of `workflow` and return its id without waiting for it.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if the workflow is not finalized, or a store
    /// error if the creation event cannot be persisted.
    #[instrument(skip(self, input))]
    pub async fn submit(&self, workflow: &str, input: Value) -> Result<Uuid, EngineError> {
        let definition = self.inner.registry.read().await.get(workflow)?;
        let run_id = Uuid::now_v7();

        let created = EventRecord::new(
            run_id,
            1,
            RunEvent::RunCreated {
                workflow_name: definition.name().to_owned(),
                input,
                steps: definition.step_names(),
            },
        );
        self.store().append_event(&created).await?;
        let mut slot = RunSlot::new(WorkflowRun::from_created(&created)?, definition.clone());

        let mut ready = Vec::new();
        for root in definition.roots() {
            ready.push(slot.make_ready(self.store(), &root.name, 1).await?);
        }

        self.inner
            .runs
            .write()
            .await
            .insert(run_id, Arc::new(Mutex::new(slot)));
        info!(run_id = %run_id, ready = ready.len(), "run submitted");
        self.inner.queue.extend(ready);
        Ok(run_id)
    }

    /// Point-in-time copy of a run.
    pub async fn get_status(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let slot = self.slot(run_id).await?;
        let snapshot = slot.lock().await.run.clone();
        Ok(snapshot)
    }

    /// Cancel a run. Steps already running finish, but their results are
    /// discarded.
    ///
    /// # Errors
    /// [`EngineError::RunTerminal`] if the run already finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let slot = self.slot(run_id).await?;
        let mut slot = slot.lock().await;
        if slot.run.is_terminal() {
            return Err(EngineError::RunTerminal { run_id, status: slot.run.status });
        }
        slot.record(self.store(), RunEvent::RunCancelled).await?;
        info!(run_id = %run_id, "run cancelled");
        Ok(())
    }

    /// Wait until the run reaches a terminal status and return its final state.
    pub async fn wait_for_completion(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let slot = self.slot(run_id).await?;
        let mut status_rx = slot.lock().await.status_tx.subscribe();
        status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| EngineError::run_not_found(run_id))?;
        let finished = slot.lock().await.run.clone();
        Ok(finished)
    }

    /// Submit a run and wait for it.
    ///
    /// # Errors
    /// [`EngineError::StepExecution`] describing the failing step if the run
    /// failed, [`EngineError::RunCancelled`] if it was cancelled.
    pub async fn run(&self, workflow: &str, input: Value) -> Result<WorkflowRun, EngineError> {
        let run_id = self.submit(workflow, input).await?;
        let run = self.wait_for_completion(run_id).await?;
        match run.status {
            RunStatus::Failed => {
                let (step, attempt, message) = run
                    .failure
                    .map(|f| (f.step, f.attempt, f.error))
                    .unwrap_or_default();
                Err(EngineError::StepExecution { step, attempt, message })
            }
            RunStatus::Cancelled => Err(EngineError::RunCancelled(run_id)),
            _ => Ok(run),
        }
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    /// Claim a dequeued task: verify it is still current and mark the step
    /// running. `None` means the task is stale and must be dropped.
    async fn begin_step(&self, task: &StepTask) -> Result<Option<Dispatch>, EngineError> {
        let Ok(slot) = self.slot(task.run_id).await else {
            warn!(run_id = %task.run_id, step = %task.step, "task for unknown run dropped");
            return Ok(None);
        };
        let mut slot = slot.lock().await;

        if slot.run.is_terminal() {
            debug!(run_id = %task.run_id, step = %task.step, status = %slot.run.status, "run finished, task dropped");
            return Ok(None);
        }
        if slot.state(&task.step) != Some((StepStatus::Ready, task.attempt)) {
            debug!(run_id = %task.run_id, step = %task.step, attempt = task.attempt, "stale task dropped");
            return Ok(None);
        }
        let Some(step) = slot.definition.step(&task.step).cloned() else {
            return Ok(None);
        };

        slot.record(
            self.store(),
            RunEvent::StepStarted { step: task.step.clone(), attempt: task.attempt },
        )
        .await?;

        Ok(Some(Dispatch {
            handler: step.handler,
            input: slot.run.input.clone(),
            ctx: StepContext {
                run_id: task.run_id,
                workflow_name: slot.run.workflow_name.clone(),
                step_name: task.step.clone(),
                attempt: task.attempt,
                prior_results: slot.run.outputs(),
            },
            timeout: step.timeout.or(self.inner.config.default_step_timeout),
        }))
    }

    /// Run one dequeued task end to end. Called by worker units.
    pub(crate) async fn process(&self, task: StepTask) {
        let dispatch = match self.begin_step(&task).await {
            Ok(Some(dispatch)) => dispatch,
            Ok(None) => return,
            Err(err) => {
                // The step is still `Ready`; put the task back once the store recovers.
                self.retry_after_store_failure(err, "start step", move |engine| {
                    let task = task.clone();
                    async move {
                        engine.inner.queue.push(task);
                        Ok::<_, EngineError>(())
                    }
                });
                return;
            }
        };

        let result = invoke(dispatch).await;

        if let Err(err) = self.on_step_complete(&task, result.clone()).await {
            self.retry_after_store_failure(err, "record step outcome", move |engine| {
                let (task, result) = (task.clone(), result.clone());
                async move { engine.on_step_complete(&task, result).await }
            });
        }
    }

    /// Repeat `op` every `store_retry_delay` while it keeps failing on the
    /// store. Any other error is logged and ends the attempt.
    fn retry_after_store_failure<F, Fut>(&self, err: EngineError, action: &'static str, op: F)
    where
        F: Fn(WorkflowEngine) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        if !matches!(err, EngineError::Store(_)) {
            error!(action, error = %err, "giving up");
            return;
        }
        warn!(action, error = %err, "state store failed, will retry");

        let engine = self.clone();
        let delay = self.inner.config.store_retry_delay;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                match op(engine.clone()).await {
                    Ok(()) => break,
                    Err(err @ EngineError::Store(_)) => {
                        warn!(action, error = %err, "state store still failing");
                    }
                    Err(err) => {
                        error!(action, error = %err, "giving up");
                        break;
                    }
                }
            }
        });
    }

    /// Fold the outcome of one attempt into its run.
    ///
    /// Results for finished runs, or for attempts the run no longer expects,
    /// are discarded without recording them. Either way the run is caught up
    /// afterwards, so calling this again after a store error finishes any
    /// transition the failed call left half done.
    #[instrument(skip(self, result), fields(run_id = %task.run_id, step = %task.step, attempt = task.attempt))]
    pub async fn on_step_complete(
        &self,
        task: &StepTask,
        result: Result<Value, StepError>,
    ) -> Result<(), EngineError> {
        let slot = self.slot(task.run_id).await?;
        let mut slot = slot.lock().await;

        if slot.run.is_terminal() {
            debug!(status = %slot.run.status, "run finished, result discarded");
            return Ok(());
        }

        if slot.state(&task.step) == Some((StepStatus::Running, task.attempt)) {
            match result {
                Ok(output) => {
                    slot.record(
                        self.store(),
                        RunEvent::StepSucceeded { step: task.step.clone(), attempt: task.attempt, output },
                    )
                    .await?;
                    info!("step succeeded");
                }
                Err(err) => self.step_failed(&mut slot, task, err).await?,
            }
        } else {
            debug!("result not expected, discarded");
        }

        let ready = slot.advance(self.store()).await?;
        drop(slot);

        self.inner.queue.extend(ready);
        Ok(())
    }

    /// Record a failed attempt and, if the policy allows another one, start
    /// its back-off timer. Failing the run is left to `advance`.
    async fn step_failed(
        &self,
        slot: &mut RunSlot,
        task: &StepTask,
        err: StepError,
    ) -> Result<(), EngineError> {
        let policy = slot.definition.retry_policy_for(&task.step).clone();
        let message = err.to_string();

        if !err.is_retryable() || task.attempt >= policy.max_attempts {
            slot.record(
                self.store(),
                RunEvent::StepFailed {
                    step: task.step.clone(),
                    attempt: task.attempt,
                    error: message.clone(),
                    retry_in_ms: None,
                },
            )
            .await?;
            error!(error = %message, "step failed");
            return Ok(());
        }

        let delay = policy.backoff.delay(task.attempt);
        slot.record(
            self.store(),
            RunEvent::StepFailed {
                step: task.step.clone(),
                attempt: task.attempt,
                error: message.clone(),
                retry_in_ms: Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
            },
        )
        .await?;
        warn!(error = %message, max_attempts = policy.max_attempts, ?delay, "step failed, retrying");

        let engine = self.clone();
        let retry = StepTask { attempt: task.attempt + 1, ..task.clone() };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = engine.retry_step(&retry).await {
                engine.retry_after_store_failure(err, "schedule retry", move |engine| {
                    let retry = retry.clone();
                    async move { engine.retry_step(&retry).await }
                });
            }
        });
        Ok(())
    }

    /// Re-enqueue a step after its back-off delay, unless the run moved on.
    async fn retry_step(&self, retry: &StepTask) -> Result<(), EngineError> {
        let slot = self.slot(retry.run_id).await?;
        let mut slot = slot.lock().await;
        if slot.run.is_terminal()
            || slot.state(&retry.step) != Some((StepStatus::Pending, retry.attempt - 1))
        {
            debug!(run_id = %retry.run_id, step = %retry.step, "retry no longer needed");
            return Ok(());
        }
        let task = slot.make_ready(self.store(), &retry.step, retry.attempt).await?;
        drop(slot);

        self.inner.queue.push(task);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery & retention
    // -----------------------------------------------------------------------

    /// Resume every run the store reports as incomplete and return their ids.
    ///
    /// Workflows must be registered before calling this; runs of unknown or
    /// changed workflows are logged and skipped.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<Uuid>, EngineError> {
        let mut recovered = Vec::new();

        for run in load_incomplete_runs(self.store()).await? {
            let run_id = run.run_id;
            if self.inner.runs.read().await.contains_key(&run_id) {
                continue;
            }
            let definition = match self.inner.registry.read().await.get(&run.workflow_name) {
                Ok(definition) => definition,
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "cannot recover run");
                    continue;
                }
            };
            let run_steps: Vec<&str> = run.steps.iter().map(|s| s.name.as_str()).collect();
            if run_steps != definition.step_names() {
                warn!(run_id = %run_id, workflow = %run.workflow_name, "workflow changed since the run started, not recovering");
                continue;
            }

            let mut slot = RunSlot::new(run, definition);
            let tasks = slot.resume(self.store()).await?;
            self.inner
                .runs
                .write()
                .await
                .insert(run_id, Arc::new(Mutex::new(slot)));
            info!(run_id = %run_id, ready = tasks.len(), "run recovered");
            self.inner.queue.extend(tasks);
            recovered.push(run_id);
        }

        Ok(recovered)
    }

    /// Drop finished runs older than the retention window from memory.
    /// Their event logs stay in the store. Returns how many were dropped.
    ///
    /// A started [`crate::WorkerPool`] calls this every `archive_interval`;
    /// engines driven without a pool, or with the interval unset, must call
    /// it themselves or finished runs accumulate.
    pub async fn archive_completed(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.inner.config.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;

        let slots: Vec<(Uuid, Arc<Mutex<RunSlot>>)> = self
            .inner
            .runs
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut expired = Vec::new();
        for (run_id, slot) in slots {
            let slot = slot.lock().await;
            if slot.run.completed_at.is_some_and(|at| at <= cutoff) {
                expired.push(run_id);
            }
        }

        let mut runs = self.inner.runs.write().await;
        for run_id in &expired {
            runs.remove(run_id);
        }
        if !expired.is_empty() {
            info!(archived = expired.len(), "finished runs archived");
        }
        expired.len()
    }
}

// ---------------------------------------------------------------------------
// Handler invocation
// ---------------------------------------------------------------------------

/// Run the handler in its own task so a panic becomes a step failure, and
/// enforce the step deadline.
async fn invoke(dispatch: Dispatch) -> Result<Value, StepError> {
    let Dispatch { handler, input, ctx, timeout } = dispatch;

    let attempt = tokio::spawn(async move {
        let execution = handler.execute(input, &ctx);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, execution)
                .await
                .unwrap_or(Err(StepError::Timeout(limit))),
            None => execution.await,
        }
    });

    match attempt.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(StepError::Panicked(panic_message(err.into_panic()))),
        Err(err) => Err(StepError::Retryable(format!("step task aborted: {err}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
