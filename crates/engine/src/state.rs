//! Folding the event log into run state.
//!
//! `WorkflowRun::apply` is the only code that mutates a run. The engine calls
//! it right after a record has been appended; recovery calls it for every
//! stored record. Both paths therefore produce identical snapshots.

use store::{EventRecord, RunEvent, StateStore};
use tracing::warn;
use uuid::Uuid;

use crate::models::{RunFailure, RunStatus, StepState, StepStatus, WorkflowRun};
use crate::EngineError;

impl WorkflowRun {
    /// Build the initial state from the `RunCreated` record.
    pub fn from_created(record: &EventRecord) -> Result<Self, EngineError> {
        let RunEvent::RunCreated { workflow_name, input, steps } = &record.event else {
            return Err(EngineError::corrupt(
                record.run_id,
                format!("log starts with {} instead of run_created", record.event.kind()),
            ));
        };
        if record.sequence != 1 {
            return Err(EngineError::corrupt(
                record.run_id,
                format!("log starts at sequence {}", record.sequence),
            ));
        }

        Ok(Self {
            run_id: record.run_id,
            workflow_name: workflow_name.clone(),
            input: input.clone(),
            status: RunStatus::Pending,
            steps: steps.iter().cloned().map(StepState::pending).collect(),
            failure: None,
            created_at: record.timestamp,
            completed_at: None,
            last_sequence: record.sequence,
        })
    }

    /// Rebuild a run from its complete log.
    ///
    /// # Errors
    /// [`EngineError::CorruptLog`] if the log is empty, has a sequence gap,
    /// mixes runs, or contains a transition the state machine does not allow.
    pub fn replay(run_id: Uuid, records: &[EventRecord]) -> Result<Self, EngineError> {
        let (first, rest) = records
            .split_first()
            .ok_or_else(|| EngineError::corrupt(run_id, "empty log"))?;
        if first.run_id != run_id {
            return Err(EngineError::corrupt(run_id, format!("record of run {}", first.run_id)));
        }

        let mut run = Self::from_created(first)?;
        for record in rest {
            run.apply(record)?;
        }
        Ok(run)
    }

    /// Fold one record into the state.
    pub fn apply(&mut self, record: &EventRecord) -> Result<(), EngineError> {
        let run_id = self.run_id;
        if record.run_id != run_id {
            return Err(EngineError::corrupt(self.run_id, format!("record of run {}", record.run_id)));
        }
        let expected = self.last_sequence + 1;
        if record.sequence != expected {
            return Err(EngineError::corrupt(
                self.run_id,
                format!("expected sequence {expected}, found {}", record.sequence),
            ));
        }
        if self.status.is_terminal() {
            return Err(EngineError::corrupt(
                self.run_id,
                format!("{} after the run became {}", record.event.kind(), self.status),
            ));
        }

        let at = record.timestamp;
        match &record.event {
            RunEvent::RunCreated { .. } => {
                return Err(EngineError::corrupt(self.run_id, "duplicate run_created"));
            }
            RunEvent::StepReady { step, attempt } => {
                // Running -> Ready only happens when recovery re-dispatches an
                // interrupted attempt.
                let state = self.step_state_mut(step)?;
                match state.status {
                    StepStatus::Pending => {}
                    StepStatus::Running if state.attempt == *attempt => {}
                    _ => return Err(illegal(run_id, &record.event, state)),
                }
                state.status = StepStatus::Ready;
                state.attempt = *attempt;
            }
            RunEvent::StepStarted { step, attempt } => {
                let state = self.step_state_mut(step)?;
                if state.status != StepStatus::Ready || state.attempt != *attempt {
                    return Err(illegal(run_id, &record.event, state));
                }
                state.status = StepStatus::Running;
                state.attempt = *attempt;
                state.started_at = Some(at);
                state.finished_at = None;
                if self.status == RunStatus::Pending {
                    self.status = RunStatus::Running;
                }
            }
            RunEvent::StepSucceeded { step, attempt, output } => {
                let state = self.step_state_mut(step)?;
                if state.status != StepStatus::Running || state.attempt != *attempt {
                    return Err(illegal(run_id, &record.event, state));
                }
                state.status = StepStatus::Succeeded;
                state.attempt = *attempt;
                state.output = Some(output.clone());
                state.error = None;
                state.finished_at = Some(at);
            }
            RunEvent::StepFailed { step, attempt, error, retry_in_ms } => {
                let state = self.step_state_mut(step)?;
                if state.status != StepStatus::Running || state.attempt != *attempt {
                    return Err(illegal(run_id, &record.event, state));
                }
                state.status = if retry_in_ms.is_some() {
                    StepStatus::Pending
                } else {
                    StepStatus::Failed
                };
                state.attempt = *attempt;
                state.error = Some(error.clone());
                state.finished_at = Some(at);
            }
            RunEvent::RunSucceeded => {
                if !self.all_succeeded() {
                    return Err(EngineError::corrupt(self.run_id, "run_succeeded before every step succeeded"));
                }
                self.status = RunStatus::Succeeded;
                self.completed_at = Some(at);
            }
            RunEvent::RunFailed { step, attempt, error } => {
                let state = self.step_state_mut(step)?;
                if state.status != StepStatus::Failed {
                    return Err(illegal(run_id, &record.event, state));
                }
                self.sweep_unstarted();
                self.status = RunStatus::Failed;
                self.failure = Some(RunFailure {
                    step: step.clone(),
                    attempt: *attempt,
                    error: error.clone(),
                });
                self.completed_at = Some(at);
            }
            RunEvent::RunCancelled => {
                self.sweep_unstarted();
                self.status = RunStatus::Cancelled;
                self.completed_at = Some(at);
            }
        }

        self.last_sequence = record.sequence;
        Ok(())
    }

    fn step_state_mut(&mut self, step: &str) -> Result<&mut StepState, EngineError> {
        let run_id = self.run_id;
        self.steps
            .iter_mut()
            .find(|s| s.name == step)
            .ok_or_else(|| EngineError::corrupt(run_id, format!("unknown step '{step}'")))
    }

    /// Steps that never started will not start any more.
    fn sweep_unstarted(&mut self) {
        for state in &mut self.steps {
            if matches!(state.status, StepStatus::Pending | StepStatus::Ready) {
                state.status = StepStatus::Cancelled;
            }
        }
    }
}

fn illegal(run_id: Uuid, event: &RunEvent, state: &StepState) -> EngineError {
    EngineError::corrupt(
        run_id,
        format!(
            "{} for step '{}' which is {} at attempt {}",
            event.kind(),
            state.name,
            state.status,
            state.attempt
        ),
    )
}

/// Replay every run the store still considers incomplete.
///
/// Runs whose log cannot be replayed are logged and skipped so one corrupt
/// log does not block recovery of the others.
pub async fn load_incomplete_runs(store: &dyn StateStore) -> Result<Vec<WorkflowRun>, EngineError> {
    let mut runs = Vec::new();
    for run_id in store.incomplete_runs().await? {
        let records = store.load_events(run_id).await?;
        match WorkflowRun::replay(run_id, &records) {
            Ok(run) => runs.push(run),
            Err(err) => warn!(run_id = %run_id, error = %err, "skipping unreplayable run"),
        }
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use store::InMemoryStore;

    struct Log {
        run_id: Uuid,
        records: Vec<EventRecord>,
    }

    impl Log {
        fn new() -> Self {
            let mut log = Self { run_id: Uuid::now_v7(), records: Vec::new() };
            log.push(RunEvent::RunCreated {
                workflow_name: "w".into(),
                input: json!({ "x": 1 }),
                steps: vec!["a".into(), "b".into(), "c".into()],
            });
            log
        }

        fn push(&mut self, event: RunEvent) -> &mut Self {
            let seq = self.records.len() as u64 + 1;
            self.records.push(EventRecord::new(self.run_id, seq, event));
            self
        }
    }

    fn ready(step: &str, attempt: u32) -> RunEvent {
        RunEvent::StepReady { step: step.into(), attempt }
    }

    fn started(step: &str, attempt: u32) -> RunEvent {
        RunEvent::StepStarted { step: step.into(), attempt }
    }

    fn succeeded(step: &str) -> RunEvent {
        RunEvent::StepSucceeded { step: step.into(), attempt: 1, output: json!({ "from": step }) }
    }

    #[test]
    fn replay_of_a_successful_run() {
        let mut log = Log::new();
        log.push(ready("a", 1))
            .push(started("a", 1))
            .push(succeeded("a"))
            .push(ready("b", 1))
            .push(ready("c", 1))
            .push(started("b", 1))
            .push(started("c", 1))
            .push(succeeded("b"))
            .push(succeeded("c"))
            .push(RunEvent::RunSucceeded);

        let run = WorkflowRun::replay(log.run_id, &log.records).unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.all_succeeded());
        assert_eq!(run.last_sequence, 11);
        assert_eq!(run.outputs()["b"], json!({ "from": "b" }));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn replay_is_deterministic() {
        let mut log = Log::new();
        log.push(ready("a", 1)).push(started("a", 1)).push(succeeded("a"));

        let first = WorkflowRun::replay(log.run_id, &log.records).unwrap();
        let second = WorkflowRun::replay(log.run_id, &log.records).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.status, RunStatus::Running);
    }

    #[test]
    fn failed_retry_returns_step_to_pending() {
        let mut log = Log::new();
        log.push(ready("a", 1)).push(started("a", 1)).push(RunEvent::StepFailed {
            step: "a".into(),
            attempt: 1,
            error: "flaky".into(),
            retry_in_ms: Some(100),
        });

        let run = WorkflowRun::replay(log.run_id, &log.records).unwrap();
        let a = run.step("a").unwrap();
        assert_eq!(a.status, StepStatus::Pending);
        assert_eq!(a.error.as_deref(), Some("flaky"));
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn run_failure_sweeps_unstarted_steps() {
        let mut log = Log::new();
        log.push(ready("a", 1))
            .push(started("a", 1))
            .push(RunEvent::StepFailed { step: "a".into(), attempt: 1, error: "boom".into(), retry_in_ms: None })
            .push(RunEvent::RunFailed { step: "a".into(), attempt: 1, error: "boom".into() });

        let run = WorkflowRun::replay(log.run_id, &log.records).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.failure,
            Some(RunFailure { step: "a".into(), attempt: 1, error: "boom".into() })
        );
        assert_eq!(run.step("a").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("b").unwrap().status, StepStatus::Cancelled);
        assert_eq!(run.step("c").unwrap().status, StepStatus::Cancelled);
    }

    #[test]
    fn sequence_gap_is_corruption() {
        let mut log = Log::new();
        log.push(ready("a", 1)).push(started("a", 1));
        log.records.remove(1);

        assert!(matches!(
            WorkflowRun::replay(log.run_id, &log.records),
            Err(EngineError::CorruptLog { .. })
        ));
    }

    #[test]
    fn events_after_terminal_are_corruption() {
        let mut log = Log::new();
        log.push(RunEvent::RunCancelled).push(ready("a", 1));
        assert!(WorkflowRun::replay(log.run_id, &log.records).is_err());
    }

    #[test]
    fn transitions_out_of_order_are_corruption() {
        // Success for a step that never started.
        let mut log = Log::new();
        log.push(ready("a", 1)).push(succeeded("a"));
        assert!(matches!(
            WorkflowRun::replay(log.run_id, &log.records),
            Err(EngineError::CorruptLog { reason, .. }) if reason.contains("step_succeeded")
        ));

        // Start with an attempt that was never made ready.
        let mut log = Log::new();
        log.push(ready("a", 1)).push(started("a", 2));
        assert!(WorkflowRun::replay(log.run_id, &log.records).is_err());

        // Run outcome that does not match the steps.
        let mut log = Log::new();
        log.push(ready("a", 1)).push(started("a", 1)).push(succeeded("a")).push(RunEvent::RunSucceeded);
        assert!(WorkflowRun::replay(log.run_id, &log.records).is_err());

        let mut log = Log::new();
        log.push(RunEvent::RunFailed { step: "a".into(), attempt: 1, error: "boom".into() });
        assert!(WorkflowRun::replay(log.run_id, &log.records).is_err());
    }

    #[test]
    fn interrupted_attempt_may_be_made_ready_again() {
        let mut log = Log::new();
        log.push(ready("a", 1)).push(started("a", 1)).push(ready("a", 1)).push(started("a", 1));

        let run = WorkflowRun::replay(log.run_id, &log.records).unwrap();
        assert_eq!(run.step("a").unwrap().status, StepStatus::Running);
    }

    #[test]
    fn unknown_step_is_corruption() {
        let mut log = Log::new();
        log.push(ready("zzz", 1));
        assert!(WorkflowRun::replay(log.run_id, &log.records).is_err());
        assert!(WorkflowRun::replay(log.run_id, &[]).is_err());
    }

    #[tokio::test]
    async fn incomplete_runs_are_replayed_from_the_store() {
        let store = InMemoryStore::new();
        let mut open = Log::new();
        open.push(ready("a", 1));
        let mut done = Log::new();
        done.push(RunEvent::RunCancelled);

        for record in open.records.iter().chain(&done.records) {
            store.append_event(record).await.unwrap();
        }

        let runs = load_incomplete_runs(&store).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, open.run_id);
        assert_eq!(runs[0].step("a").unwrap().status, StepStatus::Ready);
    }
}
