//! In-process event log. Fast, but gone with the process.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::{EventRecord, StateStore, StoreError};

/// Event log kept in a map of per-run vectors.
///
/// Share it behind an `Arc` to let a second engine instance "recover" from
/// the log of a first one in tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    runs: Mutex<HashMap<Uuid, Vec<EventRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all runs.
    pub async fn len(&self) -> usize {
        self.runs.lock().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn append_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        let log = runs.entry(record.run_id).or_default();
        let expected = log.last().map_or(1, |last| last.sequence + 1);
        if record.sequence != expected {
            return Err(StoreError::SequenceConflict {
                run_id: record.run_id,
                expected,
                found: record.sequence,
            });
        }
        trace!(run_id = %record.run_id, sequence = record.sequence, event = record.event.kind(), "event appended");
        log.push(record.clone());
        Ok(())
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.runs.lock().await.get(&run_id).cloned().unwrap_or_default())
    }

    async fn incomplete_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        let runs = self.runs.lock().await;
        let mut ids: Vec<Uuid> = runs
            .iter()
            .filter(|(_, log)| !log.iter().any(|r| r.event.is_terminal()))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunEvent;
    use serde_json::json;

    fn created(run_id: Uuid) -> EventRecord {
        EventRecord::new(
            run_id,
            1,
            RunEvent::RunCreated {
                workflow_name: "wf".into(),
                input: json!({}),
                steps: vec!["a".into()],
            },
        )
    }

    #[tokio::test]
    async fn appends_must_be_contiguous() {
        let store = InMemoryStore::new();
        let run_id = Uuid::now_v7();
        store.append_event(&created(run_id)).await.unwrap();

        let skipped = EventRecord::new(run_id, 3, RunEvent::RunCancelled);
        let err = store.append_event(&skipped).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceConflict { expected: 2, found: 3, .. }
        ));

        let replayed = created(run_id);
        assert!(store.append_event(&replayed).await.is_err());
        assert_eq!(store.load_events(run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_runs_are_not_incomplete() {
        let store = InMemoryStore::new();
        let done = Uuid::now_v7();
        let open = Uuid::now_v7();

        store.append_event(&created(done)).await.unwrap();
        store
            .append_event(&EventRecord::new(done, 2, RunEvent::RunSucceeded))
            .await
            .unwrap();
        store.append_event(&created(open)).await.unwrap();

        assert_eq!(store.incomplete_runs().await.unwrap(), vec![open]);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn unknown_run_has_empty_log() {
        let store = InMemoryStore::new();
        assert!(store.load_events(Uuid::now_v7()).await.unwrap().is_empty());
        assert!(store.is_empty().await);
    }
}
