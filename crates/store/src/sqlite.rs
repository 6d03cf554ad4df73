//! SQLite-backed event log.
//!
//! One row per event in `run_events`, keyed by `(run_id, sequence)`. Ids and
//! timestamps are stored as text; the payload column holds the event body as
//! JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pool::{create_pool, run_migrations, DbPool};
use crate::{EventRecord, RunEvent, StateStore, StoreError};

/// Durable [`StateStore`] on top of a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Wrap an existing, migrated pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = create_pool(database_url, 1).await?;
        run_migrations(&pool).await?;
        info!("sqlite event store ready");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct EventRow {
    run_id: String,
    sequence: i64,
    event_type: String,
    payload: String,
    recorded_at: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            sequence: row.try_get("sequence")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_record(self) -> Result<EventRecord, StoreError> {
        let run_id = Uuid::parse_str(&self.run_id)
            .map_err(|e| StoreError::Corrupt(format!("invalid run_id '{}': {e}", self.run_id)))?;
        let sequence = u64::try_from(self.sequence)
            .map_err(|_| StoreError::Corrupt(format!("negative sequence {}", self.sequence)))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.recorded_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{}': {e}", self.recorded_at)))?;
        let event = RunEvent::from_columns(&self.event_type, &self.payload)?;
        Ok(EventRecord { run_id, sequence, event, timestamp })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn append_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        let run_id = record.run_id.to_string();
        let (event_type, payload) = record.event.to_columns()?;

        let mut tx = self.pool.begin().await?;

        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM run_events WHERE run_id = ?")
                .bind(&run_id)
                .fetch_one(&mut *tx)
                .await?;
        let expected = last.map_or(1, |s| s as u64 + 1);
        if record.sequence != expected {
            tx.rollback().await?;
            return Err(StoreError::SequenceConflict {
                run_id: record.run_id,
                expected,
                found: record.sequence,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO run_events (run_id, sequence, event_type, payload, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(record.sequence as i64)
        .bind(event_type)
        .bind(payload)
        .bind(record.timestamp.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(run_id = %record.run_id, sequence = record.sequence, event_type, "event persisted");
        Ok(())
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, sequence, event_type, payload, recorded_at
            FROM run_events
            WHERE run_id = ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| EventRow::from_row(row)?.into_record())
            .collect()
    }

    async fn incomplete_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT run_id FROM run_events
            WHERE run_id NOT IN (
                SELECT run_id FROM run_events
                WHERE event_type IN ('run_succeeded', 'run_failed', 'run_cancelled')
            )
            ORDER BY run_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|id| {
                Uuid::parse_str(id)
                    .map_err(|e| StoreError::Corrupt(format!("invalid run_id '{id}': {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open(dir: &tempfile::TempDir) -> SqliteStore {
        let url = format!("sqlite://{}", dir.path().join("events.db").display());
        SqliteStore::connect(&url).await.unwrap()
    }

    fn created(run_id: Uuid) -> EventRecord {
        EventRecord::new(
            run_id,
            1,
            RunEvent::RunCreated {
                workflow_name: "nightly".into(),
                input: json!({ "x": 1 }),
                steps: vec!["extract".into(), "load".into()],
            },
        )
    }

    #[tokio::test]
    async fn events_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::now_v7();
        let records = vec![
            created(run_id),
            EventRecord::new(run_id, 2, RunEvent::StepReady { step: "extract".into(), attempt: 1 }),
            EventRecord::new(
                run_id,
                3,
                RunEvent::StepSucceeded { step: "extract".into(), attempt: 1, output: json!([1, 2]) },
            ),
        ];

        {
            let store = open(&dir).await;
            for record in &records {
                store.append_event(record).await.unwrap();
            }
            store.pool().close().await;
        }

        let store = open(&dir).await;
        assert_eq!(store.load_events(run_id).await.unwrap(), records);
        assert_eq!(store.incomplete_runs().await.unwrap(), vec![run_id]);
    }

    #[tokio::test]
    async fn out_of_order_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let run_id = Uuid::now_v7();

        let err = store
            .append_event(&EventRecord::new(run_id, 2, RunEvent::RunSucceeded))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SequenceConflict { expected: 1, found: 2, .. }));

        store.append_event(&created(run_id)).await.unwrap();
        assert!(store.append_event(&created(run_id)).await.is_err());
    }

    #[tokio::test]
    async fn finished_runs_are_excluded_from_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let cancelled = Uuid::now_v7();
        let running = Uuid::now_v7();

        store.append_event(&created(cancelled)).await.unwrap();
        store
            .append_event(&EventRecord::new(cancelled, 2, RunEvent::RunCancelled))
            .await
            .unwrap();
        store.append_event(&created(running)).await.unwrap();

        assert_eq!(store.incomplete_runs().await.unwrap(), vec![running]);
        let log = store.load_events(cancelled).await.unwrap();
        assert_eq!(log.last().map(|r| &r.event), Some(&RunEvent::RunCancelled));
    }
}
