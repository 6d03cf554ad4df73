//! `store` crate: the durable state store.
//!
//! Run state is persisted as an append-only log of [`EventRecord`]s, one
//! strictly increasing sequence per run. The log is the only source of truth:
//! the engine rebuilds every in-memory run by replaying it. No business logic
//! lives here.

pub mod error;
pub mod models;
pub mod memory;
pub mod pool;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use models::{EventRecord, RunEvent};
pub use sqlite::SqliteStore;

/// Backend contract for the event log.
///
/// Implementations must serialize appends per run and reject a record whose
/// `sequence` is not exactly one past the last stored sequence of that run.
/// Appends for different runs may interleave.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Append one record to its run's log.
    async fn append_event(&self, record: &EventRecord) -> Result<(), StoreError>;

    /// All records of a run, in sequence order. Unknown runs yield an empty log.
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<EventRecord>, StoreError>;

    /// Runs whose log has no terminal event, oldest first.
    async fn incomplete_runs(&self) -> Result<Vec<Uuid>, StoreError>;
}
