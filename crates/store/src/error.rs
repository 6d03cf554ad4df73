//! Typed error type for the store crate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another writer appended to the run first, or the caller skipped a number.
    #[error("run {run_id}: expected sequence {expected}, got {found}")]
    SequenceConflict {
        run_id: Uuid,
        expected: u64,
        found: u64,
    },

    /// A stored row could not be decoded.
    #[error("corrupt event row: {0}")]
    Corrupt(String),
}
