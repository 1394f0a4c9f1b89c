use thiserror::Error;

use crate::model::{BatchId, MessageId};
use crate::transition::TransitionError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("corrupted row {id}: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("refused write: {0}")]
    InvariantViolation(String),

    #[cfg(not(target_arch = "wasm32"))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("version conflict on batch {batch_id}: expected {expected}, found {actual}")]
    VersionConflict {
        batch_id: BatchId,
        expected: u64,
        actual: u64,
    },

    #[error("optimistic lock exhausted on batch {batch_id} after {attempts} attempts")]
    OptimisticLockExhausted { batch_id: BatchId, attempts: u32 },

    #[error("recompute failed for batch {batch_id}: {reason}")]
    RecomputeFailure { batch_id: BatchId, reason: String },

    #[error("audit of batch {batch_id} failed: {reason}")]
    AuditSweepItemFailure { batch_id: BatchId, reason: String },

    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("message {message_id} kept changing under {attempts} write attempts")]
    MessageContended { message_id: MessageId, attempts: u32 },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StatsError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatsError::VersionConflict { .. }
                | StatsError::RecomputeFailure { .. }
                | StatsError::AuditSweepItemFailure { .. }
                | StatsError::MessageContended { .. }
                | StatsError::Store(StoreError::Storage(_))
        ) || self.is_sqlite_busy()
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn is_sqlite_busy(&self) -> bool {
        match self {
            StatsError::Store(StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    #[cfg(target_arch = "wasm32")]
    fn is_sqlite_busy(&self) -> bool {
        false
    }
}
