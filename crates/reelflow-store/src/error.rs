use reelflow_types::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a task for this planning page already exists")]
    AlreadyExists,

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("transition {from} -> {to} is not on the pipeline graph")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("task {id} was not in status {expected}")]
    Conflict { id: uuid::Uuid, expected: TaskStatus },

    #[error("negative delta {0} rejected")]
    NegativeDelta(f64),

    #[error("malformed row: {0}")]
    InvalidRow(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Conflicts resolve themselves on re-read; database connectivity
    /// failures are worth another attempt. Everything else is a caller bug
    /// or a permanent condition.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Database(_))
    }
}
