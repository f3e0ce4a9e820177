//! Store errors, split into retryable and fatal classes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient conflict (concurrent modification, unique violation on
    /// retryable paths). One retry is reasonable.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The ephemeral counter store is unreachable; callers decide
    /// fail-open vs fail-closed.
    #[error("counter store unavailable: {0}")]
    CounterUnavailable(String),

    /// Schema or query construction failure; not retryable.
    #[error("schema error: {0}")]
    Schema(String),

    /// Row could not be decoded into the expected shape.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{entity} not found")]
    NotFound { entity: String },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }
}

impl From<StoreError> for voxgate_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => voxgate_core::Error::Conflict(msg),
            StoreError::Unavailable(msg) | StoreError::Schema(msg) | StoreError::Corrupt(msg) => {
                voxgate_core::Error::StoreUnavailable(msg)
            }
            StoreError::CounterUnavailable(msg) => voxgate_core::Error::CounterUnavailable(msg),
            StoreError::NotFound { entity } => voxgate_core::Error::NotFound { entity },
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
