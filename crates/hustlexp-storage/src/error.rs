use hustlexp_types::{ErrorKind, InvariantCode};
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-layer errors.
///
/// Invariant codes raised by the database (or by the in-memory reference
/// adapter) are carried verbatim; nothing above this layer re-checks them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{code}: {message}")]
    InvariantViolation {
        code: InvariantCode,
        message: String,
    },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("retryable: {0}")]
    Retryable(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn invariant(code: InvariantCode, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict(_) | StoreError::StateConflict(_) => ErrorKind::ConflictState,
            StoreError::InvariantViolation { code, .. } => ErrorKind::ConflictInvariant(*code),
            StoreError::InvalidInput(_) => ErrorKind::Validation,
            StoreError::Retryable(_) => ErrorKind::Retryable,
            StoreError::Serialization(_) | StoreError::Backend(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable(_))
    }
}
