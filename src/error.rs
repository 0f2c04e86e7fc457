//! # Errors
//!
//! A single error type, [`MemoryError`], covers every failure the memory subsystem
//! can report. Most variants are *soft*: the orchestrator logs them and degrades
//! (an empty search result, a skipped save) rather than failing the caller's request.
//! Only [`MemoryError::OutOfRange`] and [`MemoryError::InvalidUserId`] are meant to
//! reach the caller as hard errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the conversation store, the vector index and their persistence.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The embedding model failed to initialize; every embedding-dependent call fails.
    #[error("embedding model unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A single embedding call failed (e.g. the input had no tokens).
    #[error("failed to generate embedding: {0}")]
    EmbeddingFailure(String),

    /// A vector did not have the store's fixed dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Training was requested before the buffer reached its threshold.
    #[error("insufficient training data: have {have} vectors, need {need}")]
    InsufficientTrainingData { have: usize, need: usize },

    /// `add`/`search` on an index that has not been trained yet.
    #[error("index is not trained")]
    IndexUntrained,

    /// `train` on an index that is already trained.
    #[error("index is already trained")]
    IndexAlreadyTrained,

    /// A turn position outside the user's log.
    #[error("position {position} out of range for user {user_id:?} ({len} turns)")]
    OutOfRange {
        user_id: String,
        position: usize,
        len: usize,
    },

    /// An empty or whitespace-only user identifier.
    #[error("invalid user id {0:?}")]
    InvalidUserId(String),

    /// Reading or writing a state file failed.
    #[error("persistence failure at {path}: {reason}")]
    PersistenceFailure { path: PathBuf, reason: String },

    /// A configuration value is out of bounds.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MemoryError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        MemoryError::PersistenceFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// `true` for errors the caller should see; everything else is degraded internally.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            MemoryError::OutOfRange { .. } | MemoryError::InvalidUserId(_)
        )
    }
}

/// Crate-wide result alias.
pub type Result<T, E = MemoryError> = std::result::Result<T, E>;

/// Reject user identifiers that cannot key a conversation log.
pub(crate) fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(MemoryError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
}
