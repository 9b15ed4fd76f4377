//! Error types for the scheduler core.

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors surfaced by the candidate data source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Query against the backing database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row could not be turned into a candidate.
    #[error("failed to decode {entity}: {message}")]
    Decode { entity: String, message: String },

    /// The source could not be reached.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the candidate cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Some reload batches failed; the successful ones were applied.
    #[error("partial reload: {failed} of {total} ids failed: {last_error}")]
    PartialReload {
        failed: usize,
        total: usize,
        last_error: String,
    },
}

/// Errors that fail a scheduling task.
#[derive(Debug, Error)]
pub enum SchedError {
    /// The request is malformed; never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Source(#[from] SourceError),

    /// The executor was killed before it started.
    #[error("task executor killed")]
    Killed,

    /// The executor queue is no longer accepting work.
    #[error("task queue closed: {0}")]
    QueueClosed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedError {
    /// Returns true if the caller sent a bad request.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, SchedError::InvalidInput(_))
    }
}
