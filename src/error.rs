//! Error types for the distributed unit-of-work coordinator

use std::time::Duration;
use thiserror::Error;

/// Main error type for transactional operations.
#[derive(Error, Debug)]
pub enum DtxError {
    #[error("a transaction is already active on this unit of work")]
    AlreadyInTransaction,

    #[error("unit of work has been disposed")]
    Disposed,

    #[error("a linked unit of work requires at least one member")]
    EmptyComposition,

    #[error("distributed transaction timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no live transaction on participant {0}")]
    TransactionGone(String),

    #[error("commit failed on {participant}: {source}")]
    CommitFailed {
        participant: String,
        #[source]
        source: Box<DtxError>,
    },

    #[error(transparent)]
    Action(anyhow::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DtxError {
    /// Wrap a user-supplied action failure without altering its content.
    pub fn action(err: impl Into<anyhow::Error>) -> Self {
        DtxError::Action(err.into())
    }

    pub(crate) fn commit_failed(participant: impl Into<String>, source: DtxError) -> Self {
        DtxError::CommitFailed {
            participant: participant.into(),
            source: Box::new(source),
        }
    }

    /// Check if the error indicates a caller logic bug rather than an I/O
    /// failure. Such errors are never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            DtxError::AlreadyInTransaction | DtxError::Disposed | DtxError::EmptyComposition
        )
    }
}

/// Result type for transactional operations.
pub type DtxResult<T> = Result<T, DtxError>;
