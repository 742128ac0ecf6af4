//! Error types for the session/transaction layer
//!
//! One error enum is shared across the workspace. We use `thiserror` for
//! automatic `Display` and `Error` trait implementations.
//!
//! The taxonomy matters more than the variants themselves:
//! - Retryable: `WriteConflict` and `IncompleteTransactionHistory`. The
//!   caller retries the whole logical operation (write conflict) or must
//!   treat a statement's execution status as unknown (incomplete history).
//! - Client-visible rejections: stale transaction numbers, concurrent
//!   session modification, illegal option combinations. The client retries
//!   the whole transaction.
//! - Everything else is an infrastructure failure.
//!
//! Repeated execution of a statement id at two different write positions is
//! not an `Error` at all: it indicates storage or replication corruption and
//! halts the process (see `quill-session`).

use crate::types::{SessionId, TxnNumber};
use thiserror::Error;

/// Result type alias for session/transaction operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the session/transaction layer
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An update's precondition no longer holds; retry the whole operation
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// Insert collided with an existing primary key
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The requested transaction number is behind the session's active one
    #[error(
        "cannot start transaction {requested} on session {session_id} because a newer \
         transaction {active} has already started"
    )]
    TransactionTooOld {
        /// Session being operated on
        session_id: SessionId,
        /// Transaction number the caller asked for
        requested: TxnNumber,
        /// Transaction number currently active on the session
        active: TxnNumber,
    },

    /// A multi-statement transaction is still in progress on the session
    #[error(
        "cannot start transaction {requested} on session {session_id} because a \
         multi-document transaction {active} is in progress"
    )]
    TransactionInProgress {
        /// Session being operated on
        session_id: SessionId,
        /// Transaction number the caller asked for
        requested: TxnNumber,
        /// In-progress transaction number
        active: TxnNumber,
    },

    /// The session cache was invalidated or the active transaction moved on
    #[error("session {0} was concurrently modified and the operation must be retried")]
    ConflictingOperationInProgress(SessionId),

    /// The history chain was truncated; execution status is unprovable
    #[error("incomplete transaction history: {0}")]
    IncompleteTransactionHistory(String),

    /// The transaction was superseded, e.g. by a chunk migration
    #[error("transaction aborted; active transaction number is now {active}")]
    TransactionAborted {
        /// Transaction number now active on the session
        active: TxnNumber,
    },

    /// Illegal request option combination
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A point-in-time read cannot be satisfied yet
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    /// Lock acquisition did not complete before its deadline
    #[error("lock acquisition timed out: {0}")]
    LockTimeout(String),

    /// The named collection does not exist
    #[error("collection not found: {0}")]
    NamespaceNotFound(String),

    /// Storage substrate failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether this error must be handled by retrying the whole operation
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Error::WriteConflict(_))
    }

    /// Whether this error means a statement's execution status is unknown
    pub fn is_incomplete_history(&self) -> bool {
        matches!(self, Error::IncompleteTransactionHistory(_))
    }

    /// Whether the client must retry the whole transaction
    pub fn is_transaction_stale(&self) -> bool {
        matches!(
            self,
            Error::TransactionTooOld { .. }
                | Error::TransactionAborted { .. }
                | Error::ConflictingOperationInProgress(_)
        )
    }

    /// Incomplete-history condition for a statement lookup on a session
    pub fn incomplete_history(session_id: SessionId, txn_number: TxnNumber) -> Self {
        Error::IncompleteTransactionHistory(format!(
            "history for transaction {txn_number} on session {session_id} was truncated"
        ))
    }

    /// Convenience constructor for write conflicts
    pub fn write_conflict(msg: impl Into<String>) -> Self {
        Error::WriteConflict(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
