//! Multi-document transaction state machine
//!
//! State transitions:
//! - `None` → `InProgress` (explicit multi-statement transaction start)
//! - `None` → `InSnapshotRead` (implicit snapshot read, no explicit commit)
//! - `InProgress | InSnapshotRead` → `Committing` → `Committed`
//! - `InProgress` → `Committed` (empty transaction, nothing to commit)
//! - `None | InProgress | InSnapshotRead` → `Aborted` (explicit abort,
//!   storage rollback, or a migration advancing the transaction number out
//!   from under the command)
//! - any state → `None` (resetting for a new transaction number)
//!
//! Every mutation goes through [`TransactionState::can_transition_to`], so
//! adding a state forces every transition site to be reconsidered.

use std::fmt;

/// Where a session's current transaction stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No multi-document transaction or snapshot read is active
    None,
    /// An explicit multi-statement transaction is executing
    InProgress,
    /// An implicit snapshot read is open across commands
    InSnapshotRead,
    /// The storage transaction is committing
    Committing,
    /// The transaction committed
    Committed,
    /// The transaction aborted
    Aborted,
}

impl TransactionState {
    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// Staying in place is always legal (handlers may observe their target
    /// state already installed). Any state may reset to `None` when a new
    /// transaction number displaces the old transaction.
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        if self == next || next == None {
            return true;
        }
        matches!(
            (self, next),
            (None, InProgress)
                | (None, InSnapshotRead)
                | (None, Aborted)
                | (InProgress, Committing)
                | (InProgress, Committed)
                | (InProgress, Aborted)
                | (InSnapshotRead, Committing)
                | (InSnapshotRead, Aborted)
                | (Committing, Committed)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::None => "none",
            TransactionState::InProgress => "in progress",
            TransactionState::InSnapshotRead => "in snapshot read",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}
