//! Append-only operation log with truncation
//!
//! Positions are assigned densely starting at 1. The log can be truncated
//! from the front (cap size, migrations); lookups below the truncation
//! point report the incomplete-history condition rather than "not found",
//! because a truncated chain makes "this statement never ran" unprovable.

use crate::entry::OplogEntry;
use parking_lot::Mutex;
use quill_core::{Error, Result, WritePosition};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Default)]
struct OplogData {
    entries: BTreeMap<u64, OplogEntry>,
    next_position: u64,
    truncated_before: u64,
}

/// The replicated operation log
#[derive(Default)]
pub struct Oplog {
    data: Mutex<OplogData>,
}

impl Oplog {
    /// Create an empty log
    pub fn new() -> Self {
        Oplog::default()
    }

    /// Append an entry, assigning and returning its position
    pub fn append(&self, mut entry: OplogEntry) -> WritePosition {
        let mut data = self.data.lock();
        data.next_position += 1;
        let position = WritePosition::new(data.next_position);
        entry.position = position;
        data.entries.insert(position.as_u64(), entry);
        position
    }

    /// Point lookup by position
    ///
    /// # Errors
    /// `IncompleteTransactionHistory` when the position was truncated away;
    /// `Storage` when the position was never assigned (a broken chain link).
    pub fn find_by_position(&self, position: WritePosition) -> Result<OplogEntry> {
        let data = self.data.lock();
        if position.as_u64() < data.truncated_before {
            return Err(Error::IncompleteTransactionHistory(format!(
                "oplog was truncated at {}; position {position} is gone",
                data.truncated_before
            )));
        }
        data.entries.get(&position.as_u64()).cloned().ok_or_else(|| {
            Error::Storage(format!("no oplog entry at position {position}"))
        })
    }

    /// Drop all entries before `position` and remember the truncation point
    pub fn truncate_before(&self, position: WritePosition) {
        let mut data = self.data.lock();
        data.truncated_before = data.truncated_before.max(position.as_u64());
        let keep = data.entries.split_off(&position.as_u64());
        let dropped = data.entries.len();
        data.entries = keep;
        debug!(
            truncated_before = position.as_u64(),
            dropped, "truncated oplog"
        );
    }

    /// Position of the most recent entry; null when empty
    pub fn latest_position(&self) -> WritePosition {
        WritePosition::new(self.data.lock().next_position)
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.data.lock().entries.len()
    }

    /// Whether the log retains no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
