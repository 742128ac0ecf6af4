//! Lazy backward walk over a session's write history chain

use crate::entry::OplogEntry;
use crate::log::Oplog;
use quill_core::{Result, WritePosition};

/// Iterates a session's writes newest-to-oldest
///
/// Starting from a write position (typically the `last_write_position` of a
/// session's durable record), each step fetches the entry at the current
/// position and follows its `prev_write_position` link. The walk ends when
/// an entry has no backward link. If the chain crosses the log's truncation
/// point, `next` reports `IncompleteTransactionHistory`; callers decide
/// whether that is an error or just the end of provable history.
pub struct TransactionHistoryIterator {
    next_position: WritePosition,
}

impl TransactionHistoryIterator {
    /// Start a walk at `position`
    pub fn new(position: WritePosition) -> Self {
        TransactionHistoryIterator {
            next_position: position,
        }
    }

    /// Whether another entry is reachable
    pub fn has_next(&self) -> bool {
        !self.next_position.is_null()
    }

    /// Fetch the entry at the current position and step backward
    ///
    /// Must not be called when `has_next` is false.
    pub fn next_entry(&mut self, oplog: &Oplog) -> Result<OplogEntry> {
        assert!(self.has_next(), "history iterator walked past its chain");
        let entry = oplog.find_by_position(self.next_position)?;
        self.next_position = entry
            .prev_write_position
            .unwrap_or_else(WritePosition::null);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{OpKind, OperationSessionInfo};
    use quill_core::{SessionId, StmtId, TxnNumber};
    use serde_json::json;

    /// Append a chained entry for one session, returning its position
    fn append_chained(
        oplog: &Oplog,
        session_id: SessionId,
        stmt_id: i32,
        prev: WritePosition,
    ) -> WritePosition {
        let mut entry = OplogEntry::new(OpKind::Insert, "app.items", json!({"stmt": stmt_id}))
            .with_session_info(OperationSessionInfo::for_transaction(
                session_id,
                TxnNumber::new(1),
            ))
            .with_stmt_id(StmtId::new(stmt_id));
        if !prev.is_null() {
            entry = entry.with_prev_write_position(prev);
        }
        oplog.append(entry)
    }

    #[test]
    fn test_walks_chain_newest_to_oldest() {
        let oplog = Oplog::new();
        let session_id = SessionId::new();
        let p1 = append_chained(&oplog, session_id, 0, WritePosition::null());
        let p2 = append_chained(&oplog, session_id, 1, p1);
        let p3 = append_chained(&oplog, session_id, 2, p2);

        let mut it = TransactionHistoryIterator::new(p3);
        let mut stmt_ids = Vec::new();
        while it.has_next() {
            stmt_ids.push(it.next_entry(&oplog).unwrap().stmt_id.unwrap().as_i32());
        }
        assert_eq!(stmt_ids, vec![2, 1, 0]);
    }

    #[test]
    fn test_empty_start_has_no_entries() {
        let it = TransactionHistoryIterator::new(WritePosition::null());
        assert!(!it.has_next());
    }

    #[test]
    fn test_truncated_chain_reports_incomplete_history() {
        let oplog = Oplog::new();
        let session_id = SessionId::new();
        let p1 = append_chained(&oplog, session_id, 0, WritePosition::null());
        let p2 = append_chained(&oplog, session_id, 1, p1);
        oplog.truncate_before(p2);

        let mut it = TransactionHistoryIterator::new(p2);
        // Newest entry still readable...
        let entry = it.next_entry(&oplog).unwrap();
        assert_eq!(entry.stmt_id, Some(StmtId::new(1)));
        // ...but following the chain into truncated territory fails.
        assert!(it.has_next());
        let err = it.next_entry(&oplog).unwrap_err();
        assert!(err.is_incomplete_history());
    }

    #[test]
    #[should_panic(expected = "walked past its chain")]
    fn test_next_past_end_panics() {
        let oplog = Oplog::new();
        let mut it = TransactionHistoryIterator::new(WritePosition::null());
        let _ = it.next_entry(&oplog);
    }
}
