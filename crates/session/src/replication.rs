//! Derived replication entries for the session transaction table
//!
//! Secondaries must keep their session transaction table in step with the
//! writes they apply. Rather than replicating the table's own writes, the
//! primary derives them: after every log entry carrying session/transaction
//! metadata, a synthesized upsert of that session's record is inserted into
//! the stream.

use crate::record_store::SESSION_TRANSACTION_TABLE;
use quill_core::SessionTxnRecord;
use quill_oplog::{CommandKind, OpKind, OplogEntry};
use serde_json::json;

/// Build the session-table upsert entry matching `entry`, if it needs one
///
/// Entries without a transaction number need no table update. Apply-batch
/// commands are excluded: their inner operations do not participate in
/// retryable-write bookkeeping.
fn matching_session_table_update(entry: &OplogEntry) -> Option<OplogEntry> {
    let txn_number = entry.session_info.txn_number?;

    if entry.kind == OpKind::Command(CommandKind::ApplyBatch) {
        return None;
    }

    let session_id = entry
        .session_info
        .session_id
        .expect("transaction metadata always carries a session id");

    let record = SessionTxnRecord::new(session_id, txn_number, entry.position, entry.wall_time);
    let document = record
        .to_document()
        .expect("session transaction record serializes to a document");
    let criteria = json!({
        "_id": serde_json::to_value(session_id)
            .expect("session id serializes to a document value")
    });

    let mut update = OplogEntry::new(OpKind::Update, SESSION_TRANSACTION_TABLE, document)
        .with_object2(criteria)
        .with_wall_time(entry.wall_time)
        .with_upsert();
    update.position = entry.position;
    Some(update)
}

/// Interleave session-table upserts into a sequence of log operations
///
/// Returns a new sequence where every operation carrying session
/// transaction metadata (except apply-batch commands) is immediately
/// followed by the synthesized upsert of its session's record.
pub fn add_ops_for_session_table(ops: &[OplogEntry]) -> Vec<OplogEntry> {
    let mut out = Vec::with_capacity(ops.len() * 2);
    for op in ops {
        out.push(op.clone());
        if let Some(update) = matching_session_table_update(op) {
            out.push(update);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{SessionId, StmtId, TxnNumber, WritePosition};
    use quill_oplog::OperationSessionInfo;

    fn plain_insert() -> OplogEntry {
        OplogEntry::new(OpKind::Insert, "app.items", json!({"_id": 1}))
    }

    fn session_write(session_id: SessionId, txn: i64, position: u64) -> OplogEntry {
        let mut entry = OplogEntry::new(OpKind::Insert, "app.items", json!({"_id": 2}))
            .with_session_info(OperationSessionInfo::for_transaction(
                session_id,
                TxnNumber::new(txn),
            ))
            .with_stmt_id(StmtId::new(0));
        entry.position = WritePosition::new(position);
        entry
    }

    #[test]
    fn test_plain_ops_pass_through() {
        let ops = vec![plain_insert(), plain_insert()];
        let derived = add_ops_for_session_table(&ops);
        assert_eq!(derived.len(), 2);
        assert_eq!(derived, ops);
    }

    #[test]
    fn test_session_write_gets_table_update_after_it() {
        let session_id = SessionId::new();
        let ops = vec![plain_insert(), session_write(session_id, 5, 17)];
        let derived = add_ops_for_session_table(&ops);

        assert_eq!(derived.len(), 3);
        let update = &derived[2];
        assert_eq!(update.kind, OpKind::Update);
        assert_eq!(update.namespace, SESSION_TRANSACTION_TABLE);
        assert!(update.upsert);
        assert_eq!(update.position, WritePosition::new(17));

        let record = SessionTxnRecord::from_document(&update.document).unwrap();
        assert_eq!(record.session_id, session_id);
        assert_eq!(record.txn_number, TxnNumber::new(5));
        assert_eq!(record.last_write_position, WritePosition::new(17));
    }

    #[test]
    fn test_apply_batch_commands_are_excluded() {
        let session_id = SessionId::new();
        let mut batch = OplogEntry::new(
            OpKind::Command(CommandKind::ApplyBatch),
            "admin.$cmd",
            json!({"applyOps": []}),
        )
        .with_session_info(OperationSessionInfo::for_transaction(
            session_id,
            TxnNumber::new(1),
        ));
        batch.position = WritePosition::new(3);

        let derived = add_ops_for_session_table(&[batch]);
        assert_eq!(derived.len(), 1, "no table update for apply-batch");
    }

    #[test]
    fn test_each_session_write_is_followed_by_its_update() {
        let a = SessionId::new();
        let b = SessionId::new();
        let ops = vec![
            session_write(a, 1, 10),
            session_write(b, 7, 11),
        ];
        let derived = add_ops_for_session_table(&ops);
        assert_eq!(derived.len(), 4);

        let update_a = SessionTxnRecord::from_document(&derived[1].document).unwrap();
        let update_b = SessionTxnRecord::from_document(&derived[3].document).unwrap();
        assert_eq!(update_a.session_id, a);
        assert_eq!(update_b.session_id, b);
        assert_eq!(update_b.txn_number, TxnNumber::new(7));
    }
}
