//! Reconstruction of a session's transaction history from durable state
//!
//! The in-memory picture of a session (last written record, committed
//! statements, whether the chain is complete) is rebuilt lazily: read the
//! session's durable record, then walk its write chain backward through the
//! oplog collecting statement id → write position mappings.

use crate::record_store::SessionRecordStore;
use quill_core::{Result, SessionId, SessionTxnRecord, StmtId, TxnNumber, WritePosition};
use quill_oplog::{Oplog, TransactionHistoryIterator};
use serde_json::{json, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::error;

/// Marker document carried by dead-end sentinel entries
///
/// When a migration cannot copy a session's full history, it writes one
/// placeholder entry with the incomplete-history statement id and this
/// document as its secondary payload.
pub fn dead_end_sentinel() -> Value {
    json!({ "$incompleteOplogHistory": 1 })
}

/// Halt the process on evidence of repeated statement execution
///
/// A statement id recorded at two different write positions means a
/// retried write was executed twice, which means storage or replication
/// corruption.
/// Continuing would risk silently returning wrong results for an
/// acknowledged write, so this never returns.
pub(crate) fn fatal_on_repeated_execution(
    session_id: SessionId,
    txn_number: TxnNumber,
    stmt_id: StmtId,
    first_position: WritePosition,
    second_position: WritePosition,
) -> ! {
    error!(
        %session_id,
        %txn_number,
        %stmt_id,
        %first_position,
        %second_position,
        "statement was committed twice at different write positions; this indicates possible \
         data corruption and the process will be terminated"
    );
    panic!(
        "statement {stmt_id} from transaction {txn_number} on session {session_id} was \
         committed once at position {first_position} and a second time at position \
         {second_position}"
    );
}

/// In-memory view of a session's active transaction
#[derive(Debug, Default)]
pub struct ActiveTxnHistory {
    /// The session's durable record, if it has ever written
    pub last_txn_record: Option<SessionTxnRecord>,
    /// Committed statements of the active transaction
    pub committed_statements: HashMap<StmtId, WritePosition>,
    /// Whether the write chain was truncated, making absence unprovable
    pub has_incomplete_history: bool,
}

/// Rebuild a session's transaction history from durable state
///
/// Reads the latest record for `session_id` and walks the oplog chain
/// backward from its write position. Dead-end sentinel entries and chain
/// truncation set `has_incomplete_history`; truncation ends the walk
/// without error. A statement id seen twice at different positions halts
/// the process.
///
/// Callers must hold no locks: this reads storage and may be slow.
pub fn fetch_active_transaction_history(
    record_store: &SessionRecordStore,
    oplog: &Oplog,
    session_id: SessionId,
) -> Result<ActiveTxnHistory> {
    let mut result = ActiveTxnHistory {
        last_txn_record: record_store.latest_txn_record(session_id)?,
        ..ActiveTxnHistory::default()
    };

    let Some(record) = &result.last_txn_record else {
        return Ok(result);
    };

    let mut it = TransactionHistoryIterator::new(record.last_write_position);
    while it.has_next() {
        let entry = match it.next_entry(oplog) {
            Ok(entry) => entry,
            Err(e) if e.is_incomplete_history() => {
                result.has_incomplete_history = true;
                break;
            }
            Err(e) => return Err(e),
        };

        let stmt_id = entry
            .stmt_id
            .expect("entries in a session's write chain carry a statement id");

        if stmt_id == StmtId::INCOMPLETE_HISTORY {
            // Only the dead-end sentinel may carry this id.
            let marker = entry
                .object2
                .as_ref()
                .expect("dead-end sentinel entry carries a marker document");
            assert!(
                *marker == dead_end_sentinel(),
                "entry with the incomplete-history statement id is not a dead-end sentinel"
            );
            result.has_incomplete_history = true;
            continue;
        }

        match result.committed_statements.entry(stmt_id) {
            Entry::Vacant(slot) => {
                slot.insert(entry.position);
            }
            Entry::Occupied(existing) => {
                if *existing.get() != entry.position {
                    fatal_on_repeated_execution(
                        session_id,
                        record.txn_number,
                        stmt_id,
                        *existing.get(),
                        entry.position,
                    );
                }
            }
        }
    }

    Ok(result)
}
