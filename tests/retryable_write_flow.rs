//! End-to-end command flow: unstash, execute, record, stash
//!
//! Drives the full shape of a command against the public API: resources are
//! restored at command entry, duplicate statements are answered from
//! history instead of re-executing, new statements are recorded in step
//! with the storage commit, and resources are parked again at command exit.

use chrono::Utc;
use quilldb::{
    lock_mode_for_read, with_collection, write_conflict_retry, Client, DocumentStore, LockMode,
    OpKind, OperationContext, OperationSessionInfo, Oplog, OplogEntry, ReadConcern,
    ReadConcernLevel, Session, SessionCatalog, SessionId, SessionRecordStore, StmtId,
    TransactionState, TxnNumber, WritePosition,
};
use serde_json::json;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

struct Deployment {
    store: Arc<DocumentStore>,
    record_store: SessionRecordStore,
    oplog: Oplog,
    catalog: SessionCatalog,
}

impl Deployment {
    fn new() -> Self {
        init_tracing();
        let store = DocumentStore::new();
        let record_store = SessionRecordStore::new(store.clone());
        record_store.create_table();
        store.create_collection("app.items");
        Deployment {
            store,
            record_store,
            oplog: Oplog::new(),
            catalog: SessionCatalog::new(),
        }
    }

    fn op_ctx(&self) -> OperationContext {
        OperationContext::new(Client::new(), self.store.clone())
    }

    /// One retryable insert command, end to end. Returns the position of
    /// the statement's effect, whether freshly executed or replayed.
    fn run_insert_command(
        &self,
        session: &Arc<Session>,
        txn_number: TxnNumber,
        stmt_id: StmtId,
        doc: serde_json::Value,
    ) -> WritePosition {
        let mut op_ctx = self.op_ctx();
        op_ctx.set_txn_number(txn_number);

        session
            .refresh_from_storage_if_needed(&op_ctx, &self.record_store, &self.oplog)
            .unwrap();
        session
            .begin_or_continue_txn(&op_ctx, txn_number, None)
            .unwrap();
        session.unstash_transaction_resources(&mut op_ctx).unwrap();

        // Exactly-once: a retried statement is answered from history.
        if let Some(prior) = session
            .check_statement_executed(&self.oplog, txn_number, stmt_id)
            .unwrap()
        {
            session.stash_transaction_resources(&mut op_ctx).unwrap();
            return prior.position;
        }

        let position = write_conflict_retry("insert", "app.items", || {
            op_ctx.with_write_unit_of_work(|op_ctx| {
                let doc = doc.clone();
                let prev = session.last_write_position(txn_number)?;
                let position = with_collection(
                    op_ctx,
                    "app.items",
                    LockMode::IntentExclusive,
                    None,
                    |_op_ctx, coll| {
                        coll.expect("app.items exists").insert_document(doc.clone())?;
                        let mut entry =
                            OplogEntry::new(OpKind::Insert, "app.items", doc.clone())
                                .with_session_info(OperationSessionInfo::for_transaction(
                                    session.session_id(),
                                    txn_number,
                                ))
                                .with_stmt_id(stmt_id);
                        if !prev.is_null() {
                            entry = entry.with_prev_write_position(prev);
                        }
                        Ok(self.oplog.append(entry))
                    },
                )?;
                session.on_write_op_completed(
                    op_ctx,
                    &self.record_store,
                    txn_number,
                    vec![stmt_id],
                    position,
                    Utc::now(),
                )?;
                Ok(position)
            })
        })
        .unwrap();

        session.stash_transaction_resources(&mut op_ctx).unwrap();
        position
    }
}

#[test]
fn test_retryable_write_executes_once_across_retries() {
    let d = Deployment::new();
    let session = d.catalog.get_or_create_session(SessionId::new());
    let txn = TxnNumber::new(1);

    let first = d.run_insert_command(&session, txn, StmtId::new(0), json!({"_id": "a", "v": 1}));
    // The client saw no response and retries the same statement.
    let second = d.run_insert_command(&session, txn, StmtId::new(0), json!({"_id": "a", "v": 1}));

    assert_eq!(first, second, "the retry replays the original effect");
    assert_eq!(
        d.store
            .collection("app.items")
            .unwrap()
            .len(),
        1,
        "the document was inserted exactly once"
    );
}

#[test]
fn test_snapshot_transaction_spans_commands() {
    let d = Deployment::new();
    let session = d.catalog.get_or_create_session(SessionId::new());
    let txn = TxnNumber::new(1);

    // Command 1 opens the transaction at snapshot read concern and leaves
    // a cursor open, so its resources are parked.
    let mut op_ctx = d.op_ctx();
    op_ctx.set_txn_number(txn);
    op_ctx.set_read_concern(ReadConcern::at_level(ReadConcernLevel::Snapshot));

    session
        .refresh_from_storage_if_needed(&op_ctx, &d.record_store, &d.oplog)
        .unwrap();
    session.begin_or_continue_txn(&op_ctx, txn, None).unwrap();
    session.unstash_transaction_resources(&mut op_ctx).unwrap();
    assert_eq!(session.transaction_state(), TransactionState::InSnapshotRead);
    let snapshot = op_ctx.recovery_unit().snapshot_version().unwrap();

    op_ctx.set_has_stashed_cursor(true);
    session.stash_transaction_resources(&mut op_ctx).unwrap();
    assert!(session.has_stashed_resources());

    // Command 2 (a getMore) resumes on a fresh context and observes the
    // same snapshot, then finishes the read.
    let mut op_ctx2 = d.op_ctx();
    op_ctx2.set_txn_number(txn);
    session.unstash_transaction_resources(&mut op_ctx2).unwrap();
    assert_eq!(op_ctx2.recovery_unit().snapshot_version(), Some(snapshot));
    assert_eq!(
        op_ctx2.read_concern().level(),
        Some(ReadConcernLevel::Snapshot)
    );

    session.stash_transaction_resources(&mut op_ctx2).unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Committed);
    assert!(!session.has_stashed_resources());
}

#[test]
fn test_writes_across_transactions_chain_and_replay() {
    let d = Deployment::new();
    let session_id = SessionId::new();
    let session = d.catalog.get_or_create_session(session_id);

    for (txn, stmt, id) in [(1, 0, "a"), (1, 1, "b"), (2, 0, "c")] {
        d.run_insert_command(
            &session,
            TxnNumber::new(txn),
            StmtId::new(stmt),
            json!({"_id": id}),
        );
    }

    // A process restart: fresh catalog, same durable state.
    let catalog = SessionCatalog::new();
    let revived = catalog.get_or_create_session(session_id);
    let op_ctx = d.op_ctx();
    revived
        .refresh_from_storage_if_needed(&op_ctx, &d.record_store, &d.oplog)
        .unwrap();

    // Only transaction 2 is active after the rebuild; its statement is
    // observable, transaction 1's are gone with their number.
    assert_eq!(revived.active_txn_number(), TxnNumber::new(2));
    assert!(revived
        .check_statement_executed_no_oplog_entry_fetch(TxnNumber::new(2), StmtId::new(0))
        .unwrap());

    // Retrying txn 2 stmt 0 against the revived session replays.
    let replayed = d.run_insert_command(
        &revived,
        TxnNumber::new(2),
        StmtId::new(0),
        json!({"_id": "c"}),
    );
    assert!(!replayed.is_null());
    assert_eq!(d.store.collection("app.items").unwrap().len(), 3);
}

#[test]
fn test_manual_table_deletion_invalidates_and_recovers() {
    let d = Deployment::new();
    let session = d.catalog.get_or_create_session(SessionId::new());
    let txn = TxnNumber::new(1);

    d.run_insert_command(&session, txn, StmtId::new(0), json!({"_id": "a"}));

    // An administrator drops the session transaction table out from under
    // the cache.
    d.store.drop_collection(quilldb::SESSION_TRANSACTION_TABLE);
    d.catalog.invalidate_all_sessions();
    assert!(!session.is_valid());

    // Recreate the table; the next refresh rebuilds from what remains.
    d.record_store.create_table();
    let op_ctx = d.op_ctx();
    session
        .refresh_from_storage_if_needed(&op_ctx, &d.record_store, &d.oplog)
        .unwrap();
    assert!(session.is_valid());
    assert_eq!(session.active_txn_number(), TxnNumber::UNINITIALIZED);
}

#[test]
fn test_read_lock_mode_follows_transaction_state() {
    let d = Deployment::new();
    let session = d.catalog.get_or_create_session(SessionId::new());
    let op_ctx = d.op_ctx();

    session
        .refresh_from_storage_if_needed(&op_ctx, &d.record_store, &d.oplog)
        .unwrap();
    assert_eq!(
        lock_mode_for_read(session.in_multi_document_transaction()),
        LockMode::IntentShared
    );

    session
        .begin_or_continue_txn(&op_ctx, TxnNumber::new(1), Some(false))
        .unwrap();
    assert_eq!(
        lock_mode_for_read(session.in_multi_document_transaction()),
        LockMode::IntentExclusive
    );
}
