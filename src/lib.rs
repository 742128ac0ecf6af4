//! QuillDB - embedded document database, session/transaction layer
//!
//! Quill tracks, per logical client session, the currently active
//! transaction, deduplicates retried write statements, persists the minimal
//! progress record needed for crash recovery and chunk migration, and hands
//! storage resources across the commands of one multi-statement
//! transaction.
//!
//! # Quick start
//!
//! ```
//! use quilldb::{
//!     Client, DocumentStore, OperationContext, SessionCatalog, SessionId,
//!     SessionRecordStore, Oplog, TxnNumber,
//! };
//!
//! let store = DocumentStore::new();
//! let record_store = SessionRecordStore::new(store.clone());
//! record_store.create_table();
//! let oplog = Oplog::new();
//!
//! let catalog = SessionCatalog::new();
//! let session = catalog.get_or_create_session(SessionId::new());
//!
//! let op_ctx = OperationContext::new(Client::new(), store);
//! session
//!     .refresh_from_storage_if_needed(&op_ctx, &record_store, &oplog)
//!     .unwrap();
//! session
//!     .begin_or_continue_txn(&op_ctx, TxnNumber::new(1), None)
//!     .unwrap();
//! ```
//!
//! # Architecture
//!
//! The workspace splits along the seams the session layer consumes:
//! `quill-core` (types and errors), `quill-storage` (the transactional
//! document substrate), `quill-oplog` (the replicated log and its backward
//! history walk), and `quill-session` (the bookkeeping state machine).

pub use quill_core::{
    Error, ReadConcern, ReadConcernLevel, RecordId, Result, SessionId, SessionTxnRecord, StmtId,
    TxnNumber, WritePosition,
};
pub use quill_oplog::{
    CommandKind, OpKind, OperationSessionInfo, Oplog, OplogEntry, ReplOperation,
    TransactionHistoryIterator,
};
pub use quill_session::{
    add_ops_for_session_table, fetch_active_transaction_history, ActiveTxnHistory,
    RetryableWritesStats, Session, SessionCatalog, SessionRecordStore, SessionRecordUpdate,
    TransactionState, TxnResources, SESSION_TRANSACTION_TABLE,
};
pub use quill_storage::{
    lock_mode_for_read, with_collection, with_collection_for_read, with_collection_or_create,
    write_conflict_retry, Client, Collection, Document, DocumentStore, LockManager, LockMode,
    Locker, OperationContext, RecoveryUnit, ResourceId,
};
