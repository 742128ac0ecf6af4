//! Idempotent persistence of session transaction records
//!
//! The session transaction table holds one record per session, keyed by the
//! session id. Updates are always full-document replacements, applied
//! through an insert-or-replace protocol that turns the two benign races
//! (a concurrent upsert hitting a duplicate key, and a record that no
//! longer matches the expected predicate) into write conflicts for the
//! caller to retry.

use quill_core::{Error, Result, SessionId, SessionTxnRecord};
use quill_storage::{with_collection, LockMode, OperationContext};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Namespace of the session transaction table
pub const SESSION_TRANSACTION_TABLE: &str = "config.transactions";

/// A replacement update against the session transaction table
#[derive(Debug, Clone)]
pub struct SessionRecordUpdate {
    /// Predicate the stored document must still match
    pub query: Value,
    /// Full replacement document
    pub update: Value,
    /// Insert when no document matches
    pub upsert: bool,
}

impl SessionRecordUpdate {
    /// Upsert-style replacement of a session's record
    pub fn replacing(session_id: SessionId, record: &SessionTxnRecord) -> Result<Self> {
        Ok(SessionRecordUpdate {
            query: json!({ "_id": serde_json::to_value(session_id)? }),
            update: record.to_document()?,
            upsert: true,
        })
    }

    /// Whether the update document is a full replacement (no operators)
    fn is_replacement(&self) -> bool {
        self.update
            .as_object()
            .map(|doc| doc.keys().all(|k| !k.starts_with('$')))
            .unwrap_or(false)
    }
}

/// Persistence facade over the session transaction table
pub struct SessionRecordStore {
    store: Arc<quill_storage::DocumentStore>,
}

impl SessionRecordStore {
    /// Create a record store over `store`
    pub fn new(store: Arc<quill_storage::DocumentStore>) -> Self {
        SessionRecordStore { store }
    }

    /// Create the session transaction table if it does not exist
    pub fn create_table(&self) -> Arc<quill_storage::Collection> {
        self.store.create_collection(SESSION_TRANSACTION_TABLE)
    }

    /// Point lookup of a session's latest record
    pub fn latest_txn_record(&self, session_id: SessionId) -> Result<Option<SessionTxnRecord>> {
        let Some(collection) = self.store.collection(SESSION_TRANSACTION_TABLE) else {
            return Ok(None);
        };
        let id = serde_json::to_value(session_id)?;
        match collection.find_one_by_id(&id) {
            Some(doc) => Ok(Some(SessionTxnRecord::from_document(&doc)?)),
            None => Ok(None),
        }
    }

    /// Apply a replacement update to the session transaction table
    ///
    /// Locks the table, locates the record through the `_id` index, and:
    /// - absent: inserts; a duplicate key means another writer got there
    ///   first and is reported as a write conflict
    /// - present: re-verifies the stored document still matches the query
    ///   predicate (a mismatch is a write conflict, not a logic error),
    ///   then replaces the whole document
    ///
    /// # Errors
    /// `NamespaceNotFound` when the table is missing (manual deletion);
    /// `WriteConflict` as described above, to be retried by the caller.
    pub fn update_session_entry(
        &self,
        op_ctx: &mut OperationContext,
        request: SessionRecordUpdate,
    ) -> Result<()> {
        assert!(
            request.is_replacement(),
            "session record updates must be full-document replacements"
        );

        with_collection(
            op_ctx,
            SESSION_TRANSACTION_TABLE,
            LockMode::IntentExclusive,
            None,
            |op_ctx, collection| {
                let collection = collection.ok_or_else(|| {
                    Error::NamespaceNotFound(format!(
                        "unable to persist transaction state because the {SESSION_TRANSACTION_TABLE} \
                         collection is missing; it may have been manually deleted"
                    ))
                })?;

                op_ctx.with_write_unit_of_work(|_op_ctx| {
                    let id = request.query.get("_id").cloned().ok_or_else(|| {
                        Error::InvalidOptions(
                            "session record updates must select by _id".into(),
                        )
                    })?;

                    let Some(record_id) = collection.find_id_index_single(&id) else {
                        if !request.upsert {
                            // Nothing matches and the caller did not ask to
                            // insert.
                            return Ok(());
                        }
                        return match collection.insert_document(request.update.clone()) {
                            Err(Error::DuplicateKey(msg)) => {
                                debug!(%msg, "lost upsert race on session record");
                                Err(Error::write_conflict(format!(
                                    "concurrent upsert of session record: {msg}"
                                )))
                            }
                            Err(e) => Err(e),
                            Ok(_) => Ok(()),
                        };
                    };

                    let original = collection.doc_for(record_id).ok_or_else(|| {
                        Error::Storage(format!(
                            "record {record_id} vanished from {SESSION_TRANSACTION_TABLE}"
                        ))
                    })?;

                    // The document may have been advanced by another writer
                    // since the caller built this request; make them retry.
                    if !matches_predicate(&original, &request.query) {
                        return Err(Error::write_conflict(
                            "session record no longer matches the expected state",
                        ));
                    }

                    collection.update_document(record_id, request.update.clone())
                })
            },
        )
    }
}

/// Whether every field of `query` equals the corresponding field of `doc`
fn matches_predicate(doc: &Value, query: &Value) -> bool {
    query
        .as_object()
        .map(|fields| fields.iter().all(|(key, value)| doc.get(key) == Some(value)))
        .unwrap_or(false)
}
