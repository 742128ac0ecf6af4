//! Operation log entry types
//!
//! An OplogEntry records one applied operation. Entries written on behalf of
//! a session carry the session id, transaction number, and statement id, and
//! link backward to the session's previous write via `prev_write_position`.
//! That backward chain is what retryable-write deduplication replays.

use chrono::{DateTime, Utc};
use quill_core::{SessionId, StmtId, TxnNumber, WritePosition};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command operations that can appear in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// A batch of operations applied atomically on a secondary
    ApplyBatch,
    /// Collection creation
    CreateCollection,
    /// Collection drop
    DropCollection,
}

/// Kind of operation an entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Document insert
    Insert,
    /// Document update; `document` holds the replacement, `criteria` the key
    Update,
    /// Document delete
    Delete,
    /// No-op marker (placeholders, migrations)
    Noop,
    /// A command
    Command(CommandKind),
}

impl OpKind {
    /// Whether this entry records a command
    pub fn is_command(&self) -> bool {
        matches!(self, OpKind::Command(_))
    }
}

/// Session/transaction metadata attached to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationSessionInfo {
    /// Session the operation ran under
    pub session_id: Option<SessionId>,
    /// Transaction number within the session
    pub txn_number: Option<TxnNumber>,
}

impl OperationSessionInfo {
    /// Metadata for an operation running under a session transaction
    pub fn for_transaction(session_id: SessionId, txn_number: TxnNumber) -> Self {
        OperationSessionInfo {
            session_id: Some(session_id),
            txn_number: Some(txn_number),
        }
    }
}

/// One applied operation in the replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Where this entry sits in the log; assigned on append
    pub position: WritePosition,
    /// What the operation did
    pub kind: OpKind,
    /// Namespace the operation targeted
    pub namespace: String,
    /// Operation payload (inserted document, replacement document, ...)
    pub document: Value,
    /// Secondary payload (update criteria, sentinel markers)
    pub object2: Option<Value>,
    /// Session/transaction metadata, if the op ran under a session
    pub session_info: OperationSessionInfo,
    /// Statement id within the transaction, if any
    pub stmt_id: Option<StmtId>,
    /// Backward link to the session's previous write
    pub prev_write_position: Option<WritePosition>,
    /// Pre-image location for retryable findAndModify-style ops
    pub pre_image_position: Option<WritePosition>,
    /// Post-image location for retryable findAndModify-style ops
    pub post_image_position: Option<WritePosition>,
    /// Wall-clock time the operation was applied
    pub wall_time: DateTime<Utc>,
    /// Whether this entry is an upsert-style update
    pub upsert: bool,
}

impl OplogEntry {
    /// Create an entry with no session metadata; position is assigned by
    /// the log on append
    pub fn new(kind: OpKind, namespace: impl Into<String>, document: Value) -> Self {
        OplogEntry {
            position: WritePosition::null(),
            kind,
            namespace: namespace.into(),
            document,
            object2: None,
            session_info: OperationSessionInfo::default(),
            stmt_id: None,
            prev_write_position: None,
            pre_image_position: None,
            post_image_position: None,
            wall_time: Utc::now(),
            upsert: false,
        }
    }

    /// Attach session/transaction metadata
    pub fn with_session_info(mut self, info: OperationSessionInfo) -> Self {
        self.session_info = info;
        self
    }

    /// Attach a statement id
    pub fn with_stmt_id(mut self, stmt_id: StmtId) -> Self {
        self.stmt_id = Some(stmt_id);
        self
    }

    /// Link backward to the session's previous write
    pub fn with_prev_write_position(mut self, position: WritePosition) -> Self {
        self.prev_write_position = Some(position);
        self
    }

    /// Attach the secondary payload
    pub fn with_object2(mut self, object2: Value) -> Self {
        self.object2 = Some(object2);
        self
    }

    /// Set the wall-clock time
    pub fn with_wall_time(mut self, wall_time: DateTime<Utc>) -> Self {
        self.wall_time = wall_time;
        self
    }

    /// Mark as an upsert-style update
    pub fn with_upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

/// An operation buffered inside a multi-document transaction
///
/// Buffered operations are not in the log yet; they are drained at commit
/// and applied as one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplOperation {
    /// What the operation does
    pub kind: OpKind,
    /// Namespace it targets
    pub namespace: String,
    /// Operation payload
    pub document: Value,
}

impl ReplOperation {
    /// Create a buffered operation
    pub fn new(kind: OpKind, namespace: impl Into<String>, document: Value) -> Self {
        ReplOperation {
            kind,
            namespace: namespace.into(),
            document,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_entry_has_null_position() {
        let entry = OplogEntry::new(OpKind::Insert, "app.items", json!({"_id": 1}));
        assert!(entry.position.is_null());
        assert!(entry.stmt_id.is_none());
        assert!(entry.prev_write_position.is_none());
        assert!(!entry.upsert);
    }

    #[test]
    fn test_builder_attaches_session_metadata() {
        let session_id = SessionId::new();
        let entry = OplogEntry::new(OpKind::Insert, "app.items", json!({"_id": 1}))
            .with_session_info(OperationSessionInfo::for_transaction(
                session_id,
                TxnNumber::new(3),
            ))
            .with_stmt_id(StmtId::new(0))
            .with_prev_write_position(WritePosition::new(9));

        assert_eq!(entry.session_info.session_id, Some(session_id));
        assert_eq!(entry.session_info.txn_number, Some(TxnNumber::new(3)));
        assert_eq!(entry.stmt_id, Some(StmtId::new(0)));
        assert_eq!(entry.prev_write_position, Some(WritePosition::new(9)));
    }

    #[test]
    fn test_command_kind_detection() {
        assert!(OpKind::Command(CommandKind::ApplyBatch).is_command());
        assert!(!OpKind::Insert.is_command());
        assert!(!OpKind::Noop.is_command());
    }

    #[test]
    fn test_entry_serde_round_trip() {
        let entry = OplogEntry::new(OpKind::Update, "app.items", json!({"_id": 1, "v": 2}))
            .with_object2(json!({"_id": 1}))
            .with_upsert();
        let text = serde_json::to_string(&entry).unwrap();
        let back: OplogEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(entry, back);
    }
}
