//! Durable per-session transaction progress record
//!
//! One logical record exists per session in the session transaction
//! collection. It is replaced, never appended to: each completed retryable
//! write upserts `{_id, txn_number, last_write_position, last_write_date}`.
//! Crash recovery and chunk migration read it back to find the tail of the
//! session's write history chain.

use crate::error::{Error, Result};
use crate::types::{SessionId, TxnNumber, WritePosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Minimal durable summary of a session's transaction progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTxnRecord {
    /// Session this record belongs to; primary key of the record
    #[serde(rename = "_id")]
    pub session_id: SessionId,
    /// Highest transaction number that has written so far
    pub txn_number: TxnNumber,
    /// Position of the session's most recent write in the replicated log
    pub last_write_position: WritePosition,
    /// Wall-clock time of the most recent write
    pub last_write_date: DateTime<Utc>,
}

impl SessionTxnRecord {
    /// Create a record for a write that just completed
    pub fn new(
        session_id: SessionId,
        txn_number: TxnNumber,
        last_write_position: WritePosition,
        last_write_date: DateTime<Utc>,
    ) -> Self {
        SessionTxnRecord {
            session_id,
            txn_number,
            last_write_position,
            last_write_date,
        }
    }

    /// Serialize to the stored document form
    pub fn to_document(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }

    /// Parse a record from its stored document form
    pub fn from_document(doc: &Value) -> Result<Self> {
        serde_json::from_value(doc.clone())
            .map_err(|e| Error::Serialization(format!("malformed session txn record: {e}")))
    }
}
