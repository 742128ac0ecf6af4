//! Identifier types for sessions, transactions, and the replicated log
//!
//! These are the foundational newtypes:
//! - SessionId: globally unique identifier for a logical client session
//! - TxnNumber: per-session monotonic transaction counter
//! - StmtId: per-transaction statement identifier for write retry dedup
//! - WritePosition: ordered token locating a durable operation in the log
//! - RecordId: opaque row locator inside a collection

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a logical client session
///
/// A SessionId is a wrapper around a UUID v4. Once assigned to a session it
/// never changes; equality is by value. It doubles as the primary key of the
/// session transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random SessionId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a SessionId from a string representation
    ///
    /// Accepts standard UUID format. Returns None if the string is not a
    /// valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this SessionId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session monotonic transaction number
///
/// Identifies one transaction attempt (a single retryable write or a
/// multi-statement transaction) within a session. Numbers never decrease
/// across successive begin-or-continue calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnNumber(i64);

impl TxnNumber {
    /// Sentinel preceding any real transaction on a session
    pub const UNINITIALIZED: TxnNumber = TxnNumber(-1);

    /// Create a transaction number from its raw value
    pub const fn new(n: i64) -> Self {
        TxnNumber(n)
    }

    /// Raw value
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Whether this is the uninitialized sentinel
    pub const fn is_uninitialized(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-transaction statement identifier
///
/// Used to deduplicate retried writes: each write statement inside a
/// transaction attempt carries a StmtId, and re-executing an id that has
/// already committed must return the original result instead of applying
/// the write again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StmtId(i32);

impl StmtId {
    /// Sentinel marking a dead-end placeholder written when a session's
    /// history chain was truncated on a donor shard. Never maps to a real
    /// statement.
    pub const INCOMPLETE_HISTORY: StmtId = StmtId(-1);

    /// Create a statement id from its raw value
    pub const fn new(n: i32) -> Self {
        StmtId(n)
    }

    /// Raw value
    pub const fn as_i32(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered token locating a durably applied operation in the replicated log
///
/// Positions are assigned densely by the log on append and are comparable
/// for ordering. Position zero is the null position: it compares below every
/// real position and means "no write yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct WritePosition(u64);

impl WritePosition {
    /// The null position, preceding every real write
    pub const fn null() -> Self {
        WritePosition(0)
    }

    /// Create a position from its raw value
    pub const fn new(n: u64) -> Self {
        WritePosition(n)
    }

    /// Raw value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the null position
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for WritePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque locator of a stored document within a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(u64);

impl RecordId {
    /// Create a record id from its raw value
    pub const fn new(n: u64) -> Self {
        RecordId(n)
    }

    /// Raw value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
