//! Read concern settings carried by an operation
//!
//! Read concern travels with the operation context and, for multi-statement
//! transactions, is captured in the resource stash so that every command of
//! the transaction runs with the settings the first command specified.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Isolation/durability level requested for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConcernLevel {
    /// Read the node's local latest data
    Local,
    /// Read data acknowledged by a majority of the replica set
    Majority,
    /// Read from a single point-in-time snapshot across the transaction
    Snapshot,
}

impl fmt::Display for ReadConcernLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadConcernLevel::Local => write!(f, "local"),
            ReadConcernLevel::Majority => write!(f, "majority"),
            ReadConcernLevel::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Read concern arguments attached to an operation
///
/// `ReadConcern::default()` means the client specified nothing; that is what
/// `is_empty` reports. Only the first command in a transaction may carry a
/// non-empty read concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadConcern {
    level: Option<ReadConcernLevel>,
}

impl ReadConcern {
    /// Read concern with an explicit level
    pub fn at_level(level: ReadConcernLevel) -> Self {
        ReadConcern { level: Some(level) }
    }

    /// The requested level, if one was specified
    pub fn level(&self) -> Option<ReadConcernLevel> {
        self.level
    }

    /// The level in effect: defaults to local when unspecified
    pub fn effective_level(&self) -> ReadConcernLevel {
        self.level.unwrap_or(ReadConcernLevel::Local)
    }

    /// Whether the client specified nothing
    pub fn is_empty(&self) -> bool {
        self.level.is_none()
    }
}
