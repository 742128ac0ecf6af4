//! Core types for the Quill session/transaction layer
//!
//! This crate defines the foundational vocabulary shared by every other
//! crate in the workspace:
//! - Identifier newtypes: SessionId, TxnNumber, StmtId, WritePosition, RecordId
//! - SessionTxnRecord: the durable per-session transaction progress record
//! - ReadConcern: per-operation read settings
//! - Error/Result: the workspace error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod read_concern;
pub mod record;
pub mod types;

pub use error::{Error, Result};
pub use read_concern::{ReadConcern, ReadConcernLevel};
pub use record::SessionTxnRecord;
pub use types::{RecordId, SessionId, StmtId, TxnNumber, WritePosition};
