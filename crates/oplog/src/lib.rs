//! Replicated operation log for the session/transaction layer
//!
//! This crate provides the log surface the session bookkeeping consumes:
//! - OplogEntry: an applied operation with its write position, optional
//!   session/transaction/statement metadata, and a backward link to the
//!   session's previous write
//! - Oplog: append-only store of entries with point lookup and truncation
//! - TransactionHistoryIterator: lazy backward walk over a session's write
//!   chain, reporting truncation as an incomplete-history condition

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod history;
pub mod log;

pub use entry::{CommandKind, OpKind, OperationSessionInfo, OplogEntry, ReplOperation};
pub use history::TransactionHistoryIterator;
pub use log::Oplog;
