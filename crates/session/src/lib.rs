//! Session and transaction bookkeeping
//!
//! This crate is the heart of the workspace: per logical client session it
//! tracks the active transaction, deduplicates retried write statements,
//! persists the minimal progress record needed for crash recovery and chunk
//! migration, and hands storage resources (locks, snapshot, read concern)
//! across the commands of one multi-statement transaction.
//!
//! The pieces:
//! - Session: the per-session state machine
//! - TxnResources: the parked lock/snapshot/read-concern bundle
//! - SessionRecordStore: idempotent persistence of SessionTxnRecord
//! - fetch_active_transaction_history: in-memory rebuild from durable state
//! - add_ops_for_session_table: derived replication entries
//! - SessionCatalog: create-on-first-reference session map
//! - RetryableWritesStats: observability counters

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod history;
pub mod record_store;
pub mod replication;
pub mod resources;
pub mod session;
pub mod state;
pub mod stats;

pub use catalog::SessionCatalog;
pub use history::{dead_end_sentinel, fetch_active_transaction_history, ActiveTxnHistory};
pub use record_store::{SessionRecordStore, SessionRecordUpdate, SESSION_TRANSACTION_TABLE};
pub use replication::add_ops_for_session_table;
pub use resources::TxnResources;
pub use session::Session;
pub use state::TransactionState;
pub use stats::RetryableWritesStats;
