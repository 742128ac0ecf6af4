//! Transactional document substrate for the session layer
//!
//! This crate provides the storage-engine surface the session/transaction
//! bookkeeping layer consumes:
//! - DocumentStore/Collection: named collections of JSON documents with a
//!   primary `_id` index, insert/replace, and a duplicate-key signal
//! - RecoveryUnit: unit-of-work nesting with commit/rollback callback
//!   registration and point-in-time snapshot allocation
//! - LockManager/Locker: intent lock modes with deadlines and two-phase
//!   release while a unit of work is open
//! - OperationContext/Client: per-operation execution state
//! - Scoped collection acquisition, including the read path that yields all
//!   locks and waits for snapshot visibility
//! - write_conflict_retry: the retry loop for write-conflict errors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collection_guard;
pub mod lock;
pub mod op_context;
pub mod recovery_unit;
pub mod retry;
pub mod store;

pub use collection_guard::{
    lock_mode_for_read, with_collection, with_collection_for_read, with_collection_or_create,
};
pub use lock::{LockManager, LockMode, Locker, ResourceId};
pub use op_context::{Client, OperationContext};
pub use recovery_unit::RecoveryUnit;
pub use retry::write_conflict_retry;
pub use store::{Collection, Document, DocumentStore};
