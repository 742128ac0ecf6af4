//! Storage transaction scope with commit/rollback callback registration
//!
//! A RecoveryUnit models the storage engine's transaction for one operation:
//! nested units of work, handlers to run after the outermost unit durably
//! commits or after any abort, and an optional point-in-time snapshot.
//!
//! Handlers are the message-passing channel between the storage engine and
//! the session bookkeeping: the session registers closures here instead of
//! being called back through shared mutable state, and each closure
//! re-validates session liveness before touching anything.

use tracing::debug;

type Handler = Box<dyn FnOnce() + Send>;

/// Storage transaction state for one operation
///
/// Commit handlers run exactly once, after the outermost unit of work
/// commits. Rollback handlers run in reverse registration order on abort.
/// A unit of work abandoned without commit (including by drop) aborts.
#[derive(Default)]
pub struct RecoveryUnit {
    unit_of_work_depth: usize,
    commit_handlers: Vec<Handler>,
    rollback_handlers: Vec<Handler>,
    snapshot: Option<u64>,
}

impl RecoveryUnit {
    /// Create a recovery unit with no open unit of work
    pub fn new() -> Self {
        RecoveryUnit::default()
    }

    /// Open a (possibly nested) unit of work
    pub fn begin_unit_of_work(&mut self) {
        self.unit_of_work_depth += 1;
    }

    /// Commit the current unit of work
    ///
    /// Only the outermost commit is the durability point: it runs the
    /// registered commit handlers and discards rollback handlers. Inner
    /// commits just unwind nesting.
    pub fn commit_unit_of_work(&mut self) {
        assert!(self.unit_of_work_depth > 0, "commit without a unit of work");
        self.unit_of_work_depth -= 1;
        if self.unit_of_work_depth == 0 {
            self.rollback_handlers.clear();
            let handlers = std::mem::take(&mut self.commit_handlers);
            debug!(handlers = handlers.len(), "committing storage unit of work");
            for handler in handlers {
                handler();
            }
            self.snapshot = None;
        }
    }

    /// Abort the transaction: run rollback handlers (reverse order), drop
    /// commit handlers, release the snapshot, unwind all nesting
    pub fn abort_unit_of_work(&mut self) {
        assert!(self.unit_of_work_depth > 0, "abort without a unit of work");
        self.unit_of_work_depth = 0;
        self.commit_handlers.clear();
        let handlers = std::mem::take(&mut self.rollback_handlers);
        debug!(handlers = handlers.len(), "aborting storage unit of work");
        for handler in handlers.into_iter().rev() {
            handler();
        }
        self.snapshot = None;
    }

    /// Whether a unit of work is open
    pub fn in_unit_of_work(&self) -> bool {
        self.unit_of_work_depth > 0
    }

    /// Register a closure to run after the outermost unit of work commits
    pub fn on_commit(&mut self, handler: impl FnOnce() + Send + 'static) {
        self.commit_handlers.push(Box::new(handler));
    }

    /// Register a closure to run if the transaction aborts
    pub fn on_rollback(&mut self, handler: impl FnOnce() + Send + 'static) {
        self.rollback_handlers.push(Box::new(handler));
    }

    /// Force allocation of a point-in-time snapshot at `version`
    ///
    /// Storage transactions otherwise open snapshots lazily; the session
    /// layer calls this on the first command of a transaction so every
    /// subsequent read observes one consistent point in time. Re-allocating
    /// while a snapshot exists keeps the existing one.
    pub fn preallocate_snapshot(&mut self, version: u64) {
        if self.snapshot.is_none() {
            self.snapshot = Some(version);
        }
    }

    /// Replace the snapshot after a visibility wait
    pub fn refresh_snapshot(&mut self, version: u64) {
        self.snapshot = Some(version);
    }

    /// The point-in-time snapshot version, if one is allocated
    pub fn snapshot_version(&self) -> Option<u64> {
        self.snapshot
    }

    /// Release the snapshot without ending the transaction
    pub fn release_snapshot(&mut self) {
        self.snapshot = None;
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        if self.unit_of_work_depth > 0 {
            self.abort_unit_of_work();
        }
    }
}
