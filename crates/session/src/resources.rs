//! Parked transaction resources
//!
//! Between two commands of one multi-statement transaction, the session owns
//! the execution state the next command will need: the locker (with its
//! held locks), the recovery unit (with its open storage transaction and
//! snapshot), and the read concern the transaction started with. TxnResources
//! is that bundle.
//!
//! Ownership is transfer-only. Stashing moves the state out of the
//! operation context into the bundle; releasing moves it back. The session
//! holds at most one bundle at a time, and a bundle dropped without release
//! aborts its storage transaction and frees its locks.

use quill_core::ReadConcern;
use quill_storage::{Locker, OperationContext, RecoveryUnit};

/// The lock/snapshot/read-concern state parked between commands
pub struct TxnResources {
    // Field order matters on drop: the storage transaction aborts before
    // the locker releases its grants.
    recovery_unit: RecoveryUnit,
    locker: Locker,
    read_concern: ReadConcern,
}

impl TxnResources {
    /// Move the operation's transactional state into a parked bundle
    ///
    /// The context is left with a fresh locker and recovery unit and an
    /// empty read concern, as the next command will find it.
    pub fn stash(op_ctx: &mut OperationContext) -> Self {
        let manager = op_ctx.store().lock_manager().clone();
        let locker = op_ctx.swap_locker(Locker::new(manager));
        let recovery_unit = op_ctx.release_recovery_unit();
        let read_concern = op_ctx.read_concern();
        op_ctx.set_read_concern(ReadConcern::default());

        TxnResources {
            recovery_unit,
            locker,
            read_concern,
        }
    }

    /// The read concern the transaction started with
    pub fn read_concern(&self) -> ReadConcern {
        self.read_concern
    }

    /// Whether the parked storage transaction is still open
    pub fn in_unit_of_work(&self) -> bool {
        self.recovery_unit.in_unit_of_work()
    }

    /// Restore the bundle into an operation context
    ///
    /// The caller must already have verified that the operation carries no
    /// read concern of its own; the transaction's settings are reasserted
    /// here. The context's empty locker and fresh recovery unit are
    /// discarded.
    pub fn release(self, op_ctx: &mut OperationContext) {
        debug_assert!(
            op_ctx.read_concern().is_empty(),
            "only the first command in a transaction may specify a read concern"
        );
        debug_assert!(
            !op_ctx.locker().is_locked(),
            "releasing stashed resources over held locks"
        );

        let TxnResources {
            recovery_unit,
            locker,
            read_concern,
        } = self;

        op_ctx.swap_locker(locker);
        op_ctx.set_recovery_unit(recovery_unit);
        op_ctx.set_read_concern(read_concern);
    }
}
