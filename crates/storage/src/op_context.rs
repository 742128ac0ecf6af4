//! Per-operation execution context
//!
//! An OperationContext carries the state one in-flight database operation
//! owns: its client, the requested transaction number, the locker, the
//! recovery unit, and the read concern in effect. The session layer moves
//! the locker/recovery-unit/read-concern triple in and out of this context
//! when stashing transaction resources across command boundaries.
//!
//! Lock ordering rule: the Client's lock is always acquired before any
//! session lock. The Client effectively owns its sessions, so code locks
//! the Client to pin the session and only then locks the session itself.

use crate::lock::Locker;
use crate::recovery_unit::RecoveryUnit;
use crate::store::DocumentStore;
use parking_lot::{Mutex, MutexGuard};
use quill_core::{ReadConcern, Result, TxnNumber};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A connected client, lockable to pin its per-client state
pub struct Client {
    id: u64,
    mutex: Mutex<()>,
}

impl Client {
    /// Create a new client
    pub fn new() -> Arc<Self> {
        Arc::new(Client {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst),
            mutex: Mutex::new(()),
        })
    }

    /// Client identifier, for logging
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquire the client lock. Always taken before any session lock.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }
}

/// Execution state owned by one in-flight operation
pub struct OperationContext {
    client: Arc<Client>,
    store: Arc<DocumentStore>,
    txn_number: Option<TxnNumber>,
    locker: Locker,
    recovery_unit: RecoveryUnit,
    read_concern: ReadConcern,
    has_stashed_cursor: bool,
    killed: bool,
}

impl OperationContext {
    /// Create a context for an operation running on `client` against `store`
    pub fn new(client: Arc<Client>, store: Arc<DocumentStore>) -> Self {
        let locker = Locker::new(store.lock_manager().clone());
        OperationContext {
            client,
            store,
            txn_number: None,
            locker,
            recovery_unit: RecoveryUnit::new(),
            read_concern: ReadConcern::default(),
            has_stashed_cursor: false,
            killed: false,
        }
    }

    /// The client running this operation
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// The store this operation runs against
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Transaction number the command targeted, if any
    pub fn txn_number(&self) -> Option<TxnNumber> {
        self.txn_number
    }

    /// Set the targeted transaction number
    pub fn set_txn_number(&mut self, txn_number: TxnNumber) {
        self.txn_number = Some(txn_number);
    }

    /// Read concern in effect for this operation
    pub fn read_concern(&self) -> ReadConcern {
        self.read_concern
    }

    /// Overwrite the read concern (command parsing, or stash restore)
    pub fn set_read_concern(&mut self, read_concern: ReadConcern) {
        self.read_concern = read_concern;
    }

    /// The operation's locker
    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// The operation's locker, mutably
    pub fn locker_mut(&mut self) -> &mut Locker {
        &mut self.locker
    }

    /// Swap in a different locker, returning the previous one
    ///
    /// Used by the resource stash: held locks travel with the locker.
    pub fn swap_locker(&mut self, locker: Locker) -> Locker {
        std::mem::replace(&mut self.locker, locker)
    }

    /// The operation's recovery unit
    pub fn recovery_unit(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    /// The operation's recovery unit, mutably
    pub fn recovery_unit_mut(&mut self) -> &mut RecoveryUnit {
        &mut self.recovery_unit
    }

    /// Detach the recovery unit (open storage transaction and all), leaving
    /// a fresh one in place
    pub fn release_recovery_unit(&mut self) -> RecoveryUnit {
        std::mem::replace(&mut self.recovery_unit, RecoveryUnit::new())
    }

    /// Install a recovery unit, dropping the current one
    pub fn set_recovery_unit(&mut self, recovery_unit: RecoveryUnit) {
        self.recovery_unit = recovery_unit;
    }

    /// Open a write unit of work on both the recovery unit and the locker
    pub fn begin_write_unit_of_work(&mut self) {
        self.locker.begin_unit_of_work();
        self.recovery_unit.begin_unit_of_work();
    }

    /// Commit the current write unit of work
    ///
    /// The outermost commit runs registered commit handlers and flushes the
    /// locker's deferred releases.
    pub fn commit_write_unit_of_work(&mut self) {
        self.recovery_unit.commit_unit_of_work();
        self.locker.end_unit_of_work();
    }

    /// Abort the write unit of work: rollback handlers run, deferred lock
    /// releases flush
    pub fn abort_write_unit_of_work(&mut self) {
        self.recovery_unit.abort_unit_of_work();
        self.locker.end_all_units_of_work();
    }

    /// Whether a write unit of work is open
    pub fn in_write_unit_of_work(&self) -> bool {
        self.recovery_unit.in_unit_of_work()
    }

    /// Run `f` inside a write unit of work, committing on Ok and aborting
    /// on Err
    pub fn with_write_unit_of_work<T>(
        &mut self,
        f: impl FnOnce(&mut OperationContext) -> Result<T>,
    ) -> Result<T> {
        self.begin_write_unit_of_work();
        match f(self) {
            Ok(value) => {
                self.commit_write_unit_of_work();
                Ok(value)
            }
            Err(e) => {
                self.abort_write_unit_of_work();
                Err(e)
            }
        }
    }

    /// Whether a cursor was stashed on this operation (keeps a snapshot
    /// read open across commands)
    pub fn has_stashed_cursor(&self) -> bool {
        self.has_stashed_cursor
    }

    /// Mark whether a cursor is stashed on this operation
    pub fn set_has_stashed_cursor(&mut self, stashed: bool) {
        self.has_stashed_cursor = stashed;
    }

    /// Whether the operation has been killed by its execution context
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Mark the operation killed
    pub fn mark_killed(&mut self) {
        self.killed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockMode, ResourceId};
    use quill_core::{Error, ReadConcernLevel};
    use std::sync::atomic::Ordering;

    fn test_ctx() -> OperationContext {
        OperationContext::new(Client::new(), DocumentStore::new())
    }

    #[test]
    fn test_clients_have_distinct_ids() {
        let a = Client::new();
        let b = Client::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_new_context_is_idle() {
        let ctx = test_ctx();
        assert!(ctx.txn_number().is_none());
        assert!(!ctx.in_write_unit_of_work());
        assert!(!ctx.locker().is_locked());
        assert!(ctx.read_concern().is_empty());
        assert!(!ctx.is_killed());
    }

    #[test]
    fn test_unit_of_work_spans_locker_and_recovery_unit() {
        let mut ctx = test_ctx();
        ctx.begin_write_unit_of_work();
        assert!(ctx.in_write_unit_of_work());
        assert!(ctx.locker().in_unit_of_work());

        ctx.commit_write_unit_of_work();
        assert!(!ctx.in_write_unit_of_work());
        assert!(!ctx.locker().in_unit_of_work());
    }

    #[test]
    fn test_with_write_unit_of_work_commits_on_ok() {
        let mut ctx = test_ctx();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = fired.clone();
        ctx.with_write_unit_of_work(|ctx| {
            ctx.recovery_unit_mut()
                .on_commit(move || f.store(true, Ordering::SeqCst));
            Ok(())
        })
        .unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_with_write_unit_of_work_aborts_on_err() {
        let mut ctx = test_ctx();
        let rolled_back = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let r = rolled_back.clone();
        let result: Result<()> = ctx.with_write_unit_of_work(|ctx| {
            ctx.recovery_unit_mut()
                .on_rollback(move || r.store(true, Ordering::SeqCst));
            Err(Error::Storage("boom".into()))
        });
        assert!(result.is_err());
        assert!(rolled_back.load(Ordering::SeqCst));
        assert!(!ctx.in_write_unit_of_work());
    }

    #[test]
    fn test_swap_locker_moves_grants() {
        let mut ctx = test_ctx();
        let res = ResourceId::collection("app.items");
        ctx.locker_mut()
            .lock(res.clone(), LockMode::IntentExclusive, None)
            .unwrap();

        let manager = ctx.store().lock_manager().clone();
        let stolen = ctx.swap_locker(Locker::new(manager));
        assert!(stolen.is_locked_for(&res, LockMode::IntentExclusive));
        assert!(!ctx.locker().is_locked());
    }

    #[test]
    fn test_read_concern_round_trip() {
        let mut ctx = test_ctx();
        ctx.set_read_concern(ReadConcern::at_level(ReadConcernLevel::Snapshot));
        assert_eq!(
            ctx.read_concern().level(),
            Some(ReadConcernLevel::Snapshot)
        );
    }
}
