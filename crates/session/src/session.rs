//! Per-session transaction bookkeeping state machine
//!
//! A Session is shared between the command thread that has the session
//! checked out and the commit/rollback handlers the storage engine runs at
//! transaction boundaries. One mutex guards all mutable state and is never
//! held across storage I/O; the refresh path instead captures an
//! invalidation epoch, reads storage unlocked, and re-validates the epoch
//! before installing what it read.
//!
//! Lock ordering: the Client lock is acquired before the session mutex.
//! Stash and unstash are the only operations that need both; they clone the
//! client handle first so the operation context stays free for mutation.

use crate::history::{fatal_on_repeated_execution, fetch_active_transaction_history};
use crate::record_store::{SessionRecordStore, SessionRecordUpdate};
use crate::resources::TxnResources;
use crate::state::TransactionState;
use crate::stats::RetryableWritesStats;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use quill_core::{
    Error, ReadConcernLevel, Result, SessionId, SessionTxnRecord, StmtId, TxnNumber, WritePosition,
};
use quill_oplog::{Oplog, OplogEntry, ReplOperation, TransactionHistoryIterator};
use quill_storage::{Client, OperationContext};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Mutable session state, guarded by the session mutex
struct SessionInner {
    is_valid: bool,
    num_invalidations: u64,
    last_written_record: Option<SessionTxnRecord>,
    active_txn_number: TxnNumber,
    committed_statements: HashMap<StmtId, WritePosition>,
    has_incomplete_history: bool,
    autocommit: bool,
    txn_state: TransactionState,
    txn_resource_stash: Option<TxnResources>,
    transaction_operations: Vec<ReplOperation>,
}

impl Default for SessionInner {
    fn default() -> Self {
        SessionInner {
            is_valid: false,
            num_invalidations: 0,
            last_written_record: None,
            active_txn_number: TxnNumber::UNINITIALIZED,
            committed_statements: HashMap::new(),
            has_incomplete_history: false,
            autocommit: true,
            txn_state: TransactionState::None,
            txn_resource_stash: None,
            transaction_operations: Vec::new(),
        }
    }
}

impl SessionInner {
    fn set_state(&mut self, next: TransactionState) {
        assert!(
            self.txn_state.can_transition_to(next),
            "illegal transaction state transition {} -> {next}",
            self.txn_state
        );
        self.txn_state = next;
    }

    fn check_valid(&self, session_id: SessionId) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(Error::ConflictingOperationInProgress(session_id))
        }
    }

    fn check_is_active_transaction(
        &self,
        session_id: SessionId,
        txn_number: TxnNumber,
    ) -> Result<()> {
        if txn_number == self.active_txn_number {
            Ok(())
        } else {
            Err(Error::ConflictingOperationInProgress(session_id))
        }
    }

    fn check_txn_valid(&self, session_id: SessionId, txn_number: TxnNumber) -> Result<()> {
        if txn_number < self.active_txn_number {
            return Err(Error::TransactionTooOld {
                session_id,
                requested: txn_number,
                active: self.active_txn_number,
            });
        }
        // A newer number may only displace a multi-document transaction
        // that has no pending operations and is not mid-commit.
        if txn_number != self.active_txn_number
            && (!self.transaction_operations.is_empty()
                || self.txn_state == TransactionState::Committing)
        {
            return Err(Error::TransactionInProgress {
                session_id,
                requested: txn_number,
                active: self.active_txn_number,
            });
        }
        Ok(())
    }

    /// Install a new active transaction number, discarding per-transaction
    /// caches
    ///
    /// Any parked resources are returned rather than dropped: destroying a
    /// stash aborts its storage transaction, and rollback handlers take the
    /// session mutex, so the drop must happen after the lock is released.
    #[must_use]
    fn set_active_txn(&mut self, txn_number: TxnNumber) -> Option<TxnResources> {
        self.active_txn_number = txn_number;
        self.committed_statements.clear();
        self.has_incomplete_history = false;
        self.txn_resource_stash.take()
    }

    fn begin_or_continue(
        &mut self,
        session_id: SessionId,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
    ) -> Result<Option<TxnResources>> {
        self.check_valid(session_id)?;
        self.check_txn_valid(session_id, txn_number)?;

        if txn_number == self.active_txn_number {
            // Continuing the existing transaction.
            if autocommit.is_some() {
                return Err(Error::InvalidOptions(
                    "specifying autocommit is only allowed at the beginning of a transaction"
                        .into(),
                ));
            }
            return Ok(None);
        }

        let displaced = self.set_active_txn(txn_number);
        self.autocommit = autocommit.unwrap_or(true);
        self.set_state(TransactionState::None);
        if !self.autocommit {
            self.set_state(TransactionState::InProgress);
        }
        assert!(
            self.transaction_operations.is_empty(),
            "starting a transaction over buffered operations"
        );
        Ok(displaced)
    }

    fn begin_or_continue_on_migration(
        &mut self,
        session_id: SessionId,
        txn_number: TxnNumber,
    ) -> Result<Option<TxnResources>> {
        self.check_valid(session_id)?;
        self.check_txn_valid(session_id, txn_number)?;

        if txn_number == self.active_txn_number {
            return Ok(None);
        }
        // Migrated transaction data arrives outside the normal command
        // path: advance identity only, leaving autocommit/state untouched.
        Ok(self.set_active_txn(txn_number))
    }

    fn check_statement_executed(
        &self,
        session_id: SessionId,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Option<WritePosition>> {
        self.check_valid(session_id)?;
        self.check_is_active_transaction(session_id, txn_number)?;

        let Some(position) = self.committed_statements.get(&stmt_id) else {
            if self.has_incomplete_history {
                // Absence is unprovable: the caller must not assume the
                // statement never ran.
                return Err(Error::incomplete_history(session_id, txn_number));
            }
            return Ok(None);
        };

        let record = self
            .last_written_record
            .as_ref()
            .expect("committed statements imply a last written record");
        assert!(
            record.txn_number == txn_number,
            "committed statements outlived their transaction"
        );
        Ok(Some(*position))
    }

    /// Clear stash, operation buffer, and state; the taken stash must be
    /// dropped only after the session mutex is released (see
    /// [`SessionInner::set_active_txn`])
    #[must_use]
    fn release_stashed_resources(&mut self) -> Option<TxnResources> {
        let stash = self.txn_resource_stash.take();
        self.transaction_operations.clear();
        self.set_state(TransactionState::None);
        stash
    }

    fn make_update_request(
        &self,
        session_id: SessionId,
        txn_number: TxnNumber,
        last_write_position: WritePosition,
        last_write_date: DateTime<Utc>,
    ) -> Result<SessionRecordUpdate> {
        let record =
            SessionTxnRecord::new(session_id, txn_number, last_write_position, last_write_date);
        SessionRecordUpdate::replacing(session_id, &record)
    }
}

/// Per-logical-client transaction bookkeeping
///
/// Created on first reference to a session id and populated lazily from
/// storage. Invalidation clears all cached state but preserves identity;
/// the owning catalog decides when a Session is destroyed.
pub struct Session {
    session_id: SessionId,
    // Handed to storage commit/rollback handlers, which must not keep the
    // session alive and must re-validate liveness before mutating it.
    weak_self: Weak<Session>,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Create bookkeeping for `session_id`; state is invalid until the
    /// first refresh
    pub fn new(session_id: SessionId) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Session {
            session_id,
            weak_self: weak_self.clone(),
            inner: Mutex::new(SessionInner::default()),
        })
    }

    /// The session's identifier
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Acquire the client lock and then the session mutex, in that order
    ///
    /// The client effectively owns the session, so every caller that needs
    /// both locks goes through here; no call site can get the ordering
    /// wrong. The session guard may be dropped and retaken independently
    /// (the snapshot-read commit does), but never before the client lock.
    fn lock_client_then_session<'a>(
        &'a self,
        client: &'a Client,
    ) -> (MutexGuard<'a, ()>, MutexGuard<'a, SessionInner>) {
        let client_lock = client.lock();
        let session_lock = self.inner.lock();
        (client_lock, session_lock)
    }

    /// Ensure the in-memory state reflects durable state
    ///
    /// Optimistic refresh: capture the invalidation epoch, read storage
    /// with the session mutex released, then install the result only if no
    /// invalidation happened in between; otherwise read again.
    ///
    /// The caller must hold no locks (the storage read may block) and must
    /// be running at local read concern.
    pub fn refresh_from_storage_if_needed(
        &self,
        op_ctx: &OperationContext,
        record_store: &SessionRecordStore,
        oplog: &Oplog,
    ) -> Result<()> {
        assert!(
            !op_ctx.locker().is_locked(),
            "refreshing session state while holding locks risks deadlock"
        );
        assert!(
            op_ctx.read_concern().effective_level() == ReadConcernLevel::Local,
            "session refresh requires local read concern"
        );

        let mut guard = self.inner.lock();
        while !guard.is_valid {
            let epoch = guard.num_invalidations;
            drop(guard);

            let history = fetch_active_transaction_history(record_store, oplog, self.session_id)?;

            guard = self.inner.lock();
            // Install only if nobody invalidated or refreshed concurrently.
            if !guard.is_valid && guard.num_invalidations == epoch {
                let inner = &mut *guard;
                inner.is_valid = true;
                inner.last_written_record = history.last_txn_record;
                if let Some(record) = inner.last_written_record.as_ref() {
                    inner.active_txn_number = record.txn_number;
                    inner.committed_statements = history.committed_statements;
                    inner.has_incomplete_history = history.has_incomplete_history;
                }
                debug!(
                    session_id = %self.session_id,
                    txn_number = %inner.active_txn_number,
                    statements = inner.committed_statements.len(),
                    "refreshed session from storage"
                );
                break;
            }
        }
        Ok(())
    }

    /// Begin a new transaction or continue the active one
    ///
    /// An older number is rejected as too old, and a newer number may not
    /// displace an in-progress multi-document transaction with pending
    /// operations. `autocommit` may only be specified when the transaction
    /// starts; it defaults to true.
    pub fn begin_or_continue_txn(
        &self,
        op_ctx: &OperationContext,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
    ) -> Result<()> {
        assert!(
            !op_ctx.locker().is_locked(),
            "beginning a transaction while holding locks"
        );
        let displaced = {
            let mut inner = self.inner.lock();
            inner.begin_or_continue(self.session_id, txn_number, autocommit)?
        };
        drop(displaced);
        Ok(())
    }

    /// Begin or continue a transaction on behalf of a chunk migration
    ///
    /// Advances identity only; migrated data arrives outside the normal
    /// command path, so autocommit and state bookkeeping are skipped.
    pub fn begin_or_continue_txn_on_migration(
        &self,
        op_ctx: &OperationContext,
        txn_number: TxnNumber,
    ) -> Result<()> {
        assert!(
            !op_ctx.locker().is_locked(),
            "beginning a transaction while holding locks"
        );
        let displaced = {
            let mut inner = self.inner.lock();
            inner.begin_or_continue_on_migration(self.session_id, txn_number)?
        };
        drop(displaced);
        Ok(())
    }

    /// Record completion of a retryable write on the primary
    ///
    /// Must run inside the write's open storage transaction. Re-checks each
    /// statement id (a repeat at a different position halts the process),
    /// persists the updated session record, and registers the commit-scoped
    /// cache update.
    pub fn on_write_op_completed(
        &self,
        op_ctx: &mut OperationContext,
        record_store: &SessionRecordStore,
        txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        last_stmt_write_position: WritePosition,
        last_write_date: DateTime<Utc>,
    ) -> Result<()> {
        assert!(
            op_ctx.in_write_unit_of_work(),
            "write completion must run inside the write's storage transaction"
        );

        let update = {
            let inner = self.inner.lock();

            for &stmt_id in &stmt_ids {
                if let Some(existing) =
                    inner.check_statement_executed(self.session_id, txn_number, stmt_id)?
                {
                    fatal_on_repeated_execution(
                        self.session_id,
                        txn_number,
                        stmt_id,
                        existing,
                        last_stmt_write_position,
                    );
                }
            }

            inner.make_update_request(
                self.session_id,
                txn_number,
                last_stmt_write_position,
                last_write_date,
            )?
        };

        record_store.update_session_entry(op_ctx, update)?;
        self.register_update_cache_on_commit(
            op_ctx,
            txn_number,
            stmt_ids,
            last_stmt_write_position,
            last_write_date,
        );
        Ok(())
    }

    /// Decide whether a migrated statement still needs to be copied
    ///
    /// Begins/continues the transaction on migration, then checks the
    /// statement. A truncated chain on the recipient is not a reason to
    /// skip: the donor's history may be complete, so copying continues,
    /// except for the dead-end sentinel itself.
    pub fn on_migrate_begin(
        &self,
        op_ctx: &OperationContext,
        oplog: &Oplog,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<bool> {
        self.begin_or_continue_txn_on_migration(op_ctx, txn_number)?;

        match self.check_statement_executed(oplog, txn_number, stmt_id) {
            Ok(Some(_)) => Ok(false),
            Ok(None) => Ok(true),
            Err(e) if e.is_incomplete_history() => Ok(stmt_id != StmtId::INCOMPLETE_HISTORY),
            Err(e) => Err(e),
        }
    }

    /// Record completion of a migrated batch of statements on the primary
    pub fn on_migrate_completed(
        &self,
        op_ctx: &mut OperationContext,
        record_store: &SessionRecordStore,
        txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        last_stmt_write_position: WritePosition,
        last_write_date: DateTime<Utc>,
    ) -> Result<()> {
        assert!(
            op_ctx.in_write_unit_of_work(),
            "migration completion must run inside the write's storage transaction"
        );

        let update = {
            let inner = self.inner.lock();
            inner.check_valid(self.session_id)?;
            inner.check_is_active_transaction(self.session_id, txn_number)?;
            inner.make_update_request(
                self.session_id,
                txn_number,
                last_stmt_write_position,
                last_write_date,
            )?
        };

        record_store.update_session_entry(op_ctx, update)?;
        self.register_update_cache_on_commit(
            op_ctx,
            txn_number,
            stmt_ids,
            last_stmt_write_position,
            last_write_date,
        );
        Ok(())
    }

    /// Mark all cached state stale
    ///
    /// Clears every cached field and bumps the invalidation epoch so any
    /// in-flight unlocked refresh discards its read. Identity is preserved.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.is_valid = false;
        inner.num_invalidations += 1;

        inner.last_written_record = None;
        inner.active_txn_number = TxnNumber::UNINITIALIZED;
        inner.committed_statements.clear();
        inner.has_incomplete_history = false;
    }

    /// Position of the active transaction's most recent write
    ///
    /// Null when the transaction has not written yet.
    pub fn last_write_position(&self, txn_number: TxnNumber) -> Result<WritePosition> {
        let inner = self.inner.lock();
        inner.check_valid(self.session_id)?;
        inner.check_is_active_transaction(self.session_id, txn_number)?;

        match inner.last_written_record.as_ref() {
            Some(record) if record.txn_number == txn_number => Ok(record.last_write_position),
            _ => Ok(WritePosition::null()),
        }
    }

    /// Check whether a statement already executed, resolving its full entry
    ///
    /// Returns the original oplog entry so the caller can reconstruct the
    /// write's result instead of re-executing it.
    ///
    /// # Errors
    /// `ConflictingOperationInProgress` when `txn_number` is not the active
    /// transaction; `IncompleteTransactionHistory` when absence cannot be
    /// proven.
    pub fn check_statement_executed(
        &self,
        oplog: &Oplog,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Option<OplogEntry>> {
        let position = {
            let inner = self.inner.lock();
            inner.check_statement_executed(self.session_id, txn_number, stmt_id)?
        };
        let Some(position) = position else {
            return Ok(None);
        };

        // The cache stores only the write position; resolve the full entry
        // by walking the chain from there.
        let mut it = TransactionHistoryIterator::new(position);
        while it.has_next() {
            let entry = it.next_entry(oplog)?;
            if entry.stmt_id == Some(stmt_id) {
                RetryableWritesStats::get().increment_retried_statements_count();
                return Ok(Some(entry));
            }
        }
        unreachable!("cached statement {stmt_id} not found on its own write chain");
    }

    /// Presence-only variant of [`Session::check_statement_executed`]
    pub fn check_statement_executed_no_oplog_entry_fetch(
        &self,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .check_statement_executed(self.session_id, txn_number, stmt_id)?
            .is_some())
    }

    /// Park transaction resources at command exit
    ///
    /// No-op outside `InProgress`/`InSnapshotRead`. A snapshot read with no
    /// stashed cursor is complete: its storage transaction commits here,
    /// with the session mutex released around the commit (handlers take it).
    /// Otherwise the locker, recovery unit, and read concern move into the
    /// session's stash.
    pub fn stash_transaction_resources(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let requested = op_ctx
            .txn_number()
            .expect("stashing requires a transaction number on the operation");

        // Clone the client handle so the operation context stays mutable
        // while both locks are held.
        let client = op_ctx.client().clone();
        let (_client_lock, mut inner) = self.lock_client_then_session(&client);

        if requested != inner.active_txn_number {
            // The checked-out session's number only moves under us when a
            // chunk migration copied newer transaction data in. Abort.
            warn!(
                session_id = %self.session_id,
                requested = %requested,
                active = %inner.active_txn_number,
                "transaction superseded during command; aborting"
            );
            let stash = inner.release_stashed_resources();
            inner.set_state(TransactionState::Aborted);
            let active = inner.active_txn_number;
            drop(inner);
            drop(stash);
            return Err(Error::TransactionAborted { active });
        }

        if inner.txn_state != TransactionState::InProgress
            && inner.txn_state != TransactionState::InSnapshotRead
        {
            return Ok(());
        }

        if inner.txn_state == TransactionState::InSnapshotRead && !op_ctx.has_stashed_cursor() {
            // The snapshot read is complete. The session mutex cannot be
            // held across the commit: commit handlers re-acquire it.
            assert!(op_ctx.in_write_unit_of_work());
            inner.set_state(TransactionState::Committing);
            drop(inner);

            op_ctx.commit_write_unit_of_work();

            let mut inner = self.inner.lock();
            inner.set_state(TransactionState::Committed);
            return Ok(());
        }

        assert!(
            inner.txn_resource_stash.is_none(),
            "transaction resources are already stashed"
        );
        inner.txn_resource_stash = Some(TxnResources::stash(op_ctx));
        Ok(())
    }

    /// Restore transaction resources at command entry
    ///
    /// No-op when the storage engine cannot park resources across commands.
    /// A request behind the active number releases any stash, aborts, and
    /// fails. An existing stash is moved back into the context (the command
    /// must not carry its own read concern). With no stash, snapshot read
    /// concern or an in-progress transaction opens a storage transaction
    /// eagerly and pins a point-in-time snapshot.
    pub fn unstash_transaction_resources(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let requested = op_ctx
            .txn_number()
            .expect("unstashing requires a transaction number on the operation");

        if !op_ctx.store().supports_resource_stashing() {
            return Ok(());
        }

        let client = op_ctx.client().clone();
        let (_client_lock, mut inner) = self.lock_client_then_session(&client);

        if requested < inner.active_txn_number {
            // Superseded by a migration (see stash_transaction_resources).
            warn!(
                session_id = %self.session_id,
                requested = %requested,
                active = %inner.active_txn_number,
                "transaction superseded before command; aborting"
            );
            let stash = inner.release_stashed_resources();
            inner.set_state(TransactionState::Aborted);
            let active = inner.active_txn_number;
            drop(inner);
            drop(stash);
            return Err(Error::TransactionAborted { active });
        }

        if inner.txn_resource_stash.is_some() {
            assert!(
                inner.txn_state != TransactionState::None,
                "stashed resources without an open transaction"
            );
            if !op_ctx.read_concern().is_empty() {
                return Err(Error::InvalidOptions(
                    "only the first command in a transaction may specify a read concern".into(),
                ));
            }
            let stash = inner
                .txn_resource_stash
                .take()
                .expect("stash vanished under the session mutex");
            stash.release(op_ctx);
            return Ok(());
        }

        if op_ctx.read_concern().level() == Some(ReadConcernLevel::Snapshot)
            || inner.txn_state == TransactionState::InProgress
        {
            // Storage transactions open snapshots lazily; force allocation
            // now so the whole transaction observes one point in time.
            op_ctx.begin_write_unit_of_work();
            let version = op_ctx.store().allocate_snapshot_version();
            op_ctx.recovery_unit_mut().preallocate_snapshot(version);

            if inner.txn_state != TransactionState::InProgress {
                assert!(inner.txn_state == TransactionState::None);
                inner.set_state(TransactionState::InSnapshotRead);
            }
        }

        Ok(())
    }

    /// Abort the active transaction, releasing any parked resources
    pub fn abort_transaction(&self) {
        let stash = {
            let mut inner = self.inner.lock();
            let stash = inner.release_stashed_resources();
            inner.set_state(TransactionState::Aborted);
            stash
        };
        drop(stash);
    }

    /// Abort an implicit snapshot read for `txn_number`, if one is active
    pub fn abort_if_snapshot_read(&self, txn_number: TxnNumber) {
        let stash = {
            let mut inner = self.inner.lock();
            if inner.active_txn_number != txn_number || !inner.autocommit {
                return;
            }
            let stash = inner.release_stashed_resources();
            inner.set_state(TransactionState::Aborted);
            stash
        };
        drop(stash);
    }

    /// Buffer an operation of the active multi-document transaction
    ///
    /// The first buffered operation registers the storage handlers: commit
    /// moves the state to `Committed`, rollback clears the buffer and
    /// forces `Aborted`. Handlers re-validate liveness through a weak
    /// reference before touching the session.
    pub fn add_transaction_operation(
        &self,
        op_ctx: &mut OperationContext,
        operation: ReplOperation,
    ) {
        let mut inner = self.inner.lock();
        assert!(
            inner.txn_state == TransactionState::InProgress,
            "buffering an operation outside an in-progress transaction"
        );
        assert!(!inner.autocommit && !inner.active_txn_number.is_uninitialized());
        assert!(op_ctx.in_write_unit_of_work());

        if inner.transaction_operations.is_empty() {
            let completing = inner.active_txn_number;

            let weak = self.weak_self.clone();
            op_ctx.recovery_unit_mut().on_rollback(move || {
                let Some(session) = weak.upgrade() else { return };
                let mut inner = session.inner.lock();
                assert!(inner.active_txn_number == completing);
                assert!(inner.txn_state != TransactionState::Committed);
                inner.transaction_operations.clear();
                // Forced, not transitioned: the storage abort may land after
                // the state already moved to Committing.
                inner.txn_state = TransactionState::Aborted;
            });

            let weak = self.weak_self.clone();
            op_ctx.recovery_unit_mut().on_commit(move || {
                let Some(session) = weak.upgrade() else { return };
                let mut inner = session.inner.lock();
                assert!(inner.active_txn_number == completing);
                assert!(matches!(
                    inner.txn_state,
                    TransactionState::Committing | TransactionState::Committed
                ));
                inner.set_state(TransactionState::Committed);
            });
        }
        inner.transaction_operations.push(operation);
    }

    /// Drain the buffered operations at commit time
    ///
    /// An empty buffer commits immediately (its storage transaction is
    /// empty, so no commit handler will fire); otherwise the state moves to
    /// `Committing` until the handler observes the durable commit.
    pub fn end_transaction_and_retrieve_operations(&self) -> Vec<ReplOperation> {
        let mut inner = self.inner.lock();
        assert!(!inner.autocommit, "not in a multi-document transaction");
        assert!(inner.txn_state == TransactionState::InProgress);

        let next = if inner.transaction_operations.is_empty() {
            TransactionState::Committed
        } else {
            TransactionState::Committing
        };
        inner.set_state(next);
        std::mem::take(&mut inner.transaction_operations)
    }

    /// Whether an explicit multi-statement transaction is executing
    pub fn in_multi_document_transaction(&self) -> bool {
        self.inner.lock().txn_state == TransactionState::InProgress
    }

    /// The active transaction number
    pub fn active_txn_number(&self) -> TxnNumber {
        self.inner.lock().active_txn_number
    }

    /// The current transaction state
    pub fn transaction_state(&self) -> TransactionState {
        self.inner.lock().txn_state
    }

    /// Whether cached state is populated and fresh
    pub fn is_valid(&self) -> bool {
        self.inner.lock().is_valid
    }

    /// Whether resources are parked between commands
    pub fn has_stashed_resources(&self) -> bool {
        self.inner.lock().txn_resource_stash.is_some()
    }

    /// Register the commit-scoped cache update for a completed write
    ///
    /// Runs only after the storage transaction durably commits. The handler
    /// re-validates liveness (weak upgrade, validity flag), advances the
    /// last-written record, re-derives the active transaction if the
    /// committed number is ahead of it, and installs the statement ids. A
    /// statement already present at a different position halts the process.
    fn register_update_cache_on_commit(
        &self,
        op_ctx: &mut OperationContext,
        new_txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        last_stmt_write_position: WritePosition,
        last_write_date: DateTime<Utc>,
    ) {
        let weak = self.weak_self.clone();
        op_ctx.recovery_unit_mut().on_commit(move || {
            RetryableWritesStats::get().increment_transactions_collection_write_count();

            let Some(session) = weak.upgrade() else { return };
            let mut guard = session.inner.lock();
            let inner = &mut *guard;

            // Arbitrary time may have passed; the session may have been
            // invalidated and not yet refreshed.
            if !inner.is_valid {
                return;
            }

            // The cache of the last written record always advances after a
            // write so subsequent writes chain from the right position.
            if let Some(record) = inner.last_written_record.as_mut() {
                if new_txn_number > record.txn_number {
                    record.txn_number = new_txn_number;
                }
                if last_stmt_write_position > record.last_write_position {
                    record.last_write_position = last_stmt_write_position;
                }
                if last_write_date > record.last_write_date {
                    record.last_write_date = last_write_date;
                }
            } else {
                inner.last_written_record = Some(SessionTxnRecord::new(
                    session.session_id,
                    new_txn_number,
                    last_stmt_write_position,
                    last_write_date,
                ));
            }

            if new_txn_number > inner.active_txn_number {
                // Just before this commit, the cache entry may have been
                // invalidated and refreshed while no writes for the new
                // number were durable yet; the refresh then installed an
                // older number. Re-derive the transaction so the statement
                // ids below are not dropped. A stash displaced here carries
                // no storage handlers (buffered operations would have
                // blocked the displacement), so dropping it under the
                // session mutex is safe.
                let displaced = inner
                    .begin_or_continue(session.session_id, new_txn_number, None)
                    .expect("advancing the active transaction from a commit handler");
                drop(displaced);
            }

            if new_txn_number == inner.active_txn_number {
                for stmt_id in stmt_ids {
                    if stmt_id == StmtId::INCOMPLETE_HISTORY {
                        inner.has_incomplete_history = true;
                        continue;
                    }
                    match inner.committed_statements.get(&stmt_id) {
                        Some(existing) if *existing != last_stmt_write_position => {
                            fatal_on_repeated_execution(
                                session.session_id,
                                new_txn_number,
                                stmt_id,
                                *existing,
                                last_stmt_write_position,
                            );
                        }
                        Some(_) => {}
                        None => {
                            inner
                                .committed_statements
                                .insert(stmt_id, last_stmt_write_position);
                        }
                    }
                }
            }
        });
    }
}
