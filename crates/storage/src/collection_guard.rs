//! Scoped database+collection lock acquisition
//!
//! Call sites never touch the lock manager directly: these helpers acquire
//! the database lock (at the matching intent mode) and then the collection
//! lock, run the caller's closure, and release both, with releases deferred
//! to unit-of-work end when one is open (two-phase locking).
//!
//! The read path additionally enforces snapshot visibility: if the
//! collection's minimum visible version is ahead of the operation's
//! snapshot, all locks are released, the operation blocks until the store's
//! visible version catches up, the snapshot is refreshed, and the
//! acquisition is retried. Snapshot-level read concern cannot yield and
//! retry; it fails instead.

use crate::lock::{LockMode, ResourceId};
use crate::op_context::OperationContext;
use crate::store::Collection;
use quill_core::{Error, ReadConcernLevel, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Database portion of a "db.collection" namespace
fn database_of(ns: &str) -> &str {
    ns.split('.').next().unwrap_or(ns)
}

/// Intent mode to take on the database for a collection mode
fn database_mode_for(mode: LockMode) -> LockMode {
    match mode {
        LockMode::IntentShared | LockMode::Shared => LockMode::IntentShared,
        LockMode::IntentExclusive | LockMode::Exclusive => LockMode::IntentExclusive,
    }
}

/// Collection lock mode for a query
///
/// Multi-document transactions read under intent-exclusive locks so their
/// later writes do not upgrade; plain reads use intent-shared.
pub fn lock_mode_for_read(in_multi_document_transaction: bool) -> LockMode {
    if in_multi_document_transaction {
        LockMode::IntentExclusive
    } else {
        LockMode::IntentShared
    }
}

/// Acquire database+collection locks at `mode`, run `f`, release
///
/// The closure receives the collection handle, or None when the namespace
/// does not exist (callers decide whether that is an error).
pub fn with_collection<T>(
    op_ctx: &mut OperationContext,
    ns: &str,
    mode: LockMode,
    deadline: Option<Instant>,
    f: impl FnOnce(&mut OperationContext, Option<Arc<Collection>>) -> Result<T>,
) -> Result<T> {
    let db_resource = ResourceId::database(database_of(ns));
    let coll_resource = ResourceId::collection(ns);

    op_ctx
        .locker_mut()
        .lock(db_resource.clone(), database_mode_for(mode), deadline)?;
    if let Err(e) = op_ctx.locker_mut().lock(coll_resource.clone(), mode, deadline) {
        op_ctx.locker_mut().unlock(&db_resource);
        return Err(e);
    }

    let collection = op_ctx.store().collection(ns);
    let result = f(op_ctx, collection);

    op_ctx.locker_mut().unlock(&coll_resource);
    op_ctx.locker_mut().unlock(&db_resource);
    result
}

/// Acquire a collection for writing, creating it when missing
///
/// The common case holds intent locks only. When the collection does not
/// exist, the locks are dropped and the database is retaken exclusively so
/// the collection can be created; the closure learns whether this call
/// created it.
pub fn with_collection_or_create<T>(
    op_ctx: &mut OperationContext,
    ns: &str,
    deadline: Option<Instant>,
    f: impl FnOnce(&mut OperationContext, Arc<Collection>, bool) -> Result<T>,
) -> Result<T> {
    let db_resource = ResourceId::database(database_of(ns));
    let coll_resource = ResourceId::collection(ns);

    op_ctx
        .locker_mut()
        .lock(db_resource.clone(), LockMode::IntentExclusive, deadline)?;
    if let Err(e) = op_ctx
        .locker_mut()
        .lock(coll_resource.clone(), LockMode::IntentExclusive, deadline)
    {
        op_ctx.locker_mut().unlock(&db_resource);
        return Err(e);
    }

    if let Some(collection) = op_ctx.store().collection(ns) {
        let result = f(op_ctx, collection, false);
        op_ctx.locker_mut().unlock(&coll_resource);
        op_ctx.locker_mut().unlock(&db_resource);
        return result;
    }

    // The collection must be created: retake the database exclusively.
    // Inside a unit of work the intent locks would only be released at
    // commit, and the exclusive request would deadlock against them.
    debug_assert!(
        !op_ctx.locker().in_unit_of_work(),
        "cannot create a collection inside a unit of work"
    );
    op_ctx.locker_mut().unlock(&coll_resource);
    op_ctx.locker_mut().unlock(&db_resource);
    op_ctx
        .locker_mut()
        .lock(db_resource.clone(), LockMode::Exclusive, deadline)?;

    let store = op_ctx.store().clone();
    let (collection, just_created) = store.ensure_collection(ns);
    let result = f(op_ctx, collection, just_created);

    op_ctx.locker_mut().unlock(&db_resource);
    result
}

/// Acquire a collection for reading, waiting out snapshot visibility
///
/// Loops until the operation's snapshot (if any) is at or past the
/// collection's minimum visible version. Each wait releases every lock
/// first; holding locks across the block would stall writers indefinitely.
pub fn with_collection_for_read<T>(
    op_ctx: &mut OperationContext,
    ns: &str,
    mode: LockMode,
    deadline: Option<Instant>,
    f: impl FnOnce(&mut OperationContext, Option<Arc<Collection>>) -> Result<T>,
) -> Result<T> {
    let db_resource = ResourceId::database(database_of(ns));
    let coll_resource = ResourceId::collection(ns);
    let started = Instant::now();
    let mut body = Some(f);

    loop {
        op_ctx
            .locker_mut()
            .lock(db_resource.clone(), database_mode_for(mode), deadline)?;
        if let Err(e) = op_ctx.locker_mut().lock(coll_resource.clone(), mode, deadline) {
            op_ctx.locker_mut().unlock(&db_resource);
            return Err(e);
        }

        let collection = op_ctx.store().collection(ns);

        // A wait is needed only when the collection constrains visibility,
        // the operation actually has a snapshot, and that snapshot is stale.
        let wait_for = collection.as_ref().and_then(|coll| {
            let min_visible = coll.minimum_visible_version()?;
            let snapshot = op_ctx.recovery_unit().snapshot_version()?;
            (snapshot < min_visible).then_some(min_visible)
        });

        let Some(min_visible) = wait_for else {
            let body = body.take().expect("read body already consumed");
            let result = body(op_ctx, collection);
            op_ctx.locker_mut().unlock(&coll_resource);
            op_ctx.locker_mut().unlock(&db_resource);
            if !op_ctx.is_killed() {
                trace!(
                    namespace = ns,
                    elapsed_micros = started.elapsed().as_micros() as u64,
                    "collection read complete"
                );
            }
            return result;
        };

        if op_ctx.read_concern().effective_level() == ReadConcernLevel::Snapshot {
            op_ctx.locker_mut().unlock(&coll_resource);
            op_ctx.locker_mut().unlock(&db_resource);
            return Err(Error::SnapshotUnavailable(format!(
                "cannot read {ns} at snapshot {:?}; collection minimum is {min_visible}; \
                 retry the operation",
                op_ctx.recovery_unit().snapshot_version()
            )));
        }

        // Yield every lock before blocking, then retry from the top.
        op_ctx.locker_mut().unlock(&coll_resource);
        op_ctx.locker_mut().unlock(&db_resource);

        debug!(
            namespace = ns,
            min_visible, "yielding locks to wait for snapshot visibility"
        );
        op_ctx.store().wait_until_visible(min_visible, deadline)?;
        let fresh = op_ctx.store().allocate_snapshot_version();
        op_ctx.recovery_unit_mut().refresh_snapshot(fresh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_context::Client;
    use crate::store::DocumentStore;
    use quill_core::ReadConcern;
    use serde_json::json;
    use std::time::Duration;

    fn ctx_with_collection(ns: &str) -> OperationContext {
        let store = DocumentStore::new();
        store.create_collection(ns);
        OperationContext::new(Client::new(), store)
    }

    #[test]
    fn test_lock_mode_for_read() {
        assert_eq!(lock_mode_for_read(true), LockMode::IntentExclusive);
        assert_eq!(lock_mode_for_read(false), LockMode::IntentShared);
    }

    #[test]
    fn test_with_collection_locks_db_and_collection() {
        let mut ctx = ctx_with_collection("app.items");
        with_collection(
            &mut ctx,
            "app.items",
            LockMode::IntentExclusive,
            None,
            |ctx, coll| {
                assert!(coll.is_some());
                let locker = ctx.locker();
                assert!(locker.is_locked_for(
                    &ResourceId::database("app"),
                    LockMode::IntentExclusive
                ));
                assert!(locker.is_locked_for(
                    &ResourceId::collection("app.items"),
                    LockMode::IntentExclusive
                ));
                Ok(())
            },
        )
        .unwrap();
        assert!(!ctx.locker().is_locked());
    }

    #[test]
    fn test_with_collection_missing_namespace_passes_none() {
        let store = DocumentStore::new();
        let mut ctx = OperationContext::new(Client::new(), store);
        with_collection(
            &mut ctx,
            "app.missing",
            LockMode::IntentShared,
            None,
            |_, coll| {
                assert!(coll.is_none());
                Ok(())
            },
        )
        .unwrap();
    }

    #[test]
    fn test_with_collection_or_create_creates_once() {
        let store = DocumentStore::new();
        let mut ctx = OperationContext::new(Client::new(), store);

        with_collection_or_create(&mut ctx, "app.items", None, |_, coll, just_created| {
            assert!(just_created);
            assert!(!coll.is_view());
            Ok(())
        })
        .unwrap();

        with_collection_or_create(&mut ctx, "app.items", None, |_, _, just_created| {
            assert!(!just_created);
            Ok(())
        })
        .unwrap();
        assert!(!ctx.locker().is_locked());
    }

    #[test]
    fn test_read_without_snapshot_skips_visibility_check() {
        let mut ctx = ctx_with_collection("app.items");
        ctx.store()
            .collection("app.items")
            .unwrap()
            .set_minimum_visible_version(100);

        // No snapshot allocated: the read proceeds.
        with_collection_for_read(
            &mut ctx,
            "app.items",
            LockMode::IntentShared,
            None,
            |_, coll| {
                assert!(coll.is_some());
                Ok(())
            },
        )
        .unwrap();
    }

    #[test]
    fn test_snapshot_read_concern_fails_instead_of_waiting() {
        let mut ctx = ctx_with_collection("app.items");
        ctx.set_read_concern(ReadConcern::at_level(ReadConcernLevel::Snapshot));
        ctx.recovery_unit_mut().preallocate_snapshot(1);
        ctx.store()
            .collection("app.items")
            .unwrap()
            .set_minimum_visible_version(5);

        let err = with_collection_for_read(
            &mut ctx,
            "app.items",
            LockMode::IntentShared,
            None,
            |_, _| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SnapshotUnavailable(_)));
        assert!(!ctx.locker().is_locked());
    }

    #[test]
    fn test_stale_snapshot_waits_for_visibility() {
        let mut ctx = ctx_with_collection("app.items");
        ctx.recovery_unit_mut().preallocate_snapshot(1);
        let coll = ctx.store().collection("app.items").unwrap();
        coll.set_minimum_visible_version(5);

        let store = ctx.store().clone();
        let publisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            store.advance_visible_version(5);
        });

        with_collection_for_read(
            &mut ctx,
            "app.items",
            LockMode::IntentShared,
            None,
            |ctx, coll| {
                assert!(coll.is_some());
                assert!(ctx.recovery_unit().snapshot_version().unwrap() >= 5);
                Ok(())
            },
        )
        .unwrap();
        publisher.join().unwrap();
    }

    #[test]
    fn test_read_inserts_are_visible_inside_guard() {
        let mut ctx = ctx_with_collection("app.items");
        ctx.store()
            .collection("app.items")
            .unwrap()
            .insert_document(json!({"_id": 1, "v": "x"}))
            .unwrap();

        let found = with_collection_for_read(
            &mut ctx,
            "app.items",
            LockMode::IntentShared,
            None,
            |_, coll| Ok(coll.unwrap().find_one_by_id(&json!(1))),
        )
        .unwrap();
        assert!(found.is_some());
    }
}
