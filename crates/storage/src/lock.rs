//! Hierarchical intent locking for databases and collections
//!
//! The lock manager grants database- and collection-level locks in the four
//! classic modes (IS, IX, S, X). Writers take intent locks on the database
//! and the collection; the manager blocks incompatible requests, honoring an
//! optional deadline.
//!
//! Lockers practice two-phase release: while the operation has a unit of
//! work open, unlock requests are deferred and the locks are only returned
//! to the manager when the unit of work ends. This is what lets a
//! multi-statement transaction keep its locks across command boundaries:
//! the Locker itself is moved into the session's resource stash with its
//! grants intact.

use parking_lot::{Condvar, Mutex};
use quill_core::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Lock mode for a database or collection resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Intent to read individual documents (IS)
    IntentShared,
    /// Intent to write individual documents (IX)
    IntentExclusive,
    /// Shared access to the whole resource (S)
    Shared,
    /// Exclusive access to the whole resource (X)
    Exclusive,
}

impl LockMode {
    /// Standard intent-lock compatibility matrix
    pub fn is_compatible_with(self, held: LockMode) -> bool {
        use LockMode::*;
        match (self, held) {
            (IntentShared, IntentShared) => true,
            (IntentShared, IntentExclusive) => true,
            (IntentShared, Shared) => true,
            (IntentExclusive, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (Shared, IntentShared) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    fn index(self) -> usize {
        match self {
            LockMode::IntentShared => 0,
            LockMode::IntentExclusive => 1,
            LockMode::Shared => 2,
            LockMode::Exclusive => 3,
        }
    }

    fn from_index(i: usize) -> LockMode {
        match i {
            0 => LockMode::IntentShared,
            1 => LockMode::IntentExclusive,
            2 => LockMode::Shared,
            _ => LockMode::Exclusive,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        };
        write!(f, "{s}")
    }
}

/// Lockable resource: a database or a fully-qualified collection namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// A database, by name
    Database(String),
    /// A collection, by "db.collection" namespace
    Collection(String),
}

impl ResourceId {
    /// Database resource for a name
    pub fn database(name: impl Into<String>) -> Self {
        ResourceId::Database(name.into())
    }

    /// Collection resource for a namespace
    pub fn collection(ns: impl Into<String>) -> Self {
        ResourceId::Collection(ns.into())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Database(name) => write!(f, "db:{name}"),
            ResourceId::Collection(ns) => write!(f, "coll:{ns}"),
        }
    }
}

/// Per-resource grant counts, one slot per mode
#[derive(Default)]
struct GrantCounts([usize; 4]);

impl GrantCounts {
    fn accepts(&self, mode: LockMode) -> bool {
        self.0.iter().enumerate().all(|(i, &count)| {
            count == 0 || mode.is_compatible_with(LockMode::from_index(i))
        })
    }

    fn grant(&mut self, mode: LockMode) {
        self.0[mode.index()] += 1;
    }

    fn release(&mut self, mode: LockMode) {
        debug_assert!(self.0[mode.index()] > 0, "releasing a lock never granted");
        self.0[mode.index()] -= 1;
    }

    fn is_free(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }
}

/// Grants and blocks lock requests for all databases and collections
///
/// One manager exists per store. Requests that conflict with current grants
/// block on a condition variable until compatible or past their deadline.
pub struct LockManager {
    table: Mutex<HashMap<ResourceId, GrantCounts>>,
    released: Condvar,
}

impl LockManager {
    /// Create an empty lock manager
    pub fn new() -> Arc<Self> {
        Arc::new(LockManager {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        })
    }

    /// Acquire `mode` on `resource`, blocking until granted or the deadline
    /// passes. `None` waits indefinitely.
    fn lock(&self, resource: &ResourceId, mode: LockMode, deadline: Option<Instant>) -> Result<()> {
        let mut table = self.table.lock();
        loop {
            let counts = table.entry(resource.clone()).or_default();
            if counts.accepts(mode) {
                counts.grant(mode);
                return Ok(());
            }

            match deadline {
                None => self.released.wait(&mut table),
                Some(when) => {
                    if self.released.wait_until(&mut table, when).timed_out() {
                        return Err(Error::LockTimeout(format!(
                            "could not acquire {mode} on {resource}"
                        )));
                    }
                }
            }
        }
    }

    fn unlock(&self, resource: &ResourceId, mode: LockMode) {
        let mut table = self.table.lock();
        if let Some(counts) = table.get_mut(resource) {
            counts.release(mode);
            if counts.is_free() {
                table.remove(resource);
            }
        }
        self.released.notify_all();
    }

    /// Number of resources with at least one grant (for tests/diagnostics)
    pub fn locked_resource_count(&self) -> usize {
        self.table.lock().len()
    }
}

/// Per-operation lock bookkeeping with two-phase release
///
/// A Locker owns the grants it acquired and returns them on drop. While a
/// unit of work is open, `unlock` only marks the grant for release; the
/// actual release happens when the unit of work ends. Moving the Locker
/// (e.g. into a resource stash) moves the held locks with it.
pub struct Locker {
    manager: Arc<LockManager>,
    held: Vec<(ResourceId, LockMode)>,
    deferred: Vec<(ResourceId, LockMode)>,
    unit_of_work_depth: usize,
}

impl Locker {
    /// Create a locker bound to a manager, holding nothing
    pub fn new(manager: Arc<LockManager>) -> Self {
        Locker {
            manager,
            held: Vec::new(),
            deferred: Vec::new(),
            unit_of_work_depth: 0,
        }
    }

    /// Acquire `mode` on `resource` with an optional deadline
    pub fn lock(
        &mut self,
        resource: ResourceId,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Result<()> {
        self.manager.lock(&resource, mode, deadline)?;
        self.held.push((resource, mode));
        Ok(())
    }

    /// Release the most recent grant on `resource`
    ///
    /// Inside a unit of work the release is deferred until the unit of work
    /// ends (two-phase locking); otherwise it returns to the manager now.
    pub fn unlock(&mut self, resource: &ResourceId) {
        let Some(idx) = self.held.iter().rposition(|(r, _)| r == resource) else {
            debug_assert!(false, "unlocking {resource} which is not held");
            return;
        };
        let (resource, mode) = self.held.remove(idx);
        if self.unit_of_work_depth > 0 {
            self.deferred.push((resource, mode));
        } else {
            self.manager.unlock(&resource, mode);
        }
    }

    /// Enter a unit of work: subsequent unlocks are deferred
    pub fn begin_unit_of_work(&mut self) {
        self.unit_of_work_depth += 1;
    }

    /// Leave a unit of work; at the outermost level, flush deferred releases
    pub fn end_unit_of_work(&mut self) {
        debug_assert!(self.unit_of_work_depth > 0, "no unit of work to end");
        self.unit_of_work_depth = self.unit_of_work_depth.saturating_sub(1);
        if self.unit_of_work_depth == 0 {
            for (resource, mode) in self.deferred.drain(..) {
                self.manager.unlock(&resource, mode);
            }
        }
    }

    /// Abandon all units of work and flush deferred releases
    pub fn end_all_units_of_work(&mut self) {
        self.unit_of_work_depth = 0;
        for (resource, mode) in self.deferred.drain(..) {
            self.manager.unlock(&resource, mode);
        }
    }

    /// Whether any grant is currently held (including deferred releases)
    pub fn is_locked(&self) -> bool {
        !self.held.is_empty() || !self.deferred.is_empty()
    }

    /// Whether a unit of work is open on this locker
    pub fn in_unit_of_work(&self) -> bool {
        self.unit_of_work_depth > 0
    }

    /// Whether `resource` is held at exactly `mode`
    pub fn is_locked_for(&self, resource: &ResourceId, mode: LockMode) -> bool {
        self.held.iter().any(|(r, m)| r == resource && *m == mode)
    }

    /// Snapshot of held grants, for equivalence checks in tests
    pub fn held_resources(&self) -> Vec<(ResourceId, LockMode)> {
        self.held.clone()
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        for (resource, mode) in self.held.drain(..).chain(self.deferred.drain(..)) {
            self.manager.unlock(&resource, mode);
        }
    }
}
