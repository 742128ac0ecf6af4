//! In-memory transactional document store
//!
//! Named collections of JSON documents, each with a primary `_id` index.
//! The store exposes exactly the surface the session layer needs from a
//! storage engine:
//! - point lookup, insert (with a duplicate-key signal), and full-document
//!   replace by record id
//! - single-key lookup through the `_id` index
//! - a global visible-version counter with a blocking wait, backing snapshot
//!   allocation and the collection read path's visibility loop
//! - per-collection minimum visible versions (set after DDL) that gate
//!   point-in-time reads

use crate::lock::LockManager;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use quill_core::{Error, RecordId, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Stored document form
pub type Document = serde_json::Value;

#[derive(Default)]
struct CollectionData {
    next_record_id: u64,
    docs: BTreeMap<RecordId, Document>,
    id_index: BTreeMap<String, RecordId>,
}

/// A named collection of documents with a primary `_id` index
pub struct Collection {
    ns: String,
    is_view: bool,
    data: Mutex<CollectionData>,
    // 0 means "no minimum": readable at any snapshot
    min_visible_version: AtomicU64,
}

/// Canonical index key for an `_id` value
fn id_index_key(id: &Document) -> String {
    id.to_string()
}

impl Collection {
    fn new(ns: &str, is_view: bool) -> Self {
        Collection {
            ns: ns.to_string(),
            is_view,
            data: Mutex::new(CollectionData::default()),
            min_visible_version: AtomicU64::new(0),
        }
    }

    /// Fully-qualified "db.collection" namespace
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Whether this namespace is a view rather than a real collection
    pub fn is_view(&self) -> bool {
        self.is_view
    }

    /// Single-key lookup in the `_id` index
    pub fn find_id_index_single(&self, id: &Document) -> Option<RecordId> {
        self.data.lock().id_index.get(&id_index_key(id)).copied()
    }

    /// Fetch the document stored at `record_id`
    pub fn doc_for(&self, record_id: RecordId) -> Option<Document> {
        self.data.lock().docs.get(&record_id).cloned()
    }

    /// Point lookup by `_id` value
    pub fn find_one_by_id(&self, id: &Document) -> Option<Document> {
        let data = self.data.lock();
        let record_id = data.id_index.get(&id_index_key(id))?;
        data.docs.get(record_id).cloned()
    }

    /// Insert a document; its `_id` field becomes the primary key
    ///
    /// # Errors
    /// `Error::DuplicateKey` if a document with the same `_id` exists;
    /// `Error::InvalidOptions` if the document has no `_id`.
    pub fn insert_document(&self, doc: Document) -> Result<RecordId> {
        let id = doc
            .get("_id")
            .ok_or_else(|| Error::InvalidOptions("document is missing an _id field".into()))?
            .clone();
        let key = id_index_key(&id);

        let mut data = self.data.lock();
        if data.id_index.contains_key(&key) {
            return Err(Error::DuplicateKey(format!(
                "_id {key} already exists in {}",
                self.ns
            )));
        }

        data.next_record_id += 1;
        let record_id = RecordId::new(data.next_record_id);
        data.docs.insert(record_id, doc);
        data.id_index.insert(key, record_id);
        Ok(record_id)
    }

    /// Replace the whole document at `record_id`
    ///
    /// This layer only ever performs replacement updates, and a replacement
    /// may not change the primary key.
    pub fn update_document(&self, record_id: RecordId, doc: Document) -> Result<()> {
        let mut data = self.data.lock();
        let existing = data
            .docs
            .get(&record_id)
            .ok_or_else(|| Error::Storage(format!("record {record_id} vanished from {}", self.ns)))?;

        let old_id = existing.get("_id").cloned();
        let new_id = doc.get("_id").cloned();
        if old_id != new_id {
            return Err(Error::InvalidOptions(
                "replacement update may not change _id".into(),
            ));
        }

        data.docs.insert(record_id, doc);
        Ok(())
    }

    /// Number of documents in the collection
    pub fn len(&self) -> usize {
        self.data.lock().docs.len()
    }

    /// Whether the collection is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest version a point-in-time read may use, if one is set
    pub fn minimum_visible_version(&self) -> Option<u64> {
        match self.min_visible_version.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }

    /// Require point-in-time reads to be at or above `version`
    pub fn set_minimum_visible_version(&self, version: u64) {
        self.min_visible_version.store(version, Ordering::SeqCst);
    }
}

/// The transactional document substrate
///
/// Owns the collections, the lock manager, and the visible-version clock.
pub struct DocumentStore {
    collections: DashMap<String, Arc<Collection>>,
    lock_manager: Arc<LockManager>,
    visible: Mutex<u64>,
    visible_advanced: Condvar,
    supports_resource_stashing: bool,
}

impl DocumentStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Self::with_stashing(true)
    }

    /// Create a store whose engine cannot park resources across commands
    ///
    /// Unstash becomes a no-op against such a store.
    pub fn without_resource_stashing() -> Arc<Self> {
        Self::with_stashing(false)
    }

    fn with_stashing(supports_resource_stashing: bool) -> Arc<Self> {
        Arc::new(DocumentStore {
            collections: DashMap::new(),
            lock_manager: LockManager::new(),
            visible: Mutex::new(0),
            visible_advanced: Condvar::new(),
            supports_resource_stashing,
        })
    }

    /// The store's lock manager
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Whether the engine supports cross-command resource parking
    pub fn supports_resource_stashing(&self) -> bool {
        self.supports_resource_stashing
    }

    /// Create (or return) the collection for `ns`
    pub fn create_collection(&self, ns: &str) -> Arc<Collection> {
        self.ensure_collection(ns).0
    }

    /// Create the collection for `ns` if missing; reports whether this call
    /// created it
    pub fn ensure_collection(&self, ns: &str) -> (Arc<Collection>, bool) {
        let mut just_created = false;
        let collection = self
            .collections
            .entry(ns.to_string())
            .or_insert_with(|| {
                just_created = true;
                Arc::new(Collection::new(ns, false))
            })
            .clone();
        (collection, just_created)
    }

    /// Register `ns` as a view; reads acquire it like a collection but
    /// callers must check [`Collection::is_view`] before treating it as one
    pub fn create_view(&self, ns: &str) -> Arc<Collection> {
        self.collections
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(Collection::new(ns, true)))
            .clone()
    }

    /// Look up a collection; None if it does not exist
    pub fn collection(&self, ns: &str) -> Option<Arc<Collection>> {
        self.collections.get(ns).map(|c| c.value().clone())
    }

    /// Drop a collection; returns whether it existed
    pub fn drop_collection(&self, ns: &str) -> bool {
        let existed = self.collections.remove(ns).is_some();
        if existed {
            debug!(namespace = ns, "dropped collection");
        }
        existed
    }

    /// Current globally visible version
    pub fn visible_version(&self) -> u64 {
        *self.visible.lock()
    }

    /// Advance the visible version (monotonic), waking visibility waiters
    pub fn advance_visible_version(&self, version: u64) {
        let mut visible = self.visible.lock();
        if version > *visible {
            *visible = version;
            self.visible_advanced.notify_all();
        }
    }

    /// Block until the visible version reaches `version` or the deadline
    /// passes. Callers must hold no locks: this is a yield point.
    pub fn wait_until_visible(&self, version: u64, deadline: Option<Instant>) -> Result<()> {
        let mut visible = self.visible.lock();
        while *visible < version {
            match deadline {
                None => self.visible_advanced.wait(&mut visible),
                Some(when) => {
                    if self
                        .visible_advanced
                        .wait_until(&mut visible, when)
                        .timed_out()
                    {
                        return Err(Error::SnapshotUnavailable(format!(
                            "version {version} did not become visible before the deadline"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Allocate a point-in-time snapshot version
    pub fn allocate_snapshot_version(&self) -> u64 {
        self.visible_version()
    }
}

#[cfg(test)]
mod tests {
    // The store is shared across command threads and commit handlers.
    static_assertions::assert_impl_all!(super::DocumentStore: Send, Sync);
    static_assertions::assert_impl_all!(super::Collection: Send, Sync);

    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_insert_and_find_by_id() {
        let store = DocumentStore::new();
        let coll = store.create_collection("app.items");

        let doc = json!({"_id": "a", "value": 1});
        coll.insert_document(doc.clone()).unwrap();

        assert_eq!(coll.find_one_by_id(&json!("a")), Some(doc));
        assert_eq!(coll.find_one_by_id(&json!("b")), None);
    }

    #[test]
    fn test_duplicate_key_signal() {
        let store = DocumentStore::new();
        let coll = store.create_collection("app.items");

        coll.insert_document(json!({"_id": "a", "value": 1})).unwrap();
        let err = coll
            .insert_document(json!({"_id": "a", "value": 2}))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
    }

    #[test]
    fn test_insert_requires_id() {
        let store = DocumentStore::new();
        let coll = store.create_collection("app.items");
        let err = coll.insert_document(json!({"value": 1})).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_index_lookup_then_replace() {
        let store = DocumentStore::new();
        let coll = store.create_collection("app.items");

        coll.insert_document(json!({"_id": "a", "value": 1})).unwrap();
        let rid = coll.find_id_index_single(&json!("a")).unwrap();

        coll.update_document(rid, json!({"_id": "a", "value": 2}))
            .unwrap();
        assert_eq!(
            coll.find_one_by_id(&json!("a")).unwrap()["value"],
            json!(2)
        );
    }

    #[test]
    fn test_replace_may_not_change_id() {
        let store = DocumentStore::new();
        let coll = store.create_collection("app.items");

        coll.insert_document(json!({"_id": "a", "value": 1})).unwrap();
        let rid = coll.find_id_index_single(&json!("a")).unwrap();

        let err = coll
            .update_document(rid, json!({"_id": "b", "value": 2}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_drop_collection() {
        let store = DocumentStore::new();
        store.create_collection("app.items");
        assert!(store.collection("app.items").is_some());
        assert!(store.drop_collection("app.items"));
        assert!(store.collection("app.items").is_none());
        assert!(!store.drop_collection("app.items"));
    }

    #[test]
    fn test_visible_version_monotonic() {
        let store = DocumentStore::new();
        store.advance_visible_version(5);
        store.advance_visible_version(3);
        assert_eq!(store.visible_version(), 5);
    }

    #[test]
    fn test_wait_until_visible_times_out() {
        let store = DocumentStore::new();
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        let err = store.wait_until_visible(10, deadline).unwrap_err();
        assert!(matches!(err, Error::SnapshotUnavailable(_)));
    }

    #[test]
    fn test_wait_until_visible_wakes() {
        let store = DocumentStore::new();
        let store2 = store.clone();
        let waiter = std::thread::spawn(move || store2.wait_until_visible(4, None));

        std::thread::sleep(Duration::from_millis(10));
        store.advance_visible_version(4);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_ensure_collection_reports_creation() {
        let store = DocumentStore::new();
        let (_, created) = store.ensure_collection("app.items");
        assert!(created);
        let (_, created_again) = store.ensure_collection("app.items");
        assert!(!created_again);
    }

    #[test]
    fn test_views_are_flagged() {
        let store = DocumentStore::new();
        let view = store.create_view("app.recent_items");
        assert!(view.is_view());
        assert!(!store.create_collection("app.items").is_view());
    }

    #[test]
    fn test_minimum_visible_version() {
        let store = DocumentStore::new();
        let coll = store.create_collection("app.items");
        assert_eq!(coll.minimum_visible_version(), None);
        coll.set_minimum_visible_version(9);
        assert_eq!(coll.minimum_visible_version(), Some(9));
    }
}
