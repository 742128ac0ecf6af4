//! Create-on-first-reference session map
//!
//! The catalog owns every live Session. A lookup for an unknown session id
//! creates the bookkeeping object; it is then populated lazily by the first
//! operation that needs read-your-own-writes semantics. Bulk invalidation
//! exists for the one event that makes every cached state suspect: manual
//! deletion of the session transaction table.

use crate::session::Session;
use dashmap::DashMap;
use quill_core::SessionId;
use std::sync::Arc;
use tracing::warn;

/// Owner of all live sessions
#[derive(Default)]
pub struct SessionCatalog {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        SessionCatalog::default()
    }

    /// Fetch the session for `session_id`, creating it on first reference
    pub fn get_or_create_session(&self, session_id: SessionId) -> Arc<Session> {
        self.sessions
            .entry(session_id)
            .or_insert_with(|| Session::new(session_id))
            .clone()
    }

    /// Fetch an existing session without creating one
    pub fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&session_id).map(|s| s.value().clone())
    }

    /// Invalidate every session's cached state
    ///
    /// Called when durable session state may have changed under the cache,
    /// e.g. the session transaction table was manually deleted. Sessions
    /// keep their identity and rebuild lazily on next use.
    pub fn invalidate_all_sessions(&self) {
        warn!(
            sessions = self.sessions.len(),
            "invalidating all cached session state"
        );
        for entry in self.sessions.iter() {
            entry.value().invalidate();
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the catalog holds no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
