//! In-memory fast-path mirror of live sessions.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::models::session::Session;

/// Process-local cache of non-terminal sessions keyed by session id.
///
/// The durable store stays authoritative; entries are dropped when a
/// session reaches a terminal status.
#[derive(Debug, Default)]
pub struct SessionCache {
    inner: RwLock<HashMap<String, Session>>,
}

impl SessionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry; terminal sessions are evicted instead.
    pub async fn upsert(&self, session: &Session) {
        let mut map = self.inner.write().await;
        if session.status.is_terminal() {
            map.remove(&session.id);
        } else {
            map.insert(session.id.clone(), session.clone());
        }
    }

    /// Fetch a cached session.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().await.get(session_id).cloned()
    }

    /// Drop an entry.
    pub async fn remove(&self, session_id: &str) {
        self.inner.write().await.remove(session_id);
    }

    /// Number of cached sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
