// # Session Manager
//
// ConnectionId registry over the live sessions. Ids are minted here,
// monotonically, and never reused for the process lifetime.
//
// Lock discipline: the manager mutex is never held while calling into a
// session. Bulk operations snapshot the map, release, then iterate;
// otherwise a `send` holding the session's send mutex while removing itself
// from the manager can deadlock against a close-all holding the manager
// mutex while closing sessions.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::ConnectionId;
use crate::net::pool::SessionRef;

pub struct SessionManager {
    sessions: Mutex<HashMap<ConnectionId, SessionRef>>,
    next_id: AtomicU64,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions: max_sessions.max(1),
        }
    }

    #[cfg(feature = "lock-profiling")]
    fn lock_sessions(&self) -> parking_lot::MutexGuard<'_, HashMap<ConnectionId, SessionRef>> {
        let start = std::time::Instant::now();
        let guard = self.sessions.lock();
        let waited = start.elapsed();
        if waited > std::time::Duration::from_millis(1) {
            tracing::trace!(
                waited_us = waited.as_micros() as u64,
                "session map lock contention"
            );
        }
        guard
    }

    #[cfg(not(feature = "lock-profiling"))]
    #[inline]
    fn lock_sessions(&self) -> parking_lot::MutexGuard<'_, HashMap<ConnectionId, SessionRef>> {
        self.sessions.lock()
    }

    /// Mint the next connection id.
    pub fn generate_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session under its id. Fails when the connection cap is
    /// reached; the caller drops the lease, returning the pool slot.
    pub fn insert(&self, id: ConnectionId, session: SessionRef) -> bool {
        let mut sessions = self.lock_sessions();
        if sessions.len() >= self.max_sessions {
            tracing::warn!(id, limit = self.max_sessions, "max session count reached");
            return false;
        }
        sessions.insert(id, session);
        true
    }

    pub fn remove(&self, id: ConnectionId) -> Option<SessionRef> {
        let removed = self.lock_sessions().remove(&id);
        if removed.is_some() {
            tracing::debug!(id, "session removed from manager");
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<SessionRef> {
        self.lock_sessions().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Snapshot of every live session reference.
    pub fn all_sessions(&self) -> Vec<SessionRef> {
        let sessions = self.lock_sessions();
        sessions.values().cloned().collect()
    }

    /// Apply `f` to every session without holding the manager mutex.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionRef),
    {
        let snapshot = self.all_sessions();
        for session in &snapshot {
            f(session);
        }
    }

    /// Close every session and clear the registry. The map snapshot is
    /// released before any `close` runs.
    pub fn close_all(&self) {
        let snapshot = self.all_sessions();
        for session in &snapshot {
            session.close();
        }

        let mut sessions = self.lock_sessions();
        sessions.clear();
        tracing::info!(count = snapshot.len(), "all sessions closed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::pool::SessionPool;
    use crate::net::session::SessionState;

    #[test]
    fn test_ids_monotone_and_unique() {
        let manager = SessionManager::new(16);
        let a = manager.generate_id();
        let b = manager.generate_id();
        let c = manager.generate_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_insert_get_remove() {
        let pool = SessionPool::new(4);
        let manager = SessionManager::new(16);

        let session = pool.acquire().unwrap();
        let id = manager.generate_id();
        assert!(manager.insert(id, session));
        assert_eq!(manager.count(), 1);

        assert!(manager.get(id).is_some());
        assert!(manager.remove(id).is_some());
        assert!(manager.get(id).is_none());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_connection_cap() {
        let pool = SessionPool::new(4);
        let manager = SessionManager::new(2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();

        assert!(manager.insert(manager.generate_id(), a));
        assert!(manager.insert(manager.generate_id(), b));
        assert!(!manager.insert(manager.generate_id(), c));
    }

    #[test]
    fn test_remove_releases_slot() {
        let pool = SessionPool::new(1);
        let manager = SessionManager::new(4);

        let session = pool.acquire().unwrap();
        let id = manager.generate_id();
        assert!(manager.insert(id, session));
        assert_eq!(pool.active_count(), 1);

        manager.remove(id);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_close_all_closes_and_clears() {
        let pool = SessionPool::new(4);
        let manager = SessionManager::new(16);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let session = pool.acquire().unwrap();
            let id = manager.generate_id();
            manager.insert(id, session.clone());
            ids.push((id, session));
        }

        manager.close_all();
        assert_eq!(manager.count(), 0);
        for (_, session) in &ids {
            assert_eq!(session.state(), SessionState::Disconnected);
        }
    }
}
