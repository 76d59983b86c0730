// # Session Pool
//
// Fixed-capacity, pre-allocated session slots. `acquire` hands out a shared
// lease; dropping the last clone closes the session, resets it, and returns
// the slot to the free list. Sessions never move, so the embedded I/O
// context buffers keep stable addresses for the provider.

use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::net::session::Session;

// ============================================================================
// Slots
// ============================================================================

#[repr(align(64))]
struct PoolSlot {
    session: Session,
    in_use: AtomicBool,
}

// ============================================================================
// SessionPool
// ============================================================================

pub struct SessionPool {
    slots: Box<[PoolSlot]>,
    free_list: Mutex<Vec<usize>>,
    active: AtomicUsize,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let slots: Box<[PoolSlot]> = (0..capacity)
            .map(|_| PoolSlot {
                session: Session::new(),
                in_use: AtomicBool::new(false),
            })
            .collect();

        // LIFO free list: recently-released slots are cache-warm.
        let free_list = (0..capacity).rev().collect();

        tracing::debug!(capacity, "session pool initialized");

        Arc::new(Self {
            slots,
            free_list: Mutex::new(free_list),
            active: AtomicUsize::new(0),
        })
    }

    /// Lease a free session slot. Returns None when the pool is exhausted.
    pub fn acquire(self: &Arc<Self>) -> Option<SessionRef> {
        let slot_idx = {
            let mut free = self.free_list.lock();
            free.pop()?
        };

        let slot = &self.slots[slot_idx];
        debug_assert!(!slot.in_use.load(Ordering::Acquire), "free-list slot still leased");
        slot.in_use.store(true, Ordering::Release);
        self.active.fetch_add(1, Ordering::Relaxed);

        Some(Arc::new(SessionLease {
            pool: self.clone(),
            slot: slot_idx,
        }))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    fn release(&self, slot_idx: usize) {
        let slot = &self.slots[slot_idx];

        // The session must be fully quiesced before the slot can be reused.
        slot.session.close();
        slot.session.reset();

        slot.in_use.store(false, Ordering::Release);
        self.active.fetch_sub(1, Ordering::Relaxed);

        let mut free = self.free_list.lock();
        free.push(slot_idx);
    }
}

// ============================================================================
// SessionLease / SessionRef
// ============================================================================

/// Exclusive claim on one pool slot. Shared through `SessionRef` clones; the
/// final drop returns the slot.
pub struct SessionLease {
    pool: Arc<SessionPool>,
    slot: usize,
}

impl Deref for SessionLease {
    type Target = Session;

    #[inline]
    fn deref(&self) -> &Session {
        &self.pool.slots[self.slot].session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

/// Shared session reference with pool-returning drop semantics.
pub type SessionRef = Arc<SessionLease>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::session::SessionState;

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool = SessionPool::new(4);
        assert_eq!(pool.free_count(), 4);

        let lease = pool.acquire().unwrap();
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.free_count(), 3);

        drop(lease);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = SessionPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        drop(a);
        let c = pool.acquire();
        assert!(c.is_some());
        drop(b);
        drop(c);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_clone_extends_lease() {
        let pool = SessionPool::new(1);
        let lease = pool.acquire().unwrap();
        let clone = lease.clone();

        drop(lease);
        assert_eq!(pool.active_count(), 1, "clone still holds the slot");

        drop(clone);
        assert_eq!(pool.active_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_release_resets_session() {
        use std::os::unix::io::IntoRawFd;

        let pool = SessionPool::new(1);

        {
            let fd = std::net::TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .into_raw_fd();
            let lease = pool.acquire().unwrap();
            lease.initialize(77, fd);
            assert_eq!(lease.state(), SessionState::Connected);
        }

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.state(), SessionState::None);
        assert_eq!(lease.id(), 0);
    }

    #[test]
    fn test_slot_accounting_never_exceeds_capacity() {
        let pool = SessionPool::new(8);
        let mut leases = Vec::new();
        for _ in 0..8 {
            leases.push(pool.acquire().unwrap());
        }
        assert_eq!(pool.active_count(), 8);
        assert_eq!(pool.free_count(), 0);

        leases.clear();
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.free_count(), 8);
    }
}
