// # Unified Execution Queue
//
// Bounded queue with two interchangeable backends (mutex-guarded deque or
// the lock-free ring) and two backpressure policies (block until space, or
// reject immediately). Dispatcher workers, channels and the event bus all
// sit on top of this type.
//
// A given instance pairs its condvars with exactly one mutex: the deque
// mutex for the `Mutex` backend, the gate mutex for `LockFree`.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::BoundedLockFreeQueue;

// ============================================================================
// Options
// ============================================================================

/// What a full queue does to a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait on a condvar until space frees or the queue shuts down.
    Block,
    /// Fail the push immediately.
    Reject,
}

/// Storage backend behind the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Mutex,
    LockFree,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionQueueOptions {
    pub capacity: usize,
    pub policy: BackpressurePolicy,
    pub backend: QueueBackend,
}

impl Default for ExecutionQueueOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            policy: BackpressurePolicy::Block,
            #[cfg(feature = "ordered-lockfree")]
            backend: QueueBackend::LockFree,
            #[cfg(not(feature = "ordered-lockfree"))]
            backend: QueueBackend::Mutex,
        }
    }
}

// ============================================================================
// ExecutionQueue
// ============================================================================

pub struct ExecutionQueue<T> {
    options: ExecutionQueueOptions,
    deque: Mutex<VecDeque<T>>,
    ring: Option<BoundedLockFreeQueue<T>>,
    gate: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
    len: AtomicUsize,
    shutdown: AtomicBool,
}

impl<T> ExecutionQueue<T> {
    pub fn new(options: ExecutionQueueOptions) -> Self {
        let capacity = options.capacity.max(1);
        let ring = match options.backend {
            QueueBackend::LockFree => Some(BoundedLockFreeQueue::new(capacity)),
            QueueBackend::Mutex => None,
        };

        Self {
            options: ExecutionQueueOptions {
                capacity,
                ..options
            },
            deque: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            ring,
            gate: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            len: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn options(&self) -> &ExecutionQueueOptions {
        &self.options
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Enqueue one item. Returns false when rejected by backpressure or when
    /// the queue has shut down.
    pub fn push(&self, item: T) -> bool {
        if self.is_shutdown() {
            return false;
        }

        match self.options.backend {
            QueueBackend::Mutex => self.push_mutex(item),
            QueueBackend::LockFree => self.push_lockfree(item),
        }
    }

    fn push_mutex(&self, item: T) -> bool {
        let mut q = self.deque.lock();
        loop {
            if self.is_shutdown() {
                return false;
            }
            if q.len() < self.options.capacity {
                q.push_back(item);
                self.len.fetch_add(1, Ordering::Release);
                drop(q);
                self.not_empty.notify_one();
                return true;
            }
            if self.options.policy == BackpressurePolicy::Reject {
                return false;
            }
            self.not_full.wait(&mut q);
        }
    }

    fn push_lockfree(&self, item: T) -> bool {
        let ring = self.ring.as_ref().expect("lock-free backend missing ring");
        let mut item = item;

        // Fast path without the gate.
        match ring.push(item) {
            Ok(()) => {
                self.len.fetch_add(1, Ordering::Release);
                let _g = self.gate.lock();
                self.not_empty.notify_one();
                return true;
            }
            Err(v) => item = v,
        }

        if self.options.policy == BackpressurePolicy::Reject {
            return false;
        }

        let mut gate = self.gate.lock();
        loop {
            if self.is_shutdown() {
                return false;
            }
            match ring.push(item) {
                Ok(()) => {
                    self.len.fetch_add(1, Ordering::Release);
                    self.not_empty.notify_one();
                    return true;
                }
                Err(v) => {
                    item = v;
                    self.not_full.wait(&mut gate);
                }
            }
        }
    }

    /// Enqueue without ever blocking, regardless of the configured policy.
    pub fn try_push(&self, item: T) -> bool {
        if self.is_shutdown() {
            return false;
        }

        match self.options.backend {
            QueueBackend::Mutex => {
                let mut q = self.deque.lock();
                if q.len() >= self.options.capacity {
                    return false;
                }
                q.push_back(item);
                self.len.fetch_add(1, Ordering::Release);
                drop(q);
                self.not_empty.notify_one();
                true
            }
            QueueBackend::LockFree => {
                let ring = self.ring.as_ref().expect("lock-free backend missing ring");
                if ring.push(item).is_err() {
                    return false;
                }
                self.len.fetch_add(1, Ordering::Release);
                let _g = self.gate.lock();
                self.not_empty.notify_one();
                true
            }
        }
    }

    /// Dequeue, waiting up to `timeout`. Returns None on timeout or shutdown.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.options.backend {
            QueueBackend::Mutex => self.pop_mutex(timeout),
            QueueBackend::LockFree => self.pop_lockfree(timeout),
        }
    }

    fn pop_mutex(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut q = self.deque.lock();
        loop {
            if let Some(item) = q.pop_front() {
                self.len.fetch_sub(1, Ordering::Release);
                drop(q);
                self.not_full.notify_one();
                return Some(item);
            }
            if self.is_shutdown() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self
                .not_empty
                .wait_for(&mut q, deadline - now)
                .timed_out()
            {
                let item = q.pop_front();
                if item.is_some() {
                    self.len.fetch_sub(1, Ordering::Release);
                    drop(q);
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    fn pop_lockfree(&self, timeout: Duration) -> Option<T> {
        let ring = self.ring.as_ref().expect("lock-free backend missing ring");
        let deadline = Instant::now() + timeout;

        if let Some(item) = ring.pop() {
            self.len.fetch_sub(1, Ordering::Release);
            let _g = self.gate.lock();
            self.not_full.notify_one();
            return Some(item);
        }

        let mut gate = self.gate.lock();
        loop {
            if let Some(item) = ring.pop() {
                self.len.fetch_sub(1, Ordering::Release);
                self.not_full.notify_one();
                return Some(item);
            }
            if self.is_shutdown() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = self.not_empty.wait_for(&mut gate, deadline - now);
        }
    }

    /// Non-blocking dequeue, usable after shutdown to drain remainders.
    pub fn try_pop(&self) -> Option<T> {
        let item = match self.options.backend {
            QueueBackend::Mutex => self.deque.lock().pop_front(),
            QueueBackend::LockFree => self
                .ring
                .as_ref()
                .expect("lock-free backend missing ring")
                .pop(),
        }?;

        self.len.fetch_sub(1, Ordering::Release);
        match self.options.backend {
            QueueBackend::Mutex => {
                let _q = self.deque.lock();
                self.not_full.notify_one();
            }
            QueueBackend::LockFree => {
                let _g = self.gate.lock();
                self.not_full.notify_one();
            }
        }
        Some(item)
    }

    /// Stop accepting work and wake every waiter.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        match self.options.backend {
            QueueBackend::Mutex => {
                let _q = self.deque.lock();
            }
            QueueBackend::LockFree => {
                let _g = self.gate.lock();
            }
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn opts(capacity: usize, policy: BackpressurePolicy, backend: QueueBackend) -> ExecutionQueueOptions {
        ExecutionQueueOptions {
            capacity,
            policy,
            backend,
        }
    }

    #[test]
    fn test_reject_policy_when_full() {
        for backend in [QueueBackend::Mutex, QueueBackend::LockFree] {
            let q = ExecutionQueue::new(opts(2, BackpressurePolicy::Reject, backend));
            assert!(q.push(1));
            assert!(q.push(2));
            assert!(!q.push(3));
            assert_eq!(q.try_pop(), Some(1));
            assert!(q.push(3));
        }
    }

    #[test]
    fn test_fifo_order() {
        for backend in [QueueBackend::Mutex, QueueBackend::LockFree] {
            let q = ExecutionQueue::new(opts(64, BackpressurePolicy::Block, backend));
            for i in 0..10 {
                assert!(q.push(i));
            }
            for i in 0..10 {
                assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(i));
            }
            assert_eq!(q.pop_timeout(Duration::from_millis(10)), None);
        }
    }

    #[test]
    fn test_block_policy_unblocks_on_pop() {
        for backend in [QueueBackend::Mutex, QueueBackend::LockFree] {
            let q = Arc::new(ExecutionQueue::new(opts(1, BackpressurePolicy::Block, backend)));
            assert!(q.push(1u32));

            let producer = {
                let q = q.clone();
                std::thread::spawn(move || q.push(2))
            };

            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(q.pop_timeout(Duration::from_millis(100)), Some(1));
            assert!(producer.join().unwrap());
            assert_eq!(q.pop_timeout(Duration::from_millis(100)), Some(2));
        }
    }

    #[test]
    fn test_shutdown_wakes_blocked_producer() {
        for backend in [QueueBackend::Mutex, QueueBackend::LockFree] {
            let q = Arc::new(ExecutionQueue::new(opts(1, BackpressurePolicy::Block, backend)));
            assert!(q.push(1u32));

            let producer = {
                let q = q.clone();
                std::thread::spawn(move || q.push(2))
            };

            std::thread::sleep(Duration::from_millis(50));
            q.shutdown();
            assert!(!producer.join().unwrap());
        }
    }

    #[test]
    fn test_drain_after_shutdown() {
        for backend in [QueueBackend::Mutex, QueueBackend::LockFree] {
            let q = ExecutionQueue::new(opts(8, BackpressurePolicy::Block, backend));
            for i in 0..4 {
                assert!(q.push(i));
            }
            q.shutdown();
            assert!(!q.push(99));

            let mut drained = Vec::new();
            while let Some(v) = q.try_pop() {
                drained.push(v);
            }
            assert_eq!(drained, vec![0, 1, 2, 3]);
        }
    }
}
