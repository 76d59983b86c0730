// # Async Scope
//
// Structured submission wrapper: counts in-flight tasks, supports
// cooperative cancellation, and lets shutdown paths wait for quiescence.
// Cancelled scopes still drain: the wrapper skips the body but always
// settles the in-flight count.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatch::KeyedDispatcher;

pub struct AsyncScope {
    cancelled: AtomicBool,
    in_flight: AtomicUsize,
    drain_lock: Mutex<()>,
    drain_cv: Condvar,
}

impl AsyncScope {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
        })
    }

    /// Flip the cancel flag. Tasks already running observe it at their next
    /// `is_cancelled` check; queued tasks are skipped by the wrapper.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Submit a task through the dispatcher under this scope. Returns false
    /// when the dispatcher rejects it; the in-flight count is unwound.
    pub fn submit<F>(self: &Arc<Self>, dispatcher: &KeyedDispatcher, key: u64, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.begin();

        let scope = self.clone();
        let accepted = dispatcher.dispatch(key, move || {
            if !scope.is_cancelled() {
                task();
            }
            scope.end();
        });

        if !accepted {
            self.end();
        }
        accepted
    }

    /// Wait until every submitted task has settled. `None` waits forever;
    /// returns false when the timeout elapsed first.
    pub fn wait_for_drain(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.drain_lock.lock();

        match timeout {
            None => {
                while self.in_flight.load(Ordering::Acquire) != 0 {
                    self.drain_cv.wait(&mut guard);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while self.in_flight.load(Ordering::Acquire) != 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.drain_cv.wait_for(&mut guard, deadline - now);
                }
                true
            }
        }
    }

    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let _guard = self.drain_lock.lock();
            self.drain_cv.notify_all();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherOptions;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_drain_waits_for_tasks() {
        let dispatcher = KeyedDispatcher::new(DispatcherOptions::default()).unwrap();
        let scope = AsyncScope::new();
        let done = Arc::new(AtomicU32::new(0));

        for i in 0..8u64 {
            let done = done.clone();
            assert!(scope.submit(&dispatcher, i, move || {
                std::thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::AcqRel);
            }));
        }

        assert!(scope.wait_for_drain(Some(Duration::from_secs(5))));
        assert_eq!(done.load(Ordering::Acquire), 8);
        assert_eq!(scope.in_flight_count(), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn test_cancel_skips_queued_tasks() {
        let dispatcher = KeyedDispatcher::new(DispatcherOptions {
            workers: 1,
            ..Default::default()
        })
        .unwrap();
        let scope = AsyncScope::new();
        let ran = Arc::new(AtomicU32::new(0));

        // Occupy the single worker, then queue work and cancel before it runs.
        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = gate.clone();
            scope.submit(&dispatcher, 0, move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
        }

        for _ in 0..4 {
            let ran = ran.clone();
            scope.submit(&dispatcher, 0, move || {
                ran.fetch_add(1, Ordering::AcqRel);
            });
        }

        scope.cancel();
        gate.store(true, Ordering::Release);

        assert!(scope.wait_for_drain(Some(Duration::from_secs(5))));
        assert_eq!(ran.load(Ordering::Acquire), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn test_drain_timeout_expires() {
        let dispatcher = KeyedDispatcher::new(DispatcherOptions::default()).unwrap();
        let scope = AsyncScope::new();

        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = gate.clone();
            scope.submit(&dispatcher, 0, move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
        }

        assert!(!scope.wait_for_drain(Some(Duration::from_millis(50))));
        gate.store(true, Ordering::Release);
        assert!(scope.wait_for_drain(Some(Duration::from_secs(5))));
        dispatcher.shutdown();
    }

    #[test]
    fn test_rejected_submit_unwinds_count() {
        let dispatcher = KeyedDispatcher::new(DispatcherOptions::default()).unwrap();
        dispatcher.shutdown();

        let scope = AsyncScope::new();
        assert!(!scope.submit(&dispatcher, 1, || {}));
        assert_eq!(scope.in_flight_count(), 0);
        assert!(scope.wait_for_drain(Some(Duration::from_millis(10))));
    }
}
