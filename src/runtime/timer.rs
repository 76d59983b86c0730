// # Timer Queue
//
// Single worker thread over a min-heap of scheduled entries. Callbacks fire
// on the worker thread; keep them short or offload to a pool. Cancellation is
// lazy: `cancel` records the handle and the worker skips it on pop.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type TimerHandle = u64;

// ============================================================================
// Entries
// ============================================================================

struct TimerEntry {
    handle: TimerHandle,
    fire_at: Instant,
    /// None fires once; Some re-arms while the callback returns true.
    interval: Option<Duration>,
    callback: Box<dyn FnMut() -> bool + Send>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.handle == other.handle
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    /// Reversed so the `BinaryHeap` max-heap yields the earliest deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    cancelled: HashSet<TimerHandle>,
}

// ============================================================================
// TimerQueue
// ============================================================================

struct TimerInner {
    state: Mutex<TimerState>,
    cv: Condvar,
    running: AtomicBool,
    next_handle: AtomicU64,
}

pub struct TimerQueue {
    inner: Arc<TimerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                state: Mutex::new(TimerState::default()),
                cv: Condvar::new(),
                running: AtomicBool::new(false),
                next_handle: AtomicU64::new(1),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the background worker thread. Idempotent.
    pub fn initialize(&self) -> bool {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("timer queue already running");
            return true;
        }

        let inner = self.inner.clone();
        match std::thread::Builder::new()
            .name("timer-worker".to_string())
            .spawn(move || Self::worker_loop(inner))
        {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                tracing::debug!("timer queue initialized");
                true
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                tracing::error!("failed to spawn timer worker: {e}");
                false
            }
        }
    }

    /// Stop the worker and drop all pending entries.
    pub fn shutdown(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        {
            let _state = self.inner.state.lock();
        }
        self.cv_notify_all();

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }

        let mut state = self.inner.state.lock();
        state.heap.clear();
        state.cancelled.clear();
        tracing::debug!("timer queue shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Fire `callback` once after `delay`.
    pub fn schedule_once<F>(&self, callback: F, delay: Duration) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut once = Some(callback);
        let wrapped = move || {
            if let Some(f) = once.take() {
                f();
            }
            false
        };
        self.push_entry(Box::new(wrapped), delay, None)
    }

    /// Fire `callback` every `interval`; it re-arms while returning true.
    pub fn schedule_repeat<F>(&self, callback: F, interval: Duration) -> TimerHandle
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.push_entry(Box::new(callback), interval, Some(interval))
    }

    /// Mark a timer cancelled. No-op for already-fired handles; safe to call
    /// concurrently with the callback in flight.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        if handle == 0 {
            return false;
        }
        let mut state = self.inner.state.lock();
        state.cancelled.insert(handle);
        true
    }

    /// Number of scheduled (not yet fired) entries.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    fn push_entry(
        &self,
        callback: Box<dyn FnMut() -> bool + Send>,
        delay: Duration,
        interval: Option<Duration>,
    ) -> TimerHandle {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.inner.state.lock();
            state.heap.push(TimerEntry {
                handle,
                fire_at: Instant::now() + delay,
                interval,
                callback,
            });
        }
        self.cv_notify_all();
        handle
    }

    fn cv_notify_all(&self) {
        let _state = self.inner.state.lock();
        self.inner.cv.notify_all();
    }

    fn worker_loop(inner: Arc<TimerInner>) {
        tracing::debug!("timer worker started");

        loop {
            let mut due: Option<TimerEntry> = None;

            {
                let mut state = inner.state.lock();
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }

                match state.heap.peek().map(|e| e.fire_at) {
                    None => {
                        inner.cv.wait_for(&mut state, Duration::from_millis(100));
                    }
                    Some(fire_at) => {
                        let now = Instant::now();
                        if fire_at <= now {
                            let entry = state.heap.pop().expect("peeked entry vanished");
                            if state.cancelled.remove(&entry.handle) {
                                continue;
                            }
                            due = Some(entry);
                        } else {
                            inner.cv.wait_for(&mut state, fire_at - now);
                        }
                    }
                }
            }

            if let Some(mut entry) = due {
                let again = (entry.callback)();

                if let Some(interval) = entry.interval {
                    if again {
                        entry.fire_at = Instant::now() + interval;
                        let mut state = inner.state.lock();
                        if inner.running.load(Ordering::Acquire)
                            && !state.cancelled.remove(&entry.handle)
                        {
                            state.heap.push(entry);
                        }
                    }
                }
            }
        }

        tracing::debug!("timer worker stopped");
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_schedule_once_fires() {
        let timers = TimerQueue::new();
        assert!(timers.initialize());

        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            timers.schedule_once(
                move || fired.store(true, Ordering::Release),
                Duration::from_millis(20),
            );
        }

        std::thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::Acquire));
        timers.shutdown();
    }

    #[test]
    fn test_cancel_before_fire() {
        let timers = TimerQueue::new();
        assert!(timers.initialize());

        let fired = Arc::new(AtomicBool::new(false));
        let handle = {
            let fired = fired.clone();
            timers.schedule_once(
                move || fired.store(true, Ordering::Release),
                Duration::from_millis(100),
            )
        };

        assert!(timers.cancel(handle));
        std::thread::sleep(Duration::from_millis(250));
        assert!(!fired.load(Ordering::Acquire));
        timers.shutdown();
    }

    #[test]
    fn test_repeat_until_false() {
        let timers = TimerQueue::new();
        assert!(timers.initialize());

        let count = Arc::new(AtomicU32::new(0));
        {
            let count = count.clone();
            timers.schedule_repeat(
                move || count.fetch_add(1, Ordering::AcqRel) + 1 < 3,
                Duration::from_millis(10),
            );
        }

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(count.load(Ordering::Acquire), 3);
        timers.shutdown();
    }

    #[test]
    fn test_ordering_of_deadlines() {
        let timers = TimerQueue::new();
        assert!(timers.initialize());

        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, delay) in [(3u32, 60u64), (1, 20), (2, 40)] {
            let order = order.clone();
            timers.schedule_once(
                move || order.lock().push(tag),
                Duration::from_millis(delay),
            );
        }

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        timers.shutdown();
    }

    #[test]
    fn test_cancel_invalid_handle() {
        let timers = TimerQueue::new();
        assert!(!timers.cancel(0));
    }
}
