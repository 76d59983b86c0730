// # Keyed Dispatcher
//
// N workers, each owning one independent execution queue. A task's key hashes
// to a worker index, so tasks sharing a key always land on the same thread
// and run in enqueue order; distinct keys spread across workers and run
// concurrently.

use parking_lot::Mutex;
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{ExecutionQueue, ExecutionQueueOptions};
use crate::error::{NetError, Result};

// ============================================================================
// Options & Stats
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    /// Worker thread count. Each worker owns an independent bounded queue.
    pub workers: usize,

    /// Per-worker queue configuration.
    pub queue: ExecutionQueueOptions,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue: ExecutionQueueOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

// ============================================================================
// KeyedDispatcher
// ============================================================================

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct KeyedDispatcher {
    queues: Vec<Arc<ExecutionQueue<Task>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl KeyedDispatcher {
    /// Spawn the worker pool. Fails when `workers` is zero.
    pub fn new(options: DispatcherOptions) -> Result<Self> {
        if options.workers == 0 {
            return Err(NetError::Configuration(
                "dispatcher worker count must be > 0".to_string(),
            ));
        }

        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());
        let queues: Vec<Arc<ExecutionQueue<Task>>> = (0..options.workers)
            .map(|_| Arc::new(ExecutionQueue::new(options.queue)))
            .collect();

        let mut threads = Vec::with_capacity(options.workers);
        for (index, queue) in queues.iter().enumerate() {
            let queue = queue.clone();
            let running = running.clone();
            let counters = counters.clone();

            let handle = std::thread::Builder::new()
                .name(format!("dispatch-worker-{index}"))
                .spawn(move || Self::worker_loop(index, queue, running, counters))
                .map_err(|e| {
                    NetError::Internal(format!("failed to spawn dispatch worker: {e}"))
                })?;
            threads.push(handle);
        }

        tracing::info!(workers = options.workers, "keyed dispatcher started");

        Ok(Self {
            queues,
            threads: Mutex::new(threads),
            running,
            counters,
        })
    }

    /// Route a task by key. Equal keys execute in dispatch order; returns
    /// false when rejected by backpressure or after shutdown.
    pub fn dispatch<F>(&self, key: u64, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.running.load(Ordering::Acquire) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let index = self.worker_index(key);
        if self.queues[index].push(Box::new(task)) {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    /// Queue occupancy for one worker.
    pub fn worker_queue_len(&self, index: usize) -> usize {
        self.queues.get(index).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, drain every worker's local queue, join threads.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for queue in &self.queues {
            queue.shutdown();
        }

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        let stats = self.stats();
        tracing::info!(
            enqueued = stats.enqueued,
            processed = stats.processed,
            failed = stats.failed,
            "keyed dispatcher shutdown complete"
        );
    }

    fn worker_index(&self, key: u64) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.queues.len() as u64) as usize
    }

    fn worker_loop(
        index: usize,
        queue: Arc<ExecutionQueue<Task>>,
        running: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) {
        tracing::debug!(worker = index, "dispatch worker started");

        while running.load(Ordering::Acquire) {
            if let Some(task) = queue.pop_timeout(Duration::from_millis(100)) {
                Self::run_task(index, task, &counters);
            }
        }

        // Best-effort drain of whatever was queued before shutdown.
        let mut drained = 0usize;
        while let Some(task) = queue.try_pop() {
            Self::run_task(index, task, &counters);
            drained += 1;
        }
        if drained > 0 {
            tracing::warn!(worker = index, drained, "dispatch worker drained tasks at shutdown");
        }

        tracing::debug!(worker = index, "dispatch worker stopped");
    }

    fn run_task(index: usize, task: Task, counters: &Counters) {
        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker = index, "dispatched task panicked");
            }
        }
    }
}

impl Drop for KeyedDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
