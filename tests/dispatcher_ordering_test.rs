// Ordering contract of the keyed dispatcher under real parallelism:
// 1000 tasks across 4 keys on 4 workers, each key's sequence strictly
// increasing, with both queue backends.

use parking_lot::Mutex;
use std::sync::Arc;

use rusty_net::dispatch::{
    BackpressurePolicy, DispatcherOptions, ExecutionQueueOptions, KeyedDispatcher, QueueBackend,
};

fn run_ordering_round(backend: QueueBackend) {
    const KEYS: u64 = 4;
    const TOTAL: usize = 1000;
    const PER_KEY: usize = TOTAL / KEYS as usize;

    let dispatcher = KeyedDispatcher::new(DispatcherOptions {
        workers: 4,
        queue: ExecutionQueueOptions {
            capacity: 2048,
            policy: BackpressurePolicy::Block,
            backend,
        },
    })
    .expect("dispatcher construction");

    let observed: Arc<Vec<Mutex<Vec<usize>>>> =
        Arc::new((0..KEYS).map(|_| Mutex::new(Vec::new())).collect());

    for seq in 0..PER_KEY {
        for key in 0..KEYS {
            let observed = observed.clone();
            assert!(dispatcher.dispatch(key, move || {
                // A little jitter makes interleaving violations likely to
                // surface if affinity is broken.
                if seq % 37 == 0 {
                    std::thread::yield_now();
                }
                observed[key as usize].lock().push(seq);
            }));
        }
    }

    dispatcher.shutdown();

    for key in 0..KEYS as usize {
        let list = observed[key].lock();
        assert_eq!(list.len(), PER_KEY, "key {key}: all tasks ran");
        assert!(
            list.windows(2).all(|w| w[0] < w[1]),
            "key {key}: sequence must be strictly increasing"
        );
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.enqueued, TOTAL as u64);
    assert_eq!(stats.processed, TOTAL as u64);
    assert_eq!(stats.failed, 0);
}

#[test]
fn test_per_key_fifo_mutex_backend() {
    run_ordering_round(QueueBackend::Mutex);
}

#[test]
fn test_per_key_fifo_lockfree_backend() {
    run_ordering_round(QueueBackend::LockFree);
}

#[test]
fn test_distinct_keys_make_progress_concurrently() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let dispatcher = KeyedDispatcher::new(DispatcherOptions {
        workers: 4,
        ..Default::default()
    })
    .expect("dispatcher construction");

    // One slow key must not starve the others.
    let slow_done = Arc::new(AtomicUsize::new(0));
    let fast_done = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let slow_done = slow_done.clone();
        dispatcher.dispatch(0, move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            slow_done.fetch_add(1, Ordering::SeqCst);
        });
    }
    for key in 1..64u64 {
        let fast_done = fast_done.clone();
        dispatcher.dispatch(key, move || {
            fast_done.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Fast keys finish while the slow key is still grinding.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while fast_done.load(Ordering::SeqCst) < 40 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert!(fast_done.load(Ordering::SeqCst) >= 40);
    assert!(slow_done.load(Ordering::SeqCst) < 4);

    dispatcher.shutdown();
    assert_eq!(slow_done.load(Ordering::SeqCst), 4);
    assert_eq!(fast_done.load(Ordering::SeqCst), 63);
}
