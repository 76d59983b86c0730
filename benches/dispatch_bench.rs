// Dispatch-layer throughput: the bounded MPMC ring against the mutex deque,
// and the keyed dispatcher end to end.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusty_net::dispatch::{
    BackpressurePolicy, BoundedLockFreeQueue, DispatcherOptions, ExecutionQueue,
    ExecutionQueueOptions, KeyedDispatcher, QueueBackend,
};

fn bench_bounded_ring(c: &mut Criterion) {
    let queue = BoundedLockFreeQueue::new(1024);

    c.bench_function("bounded_ring_push_pop", |b| {
        b.iter(|| {
            queue.push(black_box(42u64)).unwrap();
            black_box(queue.pop());
        })
    });
}

fn bench_execution_queue_backends(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution_queue");

    for (name, backend) in [
        ("mutex", QueueBackend::Mutex),
        ("lockfree", QueueBackend::LockFree),
    ] {
        let queue = ExecutionQueue::new(ExecutionQueueOptions {
            capacity: 1024,
            policy: BackpressurePolicy::Block,
            backend,
        });

        group.bench_function(name, |b| {
            b.iter(|| {
                queue.push(black_box(7u64));
                black_box(queue.try_pop());
            })
        });
    }

    group.finish();
}

fn bench_keyed_dispatch(c: &mut Criterion) {
    let dispatcher = KeyedDispatcher::new(DispatcherOptions {
        workers: 4,
        queue: ExecutionQueueOptions {
            capacity: 8192,
            policy: BackpressurePolicy::Block,
            backend: QueueBackend::Mutex,
        },
    })
    .unwrap();
    let counter = Arc::new(AtomicU64::new(0));

    let mut key = 0u64;
    c.bench_function("keyed_dispatch", |b| {
        b.iter(|| {
            key = key.wrapping_add(1);
            let counter = counter.clone();
            dispatcher.dispatch(black_box(key % 16), move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        })
    });

    dispatcher.shutdown();
}

criterion_group!(
    benches,
    bench_bounded_ring,
    bench_execution_queue_backends,
    bench_keyed_dispatch
);
criterion_main!(benches);
