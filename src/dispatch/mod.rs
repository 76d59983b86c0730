// # Keyed Dispatch Layer
//
// Bounded work queues with deterministic key affinity:
//
// - `BoundedLockFreeQueue`: fixed-capacity MPMC ring with per-slot sequence
//   atomics
// - `ExecutionQueue`: unified bounded queue with mutex / lock-free backends
//   and Block / Reject backpressure
// - `KeyedDispatcher`: N workers, each owning an independent queue;
//   `hash(key) % N` routing preserves per-key FIFO while distinct keys run
//   in parallel

mod bounded;
mod keyed;
mod queue;

pub use bounded::BoundedLockFreeQueue;
pub use keyed::{DispatcherOptions, DispatcherStats, KeyedDispatcher};
pub use queue::{BackpressurePolicy, ExecutionQueue, ExecutionQueueOptions, QueueBackend};
