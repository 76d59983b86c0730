// # Concurrency Runtime Primitives
//
// Small building blocks shared by the engine: a min-heap timer worker and a
// structured submission scope with cooperative cancellation.

mod scope;
mod timer;

pub use scope::AsyncScope;
pub use timer::{TimerHandle, TimerQueue};
