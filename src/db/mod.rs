// # Asynchronous Database Layer
//
// Decouples application handlers from database latency while guaranteeing
// at-least-once execution across crashes:
//
// - `database`: the capability contract injected into the queue, plus an
//   in-memory implementation for tests and DB-less runs
// - `task`: the tagged task union
// - `wal`: line-oriented write-ahead log with backup-merge recovery
// - `queue`: worker pool draining the task queue, WAL-framed

mod database;
mod queue;
mod task;
mod wal;

pub use database::{Database, MemoryDatabase};
pub use queue::{DbQueueStats, DbTaskQueue};
pub use task::{DbTask, DbTaskCallback, DbTaskKind};
pub use wal::{RecoveredTask, WriteAheadLog};
