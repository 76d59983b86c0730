// # DB Task Queue
//
// Worker pool executing database tasks off the hot path. Every accepted task
// is WAL-framed: a pending line lands on disk before the task enters the
// queue, a done line after it succeeds. Tasks that survive a crash replay on
// the next startup, so handlers must tolerate duplicate execution.
//
// Sessions reference the queue weakly (`Weak<DbTaskQueue>`) and upgrade
// before every use, so a disappearing queue never extends its own lifetime
// through the session layer.

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::common::{now_timestamp_string, ConnectionId};
use crate::db::database::Database;
use crate::db::task::{DbTask, DbTaskCallback, DbTaskKind};
use crate::db::wal::WriteAheadLog;
use crate::error::{NetError, Result};

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct DbQueueStats {
    pub queued: usize,
    pub processed: u64,
    pub failed: u64,
}

// ============================================================================
// DbTaskQueue
// ============================================================================

struct QueueInner {
    queue: Mutex<VecDeque<DbTask>>,
    cv: Condvar,
    queue_size: AtomicUsize,
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    wal: WriteAheadLog,
    database: RwLock<Option<Arc<dyn Database>>>,
}

pub struct DbTaskQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DbTaskQueue {
    pub fn new(wal_path: impl Into<PathBuf>, database: Option<Arc<dyn Database>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(QueueInner {
                queue: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
                queue_size: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                wal: WriteAheadLog::new(wal_path),
                database: RwLock::new(database),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn workers, then replay any crash-surviving WAL entries. Workers
    /// start first so recovered tasks can re-enter the queue.
    pub fn start(&self, worker_count: usize) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("db task queue already running");
            return Ok(());
        }

        let worker_count = worker_count.max(1);
        if worker_count > 1 {
            tracing::warn!(
                workers = worker_count,
                "multiple db workers: per-session task ordering is not guaranteed"
            );
        }

        {
            let mut workers = self.workers.lock();
            for index in 0..worker_count {
                let inner = self.inner.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("db-worker-{index}"))
                    .spawn(move || worker_loop(inner))
                    .map_err(|e| NetError::Internal(format!("db worker spawn failed: {e}")))?;
                workers.push(handle);
            }
        }

        let recovered = self.inner.wal.recover()?;
        let recovered_count = recovered.len();
        for entry in recovered {
            // wal_seq stays 0 so the re-enqueue writes a fresh pending line.
            // Callbacks are not recoverable; replayed tasks run without one.
            self.enqueue(DbTask::new(entry.kind, entry.session_id, entry.data));
        }
        self.inner.wal.finish_recovery();

        if recovered_count > 0 {
            tracing::info!(count = recovered_count, "wal: re-queued recovered tasks");
        }
        tracing::info!(workers = worker_count, "db task queue started");
        Ok(())
    }

    /// Signal workers, join them, then drain leftovers with the same WAL
    /// semantics as the worker path.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        {
            let _q = self.inner.queue.lock();
        }
        self.inner.cv.notify_all();

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        drop(workers);

        let drained: Vec<DbTask> = {
            let mut queue = self.inner.queue.lock();
            let remaining = queue.len();
            if remaining > 0 {
                tracing::warn!(remaining, "db task queue draining tasks at shutdown");
            }
            self.inner.queue_size.store(0, Ordering::Relaxed);
            queue.drain(..).collect()
        };

        for mut task in drained {
            let success = process_task(&self.inner, &mut task);
            if success && task.wal_seq != 0 {
                let _ = self.inner.wal.write_done(task.wal_seq);
            }
        }

        tracing::info!(
            processed = self.inner.processed.load(Ordering::Relaxed),
            failed = self.inner.failed.load(Ordering::Relaxed),
            "db task queue shutdown complete"
        );
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue_size.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> DbQueueStats {
        DbQueueStats {
            queued: self.queue_len(),
            processed: self.inner.processed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    pub fn set_database(&self, database: Option<Arc<dyn Database>>) {
        *self.inner.database.write() = database;
    }

    /// Accept a task: WAL-pend it, then queue it. Returns false (with the
    /// callback failed) when the queue is not running, the payload is
    /// malformed, or shutdown raced the enqueue.
    pub fn enqueue(&self, mut task: DbTask) -> bool {
        if !self.inner.running.load(Ordering::Acquire) {
            tracing::error!("cannot enqueue task - db task queue not running");
            task.finish(false, "db task queue not running");
            return false;
        }

        // The WAL is line-oriented; embedded newlines would tear the frame.
        if task.data.contains('\n') {
            tracing::warn!(session = task.session_id, "task payload contains newline - rejected");
            task.finish(false, "payload contains newline");
            return false;
        }

        if task.wal_seq == 0 {
            let seq = self.inner.wal.next_sequence();
            match self
                .inner
                .wal
                .write_pending(task.kind, task.session_id, &task.data, seq)
            {
                Ok(()) => task.wal_seq = seq,
                Err(e) => {
                    // The task still runs, it just loses crash protection.
                    tracing::warn!(error = %e, "wal pending write failed");
                }
            }
        }

        let rejected: Option<DbTask> = {
            let mut queue = self.inner.queue.lock();

            // Re-check under the queue lock to close the race against
            // shutdown() observing an empty queue.
            if self.inner.running.load(Ordering::Acquire) {
                queue.push_back(task);
                self.inner.queue_size.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                Some(task)
            }
        };

        if let Some(mut task) = rejected {
            if task.wal_seq != 0 {
                // Pending line without a queued task must not replay.
                let _ = self.inner.wal.write_done(task.wal_seq);
            }
            tracing::error!("cannot enqueue task - db task queue shutting down");
            task.finish(false, "db task queue shutting down");
            return false;
        }

        self.inner.cv.notify_one();
        true
    }

    // ------------------------------------------------------------------
    // Convenience entry points
    // ------------------------------------------------------------------

    pub fn record_connect_time(&self, session_id: ConnectionId) -> bool {
        self.enqueue(DbTask::new(
            DbTaskKind::RecordConnectTime,
            session_id,
            now_timestamp_string(),
        ))
    }

    pub fn record_disconnect_time(&self, session_id: ConnectionId) -> bool {
        self.enqueue(DbTask::new(
            DbTaskKind::RecordDisconnectTime,
            session_id,
            now_timestamp_string(),
        ))
    }

    /// Upsert player data. The payload must be valid JSON; malformed input
    /// is rejected before it reaches the WAL.
    pub fn update_player_data(
        &self,
        session_id: ConnectionId,
        json_data: impl Into<String>,
        callback: Option<DbTaskCallback>,
    ) -> bool {
        let json_data = json_data.into();

        if let Err(e) = serde_json::from_str::<serde_json::Value>(&json_data) {
            tracing::warn!(session = session_id, error = %e, "player data is not valid JSON");
            if let Some(callback) = callback {
                callback(false, "payload is not valid JSON");
            }
            return false;
        }

        let mut task = DbTask::new(DbTaskKind::UpdatePlayerData, session_id, json_data);
        if let Some(callback) = callback {
            task = task.with_callback(callback);
        }
        self.enqueue(task)
    }

    /// Application-defined task; the ping-time record from the DB server
    /// travels through here as JSON.
    pub fn custom(
        &self,
        session_id: ConnectionId,
        data: impl Into<String>,
        callback: Option<DbTaskCallback>,
    ) -> bool {
        let mut task = DbTask::new(DbTaskKind::Custom, session_id, data);
        if let Some(callback) = callback {
            task = task.with_callback(callback);
        }
        self.enqueue(task)
    }
}

impl Drop for DbTaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Workers
// ============================================================================

fn worker_loop(inner: Arc<QueueInner>) {
    tracing::debug!("db worker started");

    loop {
        let mut task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    inner.queue_size.fetch_sub(1, Ordering::Relaxed);
                    break Some(task);
                }
                if !inner.running.load(Ordering::Acquire) {
                    break None;
                }
                inner.cv.wait(&mut queue);
            }
        };

        let Some(task) = task.as_mut() else {
            break;
        };

        let success = process_task(&inner, task);
        if success && task.wal_seq != 0 {
            let _ = inner.wal.write_done(task.wal_seq);
        }
    }

    tracing::debug!("db worker stopped");
}

/// Run one task against the injected database. With no database attached the
/// handlers degrade to log-only success so the WAL still settles.
fn process_task(inner: &Arc<QueueInner>, task: &mut DbTask) -> bool {
    let database = inner.database.read().clone();

    let outcome: std::result::Result<String, String> = match (&database, task.kind) {
        (Some(db), _) if !db.is_connected() => {
            Err("database not connected".to_string())
        }
        (Some(db), DbTaskKind::RecordConnectTime) => db
            .record_connect_time(task.session_id, &task.data)
            .map(|_| "connect time recorded".to_string())
            .map_err(|e| e.to_string()),
        (Some(db), DbTaskKind::RecordDisconnectTime) => db
            .record_disconnect_time(task.session_id, &task.data)
            .map(|_| "disconnect time recorded".to_string())
            .map_err(|e| e.to_string()),
        (Some(db), DbTaskKind::UpdatePlayerData) => db
            .upsert_player_data(task.session_id, &task.data)
            .map(|_| "player data updated".to_string())
            .map_err(|e| e.to_string()),
        (Some(db), DbTaskKind::Custom) => run_custom(db.as_ref(), task),
        (None, _) => {
            tracing::info!(
                session = task.session_id,
                kind = ?task.kind,
                data = %task.data,
                "db task logged (no database attached)"
            );
            Ok("logged (no database)".to_string())
        }
    };

    match outcome {
        Ok(detail) => {
            inner.processed.fetch_add(1, Ordering::Relaxed);
            task.finish(true, &detail);
            true
        }
        Err(detail) => {
            inner.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                session = task.session_id,
                kind = ?task.kind,
                detail = %detail,
                "db task failed"
            );
            task.finish(false, &detail);
            false
        }
    }
}

/// Custom payloads carrying a ping-time record are persisted; anything else
/// is logged and settled.
fn run_custom(db: &dyn Database, task: &DbTask) -> std::result::Result<String, String> {
    #[derive(serde::Deserialize)]
    struct PingRecord {
        server_id: u32,
        timestamp: u64,
        server_name: String,
    }

    match serde_json::from_str::<PingRecord>(&task.data) {
        Ok(record) => db
            .save_ping_time(record.server_id, record.timestamp, &record.server_name)
            .map(|_| "ping time saved".to_string())
            .map_err(|e| e.to_string()),
        Err(_) => {
            tracing::info!(session = task.session_id, data = %task.data, "custom db task logged");
            Ok("custom task logged".to_string())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::database::MemoryDatabase;
    use std::time::Duration;

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..(deadline_ms / 10) {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn test_tasks_reach_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::new());
        let queue = DbTaskQueue::new(dir.path().join("wal"), Some(db.clone()));
        queue.start(1).unwrap();

        assert!(queue.record_connect_time(5));
        assert!(queue.update_player_data(5, r#"{"hp": 10}"#, None));
        assert!(queue.record_disconnect_time(5));

        assert!(wait_until(2000, || db.disconnect_log().len() == 1));
        assert_eq!(db.connect_log().len(), 1);
        assert_eq!(db.player_data(5).as_deref(), Some(r#"{"hp": 10}"#));

        queue.shutdown();
    }

    #[test]
    fn test_invalid_json_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DbTaskQueue::new(dir.path().join("wal"), None);
        queue.start(1).unwrap();

        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        assert!(!queue.update_player_data(
            1,
            "not json",
            Some(Box::new(move |ok, _| flag.store(!ok, Ordering::SeqCst)))
        ));
        assert!(failed.load(Ordering::SeqCst));

        queue.shutdown();
    }

    #[test]
    fn test_newline_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DbTaskQueue::new(dir.path().join("wal"), None);
        queue.start(1).unwrap();

        assert!(!queue.custom(1, "line one\nline two", None));
        queue.shutdown();
    }

    #[test]
    fn test_enqueue_after_shutdown_fails_callback() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DbTaskQueue::new(dir.path().join("wal"), None);
        queue.start(1).unwrap();
        queue.shutdown();

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        assert!(!queue.update_player_data(
            1,
            r#"{"x": 1}"#,
            Some(Box::new(move |ok, _| flag.store(!ok, Ordering::SeqCst)))
        ));
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wal_replay_after_simulated_crash() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("wal");

        // A crashed process left pending lines: some done, some not.
        {
            let wal = WriteAheadLog::new(&wal_path);
            for i in 0..10u64 {
                let seq = wal.next_sequence();
                wal.write_pending(
                    DbTaskKind::UpdatePlayerData,
                    i,
                    &format!(r#"{{"payload": {i}}}"#),
                    seq,
                )
                .unwrap();
            }
            for seq in 1..=5u64 {
                wal.write_done(seq).unwrap();
            }
        }

        let db = Arc::new(MemoryDatabase::new());
        let queue = DbTaskQueue::new(&wal_path, Some(db.clone()));
        queue.start(1).unwrap();

        // Sessions 5..9 (seqs 6..10) replay at least once.
        assert!(wait_until(2000, || db.player_data_count() == 5));
        for i in 5..10u64 {
            assert!(db.player_data(i).is_some(), "session {i} not replayed");
        }

        queue.shutdown();

        // Steady state: every pending line has a done line.
        let queue2 = DbTaskQueue::new(&wal_path, Some(db));
        queue2.start(1).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        queue2.shutdown();
        assert!(!wal_path.exists(), "wal should be absent at steady state");
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::new());
        let queue = DbTaskQueue::new(dir.path().join("wal"), Some(db.clone()));
        queue.start(1).unwrap();

        for i in 0..50u64 {
            assert!(queue.update_player_data(i, format!(r#"{{"n": {i}}}"#), None));
        }
        queue.shutdown();

        // Drain semantics: everything accepted before shutdown executed.
        assert_eq!(db.player_data_count(), 50);
    }

    #[test]
    fn test_stats_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::new());
        let queue = DbTaskQueue::new(dir.path().join("wal"), Some(db));
        queue.start(1).unwrap();

        for _ in 0..5 {
            queue.record_connect_time(1);
        }
        queue.shutdown();

        let stats = queue.stats();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.queued, 0);
    }
}
