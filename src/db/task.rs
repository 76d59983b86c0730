// # DB Tasks

use crate::common::ConnectionId;

/// Outcome callback: success flag plus a human-readable detail. Callbacks
/// are not persisted; a task replayed after a crash runs without one.
pub type DbTaskCallback = Box<dyn FnOnce(bool, &str) + Send>;

// ============================================================================
// Task Kind
// ============================================================================

/// Closed task union. The numeric value is the WAL `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DbTaskKind {
    RecordConnectTime = 0,
    RecordDisconnectTime = 1,
    UpdatePlayerData = 2,
    Custom = 3,
}

impl DbTaskKind {
    pub fn from_wal_type(v: u8) -> Option<Self> {
        match v {
            0 => Some(DbTaskKind::RecordConnectTime),
            1 => Some(DbTaskKind::RecordDisconnectTime),
            2 => Some(DbTaskKind::UpdatePlayerData),
            3 => Some(DbTaskKind::Custom),
            _ => None,
        }
    }
}

// ============================================================================
// Task
// ============================================================================

pub struct DbTask {
    pub kind: DbTaskKind,
    pub session_id: ConnectionId,
    pub data: String,
    pub callback: Option<DbTaskCallback>,
    /// 0 until the task has been written to the WAL.
    pub wal_seq: u64,
}

impl DbTask {
    pub fn new(kind: DbTaskKind, session_id: ConnectionId, data: impl Into<String>) -> Self {
        Self {
            kind,
            session_id,
            data: data.into(),
            callback: None,
            wal_seq: 0,
        }
    }

    pub fn with_callback(mut self, callback: DbTaskCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Consume the callback, reporting the task outcome.
    pub(crate) fn finish(&mut self, success: bool, detail: &str) {
        if let Some(callback) = self.callback.take() {
            callback(success, detail);
        }
    }
}

impl std::fmt::Debug for DbTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTask")
            .field("kind", &self.kind)
            .field("session_id", &self.session_id)
            .field("data", &self.data)
            .field("has_callback", &self.callback.is_some())
            .field("wal_seq", &self.wal_seq)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_wal_type_roundtrip() {
        for kind in [
            DbTaskKind::RecordConnectTime,
            DbTaskKind::RecordDisconnectTime,
            DbTaskKind::UpdatePlayerData,
            DbTaskKind::Custom,
        ] {
            assert_eq!(DbTaskKind::from_wal_type(kind as u8), Some(kind));
        }
        assert_eq!(DbTaskKind::from_wal_type(200), None);
    }

    #[test]
    fn test_finish_consumes_callback() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let mut task = DbTask::new(DbTaskKind::Custom, 1, "x").with_callback(Box::new(
            move |success, _| {
                assert!(success);
                flag.store(true, Ordering::SeqCst);
            },
        ));

        task.finish(true, "ok");
        assert!(called.load(Ordering::SeqCst));

        // Second finish is a no-op.
        task.finish(false, "ignored");
    }
}
