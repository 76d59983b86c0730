// # Database Capability
//
// The queue only needs this narrow contract; concrete drivers (ODBC, OLE DB,
// SQLite) live behind it and are injected at startup. `MemoryDatabase` backs
// tests and DB-less runs.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::common::ConnectionId;
use crate::error::Result;

// ============================================================================
// Capability Contract
// ============================================================================

pub trait Database: Send + Sync {
    fn is_connected(&self) -> bool;

    /// INSERT into the session connect log.
    fn record_connect_time(&self, session_id: ConnectionId, timestamp: &str) -> Result<()>;

    /// INSERT into the session disconnect log.
    fn record_disconnect_time(&self, session_id: ConnectionId, timestamp: &str) -> Result<()>;

    /// UPSERT the player-data row for a session.
    fn upsert_player_data(&self, session_id: ConnectionId, data: &str) -> Result<()>;

    /// INSERT a server ping-time observation.
    fn save_ping_time(&self, server_id: u32, timestamp_ms: u64, server_name: &str) -> Result<()>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

#[derive(Default)]
struct MemoryTables {
    connect_log: Vec<(ConnectionId, String)>,
    disconnect_log: Vec<(ConnectionId, String)>,
    player_data: HashMap<ConnectionId, String>,
    ping_times: Vec<(u32, u64, String)>,
}

/// Table-shaped in-memory store with the same surface as the SQL drivers.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<MemoryTables>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_log(&self) -> Vec<(ConnectionId, String)> {
        self.tables.lock().connect_log.clone()
    }

    pub fn disconnect_log(&self) -> Vec<(ConnectionId, String)> {
        self.tables.lock().disconnect_log.clone()
    }

    pub fn player_data(&self, session_id: ConnectionId) -> Option<String> {
        self.tables.lock().player_data.get(&session_id).cloned()
    }

    pub fn player_data_count(&self) -> usize {
        self.tables.lock().player_data.len()
    }

    pub fn ping_times(&self) -> Vec<(u32, u64, String)> {
        self.tables.lock().ping_times.clone()
    }
}

impl Database for MemoryDatabase {
    fn is_connected(&self) -> bool {
        true
    }

    fn record_connect_time(&self, session_id: ConnectionId, timestamp: &str) -> Result<()> {
        self.tables
            .lock()
            .connect_log
            .push((session_id, timestamp.to_string()));
        Ok(())
    }

    fn record_disconnect_time(&self, session_id: ConnectionId, timestamp: &str) -> Result<()> {
        self.tables
            .lock()
            .disconnect_log
            .push((session_id, timestamp.to_string()));
        Ok(())
    }

    fn upsert_player_data(&self, session_id: ConnectionId, data: &str) -> Result<()> {
        self.tables
            .lock()
            .player_data
            .insert(session_id, data.to_string());
        Ok(())
    }

    fn save_ping_time(&self, server_id: u32, timestamp_ms: u64, server_name: &str) -> Result<()> {
        self.tables
            .lock()
            .ping_times
            .push((server_id, timestamp_ms, server_name.to_string()));
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_database_tables() {
        let db = MemoryDatabase::new();
        assert!(db.is_connected());

        db.record_connect_time(1, "2026-01-01 00:00:00").unwrap();
        db.record_disconnect_time(1, "2026-01-01 00:05:00").unwrap();
        db.upsert_player_data(1, r#"{"level": 3}"#).unwrap();
        db.upsert_player_data(1, r#"{"level": 4}"#).unwrap();
        db.save_ping_time(9, 12345, "game-01").unwrap();

        assert_eq!(db.connect_log().len(), 1);
        assert_eq!(db.disconnect_log().len(), 1);
        assert_eq!(db.player_data(1).as_deref(), Some(r#"{"level": 4}"#));
        assert_eq!(db.player_data_count(), 1);
        assert_eq!(db.ping_times(), vec![(9, 12345, "game-01".to_string())]);
    }
}
