// # Write-Ahead Log
//
// Line-oriented, append-only:
//
// ```text
// P|<type>|<sessionId>|<seq>|<escaped-data>\n    pending, written before enqueue
// D|<seq>\n                                      done, written after success
// ```
//
// `|` inside the data field is substituted with byte 0x01. Sequence numbers
// are monotone per process and re-seeded from the maximum observed on
// recovery so replayed tasks never reuse a number.
//
// Recovery reads both `wal` and `wal.bak` so no crash window loses tasks:
// during a P-write, between P and D, and in the middle of a previous
// recovery's rename-and-re-enqueue.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::ConnectionId;
use crate::db::task::DbTaskKind;
use crate::error::{NetError, Result};

const BACKUP_SUFFIX: &str = ".bak";
const ESCAPE_BYTE: char = '\x01';

// ============================================================================
// Recovered Entries
// ============================================================================

/// A pending entry that survived a crash and must be re-enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTask {
    pub kind: DbTaskKind,
    pub session_id: ConnectionId,
    pub data: String,
}

// ============================================================================
// WriteAheadLog
// ============================================================================

pub struct WriteAheadLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
    sequence: AtomicU64,
}

impl WriteAheadLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(BACKUP_SUFFIX);
        PathBuf::from(os)
    }

    /// Next monotone sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn escape(data: &str) -> String {
        data.replace('|', &ESCAPE_BYTE.to_string())
    }

    pub fn unescape(data: &str) -> String {
        data.replace(ESCAPE_BYTE, "|")
    }

    /// Append a pending line and push it to durable storage.
    pub fn write_pending(
        &self,
        kind: DbTaskKind,
        session_id: ConnectionId,
        data: &str,
        seq: u64,
    ) -> Result<()> {
        let line = format!(
            "P|{}|{}|{}|{}\n",
            kind as u8,
            session_id,
            seq,
            Self::escape(data)
        );
        self.append(&line)
    }

    /// Append a done line for a completed sequence.
    pub fn write_done(&self, seq: u64) -> Result<()> {
        self.append(&format!("D|{seq}\n"))
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut guard = self.file.lock();

        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| {
                    NetError::Wal(format!("open {} failed: {e}", self.path.display()))
                })?;
            *guard = Some(file);
        }

        let file = guard.as_mut().expect("wal file just opened");
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| NetError::Wal(format!("append failed: {e}")))
    }

    /// Parse both WAL files, seed the sequence counter, and stage recovery.
    ///
    /// Returns the surviving pending entries in sequence order. When any
    /// exist, the primary file has been renamed to the backup; the caller
    /// re-enqueues every entry (each getting a fresh pending line in the new
    /// primary) and then calls `finish_recovery` to drop the backup.
    pub fn recover(&self) -> Result<Vec<RecoveredTask>> {
        let backup = self.backup_path();

        let mut pending: BTreeMap<u64, RecoveredTask> = BTreeMap::new();
        let mut max_seq = 0u64;
        let mut saw_any = false;

        for path in [&self.path, &backup] {
            saw_any |= Self::parse_file(path, &mut pending, &mut max_seq);
        }

        if !saw_any {
            return Ok(Vec::new());
        }

        self.sequence.store(max_seq, Ordering::Relaxed);

        if pending.is_empty() {
            // Every recorded task completed; start clean.
            let _ = std::fs::remove_file(&self.path);
            let _ = std::fs::remove_file(&backup);
            tracing::info!("wal: clean startup, no pending tasks");
            return Ok(Vec::new());
        }

        tracing::warn!(
            count = pending.len(),
            "wal: recovering unfinished tasks from previous run"
        );

        // Stale backup from an interrupted recovery has been merged above;
        // make room for the fresh rename.
        let _ = std::fs::remove_file(&backup);

        if std::fs::rename(&self.path, &backup).is_err() {
            // Cross-device or similar: degrade to delete-first. The window
            // where only the re-enqueued pending lines protect the tasks is
            // accepted and logged.
            tracing::warn!("wal: rename to backup failed, falling back to delete-first recovery");
            let _ = std::fs::remove_file(&self.path);
        }

        // The append handle (if any) points at the renamed inode.
        *self.file.lock() = None;

        Ok(pending.into_values().collect())
    }

    /// Drop the backup once every recovered task has a fresh pending line.
    pub fn finish_recovery(&self) {
        let _ = std::fs::remove_file(self.backup_path());
    }

    /// Parse one WAL file into the pending map. Returns whether the file
    /// existed. Malformed lines are skipped: a torn final line is expected
    /// after a crash.
    fn parse_file(
        path: &Path,
        pending: &mut BTreeMap<u64, RecoveredTask>,
        max_seq: &mut u64,
    ) -> bool {
        let Ok(file) = File::open(path) else {
            return false;
        };

        for line in BufReader::new(file).lines() {
            let Ok(line) = line else {
                break;
            };
            if line.is_empty() {
                continue;
            }

            let mut parts = line.splitn(5, '|');
            match parts.next() {
                Some("P") => {
                    let Some(kind) = parts
                        .next()
                        .and_then(|s| s.parse::<u8>().ok())
                        .and_then(DbTaskKind::from_wal_type)
                    else {
                        continue;
                    };
                    let Some(session_id) = parts.next().and_then(|s| s.parse::<u64>().ok())
                    else {
                        continue;
                    };
                    let Some(seq) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
                        continue;
                    };
                    let data = Self::unescape(parts.next().unwrap_or(""));

                    *max_seq = (*max_seq).max(seq);
                    pending.insert(
                        seq,
                        RecoveredTask {
                            kind,
                            session_id,
                            data,
                        },
                    );
                }
                Some("D") => {
                    let Some(seq) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
                        continue;
                    };
                    *max_seq = (*max_seq).max(seq);
                    pending.remove(&seq);
                }
                _ => {}
            }
        }

        true
    }
}

// ============================================================================
// Tests
// ============================================================================
