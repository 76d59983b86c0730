// # DB Server
//
// Back-end role: answers server pings and persists what game servers report.
// Save requests ride the keyed dispatcher keyed by the reporting server id,
// so one server's records land in arrival order while distinct servers
// persist in parallel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::common::now_millis;
use crate::db::{Database, DbTaskQueue};
use crate::dispatch::{DispatcherOptions, KeyedDispatcher};
use crate::error::Result;
use crate::net::packet::{
    packet_id, DbSavePingTimeReq, DbSavePingTimeRes, PacketHeader, ServerPingReq, ServerPongRes,
};
use crate::net::{EngineConfig, NetworkEngine, Session, SessionHandler};
use crate::server::latency::LatencyTracker;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct DbServerConfig {
    pub engine: EngineConfig,
    pub wal_path: PathBuf,
    pub db_workers: usize,
    pub dispatcher_workers: usize,
}

impl Default for DbServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                port: 8001,
                ..Default::default()
            },
            wal_path: PathBuf::from("dbd.wal"),
            db_workers: 1,
            dispatcher_workers: 4,
        }
    }
}

// ============================================================================
// Game-Server Sessions
// ============================================================================

struct ServerLinkHandler {
    db_tasks: Weak<DbTaskQueue>,
    dispatcher: Arc<KeyedDispatcher>,
    latency: Arc<LatencyTracker>,
}

impl SessionHandler for ServerLinkHandler {
    fn on_connected(&self, session: &Session) {
        tracing::info!(session = session.id(), "game server link connected");
    }

    fn on_recv(&self, session: &Session, frame: &[u8]) {
        let Some(header) = PacketHeader::peek(frame) else {
            return;
        };

        match header.id {
            packet_id::SERVER_PING_REQ => {
                let Some(ping) = ServerPingReq::decode(frame) else {
                    return;
                };

                #[cfg(feature = "pingpong-verbose-log")]
                tracing::debug!(
                    session = session.id(),
                    sequence = ping.sequence,
                    "server ping received"
                );

                session.touch_ping();
                let pong = ServerPongRes {
                    request_timestamp: ping.timestamp,
                    response_timestamp: now_millis(),
                    sequence: ping.sequence,
                };
                session.send(&pong.encode());
            }
            packet_id::DB_SAVE_PING_TIME_REQ => {
                let Some(req) = DbSavePingTimeReq::decode(frame) else {
                    return;
                };
                self.handle_save_ping_time(session, req);
            }
            unknown => {
                tracing::warn!(session = session.id(), id = unknown, "unknown packet id - discarded");
            }
        }
    }

    fn on_disconnected(&self, session: &Session) {
        tracing::info!(session = session.id(), "game server link disconnected");
    }
}

impl ServerLinkHandler {
    /// Persist one ping-time report. Ordering per reporting server is
    /// preserved by keying the dispatch on the server id.
    fn handle_save_ping_time(&self, session: &Session, req: DbSavePingTimeReq) {
        let age = now_millis().saturating_sub(req.timestamp);
        self.latency.record(req.server_id, age);

        let db_tasks = self.db_tasks.clone();
        let session_id = session.id();
        let record = serde_json::json!({
            "server_id": req.server_id,
            "timestamp": req.timestamp,
            "server_name": req.server_name,
        })
        .to_string();

        let dispatched = self.dispatcher.dispatch(req.server_id as u64, move || {
            let Some(queue) = db_tasks.upgrade() else {
                tracing::warn!("db task queue gone - ping time dropped");
                return;
            };
            queue.custom(session_id, record, None);
        });

        let res = DbSavePingTimeRes {
            server_id: req.server_id,
            result: if dispatched { 0 } else { 1 },
            message: if dispatched {
                "queued".to_string()
            } else {
                "dispatcher rejected".to_string()
            },
        };
        session.send(&res.encode());
    }
}

// ============================================================================
// DbServer
// ============================================================================

pub struct DbServer {
    config: DbServerConfig,
    engine: Arc<NetworkEngine>,
    db_tasks: Arc<DbTaskQueue>,
    dispatcher: Arc<KeyedDispatcher>,
    latency: Arc<LatencyTracker>,
    running: AtomicBool,
}

impl DbServer {
    pub fn new(config: DbServerConfig, database: Option<Arc<dyn Database>>) -> Result<Self> {
        let engine = Arc::new(NetworkEngine::new(config.engine.clone())?);
        let db_tasks = DbTaskQueue::new(&config.wal_path, database);
        let dispatcher = Arc::new(KeyedDispatcher::new(DispatcherOptions {
            workers: config.dispatcher_workers.max(1),
            ..Default::default()
        })?);

        Ok(Self {
            engine,
            db_tasks,
            dispatcher,
            latency: Arc::new(LatencyTracker::new()),
            running: AtomicBool::new(false),
            config,
        })
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.db_tasks.start(self.config.db_workers)?;

        let handler = Arc::new(ServerLinkHandler {
            db_tasks: Arc::downgrade(&self.db_tasks),
            dispatcher: self.dispatcher.clone(),
            latency: self.latency.clone(),
        });
        self.engine.initialize(handler)?;
        self.engine.start()?;

        tracing::info!(addr = ?self.engine.local_addr(), "db server started");
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        tracing::info!("db server stopping");
        self.engine.stop();
        // Drain ordered save tasks before the queue stops accepting.
        self.dispatcher.shutdown();
        self.db_tasks.shutdown();
        tracing::info!("db server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn engine(&self) -> &NetworkEngine {
        &self.engine
    }

    pub fn db_tasks(&self) -> &Arc<DbTaskQueue> {
        &self.db_tasks
    }

    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }
}

impl Drop for DbServer {
    fn drop(&mut self) {
        self.stop();
    }
}
