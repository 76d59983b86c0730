// # Game Server
//
// Fronts game clients over the engine: answers pings, records
// connect/disconnect times through the DB task queue, and keeps an outbound
// link to the DB server with automatic reconnect. Client handlers hold the
// task queue weakly and upgrade per use, so the queue's lifetime is owned by
// the server alone.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::common::now_millis;
use crate::db::{Database, DbTaskQueue};
use crate::error::Result;
use crate::net::packet::{
    packet_id, DbSavePingTimeReq, PacketHeader, PingReq, PongRes, ServerPingReq, ServerPongRes,
};
use crate::net::{EngineConfig, NetworkEngine, Session, SessionHandler, SessionRef};
use crate::runtime::TimerQueue;
use crate::server::latency::LatencyTracker;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct DbLinkConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct GameServerConfig {
    pub engine: EngineConfig,
    pub wal_path: PathBuf,
    pub db_workers: usize,
    pub db_link: Option<DbLinkConfig>,
    pub server_id: u32,
    pub server_name: String,
    /// Interval of the server-to-server ping (and reconnect attempt) timer.
    pub ping_interval: Duration,
}

impl Default for GameServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            wal_path: PathBuf::from("gamed.wal"),
            db_workers: 1,
            db_link: None,
            server_id: 1,
            server_name: "game-01".to_string(),
            ping_interval: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Client Sessions
// ============================================================================

struct ClientHandler {
    db_tasks: Weak<DbTaskQueue>,
}

impl SessionHandler for ClientHandler {
    fn on_connected(&self, session: &Session) {
        if let Some(queue) = self.db_tasks.upgrade() {
            queue.record_connect_time(session.id());
        }
    }

    fn on_recv(&self, session: &Session, frame: &[u8]) {
        let Some(header) = PacketHeader::peek(frame) else {
            return;
        };

        match header.id {
            packet_id::PING_REQ => {
                let Some(ping) = PingReq::decode(frame) else {
                    tracing::warn!(session = session.id(), "malformed ping request");
                    return;
                };

                #[cfg(feature = "pingpong-verbose-log")]
                tracing::debug!(
                    session = session.id(),
                    sequence = ping.sequence,
                    client_time = ping.client_time,
                    "ping received"
                );

                session.touch_ping();
                let pong = PongRes {
                    client_time: ping.client_time,
                    server_time: now_millis(),
                    sequence: ping.sequence,
                };
                session.send(&pong.encode());
            }
            unknown => {
                tracing::warn!(session = session.id(), id = unknown, "unknown packet id - discarded");
            }
        }
    }

    fn on_disconnected(&self, session: &Session) {
        if let Some(queue) = self.db_tasks.upgrade() {
            queue.record_disconnect_time(session.id());
        }
    }
}

// ============================================================================
// DB Link Session
// ============================================================================

struct DbLinkHandler {
    server_id: u32,
    latency: Arc<LatencyTracker>,
    /// Sequence → send timestamp of in-flight server pings.
    pending_pings: DashMap<u32, u64>,
    /// Invoked from `on_disconnected` so the owning server can retry.
    reconnect: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl DbLinkHandler {
    fn new(server_id: u32, latency: Arc<LatencyTracker>) -> Arc<Self> {
        Arc::new(Self {
            server_id,
            latency,
            pending_pings: DashMap::new(),
            reconnect: RwLock::new(None),
        })
    }

    fn set_reconnect_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.reconnect.write() = Some(hook);
    }

    fn note_ping_sent(&self, sequence: u32, sent_ms: u64) {
        self.pending_pings.insert(sequence, sent_ms);
    }
}

impl SessionHandler for DbLinkHandler {
    fn on_connected(&self, session: &Session) {
        tracing::info!(session = session.id(), "db link established");
        self.pending_pings.clear();
    }

    fn on_recv(&self, session: &Session, frame: &[u8]) {
        let Some(header) = PacketHeader::peek(frame) else {
            return;
        };

        match header.id {
            packet_id::SERVER_PONG_RES => {
                let Some(pong) = ServerPongRes::decode(frame) else {
                    return;
                };
                if let Some((_, sent_ms)) = self.pending_pings.remove(&pong.sequence) {
                    let rtt = now_millis().saturating_sub(sent_ms);
                    self.latency.record(self.server_id, rtt);

                    #[cfg(feature = "pingpong-verbose-log")]
                    tracing::debug!(sequence = pong.sequence, rtt_ms = rtt, "db link pong");
                }
            }
            packet_id::DB_SAVE_PING_TIME_RES => {
                if let Some(res) = crate::net::packet::DbSavePingTimeRes::decode(frame) {
                    if res.result != 0 {
                        tracing::warn!(
                            result = res.result,
                            message = %res.message,
                            "db server rejected ping-time save"
                        );
                    }
                }
            }
            unknown => {
                tracing::warn!(session = session.id(), id = unknown, "unknown db link packet - discarded");
            }
        }
    }

    fn on_disconnected(&self, session: &Session) {
        tracing::warn!(session = session.id(), "db link lost");
        self.pending_pings.clear();
        let hook = self.reconnect.read();
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }
}

// ============================================================================
// GameServer
// ============================================================================

pub struct GameServer {
    config: GameServerConfig,
    engine: Arc<NetworkEngine>,
    db_tasks: Arc<DbTaskQueue>,
    timers: TimerQueue,
    latency: Arc<LatencyTracker>,
    link_handler: Arc<DbLinkHandler>,
    db_link: Arc<Mutex<Option<SessionRef>>>,
    running: AtomicBool,
}

impl GameServer {
    pub fn new(config: GameServerConfig, database: Option<Arc<dyn Database>>) -> Result<Self> {
        let engine = Arc::new(NetworkEngine::new(config.engine.clone())?);
        let db_tasks = DbTaskQueue::new(&config.wal_path, database);
        let latency = Arc::new(LatencyTracker::new());
        let link_handler = DbLinkHandler::new(config.server_id, latency.clone());

        Ok(Self {
            engine,
            db_tasks,
            timers: TimerQueue::new(),
            latency,
            link_handler,
            db_link: Arc::new(Mutex::new(None)),
            running: AtomicBool::new(false),
            config,
        })
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.db_tasks.start(self.config.db_workers)?;

        let client_handler = Arc::new(ClientHandler {
            db_tasks: Arc::downgrade(&self.db_tasks),
        });
        self.engine.initialize(client_handler)?;
        self.engine.start()?;

        self.timers.initialize();

        if let Some(link) = self.config.db_link.clone() {
            self.start_db_link(link);
        }

        tracing::info!(
            addr = ?self.engine.local_addr(),
            server_id = self.config.server_id,
            "game server started"
        );
        Ok(())
    }

    /// Maintain the outbound DB-server session: connect when absent, ping
    /// when present. Disconnects clear the slot (via the handler hook) and
    /// the next tick reconnects.
    fn start_db_link(&self, link: DbLinkConfig) {
        let addr = format!("{}:{}", link.host, link.port);

        {
            let db_link = self.db_link.clone();
            self.link_handler
                .set_reconnect_hook(Box::new(move || {
                    *db_link.lock() = None;
                }));
        }

        let engine = self.engine.clone();
        let handler = self.link_handler.clone();
        let db_link = self.db_link.clone();
        let server_id = self.config.server_id;
        let server_name = self.config.server_name.clone();

        self.timers.schedule_repeat(
            move || {
                let current = db_link.lock().clone();
                match current {
                    Some(session) if session.is_connected() => {
                        let sequence = session.next_ping_sequence();
                        let now = now_millis();
                        handler.note_ping_sent(sequence, now);

                        session.send(
                            &ServerPingReq {
                                timestamp: now,
                                sequence,
                            }
                            .encode(),
                        );
                        session.send(
                            &DbSavePingTimeReq {
                                server_id,
                                timestamp: now,
                                server_name: server_name.clone(),
                            }
                            .encode(),
                        );
                    }
                    _ => {
                        let link_handler: Arc<dyn SessionHandler> = handler.clone();
                        match engine.connect(&addr, link_handler) {
                            Ok(session) => {
                                *db_link.lock() = Some(session);
                            }
                            Err(e) => {
                                tracing::warn!(addr = %addr, error = %e, "db link connect failed - will retry");
                            }
                        }
                    }
                }
                true
            },
            self.config.ping_interval,
        );
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        tracing::info!("game server stopping");
        self.timers.shutdown();

        // Drop the link before the engine tears sessions down so the
        // reconnect hook cannot race a fresh connect.
        *self.db_link.lock() = None;

        self.engine.stop();
        self.db_tasks.shutdown();
        tracing::info!("game server stopped");
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

impl Drop for GameServer {
    fn drop(&mut self) {
        self.stop();
    }
}
