// # Network Engine
//
// Owns the listener, the accept thread, and the completion workers that pump
// the provider. Application handlers never run on completion threads: each
// reassembled frame is routed through a keyed dispatcher (keyed by
// connection id, preserving per-session order) under an `AsyncScope` so
// shutdown can wait for in-flight logic to settle.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::common::{stream_into_handle, ConnectionId, MAX_CONNECTIONS};
use crate::dispatch::{DispatcherOptions, KeyedDispatcher};
use crate::error::{NetError, Result};
use crate::io::{
    create_provider, AsyncIoProvider, CompletionEntry, OpKind, PollTimeout, ProviderError,
    DEFAULT_QUEUE_DEPTH, MAX_COMPLETION_BATCH,
};
use crate::net::event::{NetworkEvent, NetworkEventBus, NetworkEventData};
use crate::net::manager::SessionManager;
use crate::net::pool::{SessionPool, SessionRef};
use crate::net::session::SessionHandler;
use crate::runtime::AsyncScope;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,

    /// Listen port. 0 binds an ephemeral port (see `local_addr`).
    pub port: u16,

    pub max_connections: usize,

    /// Completion worker count; 0 means one per logical core.
    pub completion_workers: usize,

    /// Logic (handler offload) worker count.
    pub logic_workers: usize,

    /// Per-poll wait inside completion workers.
    pub completion_timeout_ms: u32,

    pub queue_depth: u32,

    /// Force a specific provider backend; None auto-detects.
    pub platform_hint: Option<String>,

    /// How long `stop` waits for in-flight logic before forcing shutdown.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            max_connections: MAX_CONNECTIONS,
            completion_workers: 0,
            logic_workers: 4,
            completion_timeout_ms: 100,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            platform_hint: None,
            shutdown_grace: Duration::from_secs(8),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
}

#[derive(Default)]
struct EngineCounters {
    total_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
}

// ============================================================================
// NetworkEngine
// ============================================================================

struct EngineInner {
    config: EngineConfig,
    provider: Arc<dyn AsyncIoProvider>,
    pool: Arc<SessionPool>,
    manager: Arc<SessionManager>,
    logic: Arc<KeyedDispatcher>,
    scope: Arc<AsyncScope>,
    bus: Arc<NetworkEventBus>,
    handler: RwLock<Option<Arc<dyn SessionHandler>>>,
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
    last_sweep_ms: AtomicU64,
    counters: EngineCounters,
}

pub struct NetworkEngine {
    inner: Arc<EngineInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let provider = create_provider(config.platform_hint.as_deref())?;

        let logic = Arc::new(KeyedDispatcher::new(DispatcherOptions {
            workers: config.logic_workers.max(1),
            ..Default::default()
        })?);

        let inner = Arc::new(EngineInner {
            pool: SessionPool::new(config.max_connections),
            manager: Arc::new(SessionManager::new(config.max_connections)),
            logic,
            scope: AsyncScope::new(),
            bus: NetworkEventBus::new(),
            handler: RwLock::new(None),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
            last_sweep_ms: AtomicU64::new(0),
            counters: EngineCounters::default(),
            provider,
            config,
        });

        Ok(Self {
            inner,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Open the listen socket and prepare the provider. Fails fast: a bind
    /// or provider failure here is process-fatal for the caller.
    pub fn initialize(&self, handler: Arc<dyn SessionHandler>) -> Result<()> {
        let inner = &self.inner;

        inner
            .provider
            .initialize(inner.config.queue_depth, inner.config.max_connections as u32)?;

        let addr: SocketAddr = format!("{}:{}", inner.config.host, inner.config.port)
            .parse()
            .map_err(|e| NetError::Configuration(format!("invalid listen address: {e}")))?;

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener: std::net::TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;

        *inner.handler.write() = Some(handler);
        *inner.local_addr.lock() = Some(bound);
        *inner.listener.lock() = Some(listener);

        tracing::info!(addr = %bound, backend = inner.provider.platform().name(), "network engine initialized");
        Ok(())
    }

    /// Spawn the accept thread and the completion workers.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyRunning("network engine".to_string()));
        }
        if inner.listener.lock().is_none() {
            inner.running.store(false, Ordering::Release);
            return Err(NetError::Configuration(
                "engine started before initialize".to_string(),
            ));
        }

        let mut threads = self.threads.lock();

        {
            let inner = self.inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("net-accept".to_string())
                    .spawn(move || accept_loop(inner))
                    .map_err(|e| NetError::Internal(format!("accept thread spawn failed: {e}")))?,
            );
        }

        let workers = if inner.config.completion_workers == 0 {
            num_cpus::get().max(1)
        } else {
            inner.config.completion_workers
        };

        for index in 0..workers {
            let inner = self.inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("net-worker-{index}"))
                    .spawn(move || completion_loop(inner))
                    .map_err(|e| {
                        NetError::Internal(format!("completion worker spawn failed: {e}"))
                    })?,
            );
        }

        tracing::info!(workers, "network engine started");
        Ok(())
    }

    /// Graceful stop: unblock and join the I/O threads, drain in-flight
    /// logic within the grace window, then close every session.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        tracing::info!("network engine stopping");

        // Dropping the listener stops the accept loop's next poll.
        *inner.listener.lock() = None;

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        drop(threads);

        if !inner.scope.wait_for_drain(Some(inner.config.shutdown_grace)) {
            tracing::warn!(
                in_flight = inner.scope.in_flight_count(),
                "logic drain grace expired - cancelling remaining tasks"
            );
            inner.scope.cancel();
        }
        inner.logic.shutdown();

        inner.manager.close_all();
        inner.provider.shutdown();

        let stats = self.stats();
        tracing::info!(
            total_connections = stats.total_connections,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            errors = stats.errors,
            "network engine stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Actual bound address (relevant with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn event_bus(&self) -> Arc<NetworkEventBus> {
        self.inner.bus.clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.manager.count()
    }

    pub fn get_session(&self, id: ConnectionId) -> Option<SessionRef> {
        self.inner.manager.get(id)
    }

    /// Queue data on one connection's ordered write path.
    pub fn send_to(&self, id: ConnectionId, data: &[u8]) -> bool {
        match self.inner.manager.get(id) {
            Some(session) => session.send(data),
            None => false,
        }
    }

    pub fn close_connection(&self, id: ConnectionId) {
        close_session(&self.inner, id, 0);
    }

    /// Establish an outbound session over the same substrate (server-to-
    /// server links). The returned reference stays registered until
    /// disconnect.
    pub fn connect(&self, addr: &str, handler: Arc<dyn SessionHandler>) -> Result<SessionRef> {
        let inner = &self.inner;

        let stream = TcpStream::connect(addr)
            .map_err(|e| NetError::Network(format!("connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true).ok();

        let session = inner.pool.acquire().ok_or_else(|| {
            NetError::ResourceExhausted("session pool exhausted".to_string())
        })?;

        let socket = stream_into_handle(stream);
        let id = inner.manager.generate_id();
        session.initialize(id, socket);
        session.attach(inner.provider.clone(), handler.clone());

        inner.provider.register_socket(socket).map_err(|e| {
            session.close();
            NetError::Provider(e)
        })?;

        if !inner.manager.insert(id, session.clone()) {
            let _ = inner.provider.unregister_socket(socket);
            session.close();
            return Err(NetError::ResourceExhausted(
                "connection limit reached".to_string(),
            ));
        }

        inner.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        inner
            .bus
            .publish(NetworkEventData::new(NetworkEvent::Connected, id));

        {
            let session = session.clone();
            inner.scope.submit(&inner.logic, id, move || {
                if let Some(handler) = session.handler() {
                    handler.on_connected(&session);
                }
            });
        }

        if !session.post_recv() {
            close_session(inner, id, 0);
            return Err(NetError::Network(
                "initial receive arm failed".to_string(),
            ));
        }

        tracing::info!(id, addr, "outbound session established");
        Ok(session)
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.manager.count(),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    pub fn provider_stats(&self) -> crate::io::ProviderStats {
        self.inner.provider.stats()
    }
}

impl Drop for NetworkEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

fn accept_loop(inner: Arc<EngineInner>) {
    tracing::debug!("accept thread started");
    let mut backoff = Duration::from_millis(10);

    while inner.running.load(Ordering::Acquire) {
        let accepted = {
            let guard = inner.listener.lock();
            match guard.as_ref() {
                Some(listener) => listener.accept(),
                None => break,
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff = Duration::from_millis(10);
                handle_accept(&inner, stream, peer);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                // Transient accept failures back off with jitter so a
                // persistent error cannot spin the thread.
                let jitter = Duration::from_millis(rand::rng().random_range(0..10));
                tracing::warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "accept failed");
                std::thread::sleep(backoff + jitter);
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
        }
    }

    tracing::debug!("accept thread stopped");
}

fn handle_accept(inner: &Arc<EngineInner>, stream: TcpStream, peer: SocketAddr) {
    if inner.manager.count() >= inner.config.max_connections {
        tracing::warn!(%peer, limit = inner.config.max_connections, "connection limit reached - rejecting");
        return;
    }

    let Some(handler) = inner.handler.read().clone() else {
        tracing::error!("accept without handler installed");
        return;
    };

    let Some(session) = inner.pool.acquire() else {
        tracing::warn!(%peer, "session pool exhausted - rejecting connection");
        return;
    };

    stream.set_nodelay(true).ok();
    let socket = stream_into_handle(stream);

    let id = inner.manager.generate_id();
    session.initialize(id, socket);
    session.attach(inner.provider.clone(), handler);

    if let Err(e) = inner.provider.register_socket(socket) {
        tracing::error!(id, error = %e, "socket registration failed");
        session.close();
        return;
    }

    if !inner.manager.insert(id, session.clone()) {
        let _ = inner.provider.unregister_socket(socket);
        session.close();
        return;
    }

    inner.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    tracing::info!(id, %peer, "connection accepted");
    inner
        .bus
        .publish(NetworkEventData::new(NetworkEvent::Connected, id));

    {
        let session = session.clone();
        inner.scope.submit(&inner.logic, id, move || {
            if let Some(handler) = session.handler() {
                handler.on_connected(&session);
            }
        });
    }

    if !session.post_recv() {
        close_session(inner, id, 0);
    }
}

// ============================================================================
// Completion Workers
// ============================================================================

fn completion_loop(inner: Arc<EngineInner>) {
    tracing::debug!("completion worker started");
    let mut entries = vec![CompletionEntry::default(); MAX_COMPLETION_BATCH];
    let timeout = PollTimeout::Millis(inner.config.completion_timeout_ms);

    while inner.running.load(Ordering::Acquire) {
        match inner.provider.process_completions(&mut entries, timeout) {
            Ok(0) => {}
            Ok(n) => {
                for i in 0..n {
                    let entry = entries[i];
                    handle_completion(&inner, entry);
                }
            }
            Err(ProviderError::NotInitialized) => break,
            Err(e) => {
                inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "completion poll failed");
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        sweep_disconnected(&inner);
    }

    tracing::debug!("completion worker stopped");
}

/// Reap sessions that closed themselves outside a completion (synchronous
/// send failure, handler-initiated close). One worker sweeps per interval.
fn sweep_disconnected(inner: &Arc<EngineInner>) {
    let now = crate::common::now_millis();
    let last = inner.last_sweep_ms.load(Ordering::Relaxed);
    if now.saturating_sub(last) < 1000 {
        return;
    }
    if inner
        .last_sweep_ms
        .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    let stale: Vec<ConnectionId> = inner
        .manager
        .all_sessions()
        .iter()
        .filter(|s| !s.is_connected())
        .map(|s| s.id())
        .collect();

    for id in stale {
        close_session(inner, id, 0);
    }
}

fn handle_completion(inner: &Arc<EngineInner>, entry: CompletionEntry) {
    let id = entry.context;
    let Some(session) = inner.manager.get(id) else {
        return;
    };

    match entry.op {
        OpKind::Recv => {
            if entry.result <= 0 {
                close_session(inner, id, entry.os_error);
                return;
            }

            let n = entry.result as usize;
            inner
                .counters
                .bytes_received
                .fetch_add(n as u64, Ordering::Relaxed);

            // Sole accessor window: the provider finished writing and the
            // next receive is not armed yet.
            let chunk = session.recv_ctx.filled(n);
            let outcome = session.process_raw_recv(chunk);

            for frame in outcome.frames {
                let session = session.clone();
                inner.scope.submit(&inner.logic, id, move || {
                    if let Some(handler) = session.handler() {
                        handler.on_recv(&session, &frame);
                    }
                });
            }

            if outcome.should_close {
                close_session(inner, id, 0);
                return;
            }

            if !session.post_recv() && session.is_connected() {
                close_session(inner, id, 0);
            }
        }
        OpKind::Send => {
            if entry.result < 0 {
                inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                close_session(inner, id, entry.os_error);
                return;
            }
            inner
                .counters
                .bytes_sent
                .fetch_add(entry.result as u64, Ordering::Relaxed);
            session.on_send_complete();
        }
        OpKind::Error => {
            inner.counters.errors.fetch_add(1, Ordering::Relaxed);
            close_session(inner, id, entry.os_error);
        }
        OpKind::Accept | OpKind::Connect | OpKind::Timeout => {}
    }
}

// ============================================================================
// Close Path
// ============================================================================

fn close_session(inner: &Arc<EngineInner>, id: ConnectionId, os_error: i32) {
    let Some(session) = inner.manager.remove(id) else {
        return;
    };

    if let Some(socket) = session.socket() {
        let _ = inner.provider.unregister_socket(socket);
    }

    inner.bus.publish(
        NetworkEventData::new(NetworkEvent::Disconnected, id).with_error(os_error),
    );

    // Route the close through the logic pool keyed by the same id: frames
    // already dispatched for this session run first, then on_disconnected.
    let dispatched = {
        let session = session.clone();
        inner
            .scope
            .submit(&inner.logic, id, move || session.close())
    };
    if !dispatched {
        session.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
