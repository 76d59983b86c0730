// # Asynchronous I/O Provider Layer
//
// Uniform completion-based I/O abstraction over the platform primitives:
//
// - **Windows IOCP**: stable baseline completion port
// - **Windows RIO**: registered-buffer fast path (Windows 8+)
// - **Linux epoll**: readiness-based baseline
// - **Linux io_uring**: submission/completion rings (kernel 5.1+)
// - **macOS kqueue**: kevent readiness
//
// ## Architecture
//
// ```text
// ┌─────────────────────────────────────────────────┐
// │         NetworkEngine completion workers        │
// ├─────────────────────────────────────────────────┤
// │        AsyncIoProvider (uniform trait)          │
// ├─────────────────────────────────────────────────┤
// │  IOCP / RIO / epoll / io_uring / kqueue backend │
// └─────────────────────────────────────────────────┘
// ```
//
// Sessions submit sends and receives against raw buffer pointers that stay
// pinned inside pool-owned session slots; completion workers harvest
// `CompletionEntry` batches and resolve them back to sessions through the
// opaque 64-bit correlation context.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

use crate::common::SocketHandle;

// ============================================================================
// Backends
// ============================================================================

mod platform;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
mod uring;

#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(windows)]
mod iocp;

#[cfg(windows)]
mod rio;

pub use platform::{detect_platform, PlatformInfo, PlatformKind};

#[cfg(target_os = "linux")]
pub use epoll::EpollProvider;

#[cfg(target_os = "linux")]
pub use uring::UringProvider;

#[cfg(target_os = "macos")]
pub use kqueue::KqueueProvider;

#[cfg(windows)]
pub use iocp::IocpProvider;

#[cfg(windows)]
pub use rio::RioProvider;

// ============================================================================
// Constants
// ============================================================================

/// Default submission/completion queue depth.
pub const DEFAULT_QUEUE_DEPTH: u32 = 4096;

/// Default maximum concurrent operations per provider.
pub const DEFAULT_MAX_CONCURRENT: u32 = 10_000;

/// Largest completion batch a single `process_completions` call drains.
pub const MAX_COMPLETION_BATCH: usize = 256;

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Closed provider error set. Success is the `Ok` arm of `IoResult`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider not initialized")]
    NotInitialized,

    #[error("invalid socket")]
    InvalidSocket,

    #[error("operation already pending")]
    OperationPending,

    #[error("operation failed")]
    OperationFailed,

    #[error("invalid buffer")]
    InvalidBuffer,

    #[error("no resources")]
    NoResources,

    #[error("timeout")]
    Timeout,

    #[error("platform not supported")]
    PlatformNotSupported,

    #[error("provider already initialized")]
    AlreadyInitialized,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("allocation failed")]
    AllocationFailed,

    #[error("resource exhausted")]
    ResourceExhausted,
}

pub type IoResult<T> = std::result::Result<T, ProviderError>;

// ============================================================================
// Completion Types
// ============================================================================

/// Kind of asynchronous operation a completion refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Send = 0,
    Recv = 1,
    Accept = 2,
    Connect = 3,
    Timeout = 4,
    Error = 5,
}

/// One harvested completion.
///
/// `result` is the number of bytes transferred when non-negative; a negative
/// value indicates failure with the OS detail in `os_error`.
#[derive(Debug, Clone, Copy)]
pub struct CompletionEntry {
    /// Caller-supplied correlation context from the submit call.
    pub context: u64,

    /// Operation tag.
    pub op: OpKind,

    /// Bytes transferred (>= 0) or error indicator (< 0).
    pub result: i64,

    /// OS error code when `result < 0`, otherwise 0.
    pub os_error: i32,

    /// Harvest timestamp, when the backend records one.
    pub completed_at: Option<Instant>,
}

impl Default for CompletionEntry {
    fn default() -> Self {
        Self {
            context: 0,
            op: OpKind::Error,
            result: -1,
            os_error: 0,
            completed_at: None,
        }
    }
}

impl CompletionEntry {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.result >= 0
    }

    #[inline]
    pub fn bytes_transferred(&self) -> Option<usize> {
        if self.result >= 0 {
            Some(self.result as usize)
        } else {
            None
        }
    }
}

// ============================================================================
// Poll Timeout
// ============================================================================

/// Wait behaviour for `process_completions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTimeout {
    /// Return immediately, possibly with zero completions.
    NonBlocking,
    /// Wait up to the given number of milliseconds.
    Millis(u32),
    /// Wait until at least one completion arrives.
    Infinite,
}

impl PollTimeout {
    /// Millisecond encoding used by the kernel interfaces:
    /// `0` non-blocking, positive bounded wait, `-1` infinite.
    #[inline]
    pub fn as_raw_millis(&self) -> i32 {
        match self {
            PollTimeout::NonBlocking => 0,
            PollTimeout::Millis(ms) => *ms as i32,
            PollTimeout::Infinite => -1,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time provider statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub total_completions: u64,
    pub pending: u64,
    pub errors: u64,
}

/// Atomic counters backing `ProviderStats`, shared by the backends.
#[derive(Debug, Default)]
pub(crate) struct ProviderCounters {
    pub requests: AtomicU64,
    pub completions: AtomicU64,
    pub pending: AtomicU64,
    pub errors: AtomicU64,
}

impl ProviderCounters {
    #[inline]
    pub fn on_submit(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a pending operation without a completion (cancelled / discarded).
    #[inline]
    pub fn on_discard(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProviderStats {
        ProviderStats {
            total_requests: self.requests.load(Ordering::Relaxed),
            total_completions: self.completions.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Uniform asynchronous I/O provider.
///
/// Buffer pointers passed to `send_async`/`recv_async` must stay valid and
/// unmoved until the matching completion is harvested; the session layer
/// guarantees this by pinning context buffers inside pool-owned slots.
pub trait AsyncIoProvider: Send + Sync {
    /// Prepare kernel resources. Fails with `AlreadyInitialized` when called
    /// twice without an intervening `shutdown`.
    fn initialize(&self, queue_depth: u32, max_concurrent: u32) -> IoResult<()>;

    /// Release kernel resources and discard pending operations.
    fn shutdown(&self);

    /// Which backend this provider drives.
    fn platform(&self) -> PlatformKind;

    /// Associate a socket with the provider. Clears any stale pending state a
    /// reused handle might otherwise inherit.
    fn register_socket(&self, socket: SocketHandle) -> IoResult<()>;

    /// Detach a socket and discard its pending operations.
    fn unregister_socket(&self, socket: SocketHandle) -> IoResult<()>;

    /// Register a buffer for the fast path. Meaningful for RIO and io_uring;
    /// other backends return -1.
    fn register_buffer(&self, buffer: *const u8, size: u32) -> i64;

    /// Submit an asynchronous send of `size` bytes at `data`.
    fn send_async(
        &self,
        socket: SocketHandle,
        data: *const u8,
        size: u32,
        context: u64,
        flags: u32,
    ) -> IoResult<()>;

    /// Submit an asynchronous receive of up to `size` bytes into `buffer`.
    fn recv_async(
        &self,
        socket: SocketHandle,
        buffer: *mut u8,
        size: u32,
        context: u64,
        flags: u32,
    ) -> IoResult<()>;

    /// Push batched submissions to the kernel. No-op for IOCP and the
    /// readiness backends.
    fn flush_requests(&self) -> IoResult<()>;

    /// Harvest up to `entries.len()` completions, waiting per `timeout`.
    /// Returns the number of entries filled.
    fn process_completions(
        &self,
        entries: &mut [CompletionEntry],
        timeout: PollTimeout,
    ) -> IoResult<usize>;

    /// Number of submitted operations not yet completed.
    fn pending_count(&self) -> usize;

    /// Cumulative statistics snapshot.
    fn stats(&self) -> ProviderStats;

    /// Human-readable detail for the most recent failure.
    fn last_error(&self) -> String;
}

// ============================================================================
// Provider Construction
// ============================================================================

/// Build the best provider for this host, or the one forced by `hint`.
///
/// Detection prefers the high-performance backend and falls back along
/// [RIO → IOCP], [io_uring → epoll]; macOS always uses kqueue. A hint naming
/// a backend this host cannot run fails with `PlatformNotSupported`.
pub fn create_provider(hint: Option<&str>) -> IoResult<std::sync::Arc<dyn AsyncIoProvider>> {
    let info = detect_platform();

    let kind = match hint {
        Some(name) => {
            let forced = PlatformKind::parse(name).ok_or(ProviderError::InvalidParameter)?;
            if !info.supports(forced) {
                return Err(ProviderError::PlatformNotSupported);
            }
            forced
        }
        None => info.preferred(),
    };

    tracing::info!(
        backend = kind.name(),
        os = info.name,
        major = info.major,
        minor = info.minor,
        "async I/O provider selected"
    );

    instantiate(kind)
}

#[cfg(target_os = "linux")]
fn instantiate(kind: PlatformKind) -> IoResult<std::sync::Arc<dyn AsyncIoProvider>> {
    match kind {
        PlatformKind::IoUring => Ok(std::sync::Arc::new(UringProvider::new())),
        PlatformKind::Epoll => Ok(std::sync::Arc::new(EpollProvider::new())),
        _ => Err(ProviderError::PlatformNotSupported),
    }
}

#[cfg(target_os = "macos")]
fn instantiate(kind: PlatformKind) -> IoResult<std::sync::Arc<dyn AsyncIoProvider>> {
    match kind {
        PlatformKind::Kqueue => Ok(std::sync::Arc::new(KqueueProvider::new())),
        _ => Err(ProviderError::PlatformNotSupported),
    }
}

#[cfg(windows)]
fn instantiate(kind: PlatformKind) -> IoResult<std::sync::Arc<dyn AsyncIoProvider>> {
    match kind {
        PlatformKind::Rio => Ok(std::sync::Arc::new(RioProvider::new())),
        PlatformKind::Iocp => Ok(std::sync::Arc::new(IocpProvider::new())),
        _ => Err(ProviderError::PlatformNotSupported),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn instantiate(_kind: PlatformKind) -> IoResult<std::sync::Arc<dyn AsyncIoProvider>> {
    Err(ProviderError::PlatformNotSupported)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_raw_encoding() {
        assert_eq!(PollTimeout::NonBlocking.as_raw_millis(), 0);
        assert_eq!(PollTimeout::Millis(250).as_raw_millis(), 250);
        assert_eq!(PollTimeout::Infinite.as_raw_millis(), -1);
    }

    #[test]
    fn test_completion_entry_accessors() {
        let ok = CompletionEntry {
            context: 7,
            op: OpKind::Recv,
            result: 128,
            os_error: 0,
            completed_at: None,
        };
        assert!(ok.is_success());
        assert_eq!(ok.bytes_transferred(), Some(128));

        let err = CompletionEntry {
            result: -1,
            os_error: 104,
            ..Default::default()
        };
        assert!(!err.is_success());
        assert_eq!(err.bytes_transferred(), None);
    }

    #[test]
    fn test_counters_lifecycle() {
        let counters = ProviderCounters::default();
        counters.on_submit();
        counters.on_submit();
        counters.on_complete();

        let stats = counters.snapshot();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_completions, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_create_provider_rejects_unknown_hint() {
        assert!(matches!(
            create_provider(Some("carrier-pigeon")),
            Err(ProviderError::InvalidParameter)
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_create_provider_rejects_foreign_backend() {
        assert!(matches!(
            create_provider(Some("iocp")),
            Err(ProviderError::PlatformNotSupported)
        ));
    }

    #[test]
    fn test_create_provider_default_selection() {
        let provider = create_provider(None).expect("host platform should be supported");
        let info = detect_platform();
        assert_eq!(provider.platform(), info.preferred());
    }
}
