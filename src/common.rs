// # Shared Types and Constants
//
// Identifiers, socket handle plumbing and time helpers shared by the
// engine subsystems.

use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Identifiers
// ============================================================================

/// Per-process connection identifier. Monotonically increasing, minted by the
/// session manager at accept time, never reused for the process lifetime.
pub type ConnectionId = u64;

// ============================================================================
// Socket Handles
// ============================================================================

/// Raw OS socket handle.
#[cfg(unix)]
pub type SocketHandle = std::os::unix::io::RawFd;

/// Raw OS socket handle.
#[cfg(windows)]
pub type SocketHandle = std::os::windows::io::RawSocket;

/// Sentinel bits stored in a session's atomic socket slot when no socket is
/// attached. Distinct from every valid handle on all supported platforms.
pub const INVALID_SOCKET_BITS: i64 = -1;

/// Pack a socket handle into the session's atomic slot representation.
#[inline]
pub fn socket_to_bits(socket: SocketHandle) -> i64 {
    socket as i64
}

/// Unpack a socket handle from the session's atomic slot representation.
/// Returns `None` for the invalid sentinel.
#[inline]
pub fn socket_from_bits(bits: i64) -> Option<SocketHandle> {
    if bits == INVALID_SOCKET_BITS {
        None
    } else {
        Some(bits as SocketHandle)
    }
}

/// Detach a std TCP stream into a raw handle the provider can own.
#[cfg(unix)]
pub fn stream_into_handle(stream: std::net::TcpStream) -> SocketHandle {
    use std::os::unix::io::IntoRawFd;
    stream.into_raw_fd()
}

/// Detach a std TCP stream into a raw handle the provider can own.
#[cfg(windows)]
pub fn stream_into_handle(stream: std::net::TcpStream) -> SocketHandle {
    use std::os::windows::io::IntoRawSocket;
    stream.into_raw_socket()
}

/// Close a raw socket handle.
pub fn close_socket(socket: SocketHandle) {
    #[cfg(unix)]
    unsafe {
        libc::close(socket);
    }

    #[cfg(windows)]
    unsafe {
        windows_sys::Win32::Networking::WinSock::closesocket(socket as usize);
    }
}

// ============================================================================
// Engine Constants
// ============================================================================

/// Maximum total frame size on the wire, header included.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Largest payload accepted by a single `Session::send` call.
pub const SEND_BUFFER_SIZE: usize = 4096;

/// Size of the per-session receive context buffer handed to the provider.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Back-pressure limit for a session's outbound queue. Sends past this depth
/// are dropped and logged rather than queued.
pub const MAX_SEND_QUEUE_DEPTH: usize = 256;

/// Receive accumulation cap. A peer that exceeds it is disconnected.
pub const MAX_RECV_ACCUM_SIZE: usize = MAX_PACKET_SIZE * 4;

/// Default maximum simultaneous connections.
pub const MAX_CONNECTIONS: usize = 10_000;

// ============================================================================
// Time Helpers
// ============================================================================

/// Milliseconds since the Unix epoch.
#[inline]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock timestamp formatted for DB records (`YYYY-MM-DD HH:MM:SS`).
pub fn now_timestamp_string() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ============================================================================
// Tests
// ============================================================================
