// # Windows IOCP Backend
//
// Overlapped I/O against a completion port. Each registered socket owns two
// embedded overlapped blocks (one per direction) whose addresses never move;
// a write-mostly index maps OVERLAPPED pointers back to their socket and
// direction so completion resolution takes no per-completion lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::Networking::WinSock::{
    WSAGetLastError, WSARecv, WSASend, SOCKET, SOCKET_ERROR, WSABUF, WSA_IO_PENDING,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
};

use super::{
    AsyncIoProvider, CompletionEntry, IoResult, OpKind, PlatformKind, PollTimeout,
    ProviderCounters, ProviderError, ProviderStats,
};
use crate::common::SocketHandle;

// ============================================================================
// Overlapped Blocks
// ============================================================================

/// One direction's overlapped state, embedded in the socket registration so
/// its address stays stable for the kernel.
#[repr(C)]
struct OverlappedBlock {
    overlapped: UnsafeCell<OVERLAPPED>,
    wsabuf: UnsafeCell<WSABUF>,
    context: AtomicU64,
    in_flight: AtomicBool,
}

impl OverlappedBlock {
    fn new() -> Self {
        Self {
            overlapped: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            wsabuf: UnsafeCell::new(WSABUF {
                len: 0,
                buf: std::ptr::null_mut(),
            }),
            context: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    #[inline]
    fn overlapped_addr(&self) -> usize {
        self.overlapped.get() as usize
    }

    fn arm(&self, buf: *mut u8, len: u32, context: u64) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        unsafe {
            *self.overlapped.get() = std::mem::zeroed();
            *self.wsabuf.get() = WSABUF { len, buf };
        }
        self.context.store(context, Ordering::Release);
        true
    }
}

unsafe impl Send for OverlappedBlock {}
unsafe impl Sync for OverlappedBlock {}

struct SocketOps {
    recv: OverlappedBlock,
    send: OverlappedBlock,
}

#[derive(Clone, Copy)]
struct OvSlot {
    socket: u64,
    kind: OpKind,
}

// ============================================================================
// IocpProvider
// ============================================================================

pub struct IocpProvider {
    port: AtomicIsize,
    initialized: AtomicBool,
    sockets: DashMap<u64, Arc<SocketOps>>,
    ov_index: DashMap<usize, OvSlot>,
    counters: ProviderCounters,
    last_error: Mutex<String>,
}

impl IocpProvider {
    pub fn new() -> Self {
        Self {
            port: AtomicIsize::new(INVALID_HANDLE_VALUE as isize),
            initialized: AtomicBool::new(false),
            sockets: DashMap::new(),
            ov_index: DashMap::new(),
            counters: ProviderCounters::default(),
            last_error: Mutex::new(String::new()),
        }
    }

    fn set_last_error(&self, msg: String) {
        self.counters.on_error();
        *self.last_error.lock() = msg;
    }

    fn port(&self) -> IoResult<HANDLE> {
        let port = self.port.load(Ordering::Acquire) as HANDLE;
        if port == INVALID_HANDLE_VALUE || port.is_null() {
            return Err(ProviderError::NotInitialized);
        }
        Ok(port)
    }

    fn socket_ops(&self, socket: u64) -> IoResult<Arc<SocketOps>> {
        self.sockets
            .get(&socket)
            .map(|e| e.value().clone())
            .ok_or(ProviderError::InvalidSocket)
    }
}

impl Default for IocpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IocpProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AsyncIoProvider for IocpProvider {
    fn initialize(&self, _queue_depth: u32, max_concurrent: u32) -> IoResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::AlreadyInitialized);
        }

        let port = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, max_concurrent)
        };
        if port.is_null() {
            self.set_last_error("CreateIoCompletionPort failed".to_string());
            return Err(ProviderError::AllocationFailed);
        }

        self.port.store(port as isize, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        tracing::debug!("iocp provider initialized");
        Ok(())
    }

    fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }

        let port = self
            .port
            .swap(INVALID_HANDLE_VALUE as isize, Ordering::AcqRel) as HANDLE;
        if port != INVALID_HANDLE_VALUE && !port.is_null() {
            unsafe {
                CloseHandle(port);
            }
        }

        for entry in self.sockets.iter() {
            if entry.value().recv.in_flight.load(Ordering::Acquire) {
                self.counters.on_discard();
            }
            if entry.value().send.in_flight.load(Ordering::Acquire) {
                self.counters.on_discard();
            }
        }
        self.sockets.clear();
        self.ov_index.clear();
        tracing::debug!("iocp provider shut down");
    }

    fn platform(&self) -> PlatformKind {
        PlatformKind::Iocp
    }

    fn register_socket(&self, socket: SocketHandle) -> IoResult<()> {
        let port = self.port()?;
        let key = socket as u64;

        let attached =
            unsafe { CreateIoCompletionPort(socket as HANDLE, port, key as usize, 0) };
        if attached.is_null() {
            self.set_last_error(format!("socket {key} association failed"));
            return Err(ProviderError::InvalidSocket);
        }

        if let Some((_, old)) = self.sockets.remove(&key) {
            self.ov_index.remove(&old.recv.overlapped_addr());
            self.ov_index.remove(&old.send.overlapped_addr());
        }

        let ops = Arc::new(SocketOps {
            recv: OverlappedBlock::new(),
            send: OverlappedBlock::new(),
        });
        self.ov_index.insert(
            ops.recv.overlapped_addr(),
            OvSlot {
                socket: key,
                kind: OpKind::Recv,
            },
        );
        self.ov_index.insert(
            ops.send.overlapped_addr(),
            OvSlot {
                socket: key,
                kind: OpKind::Send,
            },
        );
        self.sockets.insert(key, ops);
        Ok(())
    }

    fn unregister_socket(&self, socket: SocketHandle) -> IoResult<()> {
        let key = socket as u64;
        if let Some((_, old)) = self.sockets.remove(&key) {
            self.ov_index.remove(&old.recv.overlapped_addr());
            self.ov_index.remove(&old.send.overlapped_addr());
            if old.recv.in_flight.load(Ordering::Acquire) {
                self.counters.on_discard();
            }
            if old.send.in_flight.load(Ordering::Acquire) {
                self.counters.on_discard();
            }
        }
        Ok(())
    }

    fn register_buffer(&self, _buffer: *const u8, _size: u32) -> i64 {
        -1
    }

    fn send_async(
        &self,
        socket: SocketHandle,
        data: *const u8,
        size: u32,
        context: u64,
        flags: u32,
    ) -> IoResult<()> {
        if data.is_null() || size == 0 {
            return Err(ProviderError::InvalidBuffer);
        }

        let key = socket as u64;
        let ops = self.socket_ops(key)?;
        if !ops.send.arm(data as *mut u8, size, context) {
            return Err(ProviderError::OperationPending);
        }

        self.counters.on_submit();
        let rc = unsafe {
            WSASend(
                socket as SOCKET,
                ops.send.wsabuf.get(),
                1,
                std::ptr::null_mut(),
                flags,
                ops.send.overlapped.get(),
                None,
            )
        };

        if rc == SOCKET_ERROR {
            let err = unsafe { WSAGetLastError() };
            if err != WSA_IO_PENDING {
                ops.send.in_flight.store(false, Ordering::Release);
                self.counters.on_discard();
                self.set_last_error(format!("WSASend failed: {err}"));
                return Err(ProviderError::OperationFailed);
            }
        }
        Ok(())
    }

    fn recv_async(
        &self,
        socket: SocketHandle,
        buffer: *mut u8,
        size: u32,
        context: u64,
        flags: u32,
    ) -> IoResult<()> {
        if buffer.is_null() || size == 0 {
            return Err(ProviderError::InvalidBuffer);
        }

        let key = socket as u64;
        let ops = self.socket_ops(key)?;
        if !ops.recv.arm(buffer, size, context) {
            return Err(ProviderError::OperationPending);
        }

        self.counters.on_submit();
        let mut recv_flags = flags;
        let rc = unsafe {
            WSARecv(
                socket as SOCKET,
                ops.recv.wsabuf.get(),
                1,
                std::ptr::null_mut(),
                &mut recv_flags,
                ops.recv.overlapped.get(),
                None,
            )
        };

        if rc == SOCKET_ERROR {
            let err = unsafe { WSAGetLastError() };
            if err != WSA_IO_PENDING {
                ops.recv.in_flight.store(false, Ordering::Release);
                self.counters.on_discard();
                self.set_last_error(format!("WSARecv failed: {err}"));
                return Err(ProviderError::OperationFailed);
            }
        }
        Ok(())
    }

    fn flush_requests(&self) -> IoResult<()> {
        // IOCP submits eagerly; nothing is batched.
        Ok(())
    }

    fn process_completions(
        &self,
        entries: &mut [CompletionEntry],
        timeout: PollTimeout,
    ) -> IoResult<usize> {
        let port = self.port()?;
        if entries.is_empty() {
            return Err(ProviderError::InvalidParameter);
        }

        let timeout_ms = match timeout {
            PollTimeout::NonBlocking => 0u32,
            PollTimeout::Millis(ms) => ms,
            PollTimeout::Infinite => u32::MAX,
        };

        let max = entries.len().min(128);
        let mut raw: Vec<OVERLAPPED_ENTRY> = vec![unsafe { std::mem::zeroed() }; max];
        let mut removed: u32 = 0;

        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                port,
                raw.as_mut_ptr(),
                max as u32,
                &mut removed,
                timeout_ms,
                0,
            )
        };

        if ok == 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) {
                return Ok(0);
            }
            self.set_last_error(format!("GetQueuedCompletionStatusEx failed: {err}"));
            return Err(ProviderError::OperationFailed);
        }

        let mut count = 0;
        for raw_entry in raw.iter().take(removed as usize) {
            let ov = raw_entry.lpOverlapped;
            if ov.is_null() {
                continue;
            }

            let Some(slot) = self.ov_index.get(&(ov as usize)).map(|s| *s.value()) else {
                continue;
            };
            let Some(ops) = self.sockets.get(&slot.socket).map(|e| e.value().clone()) else {
                continue;
            };

            let block = match slot.kind {
                OpKind::Send => &ops.send,
                _ => &ops.recv,
            };
            let context = block.context.load(Ordering::Acquire);
            block.in_flight.store(false, Ordering::Release);

            let status = unsafe { (*ov).Internal };
            let bytes = raw_entry.dwNumberOfBytesTransferred;

            entries[count] = if status == 0 {
                CompletionEntry {
                    context,
                    op: slot.kind,
                    result: bytes as i64,
                    os_error: 0,
                    completed_at: Some(Instant::now()),
                }
            } else {
                CompletionEntry {
                    context,
                    op: slot.kind,
                    result: -1,
                    os_error: status as i32,
                    completed_at: Some(Instant::now()),
                }
            };
            count += 1;
            self.counters.on_complete();
        }

        Ok(count)
    }

    fn pending_count(&self) -> usize {
        self.counters.pending.load(Ordering::Relaxed) as usize
    }

    fn stats(&self) -> ProviderStats {
        self.counters.snapshot()
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }
}
