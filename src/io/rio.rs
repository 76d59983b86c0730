// # Windows Registered I/O Backend
//
// RIO keeps buffers registered with the kernel ahead of time and posts
// requests to per-socket request queues, trading setup cost for a
// syscall-free hot path. Submissions must target a registered buffer: a send
// or receive on an unregistered address fails with `InvalidBuffer` rather
// than silently degrading to the IOCP path.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use windows_sys::Win32::Networking::WinSock::{
    WSAGetLastError, WSAIoctl, RIORESULT, RIO_BUF, RIO_BUFFERID, RIO_CQ,
    RIO_EXTENSION_FUNCTION_TABLE, RIO_INVALID_BUFFERID, RIO_INVALID_CQ, RIO_INVALID_RQ, RIO_RQ,
    SIO_GET_MULTIPLE_EXTENSION_FUNCTION_POINTER, SOCKET, SOCKET_ERROR, WSAID_MULTIPLE_RIO,
};

use super::{
    AsyncIoProvider, CompletionEntry, IoResult, OpKind, PlatformKind, PollTimeout,
    ProviderCounters, ProviderError, ProviderStats, DEFAULT_QUEUE_DEPTH,
};
use crate::common::SocketHandle;

// ============================================================================
// Registered Buffers
// ============================================================================

#[derive(Clone, Copy)]
struct RegisteredBuffer {
    id: RIO_BUFFERID,
    base: u64,
    len: u32,
}

#[derive(Clone, Copy)]
struct PendingOp {
    kind: OpKind,
    context: u64,
    len: u32,
}

// ============================================================================
// RioProvider
// ============================================================================

pub struct RioProvider {
    table: Mutex<Option<RIO_EXTENSION_FUNCTION_TABLE>>,
    cq: Mutex<RIO_CQ>,
    initialized: AtomicBool,
    queue_depth: AtomicU64,
    request_queues: DashMap<u64, RIO_RQ>,
    buffers: Mutex<Vec<RegisteredBuffer>>,
    pending: DashMap<u64, PendingOp>,
    next_key: AtomicU64,
    counters: ProviderCounters,
    last_error: Mutex<String>,
}

unsafe impl Send for RioProvider {}
unsafe impl Sync for RioProvider {}

impl RioProvider {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(None),
            cq: Mutex::new(RIO_INVALID_CQ),
            initialized: AtomicBool::new(false),
            queue_depth: AtomicU64::new(DEFAULT_QUEUE_DEPTH as u64),
            request_queues: DashMap::new(),
            buffers: Mutex::new(Vec::new()),
            pending: DashMap::new(),
            next_key: AtomicU64::new(1),
            counters: ProviderCounters::default(),
            last_error: Mutex::new(String::new()),
        }
    }

    fn set_last_error(&self, msg: String) {
        self.counters.on_error();
        *self.last_error.lock() = msg;
    }

    /// Resolve the RIO function table through a throwaway socket.
    fn load_function_table(probe: SOCKET) -> Option<RIO_EXTENSION_FUNCTION_TABLE> {
        let mut table: RIO_EXTENSION_FUNCTION_TABLE = unsafe { std::mem::zeroed() };
        table.cbSize = std::mem::size_of::<RIO_EXTENSION_FUNCTION_TABLE>() as u32;
        let mut guid = WSAID_MULTIPLE_RIO;
        let mut bytes: u32 = 0;

        let rc = unsafe {
            WSAIoctl(
                probe,
                SIO_GET_MULTIPLE_EXTENSION_FUNCTION_POINTER,
                &mut guid as *mut _ as *mut _,
                std::mem::size_of_val(&guid) as u32,
                &mut table as *mut _ as *mut _,
                table.cbSize,
                &mut bytes,
                std::ptr::null_mut(),
                None,
            )
        };

        if rc == SOCKET_ERROR {
            None
        } else {
            Some(table)
        }
    }

    /// Translate a raw address range into a registered-buffer descriptor.
    fn resolve(&self, addr: u64, len: u32) -> Option<RIO_BUF> {
        let buffers = self.buffers.lock();
        for reg in buffers.iter() {
            if addr >= reg.base && addr + len as u64 <= reg.base + reg.len as u64 {
                return Some(RIO_BUF {
                    BufferId: reg.id,
                    Offset: (addr - reg.base) as u32,
                    Length: len,
                });
            }
        }
        None
    }

    fn submit(
        &self,
        socket: SocketHandle,
        kind: OpKind,
        addr: u64,
        len: u32,
        context: u64,
        flags: u32,
    ) -> IoResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::NotInitialized);
        }

        let rio_buf = self.resolve(addr, len).ok_or(ProviderError::InvalidBuffer)?;
        let rq = *self
            .request_queues
            .get(&(socket as u64))
            .ok_or(ProviderError::InvalidSocket)?;

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(key, PendingOp { kind, context, len });

        let table_guard = self.table.lock();
        let table = table_guard.as_ref().ok_or(ProviderError::NotInitialized)?;

        let ok = unsafe {
            match kind {
                OpKind::Send => match table.RIOSend {
                    Some(f) => f(rq, &rio_buf, 1, flags, key as *mut _),
                    None => 0,
                },
                _ => match table.RIOReceive {
                    Some(f) => f(rq, &rio_buf as *const _ as *mut _, 1, flags, key as *mut _),
                    None => 0,
                },
            }
        };

        if ok == 0 {
            self.pending.remove(&key);
            let err = unsafe { WSAGetLastError() };
            self.set_last_error(format!("RIO request failed: {err}"));
            return Err(ProviderError::OperationFailed);
        }

        self.counters.on_submit();
        Ok(())
    }
}

impl Default for RioProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RioProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AsyncIoProvider for RioProvider {
    fn initialize(&self, queue_depth: u32, _max_concurrent: u32) -> IoResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::AlreadyInitialized);
        }

        let depth = if queue_depth == 0 {
            DEFAULT_QUEUE_DEPTH
        } else {
            queue_depth
        };
        self.queue_depth.store(depth as u64, Ordering::Release);

        let probe = unsafe {
            windows_sys::Win32::Networking::WinSock::socket(
                windows_sys::Win32::Networking::WinSock::AF_INET as i32,
                windows_sys::Win32::Networking::WinSock::SOCK_STREAM as i32,
                windows_sys::Win32::Networking::WinSock::IPPROTO_TCP,
            )
        };
        if probe == windows_sys::Win32::Networking::WinSock::INVALID_SOCKET {
            self.set_last_error("probe socket creation failed".to_string());
            return Err(ProviderError::AllocationFailed);
        }

        let table = Self::load_function_table(probe);
        unsafe {
            windows_sys::Win32::Networking::WinSock::closesocket(probe);
        }

        let Some(table) = table else {
            self.set_last_error("RIO extension table unavailable".to_string());
            return Err(ProviderError::PlatformNotSupported);
        };

        let cq = match table.RIOCreateCompletionQueue {
            Some(f) => unsafe { f(depth, std::ptr::null_mut()) },
            None => RIO_INVALID_CQ,
        };
        if cq == RIO_INVALID_CQ {
            self.set_last_error("RIO completion queue creation failed".to_string());
            return Err(ProviderError::AllocationFailed);
        }

        *self.table.lock() = Some(table);
        *self.cq.lock() = cq;
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(depth, "rio provider initialized");
        Ok(())
    }

    fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }

        let table_guard = self.table.lock();
        if let Some(table) = table_guard.as_ref() {
            let mut cq = self.cq.lock();
            if *cq != RIO_INVALID_CQ {
                if let Some(close) = table.RIOCloseCompletionQueue {
                    unsafe { close(*cq) };
                }
                *cq = RIO_INVALID_CQ;
            }

            if let Some(dereg) = table.RIODeregisterBuffer {
                for reg in self.buffers.lock().drain(..) {
                    unsafe { dereg(reg.id) };
                }
            }
        }
        drop(table_guard);
        *self.table.lock() = None;

        self.request_queues.clear();
        for _ in 0..self.pending.len() {
            self.counters.on_discard();
        }
        self.pending.clear();
        tracing::debug!("rio provider shut down");
    }

    fn platform(&self) -> PlatformKind {
        PlatformKind::Rio
    }

    fn register_socket(&self, socket: SocketHandle) -> IoResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::NotInitialized);
        }

        let depth = (self.queue_depth.load(Ordering::Acquire) as u32).max(16);
        let per_socket = depth.min(128);

        let table_guard = self.table.lock();
        let table = table_guard.as_ref().ok_or(ProviderError::NotInitialized)?;
        let cq = *self.cq.lock();

        let rq = match table.RIOCreateRequestQueue {
            Some(f) => unsafe {
                f(
                    socket as SOCKET,
                    per_socket,
                    1,
                    per_socket,
                    1,
                    cq,
                    cq,
                    socket as u64 as *mut _,
                )
            },
            None => RIO_INVALID_RQ,
        };

        if rq == RIO_INVALID_RQ {
            let err = unsafe { WSAGetLastError() };
            self.set_last_error(format!("RIO request queue creation failed: {err}"));
            return Err(ProviderError::InvalidSocket);
        }

        self.request_queues.insert(socket as u64, rq);
        Ok(())
    }

    fn unregister_socket(&self, socket: SocketHandle) -> IoResult<()> {
        self.request_queues.remove(&(socket as u64));
        Ok(())
    }

    fn register_buffer(&self, buffer: *const u8, size: u32) -> i64 {
        if buffer.is_null() || size == 0 {
            return -1;
        }
        if !self.initialized.load(Ordering::Acquire) {
            return -1;
        }

        let table_guard = self.table.lock();
        let Some(table) = table_guard.as_ref() else {
            return -1;
        };

        let id = match table.RIORegisterBuffer {
            Some(f) => unsafe { f(buffer as *mut _, size) },
            None => RIO_INVALID_BUFFERID,
        };
        if id == RIO_INVALID_BUFFERID {
            return -1;
        }

        let mut buffers = self.buffers.lock();
        buffers.push(RegisteredBuffer {
            id,
            base: buffer as u64,
            len: size,
        });
        (buffers.len() - 1) as i64
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
        self.submit(socket, OpKind::Send, data as u64, size, context, flags)
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
        self.submit(socket, OpKind::Recv, buffer as u64, size, context, flags)
    }

    fn flush_requests(&self) -> IoResult<()> {
        // Requests were posted with commit semantics; nothing further to push.
        Ok(())
    }

    fn process_completions(
        &self,
        entries: &mut [CompletionEntry],
        timeout: PollTimeout,
    ) -> IoResult<usize> {
        if entries.is_empty() {
            return Err(ProviderError::InvalidParameter);
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::NotInitialized);
        }

        let deadline = match timeout {
            PollTimeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms as u64)),
            _ => None,
        };

        loop {
            let drained = {
                let table_guard = self.table.lock();
                let table = table_guard.as_ref().ok_or(ProviderError::NotInitialized)?;
                let cq = *self.cq.lock();

                let max = entries.len().min(128);
                let mut results: Vec<RIORESULT> = vec![unsafe { std::mem::zeroed() }; max];

                let n = match table.RIODequeueCompletion {
                    Some(f) => unsafe { f(cq, results.as_mut_ptr(), max as u32) },
                    None => 0,
                };

                let mut count = 0;
                for result in results.iter().take(n as usize) {
                    let key = result.RequestContext as u64;
                    let Some((_, op)) = self.pending.remove(&key) else {
                        continue;
                    };

                    entries[count] = if result.Status == 0 {
                        CompletionEntry {
                            context: op.context,
                            op: op.kind,
                            result: result.BytesTransferred as i64,
                            os_error: 0,
                            completed_at: Some(Instant::now()),
                        }
                    } else {
                        CompletionEntry {
                            context: op.context,
                            op: op.kind,
                            result: -1,
                            os_error: result.Status,
                            completed_at: Some(Instant::now()),
                        }
                    };
                    count += 1;
                    self.counters.on_complete();
                }
                count
            };

            if drained > 0 {
                return Ok(drained);
            }

            match timeout {
                PollTimeout::NonBlocking => return Ok(0),
                PollTimeout::Millis(_) => {
                    if Instant::now() >= deadline.unwrap_or_else(Instant::now) {
                        return Ok(0);
                    }
                    std::thread::sleep(Duration::from_micros(500));
                }
                PollTimeout::Infinite => std::thread::sleep(Duration::from_micros(500)),
            }
        }
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
