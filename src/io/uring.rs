// # Linux io_uring Backend
//
// Submission-based provider over a real kernel ring. Each `send_async` /
// `recv_async` stages one SQE keyed by a per-request correlation id;
// `flush_requests` pushes staged entries to the kernel and
// `process_completions` harvests CQEs.
//
// The ring is created without `IORING_SETUP_IOPOLL`: polled completion mode
// requires polled file descriptors and does not apply to network sockets.
// Short sends are resubmitted for the remainder so a frame never completes
// torn.

use dashmap::DashMap;
use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{
    AsyncIoProvider, CompletionEntry, IoResult, OpKind, PlatformKind, PollTimeout,
    ProviderCounters, ProviderError, ProviderStats, DEFAULT_QUEUE_DEPTH,
};
use crate::common::SocketHandle;

// ============================================================================
// Pending Operations
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PendingOp {
    kind: OpKind,
    fd: RawFd,
    buffer: u64,
    len: u32,
    /// Bytes already transferred by earlier short completions (sends only).
    done: u32,
    context: u64,
}

// ============================================================================
// UringProvider
// ============================================================================

pub struct UringProvider {
    ring: Mutex<Option<IoUring>>,
    pending: DashMap<u64, PendingOp>,
    next_key: AtomicU64,
    registered: Mutex<Vec<libc::iovec>>,
    counters: ProviderCounters,
    last_error: Mutex<String>,
}

// iovec carries raw pointers; registration addresses are caller-pinned.
unsafe impl Send for UringProvider {}
unsafe impl Sync for UringProvider {}

impl UringProvider {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(None),
            pending: DashMap::new(),
            next_key: AtomicU64::new(1),
            registered: Mutex::new(Vec::new()),
            counters: ProviderCounters::default(),
            last_error: Mutex::new(String::new()),
        }
    }

    fn set_last_error(&self, msg: String) {
        self.counters.on_error();
        *self.last_error.lock() = msg;
    }

    #[inline]
    fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    fn build_sqe(op: &PendingOp, key: u64) -> squeue::Entry {
        match op.kind {
            OpKind::Send => opcode::Send::new(
                types::Fd(op.fd),
                (op.buffer + op.done as u64) as *const u8,
                op.len - op.done,
            )
            .build()
            .user_data(key),
            _ => opcode::Recv::new(types::Fd(op.fd), op.buffer as *mut u8, op.len)
                .build()
                .user_data(key),
        }
    }

    /// Stage one SQE, submitting once to make room if the queue is full.
    fn push_sqe(&self, ring: &mut IoUring, sqe: &squeue::Entry) -> IoResult<()> {
        let pushed = unsafe { ring.submission().push(sqe).is_ok() };
        if pushed {
            return Ok(());
        }

        if let Err(e) = ring.submit() {
            self.set_last_error(format!("io_uring submit failed: {e}"));
            return Err(ProviderError::OperationFailed);
        }

        let pushed = unsafe { ring.submission().push(sqe).is_ok() };
        if pushed {
            Ok(())
        } else {
            Err(ProviderError::NoResources)
        }
    }

    fn submit_op(&self, op: PendingOp) -> IoResult<()> {
        let key = self.next_key();
        let sqe = Self::build_sqe(&op, key);

        let mut guard = self.ring.lock();
        let ring = guard.as_mut().ok_or(ProviderError::NotInitialized)?;

        self.push_sqe(ring, &sqe)?;
        self.pending.insert(key, op);
        self.counters.on_submit();
        Ok(())
    }

    /// Drain whatever the completion ring currently holds. Returns filled
    /// entry count; short sends go back onto the submission ring.
    fn harvest(&self, ring: &mut IoUring, entries: &mut [CompletionEntry]) -> usize {
        let mut count = 0;
        let mut resubmit: Vec<squeue::Entry> = Vec::new();

        {
            let mut cq = ring.completion();
            while count < entries.len() {
                let Some(cqe) = cq.next() else {
                    break;
                };

                let key = cqe.user_data();
                let res = cqe.result();

                let Some((_, mut op)) = self.pending.remove(&key) else {
                    continue;
                };

                if op.kind == OpKind::Send && res > 0 && op.done + res as u32 > op.len {
                    // Kernel reported more than requested; treat as failure.
                    entries[count] = CompletionEntry {
                        context: op.context,
                        op: OpKind::Send,
                        result: -1,
                        os_error: libc::EIO,
                        completed_at: Some(Instant::now()),
                    };
                    count += 1;
                    self.counters.on_complete();
                    continue;
                }

                if op.kind == OpKind::Send && res > 0 && op.done + (res as u32) < op.len {
                    op.done += res as u32;
                    resubmit.push(Self::build_sqe(&op, key));
                    self.pending.insert(key, op);
                    continue;
                }

                let (result, os_error) = if res < 0 {
                    (-1i64, -res)
                } else if op.kind == OpKind::Send {
                    (op.len as i64, 0)
                } else {
                    (res as i64, 0)
                };

                entries[count] = CompletionEntry {
                    context: op.context,
                    op: op.kind,
                    result,
                    os_error,
                    completed_at: Some(Instant::now()),
                };
                count += 1;
                self.counters.on_complete();
            }
        }

        for sqe in &resubmit {
            if self.push_sqe(ring, sqe).is_err() {
                tracing::warn!("io_uring resubmission dropped: submission ring exhausted");
            }
        }
        if !resubmit.is_empty() {
            let _ = ring.submit();
        }

        count
    }
}

impl Default for UringProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UringProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AsyncIoProvider for UringProvider {
    fn initialize(&self, queue_depth: u32, _max_concurrent: u32) -> IoResult<()> {
        let mut guard = self.ring.lock();
        if guard.is_some() {
            return Err(ProviderError::AlreadyInitialized);
        }

        let depth = if queue_depth == 0 {
            DEFAULT_QUEUE_DEPTH
        } else {
            queue_depth.next_power_of_two()
        };

        match IoUring::new(depth) {
            Ok(ring) => {
                *guard = Some(ring);
                tracing::debug!(depth, "io_uring provider initialized");
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.set_last_error(format!("io_uring setup failed: {e}"));
                Err(ProviderError::AllocationFailed)
            }
        }
    }

    fn shutdown(&self) {
        let mut guard = self.ring.lock();
        if guard.take().is_none() {
            return;
        }
        drop(guard);

        for _ in 0..self.pending.len() {
            self.counters.on_discard();
        }
        self.pending.clear();
        self.registered.lock().clear();
        tracing::debug!("io_uring provider shut down");
    }

    fn platform(&self) -> PlatformKind {
        PlatformKind::IoUring
    }

    fn register_socket(&self, socket: SocketHandle) -> IoResult<()> {
        if self.ring.lock().is_none() {
            return Err(ProviderError::NotInitialized);
        }
        if socket < 0 {
            return Err(ProviderError::InvalidSocket);
        }

        // The ring addresses sockets directly; only stale pending state from
        // a reused fd needs clearing.
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|e| e.value().fd == socket)
            .map(|e| *e.key())
            .collect();
        for key in stale {
            if self.pending.remove(&key).is_some() {
                self.counters.on_discard();
            }
        }
        Ok(())
    }

    fn unregister_socket(&self, socket: SocketHandle) -> IoResult<()> {
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|e| e.value().fd == socket)
            .map(|e| *e.key())
            .collect();
        for key in stale {
            if self.pending.remove(&key).is_some() {
                self.counters.on_discard();
            }
        }
        Ok(())
    }

    fn register_buffer(&self, buffer: *const u8, size: u32) -> i64 {
        if buffer.is_null() || size == 0 {
            return -1;
        }

        let mut guard = self.ring.lock();
        let Some(ring) = guard.as_mut() else {
            return -1;
        };

        let mut registered = self.registered.lock();
        registered.push(libc::iovec {
            iov_base: buffer as *mut libc::c_void,
            iov_len: size as usize,
        });

        // The kernel replaces the whole table on each registration.
        let _ = ring.submitter().unregister_buffers();
        match unsafe { ring.submitter().register_buffers(&registered) } {
            Ok(()) => (registered.len() - 1) as i64,
            Err(e) => {
                registered.pop();
                drop(registered);
                drop(guard);
                self.set_last_error(format!("buffer registration failed: {e}"));
                -1
            }
        }
    }

    fn send_async(
        &self,
        socket: SocketHandle,
        data: *const u8,
        size: u32,
        context: u64,
        _flags: u32,
    ) -> IoResult<()> {
        if data.is_null() || size == 0 {
            return Err(ProviderError::InvalidBuffer);
        }

        self.submit_op(PendingOp {
            kind: OpKind::Send,
            fd: socket,
            buffer: data as u64,
            len: size,
            done: 0,
            context,
        })
    }

    fn recv_async(
        &self,
        socket: SocketHandle,
        buffer: *mut u8,
        size: u32,
        context: u64,
        _flags: u32,
    ) -> IoResult<()> {
        if buffer.is_null() || size == 0 {
            return Err(ProviderError::InvalidBuffer);
        }

        self.submit_op(PendingOp {
            kind: OpKind::Recv,
            fd: socket,
            buffer: buffer as u64,
            len: size,
            done: 0,
            context,
        })
    }

    fn flush_requests(&self) -> IoResult<()> {
        let mut guard = self.ring.lock();
        let ring = guard.as_mut().ok_or(ProviderError::NotInitialized)?;
        let result = ring.submit();
        drop(guard);

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_last_error(format!("io_uring submit failed: {e}"));
                Err(ProviderError::OperationFailed)
            }
        }
    }

    fn process_completions(
        &self,
        entries: &mut [CompletionEntry],
        timeout: PollTimeout,
    ) -> IoResult<usize> {
        if entries.is_empty() {
            return Err(ProviderError::InvalidParameter);
        }

        let deadline = match timeout {
            PollTimeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms as u64)),
            _ => None,
        };

        loop {
            {
                let mut guard = self.ring.lock();
                let ring = guard.as_mut().ok_or(ProviderError::NotInitialized)?;

                // Push anything staged since the last flush, then harvest.
                let _ = ring.submit();
                let count = self.harvest(ring, entries);
                if count > 0 {
                    return Ok(count);
                }
            }

            match timeout {
                PollTimeout::NonBlocking => return Ok(0),
                PollTimeout::Millis(_) => {
                    if Instant::now() >= deadline.unwrap_or_else(Instant::now) {
                        return Ok(0);
                    }
                    std::thread::sleep(Duration::from_micros(500));
                }
                PollTimeout::Infinite => {
                    std::thread::sleep(Duration::from_micros(500));
                }
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

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn uring_available() -> bool {
        IoUring::new(8).is_ok()
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn poll_until_one(provider: &UringProvider, entries: &mut [CompletionEntry]) -> usize {
        for _ in 0..50 {
            let got = provider
                .process_completions(entries, PollTimeout::Millis(100))
                .unwrap();
            if got > 0 {
                return got;
            }
        }
        0
    }

    #[test]
    fn test_initialize_twice_fails() {
        if !uring_available() {
            return;
        }
        let provider = UringProvider::new();
        provider.initialize(64, 64).unwrap();
        assert_eq!(
            provider.initialize(64, 64),
            Err(ProviderError::AlreadyInitialized)
        );
        provider.shutdown();
    }

    #[test]
    fn test_recv_roundtrip() {
        if !uring_available() {
            return;
        }
        let provider = UringProvider::new();
        provider.initialize(64, 64).unwrap();

        let (mut client, server) = pair();
        let fd = server.as_raw_fd();
        provider.register_socket(fd).unwrap();

        let mut buf = vec![0u8; 64];
        provider
            .recv_async(fd, buf.as_mut_ptr(), buf.len() as u32, 11, 0)
            .unwrap();
        provider.flush_requests().unwrap();

        client.write_all(b"uring").unwrap();

        let mut entries = [CompletionEntry::default(); 8];
        let got = poll_until_one(&provider, &mut entries);
        assert_eq!(got, 1);
        assert_eq!(entries[0].op, OpKind::Recv);
        assert_eq!(entries[0].context, 11);
        assert_eq!(entries[0].result, 5);
        assert_eq!(&buf[..5], b"uring");

        provider.shutdown();
    }

    #[test]
    fn test_send_roundtrip() {
        if !uring_available() {
            return;
        }
        let provider = UringProvider::new();
        provider.initialize(64, 64).unwrap();

        let (client, server) = pair();
        let fd = server.as_raw_fd();
        provider.register_socket(fd).unwrap();

        let payload = b"ping-payload";
        provider
            .send_async(fd, payload.as_ptr(), payload.len() as u32, 3, 0)
            .unwrap();
        provider.flush_requests().unwrap();

        let mut entries = [CompletionEntry::default(); 8];
        let got = poll_until_one(&provider, &mut entries);
        assert_eq!(got, 1);
        assert_eq!(entries[0].op, OpKind::Send);
        assert_eq!(entries[0].result, payload.len() as i64);

        let mut peer = client;
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut read_buf = [0u8; 32];
        let n = peer.read(&mut read_buf).unwrap();
        assert_eq!(&read_buf[..n], payload);

        provider.shutdown();
    }
}
