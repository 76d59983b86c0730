// # Linux epoll Backend
//
// Readiness-based provider: submits record intent, completion workers poll
// the kernel, and the backend performs the actual `send`/`recv` syscall when
// the socket turns ready, matching completions by socket.
//
// Sockets are switched to non-blocking at registration. A session posts at
// most one receive and one send at a time, so each socket carries at most one
// pending operation per direction.

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use super::{
    AsyncIoProvider, CompletionEntry, IoResult, OpKind, PlatformKind, PollTimeout,
    ProviderCounters, ProviderError, ProviderStats,
};
use crate::common::SocketHandle;

// ============================================================================
// Pending Operations
// ============================================================================

#[derive(Debug)]
struct PendingRecv {
    buffer: *mut u8,
    len: u32,
    context: u64,
}

#[derive(Debug)]
struct PendingSend {
    buffer: *const u8,
    len: u32,
    sent: u32,
    context: u64,
}

// Buffers are pinned inside pool-owned session slots until the completion is
// harvested; the pointers themselves are plain addresses.
unsafe impl Send for PendingRecv {}
unsafe impl Sync for PendingRecv {}
unsafe impl Send for PendingSend {}
unsafe impl Sync for PendingSend {}

#[derive(Debug, Default)]
struct SocketOps {
    recv: Option<PendingRecv>,
    send: Option<PendingSend>,
    want_write: bool,
}

// ============================================================================
// EpollProvider
// ============================================================================

pub struct EpollProvider {
    epfd: AtomicI32,
    initialized: AtomicBool,
    sockets: DashMap<RawFd, SocketOps>,
    /// Completions produced synchronously (immediate sends) ahead of the
    /// next kernel poll.
    ready: SegQueue<CompletionEntry>,
    counters: ProviderCounters,
    last_error: Mutex<String>,
}

impl EpollProvider {
    pub fn new() -> Self {
        Self {
            epfd: AtomicI32::new(-1),
            initialized: AtomicBool::new(false),
            sockets: DashMap::new(),
            ready: SegQueue::new(),
            counters: ProviderCounters::default(),
            last_error: Mutex::new(String::new()),
        }
    }

    fn set_last_error(&self, msg: String) {
        self.counters.on_error();
        *self.last_error.lock() = msg;
    }

    fn epfd(&self) -> IoResult<RawFd> {
        let fd = self.epfd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(ProviderError::NotInitialized);
        }
        Ok(fd)
    }

    fn set_nonblocking(fd: RawFd) -> IoResult<()> {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(ProviderError::InvalidSocket);
            }
            if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(ProviderError::InvalidSocket);
            }
        }
        Ok(())
    }

    fn interest(&self, fd: RawFd, want_write: bool, add: bool) -> IoResult<()> {
        let epfd = self.epfd()?;
        let mut events = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        if want_write {
            events |= libc::EPOLLOUT as u32;
        }

        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        let op = if add {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };

        let rc = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
        if rc < 0 {
            let errno = std::io::Error::last_os_error();
            // ADD on a handle left behind by a previous registration.
            if add && errno.raw_os_error() == Some(libc::EEXIST) {
                return self.interest(fd, want_write, false);
            }
            self.set_last_error(format!("epoll_ctl failed for fd {fd}: {errno}"));
            return Err(ProviderError::OperationFailed);
        }
        Ok(())
    }

    /// Attempt the actual send syscall; emits a completion entry when the
    /// whole buffer has gone out or the socket errored.
    fn drive_send(&self, fd: RawFd, op: &mut PendingSend) -> Option<CompletionEntry> {
        while op.sent < op.len {
            let rc = unsafe {
                libc::send(
                    fd,
                    op.buffer.add(op.sent as usize) as *const libc::c_void,
                    (op.len - op.sent) as usize,
                    libc::MSG_NOSIGNAL,
                )
            };

            if rc > 0 {
                op.sent += rc as u32;
                continue;
            }

            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return None;
            }

            return Some(CompletionEntry {
                context: op.context,
                op: OpKind::Send,
                result: -1,
                os_error: errno,
                completed_at: Some(Instant::now()),
            });
        }

        Some(CompletionEntry {
            context: op.context,
            op: OpKind::Send,
            result: op.len as i64,
            os_error: 0,
            completed_at: Some(Instant::now()),
        })
    }

    fn drive_recv(&self, fd: RawFd, op: &PendingRecv) -> Option<CompletionEntry> {
        let rc = unsafe {
            libc::recv(
                fd,
                op.buffer as *mut libc::c_void,
                op.len as usize,
                0,
            )
        };

        if rc >= 0 {
            return Some(CompletionEntry {
                context: op.context,
                op: OpKind::Recv,
                result: rc as i64,
                os_error: 0,
                completed_at: Some(Instant::now()),
            });
        }

        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            return None;
        }

        Some(CompletionEntry {
            context: op.context,
            op: OpKind::Recv,
            result: -1,
            os_error: errno,
            completed_at: Some(Instant::now()),
        })
    }
}

impl Default for EpollProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpollProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AsyncIoProvider for EpollProvider {
    fn initialize(&self, _queue_depth: u32, _max_concurrent: u32) -> IoResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::AlreadyInitialized);
        }

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            self.set_last_error(format!(
                "epoll_create1 failed: {}",
                std::io::Error::last_os_error()
            ));
            return Err(ProviderError::AllocationFailed);
        }

        self.epfd.store(epfd, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(epfd, "epoll provider initialized");
        Ok(())
    }

    fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }

        let epfd = self.epfd.swap(-1, Ordering::AcqRel);
        if epfd >= 0 {
            unsafe {
                libc::close(epfd);
            }
        }

        for entry in self.sockets.iter() {
            if entry.value().recv.is_some() {
                self.counters.on_discard();
            }
            if entry.value().send.is_some() {
                self.counters.on_discard();
            }
        }
        self.sockets.clear();
        while self.ready.pop().is_some() {}
        tracing::debug!("epoll provider shut down");
    }

    fn platform(&self) -> PlatformKind {
        PlatformKind::Epoll
    }

    fn register_socket(&self, socket: SocketHandle) -> IoResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::NotInitialized);
        }
        if socket < 0 {
            return Err(ProviderError::InvalidSocket);
        }

        Self::set_nonblocking(socket)?;

        // A reused fd must not inherit pending ops from its previous life.
        if let Some((_, old)) = self.sockets.remove(&socket) {
            if old.recv.is_some() {
                self.counters.on_discard();
            }
            if old.send.is_some() {
                self.counters.on_discard();
            }
        }
        self.sockets.insert(socket, SocketOps::default());
        self.interest(socket, false, true)
    }

    fn unregister_socket(&self, socket: SocketHandle) -> IoResult<()> {
        let epfd = self.epfd()?;
        unsafe {
            let mut ev = libc::epoll_event {
                events: 0,
                u64: socket as u64,
            };
            libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, socket, &mut ev);
        }

        if let Some((_, old)) = self.sockets.remove(&socket) {
            if old.recv.is_some() {
                self.counters.on_discard();
            }
            if old.send.is_some() {
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
        _flags: u32,
    ) -> IoResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::NotInitialized);
        }
        if data.is_null() || size == 0 {
            return Err(ProviderError::InvalidBuffer);
        }

        let mut op = PendingSend {
            buffer: data,
            len: size,
            sent: 0,
            context,
        };

        let mut entry_ref = self
            .sockets
            .get_mut(&socket)
            .ok_or(ProviderError::InvalidSocket)?;
        if entry_ref.send.is_some() {
            return Err(ProviderError::OperationPending);
        }

        self.counters.on_submit();

        // Opportunistic fast path: most sockets are writable immediately.
        if let Some(done) = self.drive_send(socket, &mut op) {
            drop(entry_ref);
            if done.result < 0 {
                // Synchronous failure: the caller gets the error here, not a
                // completion, so the pending count unwinds.
                self.counters.on_discard();
                self.set_last_error(format!(
                    "send failed on fd {socket}: os error {}",
                    done.os_error
                ));
                return Err(ProviderError::OperationFailed);
            }
            self.ready.push(done);
            return Ok(());
        }

        entry_ref.send = Some(op);
        entry_ref.want_write = true;
        drop(entry_ref);
        self.interest(socket, true, false)
    }

    fn recv_async(
        &self,
        socket: SocketHandle,
        buffer: *mut u8,
        size: u32,
        context: u64,
        _flags: u32,
    ) -> IoResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::NotInitialized);
        }
        if buffer.is_null() || size == 0 {
            return Err(ProviderError::InvalidBuffer);
        }

        let mut entry_ref = self
            .sockets
            .get_mut(&socket)
            .ok_or(ProviderError::InvalidSocket)?;
        if entry_ref.recv.is_some() {
            return Err(ProviderError::OperationPending);
        }

        entry_ref.recv = Some(PendingRecv {
            buffer,
            len: size,
            context,
        });
        self.counters.on_submit();
        Ok(())
    }

    fn flush_requests(&self) -> IoResult<()> {
        // Readiness model: nothing is batched.
        Ok(())
    }

    fn process_completions(
        &self,
        entries: &mut [CompletionEntry],
        timeout: PollTimeout,
    ) -> IoResult<usize> {
        let epfd = self.epfd()?;
        if entries.is_empty() {
            return Err(ProviderError::InvalidParameter);
        }

        let mut count = 0;

        // Synchronous completions first.
        while count < entries.len() {
            match self.ready.pop() {
                Some(done) => {
                    entries[count] = done;
                    count += 1;
                    self.counters.on_complete();
                }
                None => break,
            }
        }

        let wait_ms = if count > 0 {
            0
        } else {
            timeout.as_raw_millis()
        };

        let max_events = (entries.len() - count).div_ceil(2).clamp(1, 128);
        let mut events: Vec<libc::epoll_event> =
            vec![libc::epoll_event { events: 0, u64: 0 }; max_events];

        let n = unsafe {
            libc::epoll_wait(epfd, events.as_mut_ptr(), max_events as i32, wait_ms)
        };

        if n < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EINTR) {
                return Ok(count);
            }
            self.set_last_error(format!("epoll_wait failed: {errno}"));
            return Err(ProviderError::OperationFailed);
        }

        for ev in events.iter().take(n as usize) {
            if count >= entries.len() {
                break;
            }

            let fd = ev.u64 as RawFd;
            let bits = ev.events;
            let readable =
                bits & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32
                    != 0;
            let writable = bits & (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;

            let Some(mut ops) = self.sockets.get_mut(&fd) else {
                continue;
            };

            if readable && count < entries.len() {
                if let Some(recv_op) = ops.recv.take() {
                    match self.drive_recv(fd, &recv_op) {
                        Some(done) => {
                            entries[count] = done;
                            count += 1;
                            self.counters.on_complete();
                        }
                        None => {
                            ops.recv = Some(recv_op);
                        }
                    }
                }
            }

            if writable && count < entries.len() {
                if let Some(mut send_op) = ops.send.take() {
                    match self.drive_send(fd, &mut send_op) {
                        Some(done) => {
                            entries[count] = done;
                            count += 1;
                            self.counters.on_complete();
                            ops.want_write = false;
                            drop(ops);
                            let _ = self.interest(fd, false, false);
                            continue;
                        }
                        None => {
                            ops.send = Some(send_op);
                        }
                    }
                }
            }
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

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_lifecycle_guards() {
        let provider = EpollProvider::new();
        assert_eq!(
            provider.register_socket(0),
            Err(ProviderError::NotInitialized)
        );

        provider.initialize(64, 64).unwrap();
        assert_eq!(
            provider.initialize(64, 64),
            Err(ProviderError::AlreadyInitialized)
        );
        provider.shutdown();
    }

    #[test]
    fn test_recv_completion_roundtrip() {
        let provider = EpollProvider::new();
        provider.initialize(64, 64).unwrap();

        let (mut client, server) = pair();
        let fd = server.as_raw_fd();
        provider.register_socket(fd).unwrap();

        let mut buf = vec![0u8; 64];
        provider
            .recv_async(fd, buf.as_mut_ptr(), buf.len() as u32, 42, 0)
            .unwrap();

        client.write_all(b"hello").unwrap();

        let mut entries = [CompletionEntry::default(); 8];
        let mut got = 0;
        for _ in 0..50 {
            got = provider
                .process_completions(&mut entries, PollTimeout::Millis(100))
                .unwrap();
            if got > 0 {
                break;
            }
        }

        assert_eq!(got, 1);
        assert_eq!(entries[0].op, OpKind::Recv);
        assert_eq!(entries[0].context, 42);
        assert_eq!(entries[0].result, 5);
        assert_eq!(&buf[..5], b"hello");

        provider.unregister_socket(fd).unwrap();
        provider.shutdown();
    }

    #[test]
    fn test_send_completes_and_peer_receives() {
        let provider = EpollProvider::new();
        provider.initialize(64, 64).unwrap();

        let (client, server) = pair();
        let fd = server.as_raw_fd();
        provider.register_socket(fd).unwrap();

        let payload = b"pong!";
        provider
            .send_async(fd, payload.as_ptr(), payload.len() as u32, 7, 0)
            .unwrap();

        let mut entries = [CompletionEntry::default(); 8];
        let mut got = 0;
        for _ in 0..50 {
            got = provider
                .process_completions(&mut entries, PollTimeout::Millis(100))
                .unwrap();
            if got > 0 {
                break;
            }
        }

        assert_eq!(got, 1);
        assert_eq!(entries[0].op, OpKind::Send);
        assert_eq!(entries[0].result, payload.len() as i64);

        use std::io::Read;
        let mut read_buf = [0u8; 16];
        let mut peer = client;
        peer.set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let n = peer.read(&mut read_buf).unwrap();
        assert_eq!(&read_buf[..n], payload);

        provider.shutdown();
    }

    #[test]
    fn test_peer_close_yields_zero_result() {
        let provider = EpollProvider::new();
        provider.initialize(64, 64).unwrap();

        let (client, server) = pair();
        let fd = server.as_raw_fd();
        provider.register_socket(fd).unwrap();

        let mut buf = vec![0u8; 64];
        provider
            .recv_async(fd, buf.as_mut_ptr(), buf.len() as u32, 9, 0)
            .unwrap();

        drop(client);

        let mut entries = [CompletionEntry::default(); 8];
        let mut got = 0;
        for _ in 0..50 {
            got = provider
                .process_completions(&mut entries, PollTimeout::Millis(100))
                .unwrap();
            if got > 0 {
                break;
            }
        }

        assert_eq!(got, 1);
        assert_eq!(entries[0].op, OpKind::Recv);
        assert_eq!(entries[0].result, 0);

        provider.shutdown();
    }

    #[test]
    fn test_double_recv_is_rejected() {
        let provider = EpollProvider::new();
        provider.initialize(64, 64).unwrap();

        let (_client, server) = pair();
        let fd = server.as_raw_fd();
        provider.register_socket(fd).unwrap();

        let mut buf = vec![0u8; 64];
        provider
            .recv_async(fd, buf.as_mut_ptr(), buf.len() as u32, 1, 0)
            .unwrap();
        assert_eq!(
            provider.recv_async(fd, buf.as_mut_ptr(), buf.len() as u32, 1, 0),
            Err(ProviderError::OperationPending)
        );

        provider.shutdown();
    }
}
