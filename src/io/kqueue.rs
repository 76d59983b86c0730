// # macOS kqueue Backend
//
// Readiness-based provider mirroring the epoll backend: submits record
// intent, `process_completions` waits in `kevent` and performs the actual
// syscall when a filter fires. Read filters stay armed for a socket's
// lifetime; write filters are armed only while a send is pending.

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::ptr;
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

unsafe impl Send for PendingRecv {}
unsafe impl Sync for PendingRecv {}
unsafe impl Send for PendingSend {}
unsafe impl Sync for PendingSend {}

#[derive(Debug, Default)]
struct SocketOps {
    recv: Option<PendingRecv>,
    send: Option<PendingSend>,
}

// ============================================================================
// KqueueProvider
// ============================================================================

pub struct KqueueProvider {
    kq: AtomicI32,
    initialized: AtomicBool,
    sockets: DashMap<RawFd, SocketOps>,
    ready: SegQueue<CompletionEntry>,
    counters: ProviderCounters,
    last_error: Mutex<String>,
}

impl KqueueProvider {
    pub fn new() -> Self {
        Self {
            kq: AtomicI32::new(-1),
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

    fn kq(&self) -> IoResult<RawFd> {
        let kq = self.kq.load(Ordering::Acquire);
        if kq < 0 {
            return Err(ProviderError::NotInitialized);
        }
        Ok(kq)
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

    fn change_filter(&self, fd: RawFd, filter: i16, flags: u16) -> IoResult<()> {
        let kq = self.kq()?;
        let change = libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };

        let rc = unsafe { libc::kevent(kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            let errno = std::io::Error::last_os_error();
            // Deleting an absent write filter is routine after a fast send.
            if flags & libc::EV_DELETE != 0 && errno.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            self.set_last_error(format!("kevent change failed for fd {fd}: {errno}"));
            return Err(ProviderError::OperationFailed);
        }
        Ok(())
    }

    fn drive_send(&self, fd: RawFd, op: &mut PendingSend) -> Option<CompletionEntry> {
        while op.sent < op.len {
            let rc = unsafe {
                libc::send(
                    fd,
                    op.buffer.add(op.sent as usize) as *const libc::c_void,
                    (op.len - op.sent) as usize,
                    0,
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
        let rc =
            unsafe { libc::recv(fd, op.buffer as *mut libc::c_void, op.len as usize, 0) };

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

impl Default for KqueueProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KqueueProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AsyncIoProvider for KqueueProvider {
    fn initialize(&self, _queue_depth: u32, _max_concurrent: u32) -> IoResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::AlreadyInitialized);
        }

        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            self.set_last_error(format!(
                "kqueue creation failed: {}",
                std::io::Error::last_os_error()
            ));
            return Err(ProviderError::AllocationFailed);
        }

        self.kq.store(kq, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(kq, "kqueue provider initialized");
        Ok(())
    }

    fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }

        let kq = self.kq.swap(-1, Ordering::AcqRel);
        if kq >= 0 {
            unsafe {
                libc::close(kq);
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
        tracing::debug!("kqueue provider shut down");
    }

    fn platform(&self) -> PlatformKind {
        PlatformKind::Kqueue
    }

    fn register_socket(&self, socket: SocketHandle) -> IoResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ProviderError::NotInitialized);
        }
        if socket < 0 {
            return Err(ProviderError::InvalidSocket);
        }

        Self::set_nonblocking(socket)?;

        if let Some((_, old)) = self.sockets.remove(&socket) {
            if old.recv.is_some() {
                self.counters.on_discard();
            }
            if old.send.is_some() {
                self.counters.on_discard();
            }
        }
        self.sockets.insert(socket, SocketOps::default());
        self.change_filter(socket, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE)
    }

    fn unregister_socket(&self, socket: SocketHandle) -> IoResult<()> {
        let _ = self.change_filter(socket, libc::EVFILT_READ, libc::EV_DELETE);
        let _ = self.change_filter(socket, libc::EVFILT_WRITE, libc::EV_DELETE);

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

        if let Some(done) = self.drive_send(socket, &mut op) {
            drop(entry_ref);
            if done.result < 0 {
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
        drop(entry_ref);
        self.change_filter(socket, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE)
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
        Ok(())
    }

    fn process_completions(
        &self,
        entries: &mut [CompletionEntry],
        timeout: PollTimeout,
    ) -> IoResult<usize> {
        let kq = self.kq()?;
        if entries.is_empty() {
            return Err(ProviderError::InvalidParameter);
        }

        let mut count = 0;
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

        let timeout_ms = if count > 0 {
            0
        } else {
            timeout.as_raw_millis()
        };
        let ts = libc::timespec {
            tv_sec: (timeout_ms.max(0) / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms.max(0) % 1000) * 1_000_000) as libc::c_long,
        };
        let ts_ptr: *const libc::timespec = if timeout_ms < 0 { ptr::null() } else { &ts };

        let max_events = (entries.len() - count).clamp(1, 128);
        let mut events: Vec<libc::kevent> = vec![
            libc::kevent {
                ident: 0,
                filter: 0,
                flags: 0,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            };
            max_events
        ];

        let n = unsafe {
            libc::kevent(
                kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                max_events as i32,
                ts_ptr,
            )
        };

        if n < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EINTR) {
                return Ok(count);
            }
            self.set_last_error(format!("kevent wait failed: {errno}"));
            return Err(ProviderError::OperationFailed);
        }

        for ev in events.iter().take(n as usize) {
            if count >= entries.len() {
                break;
            }

            let fd = ev.ident as RawFd;
            let Some(mut ops) = self.sockets.get_mut(&fd) else {
                continue;
            };

            match ev.filter {
                libc::EVFILT_READ => {
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
                libc::EVFILT_WRITE => {
                    if let Some(mut send_op) = ops.send.take() {
                        match self.drive_send(fd, &mut send_op) {
                            Some(done) => {
                                entries[count] = done;
                                count += 1;
                                self.counters.on_complete();
                                drop(ops);
                                let _ =
                                    self.change_filter(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
                            }
                            None => {
                                ops.send = Some(send_op);
                            }
                        }
                    }
                }
                _ => {}
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
