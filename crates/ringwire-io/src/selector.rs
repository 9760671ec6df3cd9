//! Selector fallback backend.
//!
//! Same operation contract as the ring backend, driven by readiness:
//! non-blocking sockets, a level-triggered epoll set, and completions
//! synthesized as `(token, result)` records on the dispatch thread.
//! No registered buffers, no zero-copy guarantee, no multishot, no
//! linked chains — those surface as `Unsupported`.
//!
//! Each fd carries at most one armed read-direction op (accept or recv)
//! and one write-direction op (connect or send) at a time. Op slots are
//! cleared *before* the completion handler runs, so a handler may
//! immediately re-arm the same fd.
//!
//! Connect emulation: non-blocking `connect` → `EINPROGRESS` →
//! `EPOLLOUT` → `SO_ERROR` decides success or failure.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use ringwire_core::completion::{Completion, CompletionSink};
use ringwire_core::error::{WireError, WireResult};

use crate::sockaddr::{set_nodelay, tcp_socket, SockAddrSlot};

#[derive(Debug)]
enum ReadOp {
    Accept { token: u64 },
    Recv { token: u64, ptr: *mut u8, len: usize },
}

#[derive(Debug)]
enum WriteOp {
    Connect { token: u64 },
    Send { token: u64, ptr: *const u8, len: usize },
}

#[derive(Default)]
struct FdOps {
    read: Option<ReadOp>,
    write: Option<WriteOp>,
    registered: bool,
}

/// Counters exposed through `get_stats`; mirrors the ring backend's.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorStats {
    pub submitted: u64,
    pub completed: u64,
}

pub struct SelectorBackend {
    epfd: RawFd,
    sock_fd: Option<RawFd>,
    owns_fd: bool,
    ops: HashMap<RawFd, FdOps>,
    ready: VecDeque<Completion>,
    armed_since_batch: usize,
    addr_slot: SockAddrSlot,
    stats: SelectorStats,
    closed: bool,
}

// Raw buffer pointers inside armed ops make this !Send by default; the
// backend is single-owner and the buffers follow the same ownership
// contract as on the ring path.
unsafe impl Send for SelectorBackend {}

impl SelectorBackend {
    pub fn new() -> WireResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(WireError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(Self {
            epfd,
            sock_fd: None,
            owns_fd: false,
            ops: HashMap::new(),
            ready: VecDeque::new(),
            armed_since_batch: 0,
            addr_slot: SockAddrSlot::new(),
            stats: SelectorStats::default(),
            closed: false,
        })
    }

    // ── Capability surface ───────────────────────────────────────────

    #[inline]
    pub fn supports_registered_buffers(&self) -> bool {
        false
    }

    #[inline]
    pub fn supports_batch(&self) -> bool {
        false
    }

    #[inline]
    pub fn supports_zero_copy(&self) -> bool {
        false
    }

    #[inline]
    pub fn supports_multishot(&self) -> bool {
        false
    }

    #[inline]
    pub fn supports_tls(&self) -> bool {
        false
    }

    #[inline]
    pub fn get_stats(&self) -> SelectorStats {
        self.stats
    }

    pub fn socket_fd(&self) -> Option<RawFd> {
        self.sock_fd
    }

    pub fn local_port(&self) -> WireResult<u16> {
        let fd = self.primary_fd()?;
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(WireError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(u16::from_be(addr.sin_port))
    }

    // ── Socket lifecycle ─────────────────────────────────────────────

    pub fn bind(&mut self, addr: SocketAddr) -> WireResult<()> {
        self.ensure_open()?;
        let fd = tcp_socket(addr).map_err(WireError::Os)?;
        unsafe {
            let opt: i32 = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                4,
            );
        }
        set_nonblocking(fd);

        let (ptr, len) = self.addr_slot.fill(addr);
        if unsafe { libc::bind(fd, ptr, len) } != 0 {
            let errno = unsafe { *libc::__errno_location() };
            unsafe { libc::close(fd) };
            return Err(WireError::Os(errno));
        }
        if unsafe { libc::listen(fd, 1024) } != 0 {
            let errno = unsafe { *libc::__errno_location() };
            unsafe { libc::close(fd) };
            return Err(WireError::Os(errno));
        }
        if self.owns_fd {
            if let Some(old) = self.sock_fd.take() {
                unsafe { libc::close(old) };
            }
        }
        self.sock_fd = Some(fd);
        self.owns_fd = true;
        Ok(())
    }

    pub fn submit_accept(&mut self, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        self.stats.submitted += 1;
        self.arm_read(fd, ReadOp::Accept { token })
    }

    pub fn submit_connect(&mut self, addr: SocketAddr, token: u64) -> WireResult<()> {
        self.ensure_open()?;
        let fd = tcp_socket(addr).map_err(WireError::Os)?;
        set_nonblocking(fd);
        set_nodelay(fd);
        if self.owns_fd {
            if let Some(old) = self.sock_fd.take() {
                unsafe { libc::close(old) };
            }
        }
        self.sock_fd = Some(fd);
        self.owns_fd = true;
        self.stats.submitted += 1;

        let (ptr, len) = self.addr_slot.fill(addr);
        let ret = unsafe { libc::connect(fd, ptr, len) };
        if ret == 0 {
            self.ready.push_back(Completion::new(token, 0, 0));
            return Ok(());
        }
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EINPROGRESS {
            return self.arm_write(fd, WriteOp::Connect { token });
        }
        self.ready.push_back(Completion::new(token, -errno, 0));
        Ok(())
    }

    pub fn create_from_accepted(&self, fd: RawFd) -> RawFd {
        set_nonblocking(fd);
        set_nodelay(fd);
        fd
    }

    // ── Data path ────────────────────────────────────────────────────

    pub fn submit_recv_to(
        &mut self,
        fd: RawFd,
        ptr: *mut u8,
        len: usize,
        token: u64,
    ) -> WireResult<()> {
        self.ensure_open()?;
        self.stats.submitted += 1;
        // Fast path: data may already be waiting.
        let n = unsafe { libc::recv(fd, ptr as *mut libc::c_void, len, 0) };
        if n >= 0 {
            self.ready.push_back(Completion::new(token, n as i32, 0));
            return Ok(());
        }
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            return self.arm_read(fd, ReadOp::Recv { token, ptr, len });
        }
        self.ready.push_back(Completion::new(token, -errno, 0));
        Ok(())
    }

    pub fn submit_send_to(
        &mut self,
        fd: RawFd,
        ptr: *const u8,
        len: usize,
        token: u64,
    ) -> WireResult<()> {
        self.ensure_open()?;
        self.stats.submitted += 1;
        let n = unsafe { libc::send(fd, ptr as *const libc::c_void, len, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            self.ready.push_back(Completion::new(token, n as i32, 0));
            return Ok(());
        }
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            return self.arm_write(fd, WriteOp::Send { token, ptr, len });
        }
        self.ready.push_back(Completion::new(token, -errno, 0));
        Ok(())
    }

    pub fn receive(&mut self, ptr: *mut u8, len: usize, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        self.submit_recv_to(fd, ptr, len, token)
    }

    pub fn send(&mut self, ptr: *const u8, len: usize, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        self.submit_send_to(fd, ptr, len, token)
    }

    // ── Submit and reap ──────────────────────────────────────────────

    /// Readiness backends have nothing to flush; reports how many ops
    /// were armed since the previous batch boundary.
    pub fn submit_batch(&mut self) -> WireResult<usize> {
        self.ensure_open()?;
        Ok(std::mem::take(&mut self.armed_since_batch))
    }

    /// Drain synthesized completions; non-blocking.
    pub fn poll<S: CompletionSink>(&mut self, sink: &mut S) -> usize {
        if self.closed {
            return 0;
        }
        self.poll_events(0);
        self.drain_ready(sink)
    }

    /// Block in epoll up to `millis` for readiness, then drain.
    pub fn wait_for_completion<S: CompletionSink>(
        &mut self,
        millis: u64,
        sink: &mut S,
    ) -> WireResult<usize> {
        if self.closed {
            return Ok(0);
        }
        if self.ready.is_empty() {
            self.poll_events(millis.min(i32::MAX as u64) as i32);
        }
        Ok(self.drain_ready(sink))
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.owns_fd {
            if let Some(fd) = self.sock_fd.take() {
                unsafe { libc::close(fd) };
            }
        }
        unsafe { libc::close(self.epfd) };
        self.ops.clear();
        self.ready.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ── Internals ────────────────────────────────────────────────────

    fn primary_fd(&self) -> WireResult<RawFd> {
        if self.closed {
            return Err(WireError::NotInitialized);
        }
        self.sock_fd.ok_or(WireError::NotInitialized)
    }

    fn ensure_open(&self) -> WireResult<()> {
        if self.closed {
            return Err(WireError::NotInitialized);
        }
        Ok(())
    }

    fn arm_read(&mut self, fd: RawFd, op: ReadOp) -> WireResult<()> {
        let entry = self.ops.entry(fd).or_default();
        if entry.read.is_some() {
            return Err(WireError::InvalidConfig(format!(
                "fd {} already has a read-direction op armed",
                fd
            )));
        }
        entry.read = Some(op);
        self.armed_since_batch += 1;
        self.update_interest(fd)
    }

    fn arm_write(&mut self, fd: RawFd, op: WriteOp) -> WireResult<()> {
        let entry = self.ops.entry(fd).or_default();
        if entry.write.is_some() {
            return Err(WireError::InvalidConfig(format!(
                "fd {} already has a write-direction op armed",
                fd
            )));
        }
        entry.write = Some(op);
        self.armed_since_batch += 1;
        self.update_interest(fd)
    }

    /// Sync epoll interest with the armed op slots for `fd`.
    fn update_interest(&mut self, fd: RawFd) -> WireResult<()> {
        let entry = match self.ops.get(&fd) {
            Some(e) => e,
            None => return Ok(()),
        };
        let mut events = 0u32;
        if entry.read.is_some() {
            events |= libc::EPOLLIN as u32;
        }
        if entry.write.is_some() {
            events |= libc::EPOLLOUT as u32;
        }

        if events == 0 {
            if entry.registered {
                unsafe {
                    libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                }
                self.ops.remove(&fd);
            }
            return Ok(());
        }

        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let op = if entry.registered {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret != 0 {
            return Err(WireError::Os(unsafe { *libc::__errno_location() }));
        }
        self.ops.get_mut(&fd).expect("fd entry").registered = true;
        Ok(())
    }

    fn poll_events(&mut self, timeout_ms: i32) {
        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), 64, timeout_ms) };
        if n <= 0 {
            return;
        }
        for ev in events.iter().take(n as usize) {
            let fd = ev.u64 as RawFd;
            let readable =
                ev.events & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32)
                    != 0;
            let writable =
                ev.events & (libc::EPOLLOUT as u32 | libc::EPOLLERR as u32) != 0;

            if readable {
                if let Some(op) = self.ops.get_mut(&fd).and_then(|e| e.read.take()) {
                    self.ready.push_back(execute_read(fd, op));
                }
            }
            if writable {
                if let Some(op) = self.ops.get_mut(&fd).and_then(|e| e.write.take()) {
                    self.ready.push_back(execute_write(fd, op));
                }
            }
            let _ = self.update_interest(fd);
        }
    }

    fn drain_ready<S: CompletionSink>(&mut self, sink: &mut S) -> usize {
        let mut count = 0;
        while let Some(c) = self.ready.pop_front() {
            count += 1;
            self.stats.completed += 1;
            sink.complete(c);
        }
        count
    }
}

impl Drop for SelectorBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run a ready read-direction op to completion.
fn execute_read(fd: RawFd, op: ReadOp) -> Completion {
    match op {
        ReadOp::Accept { token } => {
            let client = unsafe {
                libc::accept4(
                    fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if client < 0 {
                let errno = unsafe { *libc::__errno_location() };
                Completion::new(token, -errno, 0)
            } else {
                set_nodelay(client);
                Completion::new(token, client, 0)
            }
        }
        ReadOp::Recv { token, ptr, len } => {
            let n = unsafe { libc::recv(fd, ptr as *mut libc::c_void, len, 0) };
            if n < 0 {
                let errno = unsafe { *libc::__errno_location() };
                Completion::new(token, -errno, 0)
            } else {
                Completion::new(token, n as i32, 0)
            }
        }
    }
}

/// Run a ready write-direction op to completion.
fn execute_write(fd: RawFd, op: WriteOp) -> Completion {
    match op {
        WriteOp::Connect { token } => {
            let mut err: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if ret != 0 {
                let errno = unsafe { *libc::__errno_location() };
                Completion::new(token, -errno, 0)
            } else if err != 0 {
                Completion::new(token, -err, 0)
            } else {
                Completion::new(token, 0, 0)
            }
        }
        WriteOp::Send { token, ptr, len } => {
            let n = unsafe {
                libc::send(fd, ptr as *const libc::c_void, len, libc::MSG_NOSIGNAL)
            };
            if n < 0 {
                let errno = unsafe { *libc::__errno_location() };
                Completion::new(token, -errno, 0)
            } else {
                Completion::new(token, n as i32, 0)
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}
