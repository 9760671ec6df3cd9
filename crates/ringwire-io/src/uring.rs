//! io_uring ring backend.
//!
//! One instance owns one kernel ring: it translates logical transport
//! operations into submission-queue entries, batches them, drives the
//! submit syscall, and reaps completion-queue entries back to the
//! caller's [`CompletionSink`]. The token given at submission comes back
//! unchanged; the backend never interprets it.
//!
//! Feature setup degrades gracefully: the builder ladder tries SQPOLL
//! (with SQ-thread affinity when configured), cooperative task-run and
//! single-issuer, then falls back step by step to a basic 5.1-era ring.
//! Buffer-ring and zero-copy-send support are probed and reported, not
//! assumed.
//!
//! Submission discipline: when the SQ refuses an entry the backend
//! force-submits pending entries and retries; after a bounded number of
//! attempts the operation fails with a RESOURCE error instead of
//! spinning.
//!
//! Zero-copy sends complete twice — first the byte count, then a NOTIF
//! completion once the kernel drops its reference to the buffer. Both
//! are reported; the buffer must not be recycled before the NOTIF.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use io_uring::{opcode, squeue, types, IoUring, Probe};

use ringwire_buf::{BufPool, WireBuf};
use ringwire_core::completion::{Completion, CompletionSink};
use ringwire_core::error::{WireError, WireResult};

use crate::sockaddr::{set_nodelay, tcp_socket, SockAddrSlot};

/// Force-submit attempts before a full SQ surfaces as RESOURCE.
const MAX_SQ_RETRIES: u32 = 8;

/// Ring configuration.
#[derive(Debug, Clone)]
pub struct UringConfig {
    /// SQ entries. Power of two; the kernel rounds up otherwise.
    pub queue_depth: u32,
    /// CQ entries; defaults to twice the queue depth.
    pub cq_entries: Option<u32>,
    /// Ask for a kernel SQ-polling thread.
    pub sqpoll: bool,
    /// Pin the SQPOLL thread to this CPU; negative = unpinned.
    pub sqpoll_cpu: i32,
    /// SQPOLL idle before the kernel thread parks, in microseconds.
    pub sqpoll_idle_us: u32,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            cq_entries: None,
            sqpoll: false,
            sqpoll_cpu: -1,
            sqpoll_idle_us: 2000,
        }
    }
}

/// What the running kernel actually gave us.
#[derive(Debug, Clone, Copy, Default)]
pub struct UringFeatures {
    pub sqpoll: bool,
    pub coop_taskrun: bool,
    pub single_issuer: bool,
    pub buffer_ring: bool,
    pub send_zc: bool,
    pub multishot_accept: bool,
}

/// Counters exposed through `get_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UringStats {
    pub submitted: u64,
    pub completed: u64,
    pub notif_seen: u64,
    pub sq_full_retries: u64,
}

/// Child view over a connection accepted on a parent backend's ring.
///
/// Shares the parent ring; submissions go through the parent. The child
/// owns only the socket and must never close the ring.
#[derive(Debug)]
pub struct AcceptedConn {
    fd: RawFd,
}

impl AcceptedConn {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

pub struct UringBackend {
    ring: IoUring,
    features: UringFeatures,
    stats: UringStats,
    /// Entries pushed since the last submit.
    pending_submit: u32,
    /// Completions still expected from the kernel. Diagnostic.
    inflight: usize,
    /// Primary socket: the listener after `bind`, the client socket
    /// after `submit_connect`.
    sock_fd: Option<RawFd>,
    owns_fd: bool,
    registered: bool,
    /// Tokens with a NOTIF still outstanding.
    zc_pending: HashSet<u64>,
    /// Reused for timed waits; never allocated per call.
    timespec: types::Timespec,
    addr_slot: SockAddrSlot,
    closed: bool,
}

impl UringBackend {
    pub fn new(config: UringConfig) -> WireResult<Self> {
        let (ring, mut features) = Self::build_ring(&config)?;

        // Probe optional opcodes; missing probe support means an old
        // kernel, which also lacks the probed features.
        let mut probe = Probe::new();
        if ring.submitter().register_probe(&mut probe).is_ok() {
            features.send_zc = probe.is_supported(opcode::SendZc::CODE);
            features.buffer_ring = probe.is_supported(opcode::RecvMulti::CODE);
            features.multishot_accept = probe.is_supported(opcode::AcceptMulti::CODE);
        }

        Ok(Self {
            ring,
            features,
            stats: UringStats::default(),
            pending_submit: 0,
            inflight: 0,
            sock_fd: None,
            owns_fd: false,
            registered: false,
            zc_pending: HashSet::new(),
            timespec: types::Timespec::new(),
            addr_slot: SockAddrSlot::new(),
            closed: false,
        })
    }

    /// Builder ladder: full feature set first, then progressively less.
    fn build_ring(config: &UringConfig) -> WireResult<(IoUring, UringFeatures)> {
        let cq = config.cq_entries.unwrap_or(config.queue_depth * 2);
        let idle_ms = (config.sqpoll_idle_us / 1000).max(1);

        // 1: everything requested.
        if config.sqpoll {
            let mut b = IoUring::builder();
            b.setup_cqsize(cq).setup_sqpoll(idle_ms);
            if config.sqpoll_cpu >= 0 {
                b.setup_sqpoll_cpu(config.sqpoll_cpu as u32);
            }
            if let Ok(ring) = b.build(config.queue_depth) {
                return Ok((
                    ring,
                    UringFeatures {
                        sqpoll: true,
                        ..Default::default()
                    },
                ));
            }
            // SQPOLL needs privileges on older kernels; fall through.
        }

        // 2: cooperative task running + single issuer.
        {
            let mut b = IoUring::builder();
            b.setup_cqsize(cq).setup_coop_taskrun().setup_single_issuer();
            if let Ok(ring) = b.build(config.queue_depth) {
                return Ok((
                    ring,
                    UringFeatures {
                        coop_taskrun: true,
                        single_issuer: true,
                        ..Default::default()
                    },
                ));
            }
        }

        // 3: sized CQ only.
        {
            let mut b = IoUring::builder();
            b.setup_cqsize(cq);
            if let Ok(ring) = b.build(config.queue_depth) {
                return Ok((ring, UringFeatures::default()));
            }
        }

        // 4: basic ring, the 5.1 floor.
        IoUring::builder()
            .build(config.queue_depth)
            .map(|ring| (ring, UringFeatures::default()))
            .map_err(|e| WireError::RingSetup(e.raw_os_error().unwrap_or(-1)))
    }

    // ── Introspection ────────────────────────────────────────────────

    #[inline]
    pub fn features(&self) -> UringFeatures {
        self.features
    }

    #[inline]
    pub fn get_stats(&self) -> UringStats {
        self.stats
    }

    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight
    }

    #[inline]
    pub fn queue_depth(&self) -> u32 {
        self.ring.params().sq_entries()
    }

    #[inline]
    pub fn supports_registered_buffers(&self) -> bool {
        true
    }

    #[inline]
    pub fn supports_batch(&self) -> bool {
        true
    }

    #[inline]
    pub fn supports_zero_copy(&self) -> bool {
        self.features.send_zc
    }

    #[inline]
    pub fn supports_multishot(&self) -> bool {
        self.features.buffer_ring
    }

    #[inline]
    pub fn supports_tls(&self) -> bool {
        false
    }

    pub fn ring_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    /// The underlying ring, for registration-time plumbing (e.g.
    /// provided-buffer ring setup against this ring's submitter).
    pub fn raw_ring(&self) -> &IoUring {
        &self.ring
    }

    /// The primary socket fd, once `bind` or `submit_connect` ran.
    pub fn socket_fd(&self) -> Option<RawFd> {
        self.sock_fd
    }

    /// Local port of the primary socket. Useful after binding port 0.
    pub fn local_port(&self) -> WireResult<u16> {
        let fd = self.primary_fd()?;
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(WireError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(u16::from_be(addr.sin_port))
    }

    // ── Registration ─────────────────────────────────────────────────

    /// One-shot registration of the pool's slab, one iovec per slot so
    /// registration ids map 1:1 to pool indices. Failure is fatal for
    /// this backend instance.
    pub fn register_pool(&mut self, pool: &BufPool) -> WireResult<()> {
        let iovecs = pool.iovecs();
        // Safety: the iovecs point into the pool's slab, which outlives
        // the backend per the shutdown sequencing contract.
        unsafe {
            self.ring
                .submitter()
                .register_buffers(&iovecs)
                .map_err(|e| WireError::RingSetup(e.raw_os_error().unwrap_or(-1)))?;
        }
        self.registered = true;
        Ok(())
    }

    pub fn buffers_registered(&self) -> bool {
        self.registered
    }

    // ── Socket lifecycle ─────────────────────────────────────────────

    /// Create, configure, bind, and listen. The fd becomes this
    /// instance's primary socket.
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
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &opt as *const _ as *const libc::c_void,
                4,
            );
        }

        let (ptr, len) = self.addr_slot.fill(addr);
        let ret = unsafe { libc::bind(fd, ptr, len) };
        if ret != 0 {
            let errno = unsafe { *libc::__errno_location() };
            unsafe { libc::close(fd) };
            return Err(WireError::Os(errno));
        }
        if unsafe { libc::listen(fd, 4096) } != 0 {
            let errno = unsafe { *libc::__errno_location() };
            unsafe { libc::close(fd) };
            return Err(WireError::Os(errno));
        }

        self.replace_primary(fd);
        Ok(())
    }

    /// Queue one accept on the primary (listening) socket.
    pub fn submit_accept(&mut self, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        let sqe = opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
            .build()
            .user_data(token);
        self.push(&sqe, true)
    }

    /// Multishot accept: one submission, a completion per connection
    /// with the MORE flag until terminal.
    pub fn submit_accept_multishot(&mut self, token: u64) -> WireResult<()> {
        if !self.features.multishot_accept {
            return Err(WireError::Unsupported("multishot accept"));
        }
        let fd = self.primary_fd()?;
        let sqe = opcode::AcceptMulti::new(types::Fd(fd))
            .build()
            .user_data(token);
        self.push(&sqe, true)
    }

    /// Open a socket and queue a connect. The fd becomes the primary
    /// socket; the completion (result 0 or negated errno) carries the
    /// token.
    pub fn submit_connect(&mut self, addr: SocketAddr, token: u64) -> WireResult<()> {
        self.ensure_open()?;
        let fd = tcp_socket(addr).map_err(WireError::Os)?;
        set_nodelay(fd);

        let (ptr, len) = self.addr_slot.fill(addr);
        let sqe = opcode::Connect::new(types::Fd(fd), ptr, len)
            .build()
            .user_data(token);
        // Publish the fd before pushing so a same-batch send can refer
        // to it.
        self.replace_primary(fd);
        self.push(&sqe, true)
    }

    /// Wrap an accepted socket as a child of this backend. The child
    /// shares the parent ring and never closes it.
    pub fn create_from_accepted(&self, fd: RawFd) -> AcceptedConn {
        set_nodelay(fd);
        AcceptedConn { fd }
    }

    // ── Data path: primary-socket convenience ────────────────────────

    pub fn send(&mut self, buf: &WireBuf, len: usize, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        self.submit_send_to(fd, buf.addr(), len, token)
    }

    pub fn send_registered(&mut self, buf: &WireBuf, len: usize, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        self.submit_send_registered_to(fd, buf, len, token)
    }

    pub fn send_zero_copy(&mut self, buf: &WireBuf, len: usize, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        self.submit_send_zero_copy_to(fd, buf.addr(), len, token)
    }

    pub fn receive(&mut self, buf: &mut WireBuf, len: usize, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        self.submit_recv_to(fd, buf.addr(), len, token)
    }

    pub fn receive_registered(&mut self, buf: &mut WireBuf, len: usize, token: u64) -> WireResult<()> {
        let fd = self.primary_fd()?;
        self.submit_recv_registered_to(fd, buf, len, token)
    }

    // ── Data path: explicit fd (server dispatch) ─────────────────────

    pub fn submit_send_to(
        &mut self,
        fd: RawFd,
        ptr: *const u8,
        len: usize,
        token: u64,
    ) -> WireResult<()> {
        let sqe = opcode::Send::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(token);
        self.push(&sqe, true)
    }

    /// Send referencing the buffer by registered index — no per-call
    /// page pinning.
    pub fn submit_send_registered_to(
        &mut self,
        fd: RawFd,
        buf: &WireBuf,
        len: usize,
        token: u64,
    ) -> WireResult<()> {
        if !self.registered {
            return Err(WireError::Unsupported("pool not registered"));
        }
        let sqe = opcode::WriteFixed::new(
            types::Fd(fd),
            buf.addr() as *const u8,
            len as u32,
            buf.registration_id(),
        )
        .build()
        .user_data(token);
        self.push(&sqe, true)
    }

    /// Zero-copy send. Two completions arrive in order: byte count,
    /// then NOTIF releasing the buffer.
    pub fn submit_send_zero_copy_to(
        &mut self,
        fd: RawFd,
        ptr: *const u8,
        len: usize,
        token: u64,
    ) -> WireResult<()> {
        if !self.features.send_zc {
            return Err(WireError::Unsupported("zero-copy send"));
        }
        let sqe = opcode::SendZc::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(token);
        self.push(&sqe, true)?;
        self.zc_pending.insert(token);
        Ok(())
    }

    pub fn submit_recv_to(
        &mut self,
        fd: RawFd,
        ptr: *mut u8,
        len: usize,
        token: u64,
    ) -> WireResult<()> {
        let sqe = opcode::Recv::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(token);
        self.push(&sqe, true)
    }

    pub fn submit_recv_registered_to(
        &mut self,
        fd: RawFd,
        buf: &mut WireBuf,
        len: usize,
        token: u64,
    ) -> WireResult<()> {
        if !self.registered {
            return Err(WireError::Unsupported("pool not registered"));
        }
        let sqe = opcode::ReadFixed::new(
            types::Fd(fd),
            buf.addr(),
            len as u32,
            buf.registration_id(),
        )
        .build()
        .user_data(token);
        self.push(&sqe, true)
    }

    /// Queue receives for a batch of buffers. Returns how many were
    /// actually queued; partial exhaustion is not an error.
    pub fn submit_recv_batch(
        &mut self,
        fd: RawFd,
        bufs: &mut [WireBuf],
        tokens: &[u64],
    ) -> usize {
        let n = bufs.len().min(tokens.len());
        for i in 0..n {
            let ptr = bufs[i].addr();
            let len = bufs[i].capacity();
            if self.submit_recv_to(fd, ptr, len, tokens[i]).is_err() {
                return i;
            }
        }
        n
    }

    /// Queue sends for a batch of views. Returns the queued count.
    pub fn submit_send_batch(
        &mut self,
        fd: RawFd,
        views: &[(*const u8, usize)],
        tokens: &[u64],
    ) -> usize {
        let n = views.len().min(tokens.len());
        for i in 0..n {
            let (ptr, len) = views[i];
            if self.submit_send_to(fd, ptr, len, tokens[i]).is_err() {
                return i;
            }
        }
        n
    }

    /// Multishot receive drawing buffers from a provided-buffer ring
    /// group. Completions carry the selected buffer id in their flags
    /// and the MORE bit until the terminal completion.
    pub fn submit_multishot_recv(&mut self, fd: RawFd, token: u64, bgid: u16) -> WireResult<()> {
        if !self.features.buffer_ring {
            return Err(WireError::Unsupported("multishot recv"));
        }
        let sqe = opcode::RecvMulti::new(types::Fd(fd), bgid)
            .build()
            .user_data(token);
        self.push(&sqe, true)
    }

    // ── Linked chains ────────────────────────────────────────────────

    /// Atomic recv-then-send on one buffer. The chain breaks on the
    /// first failure. With `skip_intermediate`, the recv's completion
    /// is suppressed on success only.
    pub fn submit_linked_echo(
        &mut self,
        fd: RawFd,
        buf: &mut WireBuf,
        len: usize,
        recv_token: u64,
        send_token: u64,
        skip_intermediate: bool,
    ) -> WireResult<()> {
        let mut flags = squeue::Flags::IO_LINK;
        if skip_intermediate {
            flags |= squeue::Flags::SKIP_SUCCESS;
        }
        let recv = opcode::Recv::new(types::Fd(fd), buf.addr(), len as u32)
            .build()
            .user_data(recv_token)
            .flags(flags);
        let send = opcode::Send::new(types::Fd(fd), buf.addr() as *const u8, len as u32)
            .build()
            .user_data(send_token);
        self.push(&recv, !skip_intermediate)?;
        self.push(&send, true)
    }

    /// Send-then-recv chain for request/response round trips.
    pub fn submit_linked_request_response(
        &mut self,
        fd: RawFd,
        send_buf: &WireBuf,
        send_len: usize,
        recv_buf: &mut WireBuf,
        recv_len: usize,
        send_token: u64,
        recv_token: u64,
    ) -> WireResult<()> {
        let send = opcode::Send::new(types::Fd(fd), send_buf.addr() as *const u8, send_len as u32)
            .build()
            .user_data(send_token)
            .flags(squeue::Flags::IO_LINK);
        let recv = opcode::Recv::new(types::Fd(fd), recv_buf.addr(), recv_len as u32)
            .build()
            .user_data(recv_token);
        self.push(&send, true)?;
        self.push(&recv, true)
    }

    /// Best-effort cancel of an in-flight operation by its token.
    pub fn submit_cancel(&mut self, target_token: u64, token: u64) -> WireResult<()> {
        let sqe = opcode::AsyncCancel::new(target_token)
            .build()
            .user_data(token);
        self.push(&sqe, true)
    }

    // ── Submit and reap ──────────────────────────────────────────────

    /// Flush queued entries to the kernel. Returns the accepted count.
    pub fn submit_batch(&mut self) -> WireResult<usize> {
        if self.pending_submit == 0 {
            return Ok(0);
        }
        let submitted = self
            .ring
            .submit()
            .map_err(|e| WireError::RingSubmit(e.raw_os_error().unwrap_or(-1)))?;
        self.stats.submitted += submitted as u64;
        self.pending_submit = 0;
        Ok(submitted)
    }

    /// Drain all currently available completions into the sink.
    /// Never blocks. Returns the count drained.
    pub fn poll<S: CompletionSink>(&mut self, sink: &mut S) -> usize {
        if self.closed {
            return 0;
        }
        let mut count = 0;
        let cq = self.ring.completion();
        for cqe in cq {
            let c = Completion::new(cqe.user_data(), cqe.result(), cqe.flags());

            if self.zc_pending.contains(&c.token) {
                // First stage keeps the op in flight until NOTIF.
                if c.is_notif() {
                    self.zc_pending.remove(&c.token);
                    self.stats.notif_seen += 1;
                    self.inflight = self.inflight.saturating_sub(1);
                }
            } else if !c.has_more() {
                self.inflight = self.inflight.saturating_sub(1);
            }

            self.stats.completed += 1;
            count += 1;
            sink.complete(c);
        }
        count
    }

    /// Block for up to `millis` for at least one completion, then drain
    /// everything available. Returns the count drained (zero on
    /// expiry). The timespec is cached — no allocation per call.
    pub fn wait_for_completion<S: CompletionSink>(
        &mut self,
        millis: u64,
        sink: &mut S,
    ) -> WireResult<usize> {
        if self.closed {
            return Ok(0);
        }
        self.timespec = types::Timespec::new()
            .sec(millis / 1000)
            .nsec(((millis % 1000) * 1_000_000) as u32);
        let args = types::SubmitArgs::new().timespec(&self.timespec);

        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(submitted) => {
                self.stats.submitted += submitted as u64;
                self.pending_submit = 0;
            }
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(0);
                // Timeout and signal wakeups are normal outcomes.
                if errno != libc::ETIME && errno != libc::EINTR && errno != libc::EBUSY {
                    return Err(WireError::RingSubmit(errno));
                }
            }
        }
        Ok(self.poll(sink))
    }

    /// Teardown. Idempotent. Residual completions are drained and
    /// discarded so the kernel can release ring resources cleanly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.submit_batch();
        let mut sink = |_c: Completion| {};
        loop {
            if self.poll(&mut sink) == 0 {
                break;
            }
        }
        if self.owns_fd {
            if let Some(fd) = self.sock_fd.take() {
                unsafe { libc::close(fd) };
            }
        }
        self.inflight = 0;
        self.pending_submit = 0;
        self.closed = true;
        // IoUring::drop unmaps the rings and closes the ring fd.
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

    /// Install a new primary socket, closing the one it displaces.
    fn replace_primary(&mut self, fd: RawFd) {
        if self.owns_fd {
            if let Some(old) = self.sock_fd.take() {
                unsafe { libc::close(old) };
            }
        }
        self.sock_fd = Some(fd);
        self.owns_fd = true;
    }

    fn ensure_open(&self) -> WireResult<()> {
        if self.closed {
            return Err(WireError::NotInitialized);
        }
        Ok(())
    }

    /// Push one SQE, force-submitting when the queue is full.
    /// `counts_completion` is false for entries whose success
    /// completion the kernel will suppress.
    fn push(&mut self, entry: &squeue::Entry, counts_completion: bool) -> WireResult<()> {
        self.ensure_open()?;
        for _ in 0..MAX_SQ_RETRIES {
            let pushed = unsafe { self.ring.submission().push(entry).is_ok() };
            if pushed {
                self.pending_submit += 1;
                if counts_completion {
                    self.inflight += 1;
                }
                return Ok(());
            }
            self.stats.sq_full_retries += 1;
            self.submit_batch()?;
        }
        Err(WireError::RingFull)
    }
}

impl Drop for UringBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringwire_core::token::{op, OpToken};
    use std::io::{Read, Write};

    /// Rings cannot be created in every sandbox; tests bail out rather
    /// than fail when the kernel says no.
    fn ring_or_skip(config: UringConfig) -> Option<UringBackend> {
        match UringBackend::new(config) {
            Ok(b) => Some(b),
            Err(e) => {
                eprintln!("uring tests: skipping, ring setup failed: {}", e);
                None
            }
        }
    }

    #[test]
    fn builder_ladder_produces_a_ring() {
        let Some(be) = ring_or_skip(UringConfig::default()) else { return };
        assert!(be.queue_depth() >= 256);
        assert!(be.supports_registered_buffers());
        assert!(be.supports_batch());
        assert!(!be.supports_tls());
    }

    #[test]
    fn ops_before_bind_fail_cleanly() {
        let Some(mut be) = ring_or_skip(UringConfig::default()) else { return };
        assert!(matches!(
            be.submit_accept(0),
            Err(WireError::NotInitialized)
        ));
        let pool = BufPool::new(4, 1024).unwrap();
        let buf = pool.acquire().unwrap().unwrap();
        assert!(matches!(
            be.send(&buf, 4, 1),
            Err(WireError::NotInitialized)
        ));
        pool.release(buf).unwrap();
    }

    #[test]
    fn ops_after_close_return_empty() {
        let Some(mut be) = ring_or_skip(UringConfig::default()) else { return };
        be.close();
        be.close(); // idempotent
        let mut sink = |_c: Completion| panic!("no completions after close");
        assert_eq!(be.poll(&mut sink), 0);
        assert_eq!(be.wait_for_completion(1, &mut sink).unwrap(), 0);
        assert!(matches!(
            be.submit_accept(0),
            Err(WireError::NotInitialized)
        ));
    }

    #[test]
    fn wait_times_out_with_zero() {
        let Some(mut be) = ring_or_skip(UringConfig::default()) else { return };
        let mut sink = |_c: Completion| {};
        let start = std::time::Instant::now();
        let n = be.wait_for_completion(30, &mut sink).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= std::time::Duration::from_millis(25));
    }

    #[test]
    fn accept_recv_echo_round_trip() {
        let Some(mut be) = ring_or_skip(UringConfig::default()) else { return };
        be.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = be.local_port().unwrap();

        be.submit_accept(OpToken::ACCEPT.raw()).unwrap();
        be.submit_batch().unwrap();

        // Plain blocking client on a helper thread.
        let client = std::thread::spawn(move || {
            let mut s = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(&12_345_678u32.to_be_bytes()).unwrap();
            let mut echo = [0u8; 4];
            s.read_exact(&mut echo).unwrap();
            u32::from_be_bytes(echo)
        });

        // Accept.
        let mut accepted: Option<RawFd> = None;
        for _ in 0..100 {
            let mut sink = |c: Completion| {
                if c.token == 0 && c.result >= 0 {
                    accepted = Some(c.result);
                }
            };
            be.wait_for_completion(100, &mut sink).unwrap();
            if accepted.is_some() {
                break;
            }
        }
        let conn = be.create_from_accepted(accepted.expect("accept completion"));

        // Recv into a pool buffer.
        let pool = BufPool::new(16, 1024).unwrap();
        let mut buf = pool.acquire().unwrap().unwrap();
        let recv_tok = OpToken::encode(op::RECV, 1, 1).raw();
        be.submit_recv_to(conn.fd(), buf.addr(), buf.capacity(), recv_tok)
            .unwrap();
        be.submit_batch().unwrap();

        let mut got = 0i32;
        for _ in 0..100 {
            let mut sink = |c: Completion| {
                if c.token == recv_tok {
                    got = c.result;
                }
            };
            be.wait_for_completion(100, &mut sink).unwrap();
            if got != 0 {
                break;
            }
        }
        assert_eq!(got, 4);
        buf.set_len(4);
        assert_eq!(buf.read_u32_be(0), 12_345_678);

        // Echo back on the same buffer.
        let send_tok = OpToken::encode(op::SEND, 1, 1).raw();
        be.submit_send_to(conn.fd(), buf.addr(), 4, send_tok).unwrap();
        be.submit_batch().unwrap();
        let mut sent = 0i32;
        for _ in 0..100 {
            let mut sink = |c: Completion| {
                if c.token == send_tok {
                    sent = c.result;
                }
            };
            be.wait_for_completion(100, &mut sink).unwrap();
            if sent != 0 {
                break;
            }
        }
        assert_eq!(sent, 4);

        assert_eq!(client.join().unwrap(), 12_345_678);
        pool.release(buf).unwrap();
        unsafe { libc::close(conn.fd()) };
    }

    #[test]
    fn small_ring_backpressure_loses_nothing() {
        let Some(mut be) = ring_or_skip(UringConfig {
            queue_depth: 8,
            ..Default::default()
        }) else {
            return;
        };

        // A local socketpair gives us a writable fd without networking.
        let mut fds = [0i32; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);

        let pool = BufPool::new(16, 4096).unwrap();
        let mut bufs = Vec::new();
        let mut queued = 0usize;
        for i in 0..16u64 {
            let mut buf = pool.acquire().unwrap().unwrap();
            buf.write_at(0, b"pressure");
            match be.submit_send_to(fds[0], buf.addr(), 8, 1000 + i) {
                Ok(()) => queued += 1,
                Err(WireError::RingFull) => {}
                Err(e) => panic!("unexpected submit error: {}", e),
            }
            bufs.push(buf);
        }
        // Force-submit on full SQ means everything fits eventually.
        assert_eq!(queued, 16);
        be.submit_batch().unwrap();

        let mut done = 0usize;
        for _ in 0..200 {
            let mut sink = |c: Completion| {
                assert!(c.result > 0, "send failed: {}", c.result);
                done += 1;
            };
            be.wait_for_completion(50, &mut sink).unwrap();
            if done == 16 {
                break;
            }
        }
        assert_eq!(done, 16);

        // No buffer lost: all 16 go back to the pool.
        for buf in bufs {
            pool.release(buf).unwrap();
        }
        assert_eq!(pool.available(), 16);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn registered_pool_round_trip() {
        let Some(mut be) = ring_or_skip(UringConfig::default()) else { return };
        let pool = BufPool::new(8, 4096).unwrap();
        if let Err(e) = be.register_pool(&pool) {
            eprintln!("uring tests: skipping registered round trip: {}", e);
            return;
        }
        assert!(be.buffers_registered());

        let mut fds = [0i32; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );

        let mut out = pool.acquire().unwrap().unwrap();
        out.write_at(0, b"fixed path");
        be.submit_send_registered_to(fds[0], &out, 10, 7).unwrap();

        let mut inb = pool.acquire().unwrap().unwrap();
        be.submit_recv_registered_to(fds[1], &mut inb, 4096, 8).unwrap();
        be.submit_batch().unwrap();

        let mut got_send = 0i32;
        let mut got_recv = 0i32;
        for _ in 0..200 {
            let mut sink = |c: Completion| match c.token {
                7 => got_send = c.result,
                8 => got_recv = c.result,
                _ => {}
            };
            be.wait_for_completion(50, &mut sink).unwrap();
            if got_send != 0 && got_recv != 0 {
                break;
            }
        }
        assert_eq!(got_send, 10);
        assert_eq!(got_recv, 10);
        inb.set_len(10);
        assert_eq!(inb.as_slice(), b"fixed path");

        pool.release(out).unwrap();
        pool.release(inb).unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn linked_request_response_chain() {
        let Some(mut be) = ring_or_skip(UringConfig::default()) else { return };

        let mut fds = [0i32; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );

        let pool = BufPool::new(8, 4096).unwrap();
        let mut req = pool.acquire().unwrap().unwrap();
        req.write_at(0, b"ping");
        let mut resp = pool.acquire().unwrap().unwrap();

        // Peer: echo whatever arrives on the other end of the pair.
        let peer_fd = fds[1];
        let peer = std::thread::spawn(move || {
            let mut tmp = [0u8; 16];
            let n = unsafe {
                libc::read(peer_fd, tmp.as_mut_ptr() as *mut libc::c_void, 16)
            };
            assert_eq!(n, 4);
            unsafe { libc::write(peer_fd, tmp.as_ptr() as *const libc::c_void, 4) };
        });

        be.submit_linked_request_response(fds[0], &req, 4, &mut resp, 4096, 21, 22)
            .unwrap();
        be.submit_batch().unwrap();

        let mut send_res = 0i32;
        let mut recv_res = 0i32;
        for _ in 0..200 {
            let mut sink = |c: Completion| match c.token {
                21 => send_res = c.result,
                22 => recv_res = c.result,
                _ => {}
            };
            be.wait_for_completion(50, &mut sink).unwrap();
            if send_res != 0 && recv_res != 0 {
                break;
            }
        }
        peer.join().unwrap();

        assert_eq!(send_res, 4);
        assert_eq!(recv_res, 4);
        resp.set_len(4);
        assert_eq!(resp.as_slice(), b"ping");

        pool.release(req).unwrap();
        pool.release(resp).unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
