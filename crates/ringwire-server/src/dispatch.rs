//! The server dispatch loop.
//!
//! Single-threaded and busy-polling: one thread owns the backend,
//! issues every submission, reaps every completion, and runs the
//! handler callbacks. When no completion is available the loop spins
//! with a CPU hint rather than sleeping; optionally the thread is
//! pinned to a configured core.
//!
//! Completion demultiplexing decodes the token: op in the top 16 bits,
//! connection id in the middle 32, request id in the low 16. Token 0 is
//! the armed accept, re-armed on every accept completion.
//!
//! Shutdown sequencing: stop accepting, cancel armed receives, drain
//! write completions up to the configured timeout, then close
//! connections and finally the pool — no in-flight submission may
//! reference the slab once it is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ringwire_buf::BufPool;
use ringwire_core::completion::Completion;
use ringwire_core::error::WireResult;
use ringwire_core::shutdown::{Phase, ShutdownCoordinator};
use ringwire_core::state::ConnState;
use ringwire_core::token::{op, OpToken};
use ringwire_io::Backend;

use crate::config::ServerConfig;
use crate::conn::{ConnCtx, ConnRecord};
use crate::handler::{DataAction, ServerHandler};

/// Token used for cancel submissions during teardown.
const CANCEL_TOKEN: u64 = u64::MAX - 1;

/// Cloneable handle for stopping and observing a running server.
#[derive(Clone)]
pub struct ServerControl {
    stop: Arc<AtomicBool>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl ServerControl {
    /// Ask the loop to leave its polling loop and run the shutdown
    /// sequence.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn phase(&self) -> Phase {
        self.coordinator.phase()
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.coordinator.await_termination(timeout)
    }
}

pub struct WireServer<H: ServerHandler> {
    config: ServerConfig,
    handler: H,
    backend: Backend,
    pool: BufPool,
    conns: Vec<Option<ConnRecord>>,
    free_ids: Vec<u32>,
    /// Write buffers whose connection died before the completion
    /// arrived, keyed by the send token.
    orphan_writes: HashMap<u64, ringwire_buf::WireBuf>,
    comp_buf: Vec<Completion>,
    stop: Arc<AtomicBool>,
    coordinator: Arc<ShutdownCoordinator>,
    started: bool,
}

impl<H: ServerHandler> WireServer<H> {
    pub fn new(config: ServerConfig, handler: H) -> WireResult<Self> {
        config.validate()?;
        let pool = BufPool::new(config.num_buffers, config.buffer_size)?;
        let mut backend = Backend::create(config.backend, config.uring_config())?;
        if backend.supports_registered_buffers() {
            // Registration failure is fatal for a ring that was asked
            // for it; the selector simply reports unsupported.
            backend.register_pool(&pool)?;
        }
        Ok(Self {
            config,
            handler,
            backend,
            pool,
            conns: Vec::new(),
            free_ids: Vec::new(),
            orphan_writes: HashMap::new(),
            comp_buf: Vec::with_capacity(256),
            stop: Arc::new(AtomicBool::new(false)),
            coordinator: Arc::new(ShutdownCoordinator::new()),
            started: false,
        })
    }

    pub fn control(&self) -> ServerControl {
        ServerControl {
            stop: Arc::clone(&self.stop),
            coordinator: Arc::clone(&self.coordinator),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Bind and arm the accept without entering the loop. Useful for
    /// learning the bound port before `run`.
    pub fn start(&mut self) -> WireResult<()> {
        if self.started {
            return Ok(());
        }
        if self.config.cpu_affinity >= 0 {
            pin_to_cpu(self.config.cpu_affinity as usize);
        }
        self.backend.bind(self.config.addr()?)?;
        self.backend.submit_accept(OpToken::ACCEPT.raw())?;
        self.backend.submit_batch()?;
        self.started = true;
        eprintln!(
            "wire-server: listening on {}:{} — {:?} backend, {} × {} B buffers, sq {}",
            self.config.host,
            self.local_port().unwrap_or(self.config.port),
            self.backend.kind(),
            self.pool.capacity(),
            self.pool.buf_size(),
            self.config.queue_depth,
        );
        Ok(())
    }

    pub fn local_port(&self) -> WireResult<u16> {
        self.backend.local_port()
    }

    /// The dispatch loop. Returns once [`ServerControl::stop`] is
    /// called; the shutdown sequence has fully run by then.
    pub fn run(&mut self) -> WireResult<()> {
        self.start()?;
        while self.coordinator.is_running() && !self.stop.load(Ordering::Acquire) {
            let n = self.pump(0);
            if n == 0 {
                std::hint::spin_loop();
            }
        }
        let graceful = self.teardown();
        eprintln!(
            "wire-server: shutdown {}",
            if graceful { "(graceful)" } else { "(forced)" }
        );
        Ok(())
    }

    // ── Completion pump ──────────────────────────────────────────────

    /// Reap once: drain available completions (blocking up to
    /// `wait_millis` when nonzero), process them, flush submissions.
    fn pump(&mut self, wait_millis: u64) -> usize {
        let mut batch = std::mem::take(&mut self.comp_buf);
        batch.clear();
        {
            let mut sink = |c: Completion| batch.push(c);
            if wait_millis == 0 {
                self.backend.poll(&mut sink);
            } else {
                let _ = self.backend.wait_for_completion(wait_millis, &mut sink);
            }
        }
        let n = batch.len();
        for c in batch.drain(..) {
            self.handle_completion(c);
        }
        self.comp_buf = batch;
        let _ = self.backend.submit_batch();
        n
    }

    fn handle_completion(&mut self, c: Completion) {
        if c.is_notif() {
            // Zero-copy second stage; the loop's write path does not
            // use zero-copy sends.
            return;
        }
        let token = OpToken::from(c.token);
        if c.token == CANCEL_TOKEN {
            return;
        }
        match token.op() {
            op::ACCEPT => self.on_accept(c),
            op::RECV => self.on_recv(token.conn(), c),
            op::SEND => self.on_send(token.conn(), token.req(), c),
            _ => {}
        }
    }

    // ── Accept path ──────────────────────────────────────────────────

    fn on_accept(&mut self, c: Completion) {
        // Re-arm first so a burst of connections keeps flowing; skip
        // once shutdown began.
        if !c.has_more() && !self.stop.load(Ordering::Acquire) && self.coordinator.is_running() {
            if let Err(e) = self.backend.submit_accept(OpToken::ACCEPT.raw()) {
                eprintln!("wire-server: accept re-arm failed: {}", e);
            }
        }
        if c.result < 0 {
            if c.errno() != Some(libc::ECANCELED) {
                eprintln!("wire-server: accept error: {}", c.result);
            }
            return;
        }

        let fd = self.backend.create_from_accepted(c.result);
        let id = self.alloc_id();
        let mut record = ConnRecord::new(id, fd, self.config.pending_writes);
        record.state.transition_to(ConnState::Connecting);
        record.state.transition_to(ConnState::Connected);

        // Arm the first receive before the connection goes live.
        let buf = match self.pool.acquire() {
            Ok(Some(buf)) => buf,
            _ => {
                eprintln!("wire-server: pool exhausted, refusing connection");
                unsafe { libc::close(fd) };
                self.free_ids.push(id);
                return;
            }
        };
        let recv_token = OpToken::encode(op::RECV, id, 0).raw();
        if let Err(e) = self
            .backend
            .submit_recv_to(fd, buf.addr(), buf.capacity(), recv_token)
        {
            eprintln!("wire-server: first recv failed: {}", e);
            let _ = self.pool.release(buf);
            unsafe { libc::close(fd) };
            self.free_ids.push(id);
            return;
        }
        record.set_read(buf);

        let slot = id as usize;
        if slot >= self.conns.len() {
            self.conns.resize_with(slot + 1, || None);
        }
        self.conns[slot] = Some(record);

        let record = self.conns[slot].as_mut().expect("stored record");
        self.handler.on_connect(&mut ConnCtx::new(record));
    }

    // ── Read path ────────────────────────────────────────────────────

    fn on_recv(&mut self, id: u32, c: Completion) {
        let Some(record) = self.conns.get_mut(id as usize).and_then(|s| s.as_mut()) else {
            return;
        };
        if c.result <= 0 {
            // EOF, reset, or cancellation — the armed read has
            // completed, so its buffer is safe to reclaim.
            self.disconnect(id);
            return;
        }

        let len = c.result as usize;
        let Some(mut buf) = record.take_read() else {
            return;
        };
        buf.set_len(len);

        let action = self
            .handler
            .on_data(&mut ConnCtx::new(record), &mut buf, len);
        let fd = record.fd();

        match action {
            DataAction::Reply(reply_len) => {
                let reply_len = reply_len.min(buf.capacity());
                let req = record.next_req();
                let send_token = OpToken::encode(op::SEND, id, req).raw();
                if let Err(e) = self
                    .backend
                    .submit_send_to(fd, buf.addr(), reply_len, send_token)
                {
                    eprintln!("wire-server: send failed: {}", e);
                    let _ = self.pool.release(buf);
                    self.disconnect(id);
                    return;
                }
                if let Some(evicted) = record.stamp_write(req, buf) {
                    // Table wrapped: the connection has more than
                    // `pending_writes` sends outstanding.
                    let _ = self.pool.release(evicted);
                }

                // Fresh buffer for the next receive.
                match self.pool.acquire() {
                    Ok(Some(next)) => {
                        let recv_token = OpToken::encode(op::RECV, id, 0).raw();
                        if self
                            .backend
                            .submit_recv_to(fd, next.addr(), next.capacity(), recv_token)
                            .is_ok()
                        {
                            record.set_read(next);
                        } else {
                            let _ = self.pool.release(next);
                            self.disconnect(id);
                        }
                    }
                    _ => {
                        eprintln!("wire-server: pool exhausted, dropping connection {}", id);
                        self.disconnect(id);
                    }
                }
            }
            DataAction::Drop => {
                // Reuse the same buffer for the next receive.
                buf.clear();
                let recv_token = OpToken::encode(op::RECV, id, 0).raw();
                if self
                    .backend
                    .submit_recv_to(fd, buf.addr(), buf.capacity(), recv_token)
                    .is_ok()
                {
                    record.set_read(buf);
                } else {
                    let _ = self.pool.release(buf);
                    self.disconnect(id);
                }
            }
        }
    }

    // ── Write path ───────────────────────────────────────────────────

    fn on_send(&mut self, id: u32, req: u16, c: Completion) {
        if let Some(record) = self.conns.get_mut(id as usize).and_then(|s| s.as_mut()) {
            if let Some(buf) = record.take_write(req) {
                let _ = self.pool.release(buf);
            }
        } else if let Some(buf) = self.orphan_writes.remove(&c.token) {
            let _ = self.pool.release(buf);
        }
        if c.result < 0 && c.errno() != Some(libc::ECANCELED) {
            // The read path will observe the broken connection next.
            eprintln!("wire-server: write error on conn {}: {}", id, c.result);
        }
    }

    // ── Disconnect and teardown ──────────────────────────────────────

    fn disconnect(&mut self, id: u32) {
        let Some(mut record) = self.conns.get_mut(id as usize).and_then(|s| s.take()) else {
            return;
        };
        record.state.transition_to(ConnState::Closing);

        // The armed read completed before we got here; its buffer is
        // kernel-free. In-flight writes are parked until their
        // completions release them.
        if let Some(buf) = record.take_read() {
            let _ = self.pool.release(buf);
        }
        for (req, buf) in record.drain_writes() {
            let token = OpToken::encode(op::SEND, id, req).raw();
            self.orphan_writes.insert(token, buf);
        }

        record.state.transition_to(ConnState::Closed);
        unsafe { libc::close(record.fd()) };
        self.handler.on_disconnect(id);
        self.free_ids.push(id);
    }

    fn live_conns(&self) -> usize {
        self.conns.iter().filter(|s| s.is_some()).count()
    }

    /// The shutdown sequence: cancel armed ops, drain completions up
    /// to the configured timeout, then close connections and release
    /// the pool in coordinator order. Returns `true` when everything
    /// drained inside the timeout.
    fn teardown(&mut self) -> bool {
        let _ = self
            .backend
            .submit_cancel(OpToken::ACCEPT.raw(), CANCEL_TOKEN);
        let ids: Vec<u32> = self
            .conns
            .iter()
            .filter_map(|s| s.as_ref().map(|r| r.id()))
            .collect();
        for id in ids {
            let token = OpToken::encode(op::RECV, id, 0).raw();
            let _ = self.backend.submit_cancel(token, CANCEL_TOKEN);
        }
        let _ = self.backend.submit_batch();

        let deadline = Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        while Instant::now() < deadline {
            let n = self.pump(5);
            if n == 0 && self.live_conns() == 0 && self.orphan_writes.is_empty() {
                break;
            }
        }
        let graceful = self.live_conns() == 0 && self.orphan_writes.is_empty();

        let coordinator = Arc::clone(&self.coordinator);
        let conns = &mut self.conns;
        let orphans = &mut self.orphan_writes;
        let handler = &mut self.handler;
        let backend = &mut self.backend;
        let pool = &self.pool;
        coordinator.shutdown(
            Duration::ZERO,
            move || {
                for slot in conns.iter_mut() {
                    if let Some(mut record) = slot.take() {
                        record.state.transition_to(ConnState::Closing);
                        record.release_all(pool);
                        record.state.transition_to(ConnState::Closed);
                        unsafe { libc::close(record.fd()) };
                        handler.on_disconnect(record.id());
                    }
                }
                // Closing the backend reaps anything still pending, so
                // residual buffers are kernel-free afterwards.
                backend.close();
                for (_, buf) in orphans.drain() {
                    let _ = pool.release(buf);
                }
            },
            move || {
                pool.close();
            },
        );
        graceful
    }

    fn alloc_id(&mut self) -> u32 {
        self.free_ids
            .pop()
            .unwrap_or_else(|| self.conns.len() as u32)
    }
}

fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            eprintln!("wire-server: cpu pin to {} failed", cpu);
        }
    }
}
