//! Graceful-shutdown coordinator.
//!
//! Four ordered phases, forward transitions only:
//!
//! ```text
//! RUNNING ──► DRAINING ──► CLOSING ──► TERMINATED
//! ```
//!
//! `DRAINING → CLOSING` is forced once the drain timeout elapses even
//! with operations still in flight; the shutdown then counts as
//! non-graceful. Closers run exactly once across `shutdown` and
//! `shutdown_now`.
//!
//! Sequencing contract for the transport: drain in-flight operations,
//! close connections (cancelling multishot submissions and reaping
//! residual completions), and only then release the buffer arena —
//! no in-flight kernel submission may reference the arena at close.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{WireError, WireResult};

/// Shutdown phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Running = 0,
    Draining = 1,
    Closing = 2,
    Terminated = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Running,
            1 => Phase::Draining,
            2 => Phase::Closing,
            _ => Phase::Terminated,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Running => "RUNNING",
            Phase::Draining => "DRAINING",
            Phase::Closing => "CLOSING",
            Phase::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Listener for phase changes: `(previous, current)`.
pub type PhaseListener = Box<dyn Fn(Phase, Phase) + Send + Sync>;

/// Completion callback: `(graceful, elapsed_millis)`.
pub type CompletionListener = Box<dyn Fn(bool, u64) + Send + Sync>;

struct Inflight {
    count: usize,
}

/// Coordinates the drain/close/release sequence.
pub struct ShutdownCoordinator {
    phase: AtomicU8,
    inflight: Mutex<Inflight>,
    drained: Condvar,
    closers_ran: AtomicBool,
    phase_listeners: Mutex<Vec<PhaseListener>>,
    completion_listeners: Mutex<Vec<CompletionListener>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Running as u8),
            inflight: Mutex::new(Inflight { count: 0 }),
            drained: Condvar::new(),
            closers_ran: AtomicBool::new(false),
            phase_listeners: Mutex::new(Vec::new()),
            completion_listeners: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn add_phase_listener(&self, l: PhaseListener) {
        if let Ok(mut v) = self.phase_listeners.lock() {
            v.push(l);
        }
    }

    pub fn on_shutdown_complete(&self, l: CompletionListener) {
        if let Ok(mut v) = self.completion_listeners.lock() {
            v.push(l);
        }
    }

    /// Register a new in-flight operation. Rejected once draining has
    /// begun.
    pub fn operation_started(&self) -> WireResult<()> {
        if self.phase() > Phase::Running {
            return Err(WireError::ShuttingDown);
        }
        let mut guard = self.inflight.lock().expect("inflight lock");
        guard.count += 1;
        Ok(())
    }

    /// Mark one in-flight operation done. Never goes negative.
    pub fn operation_completed(&self) {
        let mut guard = self.inflight.lock().expect("inflight lock");
        guard.count = guard.count.saturating_sub(1);
        if guard.count == 0 {
            self.drained.notify_all();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|g| g.count).unwrap_or(0)
    }

    /// Drain, close, release. Returns `true` iff all in-flight
    /// operations completed inside the timeout (graceful).
    pub fn shutdown<C, R>(&self, timeout: Duration, close_connections: C, release_resources: R) -> bool
    where
        C: FnOnce(),
        R: FnOnce(),
    {
        let start = Instant::now();

        if !self.advance(Phase::Running, Phase::Draining) {
            // Someone else is already shutting down; just wait it out.
            self.await_termination(timeout);
            return false;
        }

        let graceful = {
            let guard = self.inflight.lock().expect("inflight lock");
            let (guard, wait) = self
                .drained
                .wait_timeout_while(guard, timeout, |inflight| inflight.count > 0)
                .expect("inflight wait");
            drop(guard);
            !wait.timed_out()
        };

        self.advance(Phase::Draining, Phase::Closing);
        self.run_closers(close_connections, release_resources);
        self.advance(Phase::Closing, Phase::Terminated);

        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.notify_complete(graceful, elapsed_ms);
        graceful
    }

    /// Immediate shutdown: skip draining. Idempotent — a second call
    /// returns without re-invoking the closers.
    pub fn shutdown_now<C, R>(&self, close_connections: C, release_resources: R)
    where
        C: FnOnce(),
        R: FnOnce(),
    {
        let start = Instant::now();
        // Jump whatever earlier phase we are in straight to Closing.
        let mut moved = false;
        for from in [Phase::Running, Phase::Draining] {
            if self.advance(from, Phase::Closing) {
                moved = true;
                break;
            }
        }
        if !moved && self.phase() == Phase::Terminated {
            return;
        }

        self.run_closers(close_connections, release_resources);
        self.advance(Phase::Closing, Phase::Terminated);
        self.notify_complete(false, start.elapsed().as_millis() as u64);
    }

    /// Block until TERMINATED or the timeout expires.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.phase() != Phase::Terminated {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    // ── Internals ────────────────────────────────────────────────────

    fn advance(&self, from: Phase, to: Phase) -> bool {
        debug_assert!(from < to);
        let ok = self
            .phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.notify_phase(from, to);
        }
        ok
    }

    fn run_closers<C: FnOnce(), R: FnOnce()>(&self, close_connections: C, release_resources: R) {
        if self.closers_ran.swap(true, Ordering::AcqRel) {
            return;
        }
        // Connections first: cancels multishot ops and reaps residuals
        // so nothing in flight still references the arena.
        close_connections();
        release_resources();
    }

    fn notify_phase(&self, prev: Phase, next: Phase) {
        let guard = match self.phase_listeners.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        for l in guard.iter() {
            if catch_unwind(AssertUnwindSafe(|| l(prev, next))).is_err() {
                eprintln!("wire-shutdown: phase listener panicked on {} -> {}", prev, next);
            }
        }
    }

    fn notify_complete(&self, graceful: bool, elapsed_ms: u64) {
        let guard = match self.completion_listeners.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        for l in guard.iter() {
            if catch_unwind(AssertUnwindSafe(|| l(graceful, elapsed_ms))).is_err() {
                eprintln!("wire-shutdown: completion listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Running < Phase::Draining);
        assert!(Phase::Draining < Phase::Closing);
        assert!(Phase::Closing < Phase::Terminated);
    }

    #[test]
    fn graceful_with_late_completion() {
        let coord = Arc::new(ShutdownCoordinator::new());
        coord.operation_started().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        coord.add_phase_listener(Box::new(move |_, next| {
            seen2.lock().unwrap().push(next);
        }));

        let completer = coord.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            completer.operation_completed();
        });

        let graceful = coord.shutdown(Duration::from_millis(100), || {}, || {});
        t.join().unwrap();

        assert!(graceful);
        assert_eq!(coord.phase(), Phase::Terminated);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Phase::Draining, Phase::Closing, Phase::Terminated]
        );
    }

    #[test]
    fn timeout_forces_closing() {
        let coord = ShutdownCoordinator::new();
        coord.operation_started().unwrap();
        // Operation never completes — drain times out.
        let graceful = coord.shutdown(Duration::from_millis(20), || {}, || {});
        assert!(!graceful);
        assert_eq!(coord.phase(), Phase::Terminated);
    }

    #[test]
    fn operations_rejected_after_drain_begins() {
        let coord = ShutdownCoordinator::new();
        coord.shutdown(Duration::from_millis(1), || {}, || {});
        assert!(matches!(
            coord.operation_started(),
            Err(WireError::ShuttingDown)
        ));
    }

    #[test]
    fn shutdown_now_runs_closers_once() {
        let coord = ShutdownCoordinator::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let r1 = runs.clone();
        coord.shutdown_now(move || { r1.fetch_add(1, Ordering::SeqCst); }, || {});
        let r2 = runs.clone();
        coord.shutdown_now(move || { r2.fetch_add(1, Ordering::SeqCst); }, || {});

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(coord.phase(), Phase::Terminated);
    }

    #[test]
    fn closers_ordered_connections_then_resources() {
        let coord = ShutdownCoordinator::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        coord.shutdown(
            Duration::from_millis(1),
            move || o1.lock().unwrap().push("connections"),
            move || o2.lock().unwrap().push("resources"),
        );
        assert_eq!(*order.lock().unwrap(), vec!["connections", "resources"]);
    }

    #[test]
    fn completion_listener_reports_graceful_flag() {
        let coord = ShutdownCoordinator::new();
        let flag = Arc::new(Mutex::new(None));
        let flag2 = flag.clone();
        coord.on_shutdown_complete(Box::new(move |graceful, _ms| {
            *flag2.lock().unwrap() = Some(graceful);
        }));
        coord.shutdown(Duration::from_millis(1), || {}, || {});
        assert_eq!(*flag.lock().unwrap(), Some(true));
    }

    #[test]
    fn completed_never_goes_negative() {
        let coord = ShutdownCoordinator::new();
        coord.operation_completed();
        coord.operation_completed();
        assert_eq!(coord.in_flight(), 0);
    }

    #[test]
    fn await_termination_times_out_while_running() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.await_termination(Duration::from_millis(10)));
    }
}
