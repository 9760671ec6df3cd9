//! Connection lifecycle state machine.
//!
//! One atomic cell per connection; transitions are compare-and-set so
//! any thread may drive the lifecycle. A transition attempt from a
//! non-matching current state fails silently and returns `false` — no
//! error, no listener notification, no side effect.
//!
//! ```text
//! New ──────► Connecting ──────► Connected ──────► Closing ──► Closed
//!  │              │  ▲              │                 ▲
//!  │              ▼  │              ▼                 │
//!  └────► Closed  Failed ◄──────────┘     Connected ──┘
//!                  │ │
//!                  │ └──► Connecting (reconnect)
//!                  └────► Closed
//! ```
//!
//! Listener notification happens outside the CAS; a panicking listener
//! is caught and reported, never propagated.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use crate::error::WireError;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
    Closing = 4,
    /// Terminal. No transition leaves this state.
    Closed = 5,
}

impl ConnState {
    /// The transition table. Self-transitions are never valid.
    pub const fn valid_transition(from: ConnState, to: ConnState) -> bool {
        use ConnState::*;
        match (from, to) {
            (New, Connecting) | (New, Closed) => true,
            (Connecting, Connected) | (Connecting, Failed) | (Connecting, Closing) => true,
            (Connected, Closing) | (Connected, Failed) => true,
            (Failed, Connecting) | (Failed, Closed) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }

    #[inline]
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::New,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Failed,
            4 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::New => "NEW",
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::Failed => "FAILED",
            ConnState::Closing => "CLOSING",
            ConnState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Listener invoked after a successful transition:
/// `(previous, current, cause)`.
pub type StateListener =
    Box<dyn Fn(ConnState, ConnState, Option<&WireError>) + Send + Sync>;

/// Thread-safe state cell with listener fan-out.
pub struct StateCell {
    state: AtomicU8,
    listeners: Mutex<Vec<StateListener>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnState::New as u8),
            listeners: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn current(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn add_listener(&self, listener: StateListener) {
        if let Ok(mut l) = self.listeners.lock() {
            l.push(listener);
        }
    }

    /// Attempt `current → next`. Returns `false` (with no side effect)
    /// when the transition is invalid or another thread moved the state
    /// first.
    pub fn transition_to(&self, next: ConnState) -> bool {
        self.transition_with_cause(next, None)
    }

    pub fn transition_with_cause(&self, next: ConnState, cause: Option<&WireError>) -> bool {
        loop {
            let cur = self.current();
            if !ConnState::valid_transition(cur, next) {
                return false;
            }
            match self.state.compare_exchange(
                cur as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.notify(cur, next, cause);
                    return true;
                }
                // Lost the race — re-check against the new current state.
                Err(_) => continue,
            }
        }
    }

    /// Recovery bypass: set the state unconditionally. Listeners still
    /// fire with the observed previous state.
    pub fn force_state(&self, next: ConnState, cause: Option<&WireError>) {
        let prev = ConnState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            self.notify(prev, next, cause);
        }
    }

    fn notify(&self, prev: ConnState, next: ConnState, cause: Option<&WireError>) {
        let guard = match self.listeners.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        for listener in guard.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| listener(prev, next, cause)));
            if result.is_err() {
                eprintln!(
                    "wire-state: listener panicked on {} -> {}",
                    prev, next
                );
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    #[inline]
    pub fn is_active(&self) -> bool {
        self.current() == ConnState::Connected
    }

    #[inline]
    pub fn is_closed_or_closing(&self) -> bool {
        matches!(self.current(), ConnState::Closing | ConnState::Closed)
    }

    #[inline]
    pub fn can_connect(&self) -> bool {
        matches!(self.current(), ConnState::New | ConnState::Failed)
    }

    #[inline]
    pub fn can_reconnect(&self) -> bool {
        self.current() == ConnState::Failed
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCell")
            .field("state", &self.current())
            .finish()
    }
}
