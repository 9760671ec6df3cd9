//! Client-side connection establishment.
//!
//! Ties the three pieces together: the backend's asynchronous connect,
//! the connection lifecycle state machine, and the category-driven
//! retry policy. Establishment outcomes surface through
//! [`ConnectEvents`]: `on_connected` on success, `on_connection_failed`
//! with the final cause once the policy gives up, `on_closed` when an
//! established connection is torn down.
//!
//! The state machine observes every failure via
//! `transition_with_cause(Failed, cause)`; reconnect attempts are only
//! made from states where `can_connect` holds.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ringwire_core::completion::Completion;
use ringwire_core::error::{classify_errno, WireError, WireResult};
use ringwire_core::retry::{RetryContext, RetryPolicy};
use ringwire_core::state::{ConnState, StateCell};

use crate::backend::Backend;

/// Establishment callbacks. Default impls ignore everything.
pub trait ConnectEvents {
    fn on_connected(&mut self, _token: u64) {}
    fn on_connection_failed(&mut self, _token: u64, _errno: i32) {}
    fn on_closed(&mut self) {}
}

/// No-op events for callers that only want the return value.
pub struct NullEvents;

impl ConnectEvents for NullEvents {}

pub struct Connector {
    backend: Backend,
    state: StateCell,
    policy: RetryPolicy,
    /// How long one connect attempt may take before it counts as a
    /// timeout failure.
    attempt_timeout: Duration,
}

impl Connector {
    pub fn new(backend: Backend, policy: RetryPolicy) -> Self {
        Self {
            backend,
            state: StateCell::new(),
            policy,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    pub fn attempt_timeout(mut self, d: Duration) -> Self {
        self.attempt_timeout = d;
        self
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state.current()
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// The backend, for data-path submissions once connected.
    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    /// Connect with retry. Blocks the calling thread while driving the
    /// backend's completion loop; returns once CONNECTED or once the
    /// policy gives up. Retries consume fresh sockets; delays follow
    /// the policy's backoff with jitter.
    pub fn connect<E: ConnectEvents>(
        &mut self,
        addr: SocketAddr,
        token: u64,
        events: &mut E,
    ) -> WireResult<()> {
        if !self.state.can_connect() {
            return Err(WireError::InvalidConfig(format!(
                "cannot connect from state {}",
                self.state.current()
            )));
        }

        let mut retry = RetryContext::new();
        loop {
            self.state.transition_to(ConnState::Connecting);

            let errno = match self.attempt(addr, token) {
                Ok(()) => {
                    self.state.transition_to(ConnState::Connected);
                    events.on_connected(token);
                    return Ok(());
                }
                Err(errno) => errno,
            };

            let cause = WireError::Os(errno);
            self.state
                .transition_with_cause(ConnState::Failed, Some(&cause));
            retry.record_failure(classify_errno(errno));

            match retry.next_delay(&self.policy) {
                Some(delay) => {
                    std::thread::sleep(delay);
                    debug_assert!(self.state.can_reconnect());
                }
                None => {
                    events.on_connection_failed(token, errno);
                    return Err(cause);
                }
            }
        }
    }

    /// One connect attempt: submit, then reap until the token's
    /// completion arrives or the attempt times out.
    fn attempt(&mut self, addr: SocketAddr, token: u64) -> Result<(), i32> {
        if let Err(e) = self.backend.submit_connect(addr, token) {
            return Err(e.os_error().unwrap_or(libc::EIO));
        }
        if let Err(e) = self.backend.submit_batch() {
            return Err(e.os_error().unwrap_or(libc::EIO));
        }

        let deadline = Instant::now() + self.attempt_timeout;
        let mut result: Option<i32> = None;
        while result.is_none() && Instant::now() < deadline {
            let mut sink = |c: Completion| {
                if c.token == token && result.is_none() {
                    result = Some(c.result);
                }
            };
            if self.backend.wait_for_completion(5, &mut sink).is_err() {
                break;
            }
        }

        match result {
            Some(0) => Ok(()),
            Some(neg) if neg < 0 => Err(-neg),
            Some(_) => Ok(()),
            None => Err(libc::ETIMEDOUT),
        }
    }

    /// Tear the connection down. Valid from any state; `on_closed`
    /// fires only when an established connection actually closed.
    pub fn close<E: ConnectEvents>(&mut self, events: &mut E) {
        let was_active = self.state.is_active();
        self.state.transition_to(ConnState::Closing);
        self.backend.close();
        // Failed connections go straight to Closed through their own
        // edge in the table.
        if !self.state.transition_to(ConnState::Closed) {
            self.state.force_state(ConnState::Closed, None);
        }
        if was_active {
            events.on_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::uring::UringConfig;
    use ringwire_core::error::ErrorCategory;

    struct Recorder {
        connected: Vec<u64>,
        failed: Vec<(u64, i32)>,
        closed: usize,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                connected: Vec::new(),
                failed: Vec::new(),
                closed: 0,
            }
        }
    }

    impl ConnectEvents for Recorder {
        fn on_connected(&mut self, token: u64) {
            self.connected.push(token);
        }
        fn on_connection_failed(&mut self, token: u64, errno: i32) {
            self.failed.push((token, errno));
        }
        fn on_closed(&mut self) {
            self.closed += 1;
        }
    }

    fn selector_connector(policy: RetryPolicy) -> Connector {
        let backend = Backend::create(BackendKind::Selector, UringConfig::default()).unwrap();
        Connector::new(backend, policy).attempt_timeout(Duration::from_millis(500))
    }

    #[test]
    fn connects_and_fires_event() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = selector_connector(RetryPolicy::default());
        let mut events = Recorder::new();
        conn.connect(addr, 200, &mut events).unwrap();

        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(events.connected, vec![200]);
        assert!(events.failed.is_empty());

        conn.close(&mut events);
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(events.closed, 1);
    }

    #[test]
    fn refused_exhausts_policy_and_reports() {
        // Learn a dead port.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let policy = RetryPolicy::new(2, Duration::from_millis(5)).jitter(0.0);
        let mut conn = selector_connector(policy);
        let mut events = Recorder::new();

        let err = conn.connect(addr, 7, &mut events).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(events.failed.len(), 1);
        assert_eq!(events.failed[0], (7, libc::ECONNREFUSED));
        assert_eq!(conn.state(), ConnState::Failed);

        // Failed is reconnectable; a live listener fixes it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        conn.connect(listener.local_addr().unwrap(), 8, &mut events)
            .unwrap();
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(events.connected, vec![8]);
    }

    #[test]
    fn connect_from_connected_rejected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut conn = selector_connector(RetryPolicy::default());
        conn.connect(addr, 1, &mut NullEvents).unwrap();
        assert!(matches!(
            conn.connect(addr, 2, &mut NullEvents),
            Err(WireError::InvalidConfig(_))
        ));
    }

    #[test]
    fn close_without_connection_fires_nothing() {
        let mut conn = selector_connector(RetryPolicy::default());
        let mut events = Recorder::new();
        conn.close(&mut events);
        assert_eq!(events.closed, 0);
        assert_eq!(conn.state(), ConnState::Closed);
    }
}
