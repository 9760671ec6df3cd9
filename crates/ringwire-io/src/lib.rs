//! # ringwire-io — transport backends
//!
//! Two implementations of one operation surface:
//!
//! - [`uring::UringBackend`] — the real thing. Kernel io_uring with
//!   batched submission, registered buffers, multishot receive over a
//!   provided-buffer ring, linked chains, and zero-copy send.
//!   Requires Linux ≥ 5.1 (≥ 5.19 for the buffer ring).
//! - [`selector::SelectorBackend`] — portability fallback. Non-blocking
//!   sockets polled through epoll, completions synthesized on the
//!   dispatch thread. Same contract, no zero-copy guarantee.
//!
//! [`backend::Backend`] is the closed dispatch enum over the two; the
//! capability set is small and fixed, so a tagged variant beats an open
//! trait object here.

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("ringwire-io targets Linux only (io_uring, epoll)");
    }
}

pub mod backend;
pub mod buf_ring;
pub mod connector;
pub mod selector;
pub mod sockaddr;
pub mod uring;

pub use backend::{Backend, BackendKind, BackendStats};
pub use connector::{ConnectEvents, Connector};
pub use selector::SelectorBackend;
pub use uring::{UringBackend, UringConfig, UringStats};
