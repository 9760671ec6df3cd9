//! # ringwire-core — transport contracts
//!
//! Shared vocabulary between the backends, the buffer pools, and the
//! server dispatch loop:
//!
//! - [`token`] — 64-bit operation tokens carried through the kernel
//!   unchanged (`user_data` in, `user_data` out).
//! - [`completion`] — the logical completion-queue record and its flag
//!   bits, plus the handler contract.
//! - [`state`] — the connection lifecycle state machine (atomic CAS,
//!   listener fan-out).
//! - [`framing`] — 4-byte big-endian length-prefix framing.
//! - [`error`] — the closed error taxonomy and classification registry.
//! - [`retry`] — exponential backoff with jitter, driven by category.
//! - [`shutdown`] — phase-ordered graceful drain coordinator.
//!
//! This crate holds no file descriptors and issues no syscalls; it is the
//! *lingua franca* the OS-facing crates agree on.

pub mod completion;
pub mod error;
pub mod framing;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod token;

pub use completion::{Completion, CompletionSink};
pub use error::{ErrorCategory, WireError, WireResult};
pub use state::{ConnState, StateCell};
pub use token::OpToken;
