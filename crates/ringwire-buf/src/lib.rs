//! # ringwire-buf — wire-side memory
//!
//! All buffers handed to the kernel come from here: one contiguous,
//! page-aligned mmap slab per pool, carved into fixed-size slots and
//! registrable with the kernel in a single call.
//!
//! Two pool disciplines coexist, with identical semantics modulo
//! ownership:
//!
//! - [`pool::BufPool`] — lock-free MPSC free-index ring, refcounted.
//!   Double free is a defect and fails loudly.
//! - [`pool::BlockingPool`] — bounded queue with a blocking `acquire`.
//!   `release` is idempotent.
//!
//! [`timed::TimedPool`] layers bounded waiting and latency metrics on
//! the lock-free pool. [`track`] is a process-wide allocation tracker
//! behind a toggle, with an explicit reset for tests.

pub mod arena;
pub mod buffer;
pub mod free_ring;
pub mod pool;
pub mod timed;
pub mod track;

pub use arena::SlabArena;
pub use buffer::WireBuf;
pub use pool::{BlockingPool, BufPool, RetainedBuf};
pub use timed::{PoolMetrics, TimedPool};
