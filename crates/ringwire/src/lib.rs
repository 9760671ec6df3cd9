//! # ringwire
//!
//! A low-latency, zero-copy TCP transport built around Linux io_uring:
//! pre-registered slab buffers, batched submission, and handler-based
//! completion dispatch keyed by 64-bit tokens.
//!
//! ```rust,no_run
//! use ringwire::{DataAction, ServerConfig, ServerHandler, WireServer};
//!
//! struct Echo;
//! impl ServerHandler for Echo {
//!     fn on_data(
//!         &mut self,
//!         _conn: &mut ringwire::ConnCtx<'_>,
//!         _buf: &mut ringwire::WireBuf,
//!         len: usize,
//!     ) -> DataAction {
//!         DataAction::Reply(len)
//!     }
//! }
//!
//! let config = ServerConfig::from_env().port(9999);
//! let mut server = WireServer::new(config, Echo).unwrap();
//! server.run().unwrap();
//! ```

pub use ringwire_core::completion::{Completion, CompletionSink, FLAG_BUFFER, FLAG_MORE, FLAG_NOTIF};
pub use ringwire_core::error::{classify, classify_errno, ErrorCategory, WireError, WireResult};
pub use ringwire_core::framing::{Deframed, Framer};
pub use ringwire_core::retry::{RetryContext, RetryPolicy};
pub use ringwire_core::shutdown::{Phase, ShutdownCoordinator};
pub use ringwire_core::state::{ConnState, StateCell};
pub use ringwire_core::token::{op, OpToken};

pub use ringwire_buf::{BlockingPool, BufPool, PoolMetrics, TimedPool, WireBuf};

pub use ringwire_io::{
    Backend, BackendKind, BackendStats, ConnectEvents, Connector, SelectorBackend, UringBackend,
    UringConfig,
};

pub use ringwire_server::{
    ConnCtx, DataAction, ServerConfig, ServerControl, ServerHandler, WireServer,
};
