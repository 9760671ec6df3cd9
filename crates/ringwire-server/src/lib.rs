//! # ringwire-server — the dispatch loop
//!
//! A single-threaded busy-polling server on top of the transport
//! backends: binds, arms accept, demultiplexes completions by decoding
//! the token's op and connection id, and hands received data to a user
//! [`handler::ServerHandler`].
//!
//! Buffer ownership is linear hot-potato: the loop acquires a buffer,
//! posts a receive, passes the filled buffer to the handler, and either
//! transfers it to the write path (released on write completion through
//! the per-connection `pending_writes` table) or takes it back for the
//! next receive.

pub mod config;
pub mod conn;
pub mod dispatch;
pub mod handler;

pub use config::ServerConfig;
pub use conn::{ConnCtx, ConnRecord};
pub use dispatch::{ServerControl, WireServer};
pub use handler::{DataAction, ServerHandler};
