//! The user handler contract.
//!
//! Callbacks run on the dispatch thread, inside the completion-reaping
//! call frame. They must not block — a stalled handler stalls every
//! connection on the loop.

use ringwire_buf::WireBuf;

use crate::conn::ConnCtx;

/// What the handler wants done with a received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAction {
    /// Send `len` bytes from this buffer back on the connection.
    /// Ownership transfers to the write path; the loop releases the
    /// buffer when the write completes.
    Reply(usize),
    /// The loop keeps the buffer and re-arms the next receive with it.
    Drop,
}

pub trait ServerHandler {
    /// A connection reached CONNECTED.
    fn on_connect(&mut self, _conn: &mut ConnCtx<'_>) {}

    /// `len` valid bytes arrived in `buf`. The buffer is borrowed for
    /// the duration of the call; the returned action decides where its
    /// ownership goes next.
    fn on_data(&mut self, conn: &mut ConnCtx<'_>, buf: &mut WireBuf, len: usize) -> DataAction;

    /// The connection closed (peer EOF, reset, or server shutdown).
    fn on_disconnect(&mut self, _conn_id: u32) {}
}

/// Echoes every payload back unchanged. The canonical smoke-test
/// handler.
#[derive(Debug, Default)]
pub struct EchoHandler {
    pub connects: u64,
    pub disconnects: u64,
    pub bytes_echoed: u64,
}

impl ServerHandler for EchoHandler {
    fn on_connect(&mut self, _conn: &mut ConnCtx<'_>) {
        self.connects += 1;
    }

    fn on_data(&mut self, _conn: &mut ConnCtx<'_>, _buf: &mut WireBuf, len: usize) -> DataAction {
        self.bytes_echoed += len as u64;
        DataAction::Reply(len)
    }

    fn on_disconnect(&mut self, _conn_id: u32) {
        self.disconnects += 1;
    }
}
