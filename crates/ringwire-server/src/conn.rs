//! Connection records.
//!
//! The loop owns an arena of records indexed by a compact connection id
//! — the same id embedded in every token. Records hold only the socket,
//! the lifecycle state, and buffer bookkeeping; they carry no pointer
//! back to the loop or the backend, so there are no ownership cycles.

use std::os::unix::io::RawFd;

use ringwire_buf::{BufPool, WireBuf};
use ringwire_core::state::{ConnState, StateCell};

/// One live connection.
pub struct ConnRecord {
    id: u32,
    fd: RawFd,
    pub state: StateCell,
    /// Write buffers in flight, indexed by `req & mask` and tagged
    /// with the full request id so stale completions cannot steal a
    /// reused slot. The write completion clears the slot and releases
    /// the buffer.
    pending_writes: Box<[Option<(u16, WireBuf)>]>,
    write_mask: usize,
    /// The buffer the armed receive will fill.
    inflight_read: Option<WireBuf>,
    next_req: u16,
}

impl ConnRecord {
    /// `pending_writes` must be a power of two.
    pub fn new(id: u32, fd: RawFd, pending_writes: usize) -> Self {
        assert!(
            pending_writes.is_power_of_two(),
            "pending_writes must be a power of two"
        );
        let state = StateCell::new();
        Self {
            id,
            fd,
            state,
            pending_writes: (0..pending_writes).map(|_| None).collect(),
            write_mask: pending_writes - 1,
            inflight_read: None,
            next_req: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Allocate the next write request id.
    pub fn next_req(&mut self) -> u16 {
        let req = self.next_req;
        self.next_req = self.next_req.wrapping_add(1);
        req
    }

    // ── Write bookkeeping ────────────────────────────────────────────

    /// Stamp a buffer into the pending-write table. A previous
    /// occupant of a wrapped slot means the table overflowed; the
    /// caller sizes the table above the connection's pipeline depth
    /// and gets the evicted buffer back to release.
    pub fn stamp_write(&mut self, req: u16, buf: WireBuf) -> Option<WireBuf> {
        self.pending_writes[req as usize & self.write_mask]
            .replace((req, buf))
            .map(|(_, evicted)| evicted)
    }

    /// Clear the slot for `req`. Returns `None` when the slot is empty
    /// or occupied by a different (wrapped) request.
    pub fn take_write(&mut self, req: u16) -> Option<WireBuf> {
        let slot = &mut self.pending_writes[req as usize & self.write_mask];
        match slot {
            Some((stamped, _)) if *stamped == req => slot.take().map(|(_, buf)| buf),
            _ => None,
        }
    }

    /// Remove every stamped write, with its request id. Used when the
    /// connection record dies before its write completions arrive.
    pub fn drain_writes(&mut self) -> Vec<(u16, WireBuf)> {
        self.pending_writes
            .iter_mut()
            .filter_map(|slot| slot.take())
            .collect()
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.iter().filter(|s| s.is_some()).count()
    }

    // ── Read bookkeeping ─────────────────────────────────────────────

    pub fn set_read(&mut self, buf: WireBuf) {
        debug_assert!(self.inflight_read.is_none(), "read already armed");
        self.inflight_read = Some(buf);
    }

    pub fn take_read(&mut self) -> Option<WireBuf> {
        self.inflight_read.take()
    }

    /// Release every buffer this connection still holds back to `pool`.
    pub fn release_all(&mut self, pool: &BufPool) {
        if let Some(buf) = self.inflight_read.take() {
            let _ = pool.release(buf);
        }
        for slot in self.pending_writes.iter_mut() {
            if let Some((_, buf)) = slot.take() {
                let _ = pool.release(buf);
            }
        }
    }
}

/// The borrowed view handed to handler callbacks.
pub struct ConnCtx<'a> {
    record: &'a mut ConnRecord,
}

impl<'a> ConnCtx<'a> {
    pub(crate) fn new(record: &'a mut ConnRecord) -> Self {
        Self { record }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.record.id()
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.record.fd()
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.record.state.current()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.record.state.is_active()
    }

    pub fn pending_writes(&self) -> usize {
        self.record.pending_write_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_ids_wrap() {
        let mut conn = ConnRecord::new(1, -1, 8);
        conn.next_req = u16::MAX;
        assert_eq!(conn.next_req(), u16::MAX);
        assert_eq!(conn.next_req(), 0);
    }

    #[test]
    fn write_table_stamp_and_clear() {
        let pool = BufPool::new(4, 1024).unwrap();
        let mut conn = ConnRecord::new(1, -1, 8);

        let buf = pool.acquire().unwrap().unwrap();
        let req = conn.next_req();
        assert!(conn.stamp_write(req, buf).is_none());
        assert_eq!(conn.pending_write_count(), 1);

        let buf = conn.take_write(req).expect("stamped buffer");
        assert!(conn.take_write(req).is_none(), "slot cleared");
        pool.release(buf).unwrap();
    }

    #[test]
    fn wrapped_slot_rejects_stale_req() {
        let pool = BufPool::new(4, 1024).unwrap();
        let mut conn = ConnRecord::new(1, -1, 4);
        let buf = pool.acquire().unwrap().unwrap();
        // req 5 and req 1 share slot 1 in a 4-slot table; only the
        // stamped req may clear it.
        conn.stamp_write(5, buf);
        assert!(conn.take_write(1).is_none());
        let buf = conn.take_write(5).expect("matching req");
        pool.release(buf).unwrap();
    }

    #[test]
    fn drain_writes_reports_req_ids() {
        let pool = BufPool::new(4, 1024).unwrap();
        let mut conn = ConnRecord::new(1, -1, 8);
        conn.stamp_write(2, pool.acquire().unwrap().unwrap());
        conn.stamp_write(5, pool.acquire().unwrap().unwrap());
        let mut drained: Vec<u16> = conn
            .drain_writes()
            .into_iter()
            .map(|(req, buf)| {
                pool.release(buf).unwrap();
                req
            })
            .collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![2, 5]);
        assert_eq!(conn.pending_write_count(), 0);
    }

    #[test]
    fn release_all_returns_everything() {
        let pool = BufPool::new(8, 1024).unwrap();
        let mut conn = ConnRecord::new(1, -1, 8);

        conn.set_read(pool.acquire().unwrap().unwrap());
        for _ in 0..3 {
            let req = conn.next_req();
            conn.stamp_write(req, pool.acquire().unwrap().unwrap());
        }
        assert_eq!(pool.in_use(), 4);

        conn.release_all(&pool);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn table_size_must_be_power_of_two() {
        let _ = ConnRecord::new(1, -1, 6);
    }
}
