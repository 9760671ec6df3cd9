//! Buffer pools.
//!
//! Both pools own one slab arena sized `count × align_up(buf_size, 4096)`
//! and expose the same observable surface; they differ only in the
//! ownership strategy:
//!
//! - [`BufPool`] — lock-free free-index ring, capacity a power of two,
//!   per-slot atomic refcount. `acquire` never blocks; releasing an
//!   already-free slot is a defect ([`WireError::DoubleFree`]).
//! - [`BlockingPool`] — bounded queue plus condvar. `acquire` blocks
//!   until a buffer is released; `release` is idempotent.
//!
//! Invariant at quiescence: `available + in_use == capacity`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use ringwire_core::error::{WireError, WireResult};

use crate::arena::{align_up, SlabArena, PAGE_SIZE};
use crate::buffer::WireBuf;
use crate::free_ring::FreeRing;
use crate::track;

/// Side-owner token produced by [`BufPool::retain`]. Releasing it is the
/// only way to drop the extra reference — the token cannot be copied.
#[derive(Debug)]
pub struct RetainedBuf {
    index: u32,
}

impl RetainedBuf {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
}

// ── Lock-free pool ───────────────────────────────────────────────────

/// Lock-free, refcounted buffer pool.
pub struct BufPool {
    arena: SlabArena,
    buf_size: usize,
    /// Per-slot reference count; 0 = free.
    refs: Box<[AtomicU32]>,
    free: FreeRing,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

impl BufPool {
    /// `count` must be a power of two (free-ring bitmask wrap).
    /// `buf_size` is rounded up to whole pages.
    pub fn new(count: usize, buf_size: usize) -> WireResult<Self> {
        if count == 0 || !count.is_power_of_two() {
            return Err(WireError::InvalidConfig(format!(
                "pool capacity must be a power of two, got {}",
                count
            )));
        }
        if buf_size == 0 {
            return Err(WireError::InvalidConfig("buffer size must be non-zero".into()));
        }
        let slot = align_up(buf_size, PAGE_SIZE);
        let arena = SlabArena::new(count * slot)?;

        let free = FreeRing::new(count);
        for i in 0..count as u32 {
            free.push(i);
        }
        let refs = (0..count).map(|_| AtomicU32::new(0)).collect();

        Ok(Self {
            arena,
            buf_size: slot,
            refs,
            free,
            in_use: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Pop a free buffer. `Ok(None)` on exhaustion; closed pools fail.
    ///
    /// The free list is an MPSC ring: releases may come from any
    /// thread, acquisition is the single-consumer side. Callers that
    /// acquire from more than one thread must serialize those calls
    /// (the dispatch loop is the one acquirer in the server) — or use
    /// [`BlockingPool`], whose queue is safe for any-thread acquire.
    pub fn acquire(&self) -> WireResult<Option<WireBuf>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::PoolClosed);
        }
        let index = match self.free.pop() {
            Some(i) => i,
            None => return Ok(None),
        };
        self.refs[index as usize].store(1, Ordering::Release);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        track::record_acquire();
        Ok(Some(self.carve(index)))
    }

    /// Alias for [`acquire`](Self::acquire); both are non-blocking.
    #[inline]
    pub fn try_acquire(&self) -> WireResult<Option<WireBuf>> {
        self.acquire()
    }

    /// Take an additional reference. The buffer stays out of the free
    /// list until every reference is released.
    pub fn retain(&self, buf: &WireBuf) -> RetainedBuf {
        let prev = self.refs[buf.index() as usize].fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain of a free buffer");
        RetainedBuf { index: buf.index() }
    }

    /// Release the owner handle.
    pub fn release(&self, buf: WireBuf) -> WireResult<()> {
        if !self.arena.contains(buf.addr() as *const u8) {
            return Err(WireError::ForeignBuffer);
        }
        self.release_index(buf.index())
    }

    /// Drop a retained reference.
    pub fn release_retained(&self, r: RetainedBuf) -> WireResult<()> {
        self.release_index(r.index)
    }

    /// Decrement the reference for slot `index`; at 1 the slot returns
    /// to the free ring. Exposed for integrations that track raw slot
    /// ids (provided-buffer recycling, pending-write tables).
    pub fn release_index(&self, index: u32) -> WireResult<()> {
        let slot = self
            .refs
            .get(index as usize)
            .ok_or(WireError::ForeignBuffer)?;
        loop {
            let cur = slot.load(Ordering::Acquire);
            if cur == 0 {
                track::record_double_free();
                return Err(WireError::DoubleFree(index));
            }
            if slot
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if cur == 1 {
                self.in_use.fetch_sub(1, Ordering::Relaxed);
                track::record_release();
                // A failed push here would mean more frees than slots;
                // the refcount gate above makes that unreachable.
                let pushed = self.free.push(index);
                debug_assert!(pushed);
            }
            return Ok(());
        }
    }

    /// Current reference count of a slot. Diagnostic.
    pub fn refcount(&self, index: u32) -> u32 {
        self.refs
            .get(index as usize)
            .map(|r| r.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.refs.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The slab as one iovec for one-shot kernel registration.
    pub fn as_iovec(&self) -> libc::iovec {
        self.arena.as_iovec()
    }

    /// One iovec per slot, index-aligned, so registration ids map 1:1
    /// to pool indices. Built once at registration time.
    pub fn iovecs(&self) -> Vec<libc::iovec> {
        (0..self.capacity())
            .map(|i| libc::iovec {
                iov_base: unsafe { self.arena.base().add(i * self.buf_size) }
                    as *mut libc::c_void,
                iov_len: self.buf_size,
            })
            .collect()
    }

    /// Stop handing out buffers. The arena itself is released when the
    /// pool drops (after the shutdown coordinator has drained in-flight
    /// submissions).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn carve(&self, index: u32) -> WireBuf {
        let ptr = unsafe { self.arena.base().add(index as usize * self.buf_size) };
        unsafe { WireBuf::from_raw(ptr, self.buf_size, index, index as u16) }
    }
}

// ── Blocking pool ────────────────────────────────────────────────────

/// Bounded blocking pool; the legacy ownership discipline.
pub struct BlockingPool {
    arena: SlabArena,
    buf_size: usize,
    free: ArrayQueue<u32>,
    /// Per-slot in-use flag; makes `release` idempotent.
    in_use_flags: Box<[AtomicBool]>,
    in_use: AtomicUsize,
    closed: AtomicBool,
    gate: Mutex<()>,
    released: Condvar,
}

impl BlockingPool {
    pub fn new(count: usize, buf_size: usize) -> WireResult<Self> {
        if count == 0 {
            return Err(WireError::InvalidConfig("pool capacity must be non-zero".into()));
        }
        if buf_size == 0 {
            return Err(WireError::InvalidConfig("buffer size must be non-zero".into()));
        }
        let slot = align_up(buf_size, PAGE_SIZE);
        let arena = SlabArena::new(count * slot)?;

        let free = ArrayQueue::new(count);
        for i in 0..count as u32 {
            let _ = free.push(i);
        }
        let in_use_flags = (0..count).map(|_| AtomicBool::new(false)).collect();

        Ok(Self {
            arena,
            buf_size: slot,
            free,
            in_use_flags,
            in_use: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            gate: Mutex::new(()),
            released: Condvar::new(),
        })
    }

    /// Block until a buffer is available. The only designed blocking
    /// call on the buffer path.
    pub fn acquire(&self) -> WireResult<WireBuf> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(WireError::PoolClosed);
            }
            if let Some(buf) = self.try_pop() {
                return Ok(buf);
            }
            let guard = self.gate.lock().expect("pool gate");
            // Re-check under the lock; a release may have raced us.
            if self.free.is_empty() && !self.closed.load(Ordering::Acquire) {
                let _unused = self
                    .released
                    .wait_timeout(guard, Duration::from_millis(10))
                    .expect("pool wait");
            }
        }
    }

    /// Non-blocking variant: `Ok(None)` when empty.
    pub fn try_acquire(&self) -> WireResult<Option<WireBuf>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::PoolClosed);
        }
        Ok(self.try_pop())
    }

    /// Return a buffer. Releasing an already-free buffer is a no-op.
    pub fn release(&self, buf: WireBuf) -> WireResult<()> {
        if !self.arena.contains(buf.addr() as *const u8) {
            return Err(WireError::ForeignBuffer);
        }
        let index = buf.index();
        if !self.in_use_flags[index as usize].swap(false, Ordering::AcqRel) {
            // Already free — idempotent by contract.
            return Ok(());
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        track::record_release();
        let _ = self.free.push(index);
        self.released.notify_one();
        Ok(())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.in_use_flags.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn as_iovec(&self) -> libc::iovec {
        self.arena.as_iovec()
    }

    /// Close the pool and wake all blocked acquirers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.released.notify_all();
    }

    fn try_pop(&self) -> Option<WireBuf> {
        let index = self.free.pop()?;
        self.in_use_flags[index as usize].store(true, Ordering::Release);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        track::record_acquire();
        let ptr = unsafe { self.arena.base().add(index as usize * self.buf_size) };
        Some(unsafe { WireBuf::from_raw(ptr, self.buf_size, index, index as u16) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lockfree_quiescence_invariant() {
        let pool = BufPool::new(16, 1024).unwrap();
        assert_eq!(pool.capacity(), 16);
        assert_eq!(pool.available(), 16);

        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(pool.acquire().unwrap().unwrap());
        }
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_use(), 16);
        assert!(pool.acquire().unwrap().is_none());

        for buf in held {
            pool.release(buf).unwrap();
        }
        assert_eq!(pool.available(), 16);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn buffers_are_page_rounded() {
        let pool = BufPool::new(4, 100).unwrap();
        assert_eq!(pool.buf_size(), PAGE_SIZE);
        let buf = pool.acquire().unwrap().unwrap();
        assert_eq!(buf.capacity(), PAGE_SIZE);
        pool.release(buf).unwrap();
    }

    #[test]
    fn non_power_of_two_rejected() {
        assert!(matches!(
            BufPool::new(6, 1024),
            Err(WireError::InvalidConfig(_))
        ));
        assert!(matches!(
            BufPool::new(0, 1024),
            Err(WireError::InvalidConfig(_))
        ));
    }

    #[test]
    fn acquire_from_closed_pool_is_fatal() {
        let pool = BufPool::new(4, 1024).unwrap();
        pool.close();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, WireError::PoolClosed));
        assert_eq!(
            err.category(),
            ringwire_core::error::ErrorCategory::Fatal
        );
    }

    #[test]
    fn retain_keeps_buffer_out_of_free_list() {
        let pool = BufPool::new(4, 1024).unwrap();
        let buf = pool.acquire().unwrap().unwrap();
        let index = buf.index();
        let retained = pool.retain(&buf);
        assert_eq!(pool.refcount(index), 2);

        pool.release(buf).unwrap();
        // Still referenced — not back in the free list.
        assert_eq!(pool.refcount(index), 1);
        assert_eq!(pool.available(), 3);

        pool.release_retained(retained).unwrap();
        assert_eq!(pool.refcount(index), 0);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn double_free_is_a_defect() {
        let pool = BufPool::new(4, 1024).unwrap();
        let buf = pool.acquire().unwrap().unwrap();
        let index = buf.index();
        pool.release(buf).unwrap();
        assert!(matches!(
            pool.release_index(index),
            Err(WireError::DoubleFree(i)) if i == index
        ));
    }

    #[test]
    fn foreign_buffer_rejected() {
        let pool_a = BufPool::new(4, 1024).unwrap();
        let pool_b = BufPool::new(4, 1024).unwrap();
        let buf = pool_a.acquire().unwrap().unwrap();
        assert!(matches!(
            pool_b.release(buf),
            Err(WireError::ForeignBuffer)
        ));
    }

    #[test]
    fn slots_are_distinct_and_writable() {
        let pool = BufPool::new(4, 4096).unwrap();
        let mut a = pool.acquire().unwrap().unwrap();
        let mut b = pool.acquire().unwrap().unwrap();
        a.write_at(0, b"aaaa");
        b.write_at(0, b"bbbb");
        assert_eq!(a.as_slice(), b"aaaa");
        assert_eq!(b.as_slice(), b"bbbb");
        pool.release(a).unwrap();
        pool.release(b).unwrap();
    }

    #[test]
    fn single_acquirer_many_releasers() {
        // The free list is MPSC: one acquiring thread, releases from
        // anywhere. Buffers travel to releaser threads over channels.
        let pool = Arc::new(BufPool::new(32, 1024).unwrap());
        let (txs, handles): (Vec<_>, Vec<_>) = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let (tx, rx) = std::sync::mpsc::channel::<WireBuf>();
                let h = thread::spawn(move || {
                    for buf in rx {
                        pool.release(buf).unwrap();
                    }
                });
                (tx, h)
            })
            .unzip();

        for round in 0..200 {
            if let Some(buf) = pool.acquire().unwrap() {
                txs[round % 4].send(buf).unwrap();
            }
        }
        drop(txs);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.available(), 32);
        assert_eq!(pool.in_use(), 0);
    }

    // ── Blocking pool ────────────────────────────────────────────────

    #[test]
    fn blocking_release_is_idempotent() {
        let pool = BlockingPool::new(2, 1024).unwrap();
        let buf = pool.acquire().unwrap();
        let index = buf.index();
        pool.release(buf).unwrap();
        // Second release of the same slot: a no-op, not an error.
        let again = unsafe {
            WireBuf::from_raw(
                pool.arena.base().add(index as usize * pool.buf_size),
                pool.buf_size,
                index,
                index as u16,
            )
        };
        pool.release(again).unwrap();
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn blocking_any_capacity_allowed() {
        let pool = BlockingPool::new(3, 512).unwrap();
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let pool = Arc::new(BlockingPool::new(1, 512).unwrap());
        let buf = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let buf = pool.acquire().unwrap();
                pool.release(buf).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(20));
        pool.release(buf).unwrap();
        waiter.join().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn blocking_close_wakes_blockers() {
        let pool = Arc::new(BlockingPool::new(1, 512).unwrap());
        let buf = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(WireError::PoolClosed)));
        drop(buf);
    }

    #[test]
    fn blocking_try_acquire_returns_none_when_empty() {
        let pool = BlockingPool::new(1, 512).unwrap();
        let buf = pool.try_acquire().unwrap().unwrap();
        assert!(pool.try_acquire().unwrap().is_none());
        pool.release(buf).unwrap();
    }
}
