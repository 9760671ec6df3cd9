//! Kernel-provided buffer ring for multishot receive.
//!
//! The kernel picks a free buffer from a registered ring for every
//! multishot-recv completion and reports the chosen id in the CQE flags
//! (`FLAG_BUFFER`, id in the top 16 bits). The caller consumes the
//! bytes and hands the buffer back by advancing the ring tail.
//!
//! Requires Linux ≥ 5.19; probe before constructing.
//!
//! Layout: one page-aligned array of `BufRingEntry` (the ring the
//! kernel reads) plus one page-aligned slab holding `entries × buf_len`
//! payload bytes, id-indexed.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types::BufRingEntry;
use io_uring::Submitter;

use ringwire_core::error::{WireError, WireResult};

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn alloc_page_aligned(len: usize) -> (*mut u8, Layout) {
    let layout = Layout::from_size_align(len, page_size()).expect("buffer ring layout");
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    (ptr, layout)
}

pub struct ProvidedBufRing {
    ring: *mut BufRingEntry,
    ring_layout: Layout,
    bufs: *mut u8,
    bufs_layout: Layout,
    entries: u16,
    mask: u16,
    buf_len: usize,
    bgid: u16,
    local_tail: u16,
    shared_tail: *const AtomicU16,
    registered: bool,
}

// Single-owner structure driven from the ring thread.
unsafe impl Send for ProvidedBufRing {}

impl ProvidedBufRing {
    /// Allocate, populate, and register a ring of `entries` buffers of
    /// `buf_len` bytes under group `bgid`. `entries` must be a power of
    /// two.
    pub fn new(
        submitter: &Submitter<'_>,
        entries: u16,
        buf_len: usize,
        bgid: u16,
    ) -> WireResult<Self> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(WireError::InvalidConfig(format!(
                "buffer ring entries must be a power of two, got {}",
                entries
            )));
        }
        let (ring_mem, ring_layout) =
            alloc_page_aligned(entries as usize * std::mem::size_of::<BufRingEntry>());
        let ring = ring_mem as *mut BufRingEntry;
        let (bufs, bufs_layout) = alloc_page_aligned(entries as usize * buf_len);

        // Hand every buffer to the kernel up front, id == slot.
        unsafe {
            let ring_slice = std::slice::from_raw_parts_mut(ring, entries as usize);
            for (bid, entry) in ring_slice.iter_mut().enumerate() {
                entry.set_addr(bufs.add(bid * buf_len) as u64);
                entry.set_len(buf_len as u32);
                entry.set_bid(bid as u16);
            }
        }

        // Publish the initial tail. Not yet shared with the kernel, so
        // a plain write is fine here.
        let tail_addr = unsafe { BufRingEntry::tail(ring as *const BufRingEntry) };
        unsafe {
            *(tail_addr as *mut u16) = entries;
        }
        let shared_tail = tail_addr as *const AtomicU16;

        let register = unsafe { submitter.register_buf_ring(ring as u64, entries, bgid) };
        if let Err(e) = register {
            unsafe {
                dealloc(ring_mem, ring_layout);
                dealloc(bufs, bufs_layout);
            }
            return Err(WireError::RingSetup(e.raw_os_error().unwrap_or(-1)));
        }

        Ok(Self {
            ring,
            ring_layout,
            bufs,
            bufs_layout,
            entries,
            mask: entries - 1,
            buf_len,
            bgid,
            local_tail: entries,
            shared_tail,
            registered: true,
        })
    }

    #[inline]
    pub fn group_id(&self) -> u16 {
        self.bgid
    }

    #[inline]
    pub fn entries(&self) -> u16 {
        self.entries
    }

    #[inline]
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    /// The bytes the kernel wrote into buffer `bid`.
    pub fn buffer(&self, bid: u16, len: usize) -> &[u8] {
        assert!(bid < self.entries, "buffer id {} out of range", bid);
        let len = len.min(self.buf_len);
        unsafe {
            std::slice::from_raw_parts(self.bufs.add(bid as usize * self.buf_len), len)
        }
    }

    /// Return buffer `bid` to the kernel: write a fresh entry at the
    /// tail slot and publish the advanced tail.
    pub fn recycle(&mut self, bid: u16) {
        assert!(bid < self.entries, "buffer id {} out of range", bid);
        let idx = (self.local_tail & self.mask) as usize;
        unsafe {
            let entry = &mut *self.ring.add(idx);
            entry.set_addr(self.bufs.add(bid as usize * self.buf_len) as u64);
            entry.set_len(self.buf_len as u32);
            entry.set_bid(bid);
        }
        self.local_tail = self.local_tail.wrapping_add(1);
        unsafe {
            (*self.shared_tail).store(self.local_tail, Ordering::Release);
        }
    }

    /// Unregister from the kernel. Call before dropping while the ring
    /// is still alive; residual multishot ops must be cancelled first.
    pub fn unregister(&mut self, submitter: &Submitter<'_>) -> WireResult<()> {
        if !self.registered {
            return Ok(());
        }
        submitter
            .unregister_buf_ring(self.bgid)
            .map_err(|e| WireError::Os(e.raw_os_error().unwrap_or(-1)))?;
        self.registered = false;
        Ok(())
    }
}

impl Drop for ProvidedBufRing {
    fn drop(&mut self) {
        // By the shutdown contract the group was unregistered (or the
        // whole ring torn down) before we get here.
        unsafe {
            dealloc(self.ring as *mut u8, self.ring_layout);
            dealloc(self.bufs, self.bufs_layout);
        }
    }
}
