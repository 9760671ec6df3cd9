//! Process-wide allocation tracker.
//!
//! A safety net, not the primary cleanup mechanism — ownership and
//! scoped release do the real work. The tracker exists so tests and
//! diagnostics can prove quiescence: every slab unmapped, every acquire
//! matched by a release.
//!
//! Cost when enabled: one `fetch_add(1, Relaxed)` per event. Disabled
//! (the default) it is a single relaxed load.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(false);

static SLABS_MAPPED: AtomicU64 = AtomicU64::new(0);
static SLABS_UNMAPPED: AtomicU64 = AtomicU64::new(0);
static BYTES_MAPPED: AtomicU64 = AtomicU64::new(0);
static BYTES_UNMAPPED: AtomicU64 = AtomicU64::new(0);
static ACQUIRES: AtomicU64 = AtomicU64::new(0);
static RELEASES: AtomicU64 = AtomicU64::new(0);
static DOUBLE_FREES: AtomicU64 = AtomicU64::new(0);

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSnapshot {
    pub slabs_mapped: u64,
    pub slabs_unmapped: u64,
    pub bytes_mapped: u64,
    pub bytes_unmapped: u64,
    pub acquires: u64,
    pub releases: u64,
    pub double_frees: u64,
}

impl TrackSnapshot {
    /// Slabs still mapped.
    pub fn live_slabs(&self) -> u64 {
        self.slabs_mapped.saturating_sub(self.slabs_unmapped)
    }

    /// Bytes mapped but not yet unmapped.
    pub fn leaked_bytes(&self) -> u64 {
        self.bytes_mapped.saturating_sub(self.bytes_unmapped)
    }

    /// Acquires without a matching release.
    pub fn outstanding_buffers(&self) -> u64 {
        self.acquires.saturating_sub(self.releases)
    }
}

pub fn enable() {
    ENABLED.store(true, Ordering::Release);
}

pub fn disable() {
    ENABLED.store(false, Ordering::Release);
}

#[inline]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub(crate) fn record_slab_map(bytes: usize) {
    if is_enabled() {
        SLABS_MAPPED.fetch_add(1, Ordering::Relaxed);
        BYTES_MAPPED.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

#[inline]
pub(crate) fn record_slab_unmap(bytes: usize) {
    if is_enabled() {
        SLABS_UNMAPPED.fetch_add(1, Ordering::Relaxed);
        BYTES_UNMAPPED.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

#[inline]
pub(crate) fn record_acquire() {
    if is_enabled() {
        ACQUIRES.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub(crate) fn record_release() {
    if is_enabled() {
        RELEASES.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub(crate) fn record_double_free() {
    if is_enabled() {
        DOUBLE_FREES.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn snapshot() -> TrackSnapshot {
    TrackSnapshot {
        slabs_mapped: SLABS_MAPPED.load(Ordering::Relaxed),
        slabs_unmapped: SLABS_UNMAPPED.load(Ordering::Relaxed),
        bytes_mapped: BYTES_MAPPED.load(Ordering::Relaxed),
        bytes_unmapped: BYTES_UNMAPPED.load(Ordering::Relaxed),
        acquires: ACQUIRES.load(Ordering::Relaxed),
        releases: RELEASES.load(Ordering::Relaxed),
        double_frees: DOUBLE_FREES.load(Ordering::Relaxed),
    }
}

/// Zero every counter. For tests.
pub fn reset() {
    SLABS_MAPPED.store(0, Ordering::Relaxed);
    SLABS_UNMAPPED.store(0, Ordering::Relaxed);
    BYTES_MAPPED.store(0, Ordering::Relaxed);
    BYTES_UNMAPPED.store(0, Ordering::Relaxed);
    ACQUIRES.store(0, Ordering::Relaxed);
    RELEASES.store(0, Ordering::Relaxed);
    DOUBLE_FREES.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufPool;

    // Serializes the tests that touch the global counters; pool tests
    // elsewhere only record while tracking is enabled, so assertions
    // stay lower bounds rather than exact counts.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn tracks_pool_lifecycle() {
        let _guard = TEST_LOCK.lock().unwrap();
        enable();
        let before = snapshot();

        {
            let pool = BufPool::new(4, 1024).unwrap();
            let buf = pool.acquire().unwrap().unwrap();
            let index = buf.index();
            pool.release(buf).unwrap();
            let _ = pool.release_index(index); // deliberate double free
        }

        let after = snapshot();
        assert!(after.slabs_mapped >= before.slabs_mapped + 1);
        assert!(after.slabs_unmapped >= before.slabs_unmapped + 1, "pool drop unmaps the slab");
        assert!(after.bytes_mapped >= before.bytes_mapped + 4 * 4096);
        assert!(after.bytes_unmapped >= before.bytes_unmapped + 4 * 4096);
        assert!(after.acquires >= before.acquires + 1);
        assert!(after.releases >= before.releases + 1);
        assert!(after.double_frees >= before.double_frees + 1);

        disable();
    }

    #[test]
    fn reset_zeroes_counters() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        let snap = snapshot();
        assert_eq!(snap.outstanding_buffers(), 0);
        assert_eq!(snap.live_slabs(), 0);
        assert_eq!(snap.leaked_bytes(), 0);
    }

    #[test]
    fn snapshot_derived_quantities_saturate() {
        let snap = TrackSnapshot {
            slabs_mapped: 1,
            slabs_unmapped: 2,
            bytes_mapped: 100,
            bytes_unmapped: 400,
            acquires: 3,
            releases: 5,
            double_frees: 0,
        };
        assert_eq!(snap.live_slabs(), 0);
        assert_eq!(snap.leaked_bytes(), 0);
        assert_eq!(snap.outstanding_buffers(), 0);
    }
}
