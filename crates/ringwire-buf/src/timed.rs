//! Timed pool — bounded waiting and acquisition metrics.
//!
//! Wraps the lock-free [`BufPool`] with a condvar so callers off the hot
//! path can wait a bounded time for a buffer instead of polling, and
//! records per-acquisition latency for the periodic metrics snapshot.
//!
//! Inherits the wrapped pool's MPSC discipline: releases from any
//! thread, one acquiring thread at a time.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use ringwire_core::error::WireResult;

use crate::buffer::WireBuf;
use crate::pool::BufPool;

/// Snapshot of acquisition behaviour since construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_wait_ns: u64,
    pub max_wait_ns: u64,
    pub available: usize,
    pub capacity: usize,
    pub success_rate: f64,
    pub utilization: f64,
}

pub struct TimedPool {
    pool: BufPool,
    gate: Mutex<()>,
    released: Condvar,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    wait_ns_sum: AtomicU64,
    wait_ns_max: AtomicU64,
    waiters: AtomicUsize,
}

impl TimedPool {
    pub fn new(count: usize, buf_size: usize) -> WireResult<Self> {
        Ok(Self::wrap(BufPool::new(count, buf_size)?))
    }

    pub fn wrap(pool: BufPool) -> Self {
        Self {
            pool,
            gate: Mutex::new(()),
            released: Condvar::new(),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            wait_ns_sum: AtomicU64::new(0),
            wait_ns_max: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &BufPool {
        &self.pool
    }

    /// Non-blocking acquisition, counted in the metrics.
    pub fn try_acquire(&self) -> WireResult<Option<WireBuf>> {
        self.total.fetch_add(1, Ordering::Relaxed);
        match self.pool.try_acquire() {
            Ok(Some(buf)) => {
                self.successful.fetch_add(1, Ordering::Relaxed);
                Ok(Some(buf))
            }
            Ok(None) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Wait up to `timeout` for a buffer. `Ok(None)` on expiry.
    pub fn acquire_with_timeout(&self, timeout: Duration) -> WireResult<Option<WireBuf>> {
        let start = Instant::now();
        self.total.fetch_add(1, Ordering::Relaxed);
        let deadline = start + timeout;

        loop {
            match self.pool.try_acquire() {
                Ok(Some(buf)) => {
                    self.record_wait(start.elapsed());
                    self.successful.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(buf));
                }
                Ok(None) => {}
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.record_wait(start.elapsed());
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }

            self.waiters.fetch_add(1, Ordering::Relaxed);
            let guard = self.gate.lock().expect("timed pool gate");
            let _unused = self
                .released
                .wait_timeout(guard, deadline - now)
                .expect("timed pool wait");
            self.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Predicate-only wait: `true` once a buffer is available, without
    /// acquiring it.
    pub fn await_available(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pool.available() > 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let guard = self.gate.lock().expect("timed pool gate");
            let _unused = self
                .released
                .wait_timeout(guard, deadline - now)
                .expect("timed pool wait");
        }
    }

    /// Release and wake one waiter.
    pub fn release_and_signal(&self, buf: WireBuf) -> WireResult<()> {
        self.pool.release(buf)?;
        if self.waiters.load(Ordering::Relaxed) > 0 {
            self.released.notify_one();
        } else {
            // Cheap enough, and await_available callers do not register
            // as waiters.
            self.released.notify_all();
        }
        Ok(())
    }

    pub fn metrics(&self) -> PoolMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let sum = self.wait_ns_sum.load(Ordering::Relaxed);
        let waits = successful.max(1);
        let capacity = self.pool.capacity();
        PoolMetrics {
            total,
            successful,
            failed,
            avg_wait_ns: sum / waits,
            max_wait_ns: self.wait_ns_max.load(Ordering::Relaxed),
            available: self.pool.available(),
            capacity,
            success_rate: if total == 0 {
                1.0
            } else {
                successful as f64 / total as f64
            },
            utilization: self.pool.in_use() as f64 / capacity as f64,
        }
    }

    fn record_wait(&self, waited: Duration) {
        let ns = waited.as_nanos() as u64;
        self.wait_ns_sum.fetch_add(ns, Ordering::Relaxed);
        self.wait_ns_max.fetch_max(ns, Ordering::Relaxed);
    }
}
