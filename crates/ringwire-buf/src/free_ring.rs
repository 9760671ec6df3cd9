//! Free-index ring — the lock-free pool's free list.
//!
//! Multi-producer (any thread releasing a buffer), single-consumer (the
//! acquiring side drains one index at a time). Capacity is a power of
//! two so positions wrap with a bitmask; head and tail are monotonically
//! increasing `u64`s, empty when `head == tail`, full when
//! `tail - head == capacity`.
//!
//! Producers claim a slot with CAS on the tail and then publish the
//! index with a Release store; each slot starts at a sentinel so the
//! consumer can tell "claimed but not yet published" from "ready" and
//! spin the handful of cycles until the store lands.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Slot value meaning "claimed, value not yet published".
const VACANT: u32 = u32::MAX;

pub struct FreeRing {
    slots: Box<[AtomicU32]>,
    head: AtomicU64,
    tail: AtomicU64,
    mask: u64,
}

impl FreeRing {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity).map(|_| AtomicU32::new(VACANT)).collect();
        Self {
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            mask: capacity as u64 - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push an index. Multi-producer safe. `false` when full — for a
    /// pool free list that means more releases than slots, i.e. a
    /// double free upstream.
    pub fn push(&self, value: u32) -> bool {
        debug_assert_ne!(value, VACANT);
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= self.slots.len() as u64 {
                return false;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let idx = (tail & self.mask) as usize;
                    self.slots[idx].store(value, Ordering::Release);
                    return true;
                }
                Err(_) => {
                    std::hint::spin_loop();
                    continue;
                }
            }
        }
    }

    /// Pop an index. Single consumer only.
    pub fn pop(&self) -> Option<u32> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = (head & self.mask) as usize;
        // The producer that claimed this slot may not have published
        // yet; wait out the store.
        let value = loop {
            let v = self.slots[idx].load(Ordering::Acquire);
            if v != VACANT {
                break v;
            }
            std::hint::spin_loop();
        };
        self.slots[idx].store(VACANT, Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}
