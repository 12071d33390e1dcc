// WIGIG DATAPATH — ENGINE: DESCRIPTOR RING CORE
// Fixed-capacity circular array of hardware descriptors plus a parallel
// software-owned context array (the side-table holding what hardware must
// never see: buffer ownership, mapping kind, chain bookkeeping).
//
// Index contract (single-producer / single-consumer):
//   - only the producer writes `head`, only the consumer writes `tail`
//   - empty  iff head == tail
//   - full   iff (tail + capacity - 1) % capacity == head
//   - at most capacity-1 entries usable; one slot stays empty so full and
//     empty are distinguishable
//   - the producer owns slots in [head, head+n) while staging; the consumer
//     owns slots in [tail, head); publication of either index is the
//     handover point
//
// Both indices are cache-line padded atomics published with Release and
// observed with Acquire, so the opposite side never sees a slot before the
// writes that filled it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Zeroable;

use crate::engine::runtime::CachePadded;
use crate::error::Error;

pub struct DescRing<D, C> {
    desc: Box<[UnsafeCell<D>]>,
    ctx: Box<[UnsafeCell<Option<C>>]>,
    capacity: u32,
    head: CachePadded<AtomicU32>, // producer-written, consumer-read
    tail: CachePadded<AtomicU32>, // consumer-written, producer-read
}

// SAFETY: the single-producer/single-consumer contract above keeps the slot
// ranges touched by each side disjoint; the atomic indices are the only
// shared mutable state crossed without that ownership split.
unsafe impl<D: Send, C: Send> Send for DescRing<D, C> {}
unsafe impl<D: Send, C: Send> Sync for DescRing<D, C> {}

impl<D: Zeroable, C> DescRing<D, C> {
    /// Allocate a ring of `capacity` zero-initialized descriptors and empty
    /// contexts. Capacity must be at least 2 (one slot is always kept empty).
    pub fn new(capacity: u32) -> Result<Self, Error> {
        assert!(capacity >= 2, "ring capacity must be at least 2");

        let n = capacity as usize;
        let mut desc = Vec::new();
        desc.try_reserve_exact(n).map_err(|_| Error::OutOfMemory)?;
        for _ in 0..n {
            desc.push(UnsafeCell::new(D::zeroed()));
        }
        let mut ctx = Vec::new();
        ctx.try_reserve_exact(n).map_err(|_| Error::OutOfMemory)?;
        for _ in 0..n {
            ctx.push(UnsafeCell::new(None));
        }

        Ok(DescRing {
            desc: desc.into_boxed_slice(),
            ctx: ctx.into_boxed_slice(),
            capacity,
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
        })
    }
}

impl<D, C> DescRing<D, C> {
    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline(always)]
    pub fn head(&self) -> u32 {
        self.head.value.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn tail(&self) -> u32 {
        self.tail.value.load(Ordering::Acquire)
    }

    /// Entries currently handed to hardware (or awaiting reclaim).
    #[inline(always)]
    pub fn used(&self) -> u32 {
        (self.capacity + self.head() - self.tail()) % self.capacity
    }

    /// Slots the producer may still stage: capacity - used - 1.
    #[inline(always)]
    pub fn available_slots(&self) -> u32 {
        self.capacity - self.used() - 1
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        (self.head() + 1) % self.capacity == self.tail()
    }

    /// Next index after `idx`, mod capacity.
    #[inline(always)]
    pub fn next(&self, idx: u32) -> u32 {
        (idx + 1) % self.capacity
    }

    /// Index `idx + n`, mod capacity.
    #[inline(always)]
    pub fn offset(&self, idx: u32, n: u32) -> u32 {
        (idx + n) % self.capacity
    }

    /// Publish `n` newly staged descriptors. Producer side only. The caller
    /// must follow this with the doorbell write so hardware observes the
    /// update; the publish is a required side effect of posting, not an
    /// optimization.
    #[inline(always)]
    pub fn advance_head(&self, n: u32) {
        let head = self.head.value.load(Ordering::Relaxed);
        self.head
            .value
            .store((head + n) % self.capacity, Ordering::Release);
    }

    /// Publish `n` vacated slots. Consumer side only.
    #[inline(always)]
    pub fn advance_tail(&self, n: u32) {
        let tail = self.tail.value.load(Ordering::Relaxed);
        self.tail
            .value
            .store((tail + n) % self.capacity, Ordering::Release);
    }

    /// Raw pointer to the descriptor at `idx`.
    ///
    /// Dereferencing is only sound while the caller's side owns the slot
    /// under the index contract (producer: staged-but-unpublished slots;
    /// consumer: slots in [tail, head)).
    #[inline(always)]
    pub fn desc_ptr(&self, idx: u32) -> *mut D {
        debug_assert!(idx < self.capacity);
        self.desc[idx as usize].get()
    }

    /// Take the context stored at `idx`, leaving the slot empty.
    ///
    /// # Safety
    /// The caller's side must own the slot under the index contract, and no
    /// other call may touch this slot's context concurrently.
    #[inline(always)]
    pub unsafe fn take_ctx(&self, idx: u32) -> Option<C> {
        debug_assert!(idx < self.capacity);
        (*self.ctx[idx as usize].get()).take()
    }

    /// Store a context at `idx`.
    ///
    /// # Safety
    /// Same ownership contract as [`take_ctx`](Self::take_ctx).
    #[inline(always)]
    pub unsafe fn put_ctx(&self, idx: u32, c: C) {
        debug_assert!(idx < self.capacity);
        *self.ctx[idx as usize].get() = Some(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(cap: u32) -> DescRing<u64, u32> {
        DescRing::new(cap).unwrap()
    }

    #[test]
    fn starts_empty() {
        let r = ring(8);
        assert!(r.is_empty());
        assert!(!r.is_full());
        assert_eq!(r.used(), 0);
        assert_eq!(r.available_slots(), 7);
    }

    #[test]
    fn one_slot_kept_empty() {
        let r = ring(8);
        r.advance_head(7);
        assert!(r.is_full());
        assert_eq!(r.used(), 7);
        assert_eq!(r.available_slots(), 0);
    }

    #[test]
    fn used_stays_in_bounds_across_wrap() {
        // Drive head/tail through several full wraps and check the invariant
        // 0 <= used <= capacity-1 after every step.
        let r = ring(8);
        for _ in 0..5 {
            for _ in 0..7 {
                r.advance_head(1);
                assert!(r.used() <= 7);
            }
            for _ in 0..7 {
                r.advance_tail(1);
                assert!(r.used() <= 7);
            }
        }
        assert!(r.is_empty());
    }

    #[test]
    fn index_arithmetic_wraps() {
        let r = ring(8);
        assert_eq!(r.next(7), 0);
        assert_eq!(r.offset(6, 3), 1);
    }

    #[test]
    fn ctx_take_leaves_slot_empty() {
        let r = ring(4);
        // SAFETY: single-threaded test, trivially owns every slot.
        unsafe {
            r.put_ctx(2, 99);
            assert_eq!(r.take_ctx(2), Some(99));
            assert_eq!(r.take_ctx(2), None);
        }
    }

    #[test]
    fn descriptors_zero_initialized() {
        let r = ring(4);
        for i in 0..4 {
            // SAFETY: single-threaded test.
            assert_eq!(unsafe { *r.desc_ptr(i) }, 0u64);
        }
    }
}
