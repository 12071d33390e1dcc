// WIGIG DATAPATH — ENGINE: RUNTIME PRIMITIVES
// Monotonic clock and cache-line padding. The clock feeds reorder arrival
// timestamps and transmit-ring idle accounting; padding keeps the ring's
// producer and consumer indices off each other's cache lines.

/// Monotonic nanosecond clock.
#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: FFI call with valid mutable reference to timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Hardware cache-line padding.
/// 128 bytes covers L1d false sharing plus adjacent-line hardware prefetch
/// (128-byte stride on Cortex-A53, 128-byte pair on Intel).
#[repr(C, align(128))]
pub struct CachePadded<T> {
    pub value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        CachePadded { value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = clock_ns();
        let b = clock_ns();
        assert!(b >= a);
    }

    #[test]
    fn padding_alignment() {
        assert_eq!(core::mem::align_of::<CachePadded<u32>>(), 128);
        assert!(core::mem::size_of::<CachePadded<u32>>() >= 128);
    }
}
