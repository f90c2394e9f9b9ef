//! Utilities used in this crate.
//!
//! This is not part of the public interface of the crate.

/// Geometrically-growing no-op spin, 32 iterations up to 16384.
///
/// Never calls into the scheduler (`sched_yield`, a mutex, a condvar): both
/// the producer's ring-full wait and the interruption ring's wait-for-slot
/// loop may run in signal context, where yielding is not allowed. Call
/// repeatedly with the previous return value until the awaited condition is
/// true.
#[inline]
pub fn spin_backoff(prev: u32) -> u32 {
    let n = prev.clamp(32, 16384);
    let mut sink: u32 = 0;
    for i in 0..n {
        sink = sink.wrapping_add(i);
    }
    std::hint::black_box(sink);
    (n + 1).min(16384)
}
