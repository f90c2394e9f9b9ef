//! Global generation counter (`ggen`): a coarse, cheap clock used to bound
//! how stale a thread's view of another thread's writes can be.
//!
//! `increase_ggen` is called around synchronization operations that create a
//! happens-before edge (lock release, thread fork/join). Any ring that wants
//! to know "has the world moved on since I last looked" loads `GGEN` with
//! the orderings below; it never needs a lock.

use std::sync::atomic::{AtomicU64, Ordering};

static GGEN: AtomicU64 = AtomicU64::new(0);

/// Bump the global generation. Called by a thread that just performed a
/// synchronization release (mutex unlock, fork, join).
///
/// Uses `Release` so that every store this thread made before the bump is
/// visible to any thread that later observes the new `ggen` value with
/// `ggen_after_load`.
pub fn increase_ggen() -> u64 {
    GGEN.fetch_add(1, Ordering::Release) + 1
}

/// Read `ggen` before recording a traced store.
///
/// `Acquire` pairs with `increase_ggen`'s `Release`: if this load observes a
/// bumped generation, every store program-ordered before that bump is
/// visible to this thread already, so the COG event this value seeds is
/// conservative (it over-approximates how much happened-before, never
/// under-approximates it).
pub fn ggen_before_store() -> u64 {
    GGEN.load(Ordering::Acquire)
}

/// Read `ggen` after a traced load, with a fence ahead of the load.
///
/// The fence orders the load after every prior memory access in program
/// order, so the returned generation reflects everything this thread has
/// observed so far, not just what an ordinary `Acquire` load would pin down.
pub fn ggen_after_load() -> u64 {
    std::sync::atomic::fence(Ordering::Acquire);
    GGEN.load(Ordering::Acquire)
}

/// Current generation, with no ordering guarantee beyond atomicity. Useful
/// for diagnostics; tracing code should use `ggen_before_store` /
/// `ggen_after_load` instead.
pub fn current() -> u64 {
    GGEN.load(Ordering::Relaxed)
}
