//! Monotonic tick counter.
//!
//! The platform layer advances the counter from its timer source; everything
//! else only ever reads it. There is no wall-clock time anywhere in the
//! system - retry timers and timeouts are all expressed in ticks.

use core::sync::atomic::{AtomicU64, Ordering};

/// Tick rate of the monotonic counter
pub const TICKS_PER_SEC: u64 = 1024;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Current value of the monotonic tick counter
pub fn currticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Advance the tick counter
///
/// Called by the platform timer glue (and by tests to simulate the passage
/// of time).
pub fn advance(ticks: u64) {
    TICKS.fetch_add(ticks, Ordering::Relaxed);
}

/// Convert whole seconds to ticks
pub const fn sec(s: u64) -> u64 {
    s * TICKS_PER_SEC
}

/// Convert milliseconds to ticks, rounding up so short waits never vanish
pub const fn msec(ms: u64) -> u64 {
    (ms * TICKS_PER_SEC).div_ceil(1000)
}
