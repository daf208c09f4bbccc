//! Monotonic kernel tick counter.
//!
//! The timer interrupt (out of scope) calls [`tick`] at `HZ`. Everything
//! that needs a timeout (request waits, ARP throttling, TCP timers, the
//! scheduler's load sampling) reads [`current_ticks`].

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency.
pub const HZ: u64 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advance the tick counter by one. Called from the timer IRQ.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Current tick count since boot.
pub fn current_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Ticks elapsed since `start`, wrapping-safe.
pub fn ticks_since(start: u64) -> u64 {
    current_ticks().wrapping_sub(start)
}

#[cfg(test)]
pub(crate) fn advance(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}
