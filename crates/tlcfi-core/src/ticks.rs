//! # Ticks Clock
//!
//! Millisecond counter with 32-bit wraparound used to timestamp every state
//! change and to measure request/confirmation latency.
//!
//! The clock is an explicit value shared through `Arc<TicksClock>`; a manual
//! source lets tests drive time by hand.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Source of TLC-FI ticks.
#[derive(Debug)]
pub struct TicksClock {
    source: TickSource,
}

#[derive(Debug)]
enum TickSource {
    Monotonic(Instant),
    Manual(AtomicU32),
}

impl TicksClock {
    /// Clock counting milliseconds since construction.
    pub fn monotonic() -> Self {
        TicksClock {
            source: TickSource::Monotonic(Instant::now()),
        }
    }

    /// Clock that only moves through [`TicksClock::set`] and [`TicksClock::advance`].
    pub fn manual(start: u32) -> Self {
        TicksClock {
            source: TickSource::Manual(AtomicU32::new(start)),
        }
    }

    /// Current tick value.
    pub fn ticks(&self) -> u32 {
        match &self.source {
            // Truncation is the wraparound.
            TickSource::Monotonic(start) => start.elapsed().as_millis() as u32,
            TickSource::Manual(value) => value.load(Ordering::SeqCst),
        }
    }

    /// Sets a manual clock. No-op on a monotonic clock.
    pub fn set(&self, ticks: u32) {
        if let TickSource::Manual(value) = &self.source {
            value.store(ticks, Ordering::SeqCst);
        }
    }

    /// Advances a manual clock, wrapping at `u32::MAX`. No-op on a monotonic clock.
    pub fn advance(&self, millis: u32) {
        if let TickSource::Manual(value) = &self.source {
            // fetch_add on atomics wraps on overflow
            value.fetch_add(millis, Ordering::SeqCst);
        }
    }

    /// Ticks elapsed since `since`, correct across one wraparound.
    pub fn elapsed_since(&self, since: u32) -> u32 {
        elapsed(since, self.ticks())
    }
}

impl Default for TicksClock {
    fn default() -> Self {
        TicksClock::monotonic()
    }
}

/// Difference `to - from` in wrapping 32-bit arithmetic.
pub fn elapsed(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}
