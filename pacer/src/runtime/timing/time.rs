//! Monotonic nanosecond time sources.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

/// A source of monotonic time in nanoseconds since an arbitrary origin.
pub trait Now {
    /// Nanoseconds elapsed since this source's origin. Never decreases.
    fn now_nanos(&self) -> u64;
}

/// TSC-backed wall clock (falls back to the OS monotonic clock where the
/// TSC is unusable).
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Now for MonotonicClock {
    #[inline]
    fn now_nanos(&self) -> u64 {
        saturating_nanos(self.origin.elapsed())
    }
}

/// Manually advanced clock for deterministic tests and replays.
///
/// Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start` nanoseconds.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(saturating_nanos(by), Ordering::AcqRel);
    }

    /// Moves the clock forward by a raw nanosecond count.
    pub fn advance_nanos(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }
}

impl Now for ManualClock {
    #[inline]
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

/// Converts a duration to nanoseconds, saturating at `u64::MAX` (~584 years).
#[inline]
pub(crate) fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();

        let mut previous = clock.now_nanos();
        for _ in 0..1_000 {
            let now = clock.now_nanos();
            assert!(now >= previous);
            previous = now;
        }
    }

    #[test]
    fn monotonic_clock_tracks_sleep() {
        let clock = MonotonicClock::new();

        std::thread::sleep(Duration::from_millis(5));

        assert!(clock.now_nanos() >= 4_000_000, "expected roughly 5ms to elapse");
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(100);
        let view = clock.clone();

        clock.advance(Duration::from_micros(2));
        view.advance_nanos(50);

        assert_eq!(clock.now_nanos(), 2_150);
        assert_eq!(view.now_nanos(), 2_150);
    }

    #[test]
    fn huge_durations_saturate() {
        assert_eq!(saturating_nanos(Duration::MAX), u64::MAX);
        assert_eq!(saturating_nanos(Duration::from_nanos(7)), 7);
    }
}
