//! Drift-corrected virtual clock.
//!
//! Tracks how much emulated time the steppable has produced since the run
//! started and converts the gap to wall-clock time into a cycle budget:
//!
//! ```text
//! delta      = real_elapsed - virtual_time
//! delta      > max_lag  =>  virtual_time = real_elapsed, delta = 0
//! cycle_goal = floor(delta * cycles_per_second / 1e9)
//! ```
//!
//! Resetting on excessive lag bounds catch-up bursts after a stall
//! (breakpoint, preemption) to at most `max_lag` worth of cycles. Virtual
//! time accumulates in `f64` so truncation does not compound across many
//! short timeslices.

use std::num::NonZeroU64;
use std::time::Duration;

use super::time::saturating_nanos;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Cycle budget computed at the start of a timeslice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Wall-clock nanoseconds since the run's origin.
    pub real_elapsed: u64,
    /// Cycles the steppable must execute to catch up with wall-clock time.
    pub cycle_goal: u64,
    /// Whether the lag exceeded `max_lag` and virtual time was resynced.
    pub drift_reset: bool,
}

/// Converts wall-clock progress into emulated-cycle budgets.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    cycles_per_second: NonZeroU64,
    timeslice: u64,
    max_lag: u64,
    origin: u64,
    virtual_time: f64,
    drift_resets: u64,
}

impl VirtualClock {
    /// Creates a clock for the given emulated rate.
    ///
    /// The origin is zero until [`VirtualClock::reset`] is called.
    #[must_use]
    pub fn new(cycles_per_second: NonZeroU64, timeslice: Duration, max_lag: Duration) -> Self {
        Self {
            cycles_per_second,
            timeslice: saturating_nanos(timeslice),
            max_lag: saturating_nanos(max_lag),
            origin: 0,
            virtual_time: 0.0,
            drift_resets: 0,
        }
    }

    /// Starts a fresh run at `now`: origin = now, virtual time = 0.
    pub fn reset(&mut self, now: u64) {
        self.origin = now;
        self.virtual_time = 0.0;
    }

    /// Computes the cycle budget for a timeslice starting at `now`.
    ///
    /// Applies drift correction first, so the returned goal never implies
    /// more than `max_lag` worth of catch-up. A negative lag (virtual time
    /// ahead after an overshooting step) yields a goal of zero.
    pub fn budget(&mut self, now: u64) -> Budget {
        let real_elapsed = now.saturating_sub(self.origin);
        let mut delta = real_elapsed as f64 - self.virtual_time;
        let mut drift_reset = false;

        if delta > self.max_lag as f64 {
            self.virtual_time = real_elapsed as f64;
            self.drift_resets += 1;
            delta = 0.0;
            drift_reset = true;
        }

        let cycle_goal = if delta > 0.0 {
            // Truncating cast floors positive values.
            (delta * self.cycles_per_second.get() as f64 / NANOS_PER_SECOND) as u64
        } else {
            0
        };

        Budget {
            real_elapsed,
            cycle_goal,
            drift_reset,
        }
    }

    /// Accounts for `cycles` executed during the current timeslice.
    pub fn advance(&mut self, cycles: u64) {
        self.virtual_time +=
            cycles as f64 / self.cycles_per_second.get() as f64 * NANOS_PER_SECOND;
    }

    /// Returns `true` once a full timeslice has passed since `slice_start`.
    #[inline]
    #[must_use]
    pub const fn timeslice_elapsed(&self, slice_start: u64, now: u64) -> bool {
        now.saturating_sub(slice_start) >= self.timeslice
    }

    /// Emulated nanoseconds produced since the origin.
    #[must_use]
    pub const fn virtual_nanos(&self) -> f64 {
        self.virtual_time
    }

    /// Timeslice length in nanoseconds.
    #[must_use]
    pub const fn timeslice_nanos(&self) -> u64 {
        self.timeslice
    }

    /// Lag threshold in nanoseconds.
    #[must_use]
    pub const fn max_lag_nanos(&self) -> u64 {
        self.max_lag
    }

    /// Target rate.
    #[must_use]
    pub const fn cycles_per_second(&self) -> NonZeroU64 {
        self.cycles_per_second
    }

    /// Number of drift corrections since construction.
    #[must_use]
    pub const fn drift_resets(&self) -> u64 {
        self.drift_resets
    }
}
