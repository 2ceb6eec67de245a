//! Timing primitives for the dispatch loop.
//!
//! Wall-clock reads are integer monotonic nanoseconds behind the [`Now`]
//! trait; the [`VirtualClock`] turns them into cycle budgets.

mod time;
mod virtual_clock;

pub use time::{ManualClock, MonotonicClock, Now};
pub use virtual_clock::{Budget, VirtualClock};
