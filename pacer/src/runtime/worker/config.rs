//! Worker configuration.
//!
//! # Tuning Guidelines
//!
//! - **Timeslice**: upper bound on signal latency and the granularity of
//!   the busy-wait. Shorter slices answer `stop` faster but spend a larger
//!   share of each slice in `step` call overhead.
//! - **Max lag**: how far virtual time may fall behind wall time before it
//!   is resynchronised. Larger values smooth over short preemptions; smaller
//!   values cap the catch-up burst after a stall.
//!
//! The defaults (100µs slice, 1ms lag) suit a worker running under a
//! real-time scheduling class on an otherwise idle core.

use std::borrow::Cow;
use std::time::Duration;

use crate::runtime::topology::{CpuConfig, RealtimePolicy};

use super::WorkerError;

/// Ratio between the default lag tolerance and the timeslice.
pub const MAX_LAG_TIMESLICES: u32 = 10;

/// Configuration for a [`Worker`](super::Worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Busy-wait quantum between dispatches.
    ///
    /// **Default**: 100µs
    pub timeslice: Duration,

    /// Drift beyond which the virtual clock is reset to wall time.
    ///
    /// Must be at least one timeslice.
    ///
    /// **Default**: 10 × timeslice (1ms)
    pub max_lag: Duration,

    /// Core placement for the worker thread.
    ///
    /// **Default**: [`CpuConfig::Auto`]
    pub cpu: CpuConfig,

    /// Scheduling class for the worker thread.
    ///
    /// **Default**: `SCHED_FIFO` at priority 50
    pub realtime: RealtimePolicy,

    /// Bound on every control-side busy-wait. `None` waits forever.
    ///
    /// **Default**: `None`
    pub handshake_timeout: Option<Duration>,

    /// OS thread name.
    ///
    /// **Default**: `"pacer-worker"`
    pub thread_name: Cow<'static, str>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let timeslice = Duration::from_micros(100);
        Self {
            timeslice,
            max_lag: timeslice * MAX_LAG_TIMESLICES,
            cpu: CpuConfig::Auto,
            realtime: RealtimePolicy::default(),
            handshake_timeout: None,
            thread_name: Cow::Borrowed("pacer-worker"),
        }
    }
}

impl WorkerConfig {
    /// Defaults without pinning or real-time scheduling.
    ///
    /// Suitable for tests and for hosts where several workers share cores.
    #[must_use]
    pub fn unprivileged() -> Self {
        Self::default()
            .with_cpu(CpuConfig::Disabled)
            .with_realtime(RealtimePolicy::Disabled)
    }

    /// Checks the invariants [`Worker::spawn`](super::Worker::spawn) relies on.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidConfig`] naming the violated rule.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.timeslice.is_zero() {
            return Err(WorkerError::InvalidConfig("timeslice must be > 0"));
        }
        if self.max_lag < self.timeslice {
            return Err(WorkerError::InvalidConfig("max_lag must be >= timeslice"));
        }
        if let Some(priority) = self.realtime.priority()
            && !(1..=99).contains(&priority)
        {
            return Err(WorkerError::InvalidConfig("real-time priority must be in 1..=99"));
        }
        if self.thread_name.contains('\0') {
            return Err(WorkerError::InvalidConfig("thread_name must not contain NUL"));
        }
        Ok(())
    }
}

impl WorkerConfig {
    /// Builder-style setter for the timeslice.
    ///
    /// Also rescales `max_lag` to [`MAX_LAG_TIMESLICES`] slices; call
    /// [`with_max_lag`](Self::with_max_lag) afterwards to override it.
    #[must_use]
    pub fn with_timeslice(mut self, timeslice: Duration) -> Self {
        self.timeslice = timeslice;
        self.max_lag = timeslice.saturating_mul(MAX_LAG_TIMESLICES);
        self
    }

    /// Builder-style setter for the lag tolerance.
    #[must_use]
    pub const fn with_max_lag(mut self, max_lag: Duration) -> Self {
        self.max_lag = max_lag;
        self
    }

    /// Builder-style setter for core placement.
    #[must_use]
    pub const fn with_cpu(mut self, cpu: CpuConfig) -> Self {
        self.cpu = cpu;
        self
    }

    /// Builder-style setter for the scheduling class.
    #[must_use]
    pub const fn with_realtime(mut self, realtime: RealtimePolicy) -> Self {
        self.realtime = realtime;
        self
    }

    /// Builder-style setter for the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Builder-style setter for the thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.thread_name = name.into();
        self
    }
}
