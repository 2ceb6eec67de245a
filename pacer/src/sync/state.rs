//! Worker state register.
//!
//! Written only by the worker thread (the initial `Initializing` value is
//! set before the thread exists); the control thread only reads it and
//! treats a change as acceptance of the signal it posted.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of the worker thread.
///
/// ```text
/// initializing ──► stopped ──start──► running ◄──resume── paused
///                     ▲                  │ └──suspend────►  │
///                     └──────stop────────┴──────────────────┘
///  any ──quit──► quit            any ──fault──► exception
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Thread spawned, scheduling not yet configured.
    Initializing = 0,
    /// Parked, waiting for `start` (or `quit`).
    Stopped = 1,
    /// Dispatching timeslices.
    Running = 2,
    /// Holding the context without stepping.
    Paused = 3,
    /// A fault was captured; the thread has returned. Terminal.
    Exception = 4,
    /// Quit was serviced; the thread has returned. Terminal.
    Quit = 5,
}

impl WorkerState {
    /// Returns `true` once the worker thread has returned for good.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exception | Self::Quit)
    }

    /// Returns `true` while the worker holds a dispatch context.
    #[inline]
    #[must_use]
    pub const fn is_dispatching(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Initializing,
            1 => Self::Stopped,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Exception,
            // Only values produced by `as u8` are ever stored.
            _ => Self::Quit,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Exception => "exception",
            Self::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// Atomic holder for [`WorkerState`].
#[repr(align(64))]
pub struct StateRegister {
    state: AtomicU8,
}

impl StateRegister {
    /// Creates a register in [`WorkerState::Initializing`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Initializing as u8),
        }
    }

    /// Reads the current state.
    #[inline]
    #[must_use]
    pub fn load(&self) -> WorkerState {
        WorkerState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Publishes a new state. Worker thread only.
    ///
    /// Release ordering makes every write the worker did before the
    /// transition (parking the context, storing a fault) visible to a
    /// control thread that observes the new state.
    #[inline]
    pub fn publish(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Default for StateRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRegister").field("state", &self.load()).finish()
    }
}
