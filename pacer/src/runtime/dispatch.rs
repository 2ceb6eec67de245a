//! The steppable seam and per-timeslice stepping.
//!
//! A [`Steppable`] is the emulation core (CPU, video chip, ...) that does the
//! actual work. The worker owns it through a [`DispatchContext`] for the
//! whole run and drives it with [`DispatchContext::run_timeslice`], which
//! asks the [`VirtualClock`] for a cycle budget and steps until the budget
//! is met or the core reports something other than success.

use std::error::Error as StdError;
use std::fmt;
use std::num::NonZeroU64;

use crate::runtime::timing::VirtualClock;
use crate::runtime::worker::WorkerError;
use crate::trace::trace;

/// An emulation core that can execute a bounded number of cycles.
pub trait Steppable {
    /// Error raised when stepping fails in a way the core cannot express
    /// as a [`DispatchStatus`]. Relayed to the control thread as a fault.
    type Error: StdError + Send + Sync + 'static;

    /// Executes up to `max_cycles` cycles.
    ///
    /// Must record the cycles actually executed and the outcome in `result`
    /// via [`DispatchResult::set_ok`], [`DispatchResult::set_debugger`] or
    /// [`DispatchResult::set_fatal`]. Instruction-granular cores may
    /// overshoot `max_cycles` by part of one instruction.
    ///
    /// # Errors
    ///
    /// Any error is captured on the worker, ends the run and puts the worker
    /// into the terminal `exception` state.
    fn step(&mut self, result: &mut DispatchResult, max_cycles: u64) -> Result<(), Self::Error>;
}

/// Classification of the last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchStatus {
    /// Cycles executed normally.
    #[default]
    Ok,
    /// A breakpoint or trap was hit; the owning loop should enter the debugger.
    Debugger,
    /// The emulated machine reached an unrecoverable condition.
    Fatal,
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Debugger => f.write_str("debugger"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// Whether a debugger trap fired on a read or a write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapKind {
    /// Read trap.
    Read,
    /// Write trap.
    Write,
}

/// Result slot written by [`Steppable::step`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchResult {
    status: DispatchStatus,
    cycles: u64,
    message: Option<String>,
    address: Option<u32>,
    trap: Option<TrapKind>,
}

impl DispatchResult {
    /// Creates a successful, empty result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful step of `cycles` cycles.
    pub fn set_ok(&mut self, cycles: u64) {
        self.status = DispatchStatus::Ok;
        self.cycles = cycles;
        self.message = None;
        self.address = None;
        self.trap = None;
    }

    /// Records a step that stopped at a breakpoint or trap.
    pub fn set_debugger(
        &mut self,
        cycles: u64,
        message: impl Into<String>,
        address: Option<u32>,
        trap: Option<TrapKind>,
    ) {
        self.status = DispatchStatus::Debugger;
        self.cycles = cycles;
        self.message = Some(message.into());
        self.address = address;
        self.trap = trap;
    }

    /// Records a step that ended in an unrecoverable emulated condition.
    pub fn set_fatal(&mut self, cycles: u64, message: impl Into<String>) {
        self.status = DispatchStatus::Fatal;
        self.cycles = cycles;
        self.message = Some(message.into());
        self.address = None;
        self.trap = None;
    }

    #[must_use]
    pub const fn status(&self) -> DispatchStatus {
        self.status
    }

    /// Cycles executed by the most recent step.
    #[must_use]
    pub const fn cycles(&self) -> u64 {
        self.cycles
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub const fn address(&self) -> Option<u32> {
        self.address
    }

    #[must_use]
    pub const fn trap(&self) -> Option<TrapKind> {
        self.trap
    }

    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == DispatchStatus::Ok
    }
}

/// Outcome of one timeslice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeslice {
    /// Budget requested by the virtual clock.
    pub cycle_goal: u64,
    /// Cycles actually executed.
    pub cycles: u64,
    /// Whether the virtual clock resynced before this timeslice.
    pub drift_reset: bool,
}

/// Everything the worker needs for one run: rate, result slot and core.
///
/// Ownership moves to the worker at `start` and back to the caller at
/// `stop`, so the control thread can never touch it mid-run.
pub struct DispatchContext<S> {
    cycles_per_second: NonZeroU64,
    result: DispatchResult,
    steppable: S,
    cycles_emulated: u64,
}

impl<S> DispatchContext<S> {
    /// Creates a context with a fresh result slot.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::ZeroRate`] if `cycles_per_second` is zero.
    pub fn new(cycles_per_second: u64, steppable: S) -> Result<Self, WorkerError> {
        let cycles_per_second = NonZeroU64::new(cycles_per_second).ok_or(WorkerError::ZeroRate)?;
        Ok(Self {
            cycles_per_second,
            result: DispatchResult::new(),
            steppable,
            cycles_emulated: 0,
        })
    }

    /// Replaces the result slot, e.g. to carry one over from a previous run.
    #[must_use]
    pub fn with_result(mut self, result: DispatchResult) -> Self {
        self.result = result;
        self
    }

    #[must_use]
    pub const fn cycles_per_second(&self) -> NonZeroU64 {
        self.cycles_per_second
    }

    #[must_use]
    pub const fn result(&self) -> &DispatchResult {
        &self.result
    }

    pub fn result_mut(&mut self) -> &mut DispatchResult {
        &mut self.result
    }

    #[must_use]
    pub const fn steppable(&self) -> &S {
        &self.steppable
    }

    pub fn steppable_mut(&mut self) -> &mut S {
        &mut self.steppable
    }

    /// Total cycles executed since this context was created.
    #[must_use]
    pub const fn cycles_emulated(&self) -> u64 {
        self.cycles_emulated
    }

    /// Splits the context into its core and last result.
    #[must_use]
    pub fn into_parts(self) -> (S, DispatchResult) {
        (self.steppable, self.result)
    }
}

impl<S: Steppable> DispatchContext<S> {
    /// Runs one timeslice's worth of steps against `clock` at time `now`.
    ///
    /// Steps repeatedly, asking for the remaining budget each time, until
    /// the goal is met or the result is no longer a success. Once a step
    /// reports non-success no further steps are taken until the caller
    /// resets the result slot. A successful step that executes zero cycles
    /// ends this timeslice early so the caller stays responsive.
    ///
    /// # Errors
    ///
    /// Propagates the steppable's error; the cycles of the failing
    /// timeslice are not accounted.
    pub fn run_timeslice(
        &mut self,
        clock: &mut VirtualClock,
        now: u64,
    ) -> Result<Timeslice, S::Error> {
        let budget = clock.budget(now);
        let mut cycles = 0u64;

        while cycles < budget.cycle_goal && self.result.is_success() {
            self.steppable.step(&mut self.result, budget.cycle_goal - cycles)?;

            let executed = self.result.cycles();
            cycles = cycles.saturating_add(executed);

            if executed == 0 && self.result.is_success() {
                trace!(goal = budget.cycle_goal, cycles, "step made no progress; ending timeslice");
                break;
            }
        }

        clock.advance(cycles);
        self.cycles_emulated = self.cycles_emulated.saturating_add(cycles);

        Ok(Timeslice {
            cycle_goal: budget.cycle_goal,
            cycles,
            drift_reset: budget.drift_reset,
        })
    }
}

impl<S> fmt::Debug for DispatchContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("cycles_per_second", &self.cycles_per_second)
            .field("result", &self.result)
            .field("cycles_emulated", &self.cycles_emulated)
            .finish_non_exhaustive()
    }
}
