//! Control-side handle for the paced worker thread.
//!
//! # Handshake
//!
//! Every control call follows the same pattern:
//!
//! ```text
//! Control thread                           Worker thread
//!      │                                        │
//!      │  check state (precondition)            │
//!      │  post(signal)   ── spins until empty   │
//!      │───────────────────────────────────────>│
//!      │                                        │  transition
//!      │                                        │  publish(state)
//!      │                                        │  clear mailbox
//!      │<───────────────────────────────────────│
//!      │  observe(state) ── spins until target  │
//!      │                     or exception       │
//! ```
//!
//! Invalid calls (`suspend` while not running, `resume` while not paused,
//! `start` while not stopped) return [`WorkerError::InvalidState`] without
//! posting anything.
//!
//! # Faults
//!
//! A fault captured on the worker is returned exactly once, as
//! [`WorkerError::Fault`], from whichever call first observes it. The
//! worker is terminal afterwards and every later call returns
//! [`WorkerError::Terminated`]. [`Worker::shutdown`] returns a fault that
//! no call observed; dropping the handle instead logs it and panics.
//!
//! # Example
//!
//! ```ignore
//! let mut worker = Worker::spawn(WorkerConfig::default())?;
//!
//! worker.start(DispatchContext::new(3_579_545, core)?)?;
//! // ... render the frame ...
//! let context = worker.stop()?.expect("worker was running");
//! frame_cycles += context.cycles_emulated();
//!
//! worker.shutdown()?;
//! ```

mod config;
mod thread;

pub use config::{MAX_LAG_TIMESLICES, WorkerConfig};

use std::fmt;
use std::hint;
use std::io;
use std::sync::Arc;
use std::thread::{self as os_thread, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::relay::CapturedFault;
use crate::runtime::dispatch::{DispatchContext, Steppable};
use crate::sync::mailbox::Signal;
use crate::sync::state::WorkerState;
use crate::trace::{debug, error, info, warn};

use thread::{Shared, WorkerThread};

/// Control API calls, named in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`Worker::spawn`]
    Spawn,
    /// [`Worker::start`]
    Start,
    /// [`Worker::stop`]
    Stop,
    /// [`Worker::suspend`]
    Suspend,
    /// [`Worker::resume`]
    Resume,
    /// [`Worker::inspect_paused`]
    Inspect,
    /// [`Worker::shutdown`] or drop.
    Quit,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spawn => "spawn",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Inspect => "inspect",
            Self::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// Error returned by the worker control API.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The OS refused to create the worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    /// A [`WorkerConfig`] rule was violated.
    #[error("invalid worker configuration: {0}")]
    InvalidConfig(&'static str),
    /// A dispatch context was created with a rate of zero.
    #[error("cycles_per_second must be > 0")]
    ZeroRate,
    /// The call is not valid in the worker's current state.
    #[error("cannot {operation} while worker is {state}")]
    InvalidState {
        /// Rejected call.
        operation: Operation,
        /// State observed at the time.
        state: WorkerState,
    },
    /// The worker captured a fault; it is terminal from now on.
    #[error("worker fault: {0}")]
    Fault(#[from] CapturedFault),
    /// The worker has exited (after quit, or after its fault was relayed).
    #[error("worker thread has terminated")]
    Terminated,
    /// The worker did not acknowledge a signal within the handshake timeout.
    #[error("{operation} handshake timed out after {waited:?}")]
    Timeout {
        /// Call that gave up.
        operation: Operation,
        /// Time spent waiting.
        waited: Duration,
    },
    /// A previous handshake timed out; the worker no longer accepts calls.
    #[error("worker is unresponsive")]
    Unresponsive,
}

/// Optional bound on a busy-wait.
struct Deadline {
    started: Instant,
    limit: Option<Instant>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            started,
            limit: timeout.map(|timeout| started + timeout),
        }
    }

    fn check(&self, operation: Operation) -> Result<(), WorkerError> {
        match self.limit {
            Some(limit) => {
                let now = Instant::now();
                if now > limit {
                    Err(WorkerError::Timeout {
                        operation,
                        waited: now.duration_since(self.started),
                    })
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }
}

/// Handle to a paced worker thread.
///
/// Owns the thread: [`shutdown`](Self::shutdown) posts `quit` and joins it,
/// and so does dropping the handle.
pub struct Worker<S: Steppable + Send + 'static> {
    shared: Arc<Shared<S>>,
    handle: Option<JoinHandle<()>>,
    handshake_timeout: Option<Duration>,
    unresponsive: bool,
}

impl<S: Steppable + Send + 'static> Worker<S> {
    /// Spawns the worker thread and waits until it is stopped and ready.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidConfig`] for a bad configuration,
    /// [`WorkerError::Spawn`] if the thread cannot be created, and any fault
    /// raised while the thread initialises.
    pub fn spawn(config: WorkerConfig) -> Result<Self, WorkerError> {
        config.validate()?;

        info!(
            timeslice_us = config.timeslice.as_micros() as u64,
            max_lag_us = config.max_lag.as_micros() as u64,
            cpu = ?config.cpu,
            realtime = %config.realtime,
            handshake_timeout = ?config.handshake_timeout,
            "worker starting"
        );

        let shared = Arc::new(Shared::new());
        let worker_thread = WorkerThread::new(Arc::clone(&shared), &config);

        let handle = os_thread::Builder::new()
            .name(config.thread_name.clone().into_owned())
            .spawn(move || worker_thread.run())
            .map_err(|e| {
                error!(error = %e, "failed to spawn worker thread");
                WorkerError::Spawn(e)
            })?;

        let mut worker = Self {
            shared,
            handle: Some(handle),
            handshake_timeout: config.handshake_timeout,
            unresponsive: false,
        };
        worker.guard(|w| w.await_state(Operation::Spawn, WorkerState::Stopped))?;

        info!("worker ready");
        Ok(worker)
    }

    /// Hands `context` to the worker and waits until it is running.
    ///
    /// A context with a zero rate cannot be constructed, see
    /// [`DispatchContext::new`].
    ///
    /// # Errors
    ///
    /// [`WorkerError::InvalidState`] unless the worker is stopped, or a
    /// relayed fault / termination / timeout.
    pub fn start(&mut self, context: DispatchContext<S>) -> Result<(), WorkerError> {
        let state = self.ensure_usable()?;
        if state != WorkerState::Stopped {
            return Err(WorkerError::InvalidState {
                operation: Operation::Start,
                state,
            });
        }

        debug!(cycles_per_second = context.cycles_per_second().get(), "starting dispatch");
        self.shared.park(context);
        self.handshake(Operation::Start, Signal::Start, WorkerState::Running)
    }

    /// Stops dispatching and hands the context back.
    ///
    /// The returned context reports the cycles emulated since `start` through
    /// [`DispatchContext::cycles_emulated`]. Returns `Ok(None)` if the worker
    /// is already stopped.
    ///
    /// # Errors
    ///
    /// A relayed fault, termination or timeout.
    pub fn stop(&mut self) -> Result<Option<DispatchContext<S>>, WorkerError> {
        match self.ensure_usable()? {
            WorkerState::Stopped => Ok(None),
            WorkerState::Running | WorkerState::Paused => {
                self.handshake(Operation::Stop, Signal::Stop, WorkerState::Stopped)?;
                let context = self.shared.take_context();
                debug!(
                    cycles = ?context.as_ref().map(DispatchContext::cycles_emulated),
                    "dispatch stopped"
                );
                Ok(context)
            }
            state => Err(WorkerError::InvalidState {
                operation: Operation::Stop,
                state,
            }),
        }
    }

    /// Pauses a running worker, keeping its context.
    ///
    /// # Errors
    ///
    /// [`WorkerError::InvalidState`] unless the worker is running, or a
    /// relayed fault / termination / timeout.
    pub fn suspend(&mut self) -> Result<(), WorkerError> {
        self.transition(Operation::Suspend, WorkerState::Running, Signal::Suspend, WorkerState::Paused)
    }

    /// Resumes a paused worker.
    ///
    /// # Errors
    ///
    /// [`WorkerError::InvalidState`] unless the worker is paused, or a
    /// relayed fault / termination / timeout.
    pub fn resume(&mut self) -> Result<(), WorkerError> {
        self.transition(Operation::Resume, WorkerState::Paused, Signal::Resume, WorkerState::Running)
    }

    /// Returns `true` while the worker holds a context (running or paused).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.load().is_dispatching()
    }

    /// Current worker state, for diagnostics.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.shared.state.load()
    }

    /// Runs `f` on the context of a paused worker (e.g. to snapshot it).
    ///
    /// # Errors
    ///
    /// [`WorkerError::InvalidState`] unless the worker is paused, or a
    /// relayed fault / termination.
    pub fn inspect_paused<R>(
        &mut self,
        f: impl FnOnce(&mut DispatchContext<S>) -> R,
    ) -> Result<R, WorkerError> {
        let state = self.ensure_usable()?;
        let invalid = WorkerError::InvalidState {
            operation: Operation::Inspect,
            state,
        };
        if state != WorkerState::Paused {
            return Err(invalid);
        }
        self.shared.with_parked(f).ok_or(invalid)
    }

    /// Takes back the context a faulted worker was dispatching.
    ///
    /// Available only after the steppable returned an error; a panic
    /// unwinds through the context and it is lost.
    pub fn reclaim(&mut self) -> Option<DispatchContext<S>> {
        if self.shared.state.load() == WorkerState::Exception {
            self.shared.take_context()
        } else {
            None
        }
    }

    /// Quits the worker and joins its thread.
    ///
    /// # Errors
    ///
    /// Returns a fault no earlier call observed, or [`WorkerError::Timeout`]
    /// / [`WorkerError::Unresponsive`] if the thread had to be detached.
    pub fn shutdown(mut self) -> Result<(), WorkerError> {
        self.quit()
    }

    fn transition(
        &mut self,
        operation: Operation,
        required: WorkerState,
        signal: Signal,
        target: WorkerState,
    ) -> Result<(), WorkerError> {
        let state = self.ensure_usable()?;
        if state != required {
            return Err(WorkerError::InvalidState { operation, state });
        }
        self.handshake(operation, signal, target)
    }

    fn handshake(
        &mut self,
        operation: Operation,
        signal: Signal,
        target: WorkerState,
    ) -> Result<(), WorkerError> {
        self.guard(|w| {
            let deadline = Deadline::new(w.handshake_timeout);
            w.shared
                .mailbox
                .post_with(signal, || w.poll(operation, &deadline))?;
            w.unpark();
            w.spin_until(target, operation, &deadline)
        })
    }

    fn await_state(&self, operation: Operation, target: WorkerState) -> Result<(), WorkerError> {
        let deadline = Deadline::new(self.handshake_timeout);
        self.spin_until(target, operation, &deadline)
    }

    /// Marks the worker unresponsive if `f` timed out.
    fn guard(
        &mut self,
        f: impl FnOnce(&Self) -> Result<(), WorkerError>,
    ) -> Result<(), WorkerError> {
        let result = f(self);
        if matches!(result, Err(WorkerError::Timeout { .. })) {
            warn!(result = ?result, "worker handshake timed out");
            self.unresponsive = true;
        }
        result
    }

    fn spin_until(
        &self,
        target: WorkerState,
        operation: Operation,
        deadline: &Deadline,
    ) -> Result<(), WorkerError> {
        loop {
            let state = self.shared.state.load();
            if state == target {
                return Ok(());
            }
            if let Some(error) = self.terminal_error(state) {
                return Err(error);
            }
            deadline.check(operation)?;
            hint::spin_loop();
        }
    }

    fn poll(&self, operation: Operation, deadline: &Deadline) -> Result<(), WorkerError> {
        if let Some(error) = self.terminal_error(self.shared.state.load()) {
            return Err(error);
        }
        deadline.check(operation)
    }

    fn ensure_usable(&self) -> Result<WorkerState, WorkerError> {
        if self.unresponsive {
            return Err(WorkerError::Unresponsive);
        }
        let state = self.shared.state.load();
        match self.terminal_error(state) {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }

    /// Relays a pending fault (once), or reports termination.
    fn terminal_error(&self, state: WorkerState) -> Option<WorkerError> {
        match state {
            WorkerState::Exception => Some(
                self.shared
                    .relay
                    .take()
                    .map_or(WorkerError::Terminated, WorkerError::Fault),
            ),
            WorkerState::Quit => Some(WorkerError::Terminated),
            _ => None,
        }
    }

    fn unpark(&self) {
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    fn quit(&mut self) -> Result<(), WorkerError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        if self.unresponsive {
            self.shared.mailbox.force(Signal::Quit);
            handle.thread().unpark();
            warn!("detaching unresponsive worker thread");
            return Err(WorkerError::Unresponsive);
        }

        debug!("worker quit requested");
        let deadline = Deadline::new(self.handshake_timeout);

        if !self.shared.state.load().is_terminal() {
            let posted = self.shared.mailbox.post_with(Signal::Quit, || {
                if self.shared.state.load().is_terminal() {
                    Err(None)
                } else {
                    deadline.check(Operation::Quit).map_err(Some)
                }
            });
            if let Err(Some(timeout)) = posted {
                return Err(self.detach(handle, timeout));
            }
            handle.thread().unpark();

            while !self.shared.state.load().is_terminal() {
                if let Err(timeout) = deadline.check(Operation::Quit) {
                    return Err(self.detach(handle, timeout));
                }
                hint::spin_loop();
            }
        }

        if handle.join().is_err() {
            error!("worker thread panicked outside dispatch");
            return Err(WorkerError::Terminated);
        }

        info!(state = %self.shared.state.load(), "worker joined");
        match self.shared.relay.take() {
            Some(fault) => Err(WorkerError::Fault(fault)),
            None => Ok(()),
        }
    }

    fn detach(&mut self, handle: JoinHandle<()>, timeout: WorkerError) -> WorkerError {
        self.unresponsive = true;
        self.shared.mailbox.force(Signal::Quit);
        handle.thread().unpark();
        warn!(error = %timeout, "detaching unresponsive worker thread");
        timeout
    }
}

impl<S: Steppable + Send + 'static> fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("state", &self.shared.state.load())
            .field("unresponsive", &self.unresponsive)
            .field("fault_pending", &self.shared.relay.is_pending())
            .finish_non_exhaustive()
    }
}

impl<S: Steppable + Send + 'static> Drop for Worker<S> {
    fn drop(&mut self) {
        match self.quit() {
            Ok(()) | Err(WorkerError::Unresponsive | WorkerError::Timeout { .. }) => {}
            Err(WorkerError::Fault(fault)) => {
                error!(fault = %fault, "worker dropped with an unobserved fault");
                if !os_thread::panicking() {
                    panic!("worker dropped with an unobserved fault: {fault}");
                }
            }
            Err(_other) => {
                debug!(error = %_other, "worker quit on drop");
            }
        }
    }
}
