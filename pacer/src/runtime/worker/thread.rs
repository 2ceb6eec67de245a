//! Worker thread: signal servicing and the paced dispatch loop.
//!
//! The thread owns the [`DispatchContext`] from `start` until `stop`. While
//! stopped it parks and is woken by the control thread after each post;
//! while running or paused it busy-waits, checking the mailbox every
//! iteration so any signal is seen within one timeslice.

use std::hint;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::relay::{CapturedFault, FaultRelay};
use crate::runtime::dispatch::{DispatchContext, Steppable};
use crate::runtime::timing::{MonotonicClock, Now, VirtualClock};
use crate::runtime::topology::{self, CpuConfig, RealtimePolicy};
use crate::sync::mailbox::{Mailbox, Signal};
use crate::sync::state::{StateRegister, WorkerState};
use crate::trace::{debug, error, info};

use super::WorkerConfig;

/// State shared between the control handle and the worker thread.
pub(super) struct Shared<S> {
    pub(super) mailbox: Mailbox,
    pub(super) state: StateRegister,
    pub(super) relay: FaultRelay,
    /// Context handoff slot. Only touched at handoff points (start, stop,
    /// suspend, resume, fault), never while stepping.
    handoff: Mutex<Option<DispatchContext<S>>>,
}

impl<S> Shared<S> {
    pub(super) fn new() -> Self {
        Self {
            mailbox: Mailbox::new(),
            state: StateRegister::new(),
            relay: FaultRelay::new(),
            handoff: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<DispatchContext<S>>> {
        self.handoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn park(&self, context: DispatchContext<S>) {
        *self.slot() = Some(context);
    }

    pub(super) fn take_context(&self) -> Option<DispatchContext<S>> {
        self.slot().take()
    }

    pub(super) fn with_parked<R>(&self, f: impl FnOnce(&mut DispatchContext<S>) -> R) -> Option<R> {
        self.slot().as_mut().map(f)
    }
}

/// How a dispatch run ended without a fault.
enum Exit {
    Stop,
    Quit,
}

/// The worker side of the handshake.
pub(super) struct WorkerThread<S> {
    shared: Arc<Shared<S>>,
    clock: MonotonicClock,
    timeslice: Duration,
    max_lag: Duration,
    cpu: CpuConfig,
    realtime: RealtimePolicy,
}

impl<S: Steppable> WorkerThread<S> {
    pub(super) fn new(shared: Arc<Shared<S>>, config: &WorkerConfig) -> Self {
        Self {
            shared,
            clock: MonotonicClock::new(),
            timeslice: config.timeslice,
            max_lag: config.max_lag,
            cpu: config.cpu,
            realtime: config.realtime,
        }
    }

    /// Thread entry point. Never unwinds: every failure ends up in the
    /// relay with the state set to [`WorkerState::Exception`].
    pub(super) fn run(mut self) {
        info!("worker thread started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            topology::configure_current_thread(self.cpu, self.realtime);
            self.service()
        }));

        match outcome {
            Ok(Ok(())) => self.publish(WorkerState::Quit),
            Ok(Err(fault)) => self.fail(fault),
            Err(payload) => self.fail(CapturedFault::from_panic(payload)),
        }

        info!("worker thread exiting");
    }

    fn fail(&self, fault: CapturedFault) {
        error!(fault = %fault, "worker fault captured");
        self.shared.relay.capture(fault);
        self.publish(WorkerState::Exception);
    }

    fn publish(&self, state: WorkerState) {
        self.shared.state.publish(state);
        debug!(state = %state, "worker state");
    }

    /// Services signals while stopped.
    fn service(&mut self) -> Result<(), CapturedFault> {
        self.publish(WorkerState::Stopped);

        loop {
            match self.wait_for_signal() {
                Signal::Quit => return Ok(()),
                Signal::Stop => self.shared.mailbox.clear(),
                Signal::Start => {
                    let Some(context) = self.shared.take_context() else {
                        return Err(CapturedFault::Protocol {
                            signal: Signal::Start,
                            state: WorkerState::Stopped,
                        });
                    };
                    match self.dispatch(context)? {
                        Exit::Quit => return Ok(()),
                        Exit::Stop => {
                            self.publish(WorkerState::Stopped);
                            self.shared.mailbox.clear();
                        }
                    }
                }
                signal => {
                    return Err(CapturedFault::Protocol {
                        signal,
                        state: WorkerState::Stopped,
                    });
                }
            }
        }
    }

    /// Parks the thread until the mailbox holds a signal.
    fn wait_for_signal(&self) -> Signal {
        loop {
            match self.shared.mailbox.peek() {
                Signal::None => thread::park(),
                signal => return signal,
            }
        }
    }

    /// Runs `context` until stopped, quit or faulted.
    ///
    /// `active` is `None` exactly while paused; the context then sits in the
    /// handoff slot where the control thread may inspect it.
    fn dispatch(&mut self, context: DispatchContext<S>) -> Result<Exit, CapturedFault> {
        let mut clock = VirtualClock::new(context.cycles_per_second(), self.timeslice, self.max_lag);
        clock.reset(self.clock.now_nanos());

        let mut active = Some(context);
        self.publish(WorkerState::Running);
        self.shared.mailbox.clear();

        loop {
            let slice_start = self.clock.now_nanos();

            if let Some(context) = active.as_mut() {
                match context.run_timeslice(&mut clock, slice_start) {
                    Ok(slice) => {
                        if slice.drift_reset {
                            debug!(
                                resets = clock.drift_resets(),
                                max_lag_ns = clock.max_lag_nanos(),
                                "virtual clock resynchronised"
                            );
                        }
                    }
                    Err(error) => {
                        if let Some(context) = active.take() {
                            self.shared.park(context);
                        }
                        return Err(CapturedFault::step(error));
                    }
                }
            }

            loop {
                match self.shared.mailbox.peek() {
                    Signal::None => {}
                    Signal::Quit => return Ok(Exit::Quit),
                    Signal::Stop => {
                        if let Some(context) = active.take() {
                            self.shared.park(context);
                        }
                        return Ok(Exit::Stop);
                    }
                    Signal::Suspend if active.is_some() => {
                        if let Some(context) = active.take() {
                            self.shared.park(context);
                        }
                        self.publish(WorkerState::Paused);
                        self.shared.mailbox.clear();
                    }
                    Signal::Resume if active.is_none() => {
                        let Some(context) = self.shared.take_context() else {
                            return Err(CapturedFault::Protocol {
                                signal: Signal::Resume,
                                state: WorkerState::Paused,
                            });
                        };
                        active = Some(context);
                        self.publish(WorkerState::Running);
                        self.shared.mailbox.clear();
                    }
                    signal => {
                        let state = if active.is_some() {
                            WorkerState::Running
                        } else {
                            WorkerState::Paused
                        };
                        return Err(CapturedFault::Protocol { signal, state });
                    }
                }

                if active.is_some() && clock.timeslice_elapsed(slice_start, self.clock.now_nanos()) {
                    break;
                }
                hint::spin_loop();
            }
        }
    }
}
