//! Real-time pacing and thread handoff for an emulation step loop.
//!
//! A [`Worker`] owns one dedicated OS thread that runs a [`Steppable`] in
//! fixed timeslices, synchronised to wall-clock time by a drift-corrected
//! virtual clock. The owning (control) thread drives it with
//! `start`/`stop`/`suspend`/`resume` and gets faults raised on the worker
//! relayed back as errors.
//!
//! ```no_run
//! use pacer::{DispatchContext, DispatchResult, Steppable, Worker, WorkerConfig};
//!
//! struct Nop;
//!
//! impl Steppable for Nop {
//!     type Error = std::convert::Infallible;
//!
//!     fn step(&mut self, result: &mut DispatchResult, max_cycles: u64) -> Result<(), Self::Error> {
//!         result.set_ok(max_cycles);
//!         Ok(())
//!     }
//! }
//!
//! let mut worker = Worker::spawn(WorkerConfig::default())?;
//! worker.start(DispatchContext::new(1_193_182, Nop)?)?;
//! // ... poll input, render ...
//! let context = worker.stop()?.expect("worker was running");
//! println!("emulated {} cycles", context.cycles_emulated());
//! worker.shutdown()?;
//! # Ok::<(), pacer::WorkerError>(())
//! ```

pub mod relay;
pub mod runtime;
pub mod sync;
mod trace;

pub use relay::CapturedFault;
pub use runtime::dispatch::{DispatchContext, DispatchResult, DispatchStatus, Steppable, TrapKind};
pub use runtime::topology::{CpuConfig, RealtimePolicy};
pub use runtime::worker::{Operation, Worker, WorkerConfig, WorkerError};
pub use runtime::timing::{ManualClock, MonotonicClock, Now, VirtualClock};
pub use sync::mailbox::Signal;
pub use sync::state::WorkerState;
pub use trace::init_tracing;
