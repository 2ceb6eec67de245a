//! Fault transport from the worker thread to the control thread.
//!
//! The worker captures any failure escaping the dispatch loop as a
//! [`CapturedFault`], stores it in the [`FaultRelay`] and only then publishes
//! `WorkerState::Exception`. The control thread takes the fault out by move
//! when it observes that state, so each fault is relayed exactly once.

use std::any::Any;
use std::error::Error as StdError;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::sync::mailbox::Signal;
use crate::sync::state::WorkerState;

/// Boxed error returned by a steppable.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A failure captured on the worker thread.
#[derive(Debug, Error)]
pub enum CapturedFault {
    /// The steppable returned an error.
    #[error("step failed: {0}")]
    Step(#[source] BoxError),
    /// The steppable panicked; the payload message is preserved.
    #[error("step panicked: {0}")]
    Panic(String),
    /// The worker was handed a signal it cannot service in its state.
    #[error("unexpected {signal} signal while {state}")]
    Protocol {
        /// Signal found in the mailbox.
        signal: Signal,
        /// Worker state at the time.
        state: WorkerState,
    },
}

impl CapturedFault {
    /// Wraps an error returned by a steppable.
    pub fn step<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Step(Box::new(error))
    }

    /// Converts a panic payload from `catch_unwind` into a fault.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_owned(),
                Err(_) => "non-string panic payload".to_owned(),
            },
        };
        Self::Panic(message)
    }

    /// Returns the steppable's error, if this fault carries one.
    #[must_use]
    pub fn step_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Step(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

/// Single-shot slot carrying a [`CapturedFault`] across threads.
///
/// Cold path only: it is touched once when the worker dies and once when
/// the control thread relays the fault.
#[derive(Debug, Default)]
pub struct FaultRelay {
    slot: Mutex<Option<CapturedFault>>,
}

impl FaultRelay {
    /// Creates an empty relay.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Stores a fault. Worker thread, before publishing `Exception`.
    pub fn capture(&self, fault: CapturedFault) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
    }

    /// Moves the fault out, leaving the relay empty.
    #[must_use]
    pub fn take(&self) -> Option<CapturedFault> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Returns `true` if a fault is waiting to be relayed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic;

    #[derive(Debug, Error)]
    #[error("bus conflict at {0:#06x}")]
    struct BusConflict(u16);

    #[test]
    fn fault_is_taken_exactly_once() {
        let relay = FaultRelay::new();
        relay.capture(CapturedFault::Panic("boom".into()));

        assert!(relay.is_pending());
        assert!(matches!(relay.take(), Some(CapturedFault::Panic(msg)) if msg == "boom"));
        assert!(relay.take().is_none());
        assert!(!relay.is_pending());
    }

    #[test]
    fn step_error_is_downcastable() {
        let fault = CapturedFault::step(BusConflict(0x1fff));

        let source = fault.step_error().expect("step fault carries its error");
        let conflict = source.downcast_ref::<BusConflict>().expect("original type");
        assert_eq!(conflict.0, 0x1fff);
        assert_eq!(fault.to_string(), "step failed: bus conflict at 0x1fff");
    }

    #[test]
    fn panic_payloads_keep_their_message() {
        let literal = panic::catch_unwind(|| panic!("illegal opcode")).unwrap_err();
        let formatted = panic::catch_unwind(|| panic!("illegal opcode {:#04x}", 0x02)).unwrap_err();
        let opaque = panic::catch_unwind(|| panic::panic_any(17_u32)).unwrap_err();

        assert!(matches!(CapturedFault::from_panic(literal), CapturedFault::Panic(m) if m == "illegal opcode"));
        assert!(matches!(CapturedFault::from_panic(formatted), CapturedFault::Panic(m) if m == "illegal opcode 0x02"));
        assert!(matches!(CapturedFault::from_panic(opaque), CapturedFault::Panic(m) if m == "non-string panic payload"));
    }

    #[test]
    fn protocol_fault_names_signal_and_state() {
        let fault = CapturedFault::Protocol {
            signal: Signal::Resume,
            state: WorkerState::Stopped,
        };

        assert_eq!(fault.to_string(), "unexpected resume signal while stopped");
    }
}
