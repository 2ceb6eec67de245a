//! Single-slot signal mailbox.
//!
//! The control thread posts at most one outstanding [`Signal`]; the worker
//! reads it once per loop iteration, performs the transition and resets the
//! slot to [`Signal::None`] as its final step. Posting never allocates and
//! never takes a lock.
//!
//! # Example
//!
//! ```
//! use pacer::sync::mailbox::{Mailbox, Signal};
//!
//! let mailbox = Mailbox::new();
//! mailbox.try_post(Signal::Start).unwrap();
//! assert_eq!(mailbox.try_post(Signal::Stop), Err(Signal::Start));
//!
//! // Worker side
//! assert_eq!(mailbox.peek(), Signal::Start);
//! mailbox.clear();
//! assert!(mailbox.is_empty());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Command posted from the control thread to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Signal {
    /// Empty slot.
    None = 0,
    /// Begin dispatching a freshly handed-over context.
    Start = 1,
    /// End the current run and hand the context back.
    Stop = 2,
    /// Stop stepping but keep the context (running → paused).
    Suspend = 3,
    /// Continue stepping (paused → running).
    Resume = 4,
    /// Terminate the worker thread. Never resumable.
    Quit = 5,
}

impl Signal {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Start,
            2 => Self::Stop,
            3 => Self::Suspend,
            4 => Self::Resume,
            5 => Self::Quit,
            _ => Self::None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// Single-slot, single-writer signal channel.
///
/// Padded to its own cache line so polling it from the worker's busy-wait
/// does not contend with the state register.
#[repr(align(64))]
pub struct Mailbox {
    slot: AtomicU8,
}

impl Mailbox {
    /// Creates an empty mailbox.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: AtomicU8::new(Signal::None as u8),
        }
    }

    /// Returns the pending signal without consuming it.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> Signal {
        Signal::from_raw(self.slot.load(Ordering::Acquire))
    }

    /// Returns `true` if no signal is pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peek() == Signal::None
    }

    /// Posts `signal` if the slot is empty (wait-free).
    ///
    /// Only the control thread may call this. The load-then-store is not a
    /// CAS: correctness relies on there being a single poster, while the
    /// worker only ever resets a slot it has already observed as occupied.
    ///
    /// # Errors
    ///
    /// Returns `Err(pending)` with the still-outstanding signal if the slot
    /// is occupied.
    #[inline]
    pub fn try_post(&self, signal: Signal) -> Result<(), Signal> {
        match self.peek() {
            Signal::None => {
                self.slot.store(signal as u8, Ordering::Release);
                Ok(())
            }
            pending => Err(pending),
        }
    }

    /// Spins until the slot is empty, then posts `signal`.
    ///
    /// `poll` runs on every iteration in which the slot is still occupied;
    /// returning an error aborts the wait (used to surface a worker fault or
    /// a timeout instead of spinning forever).
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `poll`.
    pub fn post_with<E>(
        &self,
        signal: Signal,
        mut poll: impl FnMut() -> Result<(), E>,
    ) -> Result<(), E> {
        loop {
            if self.try_post(signal).is_ok() {
                return Ok(());
            }
            poll()?;
            std::hint::spin_loop();
        }
    }

    /// Overwrites the slot regardless of its contents.
    ///
    /// Reserved for posting [`Signal::Quit`] to a worker that no longer
    /// answers handshakes.
    #[inline]
    pub fn force(&self, signal: Signal) {
        self.slot.store(signal as u8, Ordering::Release);
    }

    /// Resets the slot to [`Signal::None`]. Worker side.
    #[inline]
    pub fn clear(&self) {
        self.slot.store(Signal::None as u8, Ordering::Release);
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("pending", &self.peek()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_mailbox_is_empty() {
        let mailbox = Mailbox::new();

        assert!(mailbox.is_empty());
        assert_eq!(mailbox.peek(), Signal::None);
    }

    #[test]
    fn occupied_slot_rejects_second_post() {
        let mailbox = Mailbox::new();

        assert!(mailbox.try_post(Signal::Suspend).is_ok());
        assert_eq!(mailbox.try_post(Signal::Resume), Err(Signal::Suspend));
        assert_eq!(mailbox.peek(), Signal::Suspend, "first signal must survive");
    }

    #[test]
    fn clear_makes_room_for_next_signal() {
        let mailbox = Mailbox::new();

        mailbox.try_post(Signal::Start).unwrap();
        mailbox.clear();
        assert!(mailbox.try_post(Signal::Stop).is_ok());
        assert_eq!(mailbox.peek(), Signal::Stop);
    }

    #[test]
    fn post_with_waits_for_consumer() {
        let mailbox = Arc::new(Mailbox::new());
        mailbox.try_post(Signal::Start).unwrap();

        let worker = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || {
                while mailbox.peek() != Signal::Start {
                    std::hint::spin_loop();
                }
                mailbox.clear();
            })
        };

        mailbox
            .post_with(Signal::Stop, || Ok::<(), ()>(()))
            .unwrap();
        worker.join().unwrap();

        assert_eq!(mailbox.peek(), Signal::Stop);
    }

    #[test]
    fn post_with_propagates_poll_error() {
        let mailbox = Mailbox::new();
        mailbox.try_post(Signal::Start).unwrap();

        let mut remaining = 3;
        let result = mailbox.post_with(Signal::Stop, || {
            remaining -= 1;
            if remaining == 0 { Err("gave up") } else { Ok(()) }
        });

        assert_eq!(result, Err("gave up"));
        assert_eq!(mailbox.peek(), Signal::Start, "aborted post must not overwrite");
    }

    #[test]
    fn force_overwrites_pending_signal() {
        let mailbox = Mailbox::new();
        mailbox.try_post(Signal::Suspend).unwrap();

        mailbox.force(Signal::Quit);

        assert_eq!(mailbox.peek(), Signal::Quit);
    }
}
