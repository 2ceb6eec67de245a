//! Lock-free handshake primitives shared by the control and worker threads.
//!
//! Each variable has exactly one writer per transition:
//! - [`mailbox`] is written by the control thread (post) and reset by the
//!   worker (clear) once the signal has been serviced.
//! - [`state`] is written only by the worker thread.

pub mod mailbox;
pub mod state;
