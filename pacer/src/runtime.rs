//! Worker runtime.
//!
//! - `timing`: monotonic time sources and the drift-corrected virtual clock.
//! - `dispatch`: the steppable seam and per-timeslice stepping.
//! - `topology`: CPU placement and real-time scheduling for the worker.
//! - `worker`: thread lifecycle and the control API.

pub mod dispatch;
pub mod timing;
pub mod topology;
pub mod worker;
