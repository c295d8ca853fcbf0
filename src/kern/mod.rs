//! Kern subsystem - scheduling primitives the device core blocks through
//!
//! The device core never spins waiting for another holder. It parks the
//! calling thread through a [`Scheduler`] and relies on wakeups issued when
//! busy bits clear.

pub mod sched_prim;
#[cfg(any(test, feature = "std"))]
pub mod thread_sched;

pub use sched_prim::{Scheduler, WaitSet, Waiter};
#[cfg(any(test, feature = "std"))]
pub use thread_sched::ThreadScheduler;
