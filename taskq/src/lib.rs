//! Deferred work queues.
//!
//! A [`Taskqueue`] runs [`Task`]s on a pool of worker threads in strict
//! priority order, first come first served within a priority. Submitting a
//! task that is already queued coalesces the two requests into one execution,
//! which is told how many requests it stands for. [`TimedTask`]s add delayed
//! submission on top of a one-shot [`time::Timer`].
//!
//! Queues also provide cancellation and blocking drains: wait for one task to
//! go idle, for everything queued so far to start, for everything running to
//! finish, or for the whole queue to go quiet.

pub mod errors;
pub use errors::TaskError;

pub mod queue;
pub use queue::{Builder, Core, EnqueueFlags, Handle, LockKind, Taskqueue, ThreadOpts};

pub mod task;
pub use task::{Task, TaskFlags, TimedTask};

pub mod time;

mod utils;

#[cfg(test)]
mod test_utils;
