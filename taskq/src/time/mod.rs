//! One-shot timers used to implement delayed enqueue.
//!
//! A queue only needs to arm a callback and to cancel it. The default provider
//! is [`TimerThread`], hosts with their own timer facility can plug it in
//! through [`Builder::timer`].
//!
//! [`Builder::timer`]: crate::queue::Builder::timer

use std::fmt;
use std::time::Duration;

mod thread;
pub use thread::TimerThread;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies an armed timer within its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A one-shot timer facility.
///
/// Queues call both methods with their own lock held, so implementations must
/// never invoke a callback synchronously from `arm_once` or `cancel`.
pub trait Timer: Send + Sync + fmt::Debug {
    /// Schedules `callback` to run once, no earlier than `delay` from now.
    fn arm_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Stops an armed timer. Returns true if the callback was dropped without
    /// running. Returns false if it already ran or is running right now.
    fn cancel(&self, handle: TimerHandle) -> bool;
}
