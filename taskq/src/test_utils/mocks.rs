use crate::time::{Timer, TimerCallback, TimerHandle};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Default)]
struct Armed {
    next_id: u64,
    callbacks: BTreeMap<u64, (Duration, TimerCallback)>,
}

/// A timer that only fires when the test says so.
#[derive(Default)]
pub(crate) struct ManualTimer {
    armed: Mutex<Armed>,
}

impl ManualTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn armed(&self) -> usize {
        self.armed.lock().callbacks.len()
    }

    pub(crate) fn delays(&self) -> Vec<Duration> {
        self.armed.lock().callbacks.values().map(|(d, _)| *d).collect()
    }

    /// Removes the oldest armed callback without running it. The timer then
    /// behaves as if it fired, `cancel` reports false.
    pub(crate) fn take_next(&self) -> Option<TimerCallback> {
        self.armed.lock().callbacks.pop_first().map(|(_, (_, cb))| cb)
    }

    /// Runs every armed callback, returns how many ran.
    pub(crate) fn fire_all(&self) -> usize {
        let fired = std::mem::take(&mut self.armed.lock().callbacks);
        let count = fired.len();

        // Callbacks take the queue lock, never run them under ours.
        for (_, (_, cb)) in fired {
            cb();
        }
        count
    }
}

impl Timer for ManualTimer {
    fn arm_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let mut armed = self.armed.lock();
        armed.next_id += 1;

        let id = armed.next_id;
        armed.callbacks.insert(id, (delay, callback));
        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.armed.lock().callbacks.remove(&handle.as_u64()).is_some()
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimer")
            .field("armed", &self.armed())
            .finish()
    }
}
