use crate::errors::TaskError;
use crate::queue::lock::Channel;
use crate::task::{Task, TaskFlags};
use crate::time::TimerHandle;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Timer bookkeeping of a [`TimedTask`].
#[derive(Debug, Default)]
pub(crate) struct TimedState {
    /// A timer is scheduled and will enqueue the task when it fires.
    pub(crate) armed: bool,

    /// `drain_timed` is running, new delayed enqueues are dropped.
    pub(crate) draining: bool,

    /// Bumped every time the timer is armed so a callback can tell whether it
    /// still owns the arming it was created for.
    pub(crate) generation: u64,

    pub(crate) handle: Option<TimerHandle>,
}

struct Inner {
    task: Task,

    /// Address of the queue this task was first enqueued on.
    queue: OnceLock<usize>,

    // Only locked while holding the owning queue's lock, so it is never
    // contended. It exists because the owning queue is only known lazily.
    state: Mutex<TimedState>,

    /// Woken when an armed timer fired and the task was enqueued.
    chan: Channel,
}

/// A [`Task`] paired with a one-shot timer, enabling delayed submission
/// through [`Core::enqueue_after`].
///
/// The first delayed or immediate submission binds the timed task to its
/// queue. Using it with any other queue afterwards fails with
/// [`TaskError::QueueMismatch`]. Call [`Core::drain_timed`] before dropping the
/// last handle if a timer may still be armed.
///
/// [`Core::enqueue_after`]: crate::queue::Core::enqueue_after
/// [`Core::drain_timed`]: crate::queue::Core::drain_timed
#[derive(Clone)]
pub struct TimedTask(Arc<Inner>);

impl TimedTask {
    pub fn new<F>(priority: u8, f: F) -> Self
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        Self::from_task(Task::new(priority, f))
    }

    pub fn with_flags<F>(priority: u8, flags: TaskFlags, f: F) -> Self
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        Self::from_task(Task::with_flags(priority, flags, f))
    }

    pub fn with_context<C>(priority: u8, context: Arc<C>, f: fn(&C, u16)) -> Self
    where
        C: Send + Sync + 'static,
    {
        Self::from_task(Task::with_context(priority, context, f))
    }

    fn from_task(task: Task) -> Self {
        Self(Arc::new(Inner {
            task,
            queue: OnceLock::new(),
            state: Mutex::new(TimedState::default()),
            chan: Channel::new(),
        }))
    }

    /// The wrapped task. It may be passed to the plain task operations of the
    /// queue the timed task is bound to.
    pub fn task(&self) -> &Task {
        &self.0.task
    }

    pub fn pending(&self) -> u16 {
        self.0.task.pending()
    }

    /// Whether a timer is currently scheduled. Informational when read
    /// outside of the queue lock.
    pub fn is_armed(&self) -> bool {
        self.0.state.lock().armed
    }

    /// Binds to `queue` on first use, then checks every later use against it.
    pub(crate) fn bind(&self, queue: usize) -> Result<(), TaskError> {
        if *self.0.queue.get_or_init(|| queue) == queue {
            Ok(())
        } else {
            Err(TaskError::QueueMismatch)
        }
    }

    /// Must be called with the bound queue's lock held.
    pub(crate) fn state(&self) -> MutexGuard<'_, TimedState> {
        self.0.state.lock()
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.0.chan
    }
}

impl fmt::Debug for TimedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedTask")
            .field("task", &self.0.task)
            .field("state", &*self.0.state.lock())
            .finish()
    }
}
