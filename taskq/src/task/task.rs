use crate::queue::lock::Channel;
use crate::task::Id;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

/// Maximum number of coalesced enqueue requests a task can carry. Further
/// requests saturate at this value instead of wrapping.
pub const MAX_PENDING: u16 = u16::MAX;

/// Highest task priority. Reserved in practice for the barrier inserted by
/// `drain_queue`, regular tasks may still use it.
pub const MAX_PRIORITY: u8 = u8::MAX;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TaskFlags: u8 {
        /// The task body must run inside the queue's [`BatchGuard`]. The
        /// execution loop keeps the guard entered across consecutive guarded
        /// tasks.
        ///
        /// [`BatchGuard`]: crate::queue::BatchGuard
        const GUARDED = 1;
    }
}

type TaskFn = dyn Fn(u16) + Send + Sync + 'static;

struct Inner {
    id: Id,

    priority: u8,

    flags: TaskFlags,

    func: Box<TaskFn>,

    /// Number of enqueue requests coalesced since the task was last dequeued.
    /// Zero means the task is not on any pending list.
    //
    // Only ever written with the owning queue's lock held. The atomic lets us
    // hand out racy snapshots through `Task::pending` without that lock.
    pending: AtomicU16,

    /// Woken every time an execution of the task finishes.
    chan: Channel,
}

/// A unit of deferred work: a function, the priority it runs at, and the
/// pending counter the queue uses to coalesce repeated submissions.
///
/// `Task` is a cheap handle, cloning it yields another reference to the same
/// task. The caller owns the task, queues only borrow it while it is pending or
/// running. The function receives the number of enqueue requests that were
/// coalesced into this execution.
///
/// A task must only be submitted to one queue at a time.
#[derive(Clone)]
pub struct Task(Arc<Inner>);

impl Task {
    /// Creates an idle task running `f` at `priority`. Higher priorities run
    /// first.
    pub fn new<F>(priority: u8, f: F) -> Self
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        Self::with_flags(priority, TaskFlags::empty(), f)
    }

    pub fn with_flags<F>(priority: u8, flags: TaskFlags, f: F) -> Self
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        Self(Arc::new(Inner {
            id: Id::next(),
            priority,
            flags,
            func: Box::new(f),
            pending: AtomicU16::new(0),
            chan: Channel::new(),
        }))
    }

    /// Creates a task from a plain function and the context it operates on.
    /// The context stays owned by the caller through the `Arc`.
    pub fn with_context<C>(priority: u8, context: Arc<C>, f: fn(&C, u16)) -> Self
    where
        C: Send + Sync + 'static,
    {
        Self::new(priority, move |pending| f(&context, pending))
    }

    pub(crate) fn barrier() -> Self {
        Self::new(MAX_PRIORITY, |_| {})
    }

    pub fn id(&self) -> Id {
        self.0.id
    }

    pub fn priority(&self) -> u8 {
        self.0.priority
    }

    pub fn flags(&self) -> TaskFlags {
        self.0.flags
    }

    pub fn is_guarded(&self) -> bool {
        self.0.flags.contains(TaskFlags::GUARDED)
    }

    /// Snapshot of the pending counter. Only stable when observed under the
    /// queue lock, otherwise informational.
    pub fn pending(&self) -> u16 {
        self.0.pending.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // The following accessors must be called with the owning queue's lock held.

    pub(crate) fn is_pending(&self) -> bool {
        self.pending() > 0
    }

    pub(crate) fn set_pending(&self, val: u16) {
        self.0.pending.store(val, Ordering::Release);
    }

    /// Saturating increment, returns the new value.
    pub(crate) fn inc_pending(&self) -> u16 {
        let val = self.pending().saturating_add(1);
        self.set_pending(val);
        val
    }

    /// Resets the counter to zero and returns what it was.
    pub(crate) fn take_pending(&self) -> u16 {
        self.0.pending.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn run(&self, pending: u16) {
        (self.0.func)(pending)
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.0.chan
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.0.id)
            .field("priority", &self.0.priority)
            .field("flags", &self.0.flags)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(Task: Send, Sync, Clone);

    #[test]
    fn test_new_task_is_idle() {
        let task = Task::new(3, |_| {});
        assert_eq!(task.pending(), 0);
        assert_eq!(task.priority(), 3);
        assert!(!task.is_guarded());
    }

    #[test]
    fn test_pending_saturates() {
        let task = Task::new(0, |_| {});
        task.set_pending(MAX_PENDING - 1);

        assert_eq!(task.inc_pending(), MAX_PENDING);
        assert_eq!(task.inc_pending(), MAX_PENDING);
        assert_eq!(task.take_pending(), MAX_PENDING);
        assert_eq!(task.pending(), 0);
    }

    #[test]
    fn test_with_context_passes_context_and_pending() {
        let ctx = Arc::new(AtomicUsize::new(0));
        let task = Task::with_context(1, ctx.clone(), |ctx, pending| {
            ctx.fetch_add(pending as usize, Ordering::Relaxed);
        });

        task.run(4);
        task.run(2);
        assert_eq!(ctx.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn test_clones_share_identity() {
        let a = Task::with_flags(7, TaskFlags::GUARDED, |_| {});
        let b = a.clone();
        let c = Task::new(7, |_| {});

        assert!(a.ptr_eq(&b));
        assert!(std::ptr::eq(a.channel(), b.channel()));
        assert!(!a.ptr_eq(&c));
        assert!(b.is_guarded());
    }
}
