use crate::errors::TaskError;
use crate::queue::builder::QueueConfig;
use crate::queue::busy::ActiveList;
use crate::queue::hooks::{BatchGuard, BatchScope, CallbackKind, Callbacks, Notify};
use crate::queue::lock::{self, Channel, LockKind, QueueGuard, QueueMutex};
use crate::queue::pending::PendingList;
use crate::task::{Task, TimedTask};
use crate::time::Timer;
use bitflags::bitflags;
use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct EnqueueFlags: u8 {
        /// Reject with [`TaskError::AlreadyExists`] instead of coalescing.
        const FAIL_IF_PENDING = 1;

        /// Reject with [`TaskError::Canceled`] while a `cancel` of the running
        /// task is in flight.
        const FAIL_IF_CANCELING = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct QueueFlags: u8 {
        /// Cleared by `destroy`, workers exit once they observe it.
        const ACTIVE = 1;

        /// `notify` is suppressed until `unblock`.
        const BLOCKED = 1 << 1;

        /// `notify` runs after the queue lock is released.
        const UNLOCKED_NOTIFY = 1 << 2;
    }
}

// Address of the queue whose worker runs on this thread, zero elsewhere.
thread_local! {
    static CURRENT_QUEUE: Cell<usize> = const { Cell::new(0) };
}

/// Everything guarded by the queue lock.
#[derive(Debug)]
pub(crate) struct State {
    pub(crate) pending: PendingList,

    pub(crate) active: ActiveList,

    /// Stamped on every busy entry, bounds `drain_active`.
    pub(crate) seq: u64,

    /// Armed timers plus in-progress `drain_active` calls. `destroy` waits for
    /// it to reach zero.
    pub(crate) outstanding_timers: usize,

    /// Worker threads started and not yet exited.
    pub(crate) threads: usize,

    /// Workers asleep on the idle channel.
    pub(crate) idle_threads: usize,

    pub(crate) flags: QueueFlags,
}

/// The shared part of a queue: both lists, the lock guarding them and every
/// task operation.
///
/// Producers reach it through a [`Handle`] or the owning [`Taskqueue`], both
/// dereference to `Core`.
///
/// [`Handle`]: crate::queue::Handle
/// [`Taskqueue`]: crate::queue::Taskqueue
pub struct Core {
    name: String,

    pub(crate) state: QueueMutex<State>,

    /// Idle workers sleep here.
    idle: Channel,

    /// `destroy` sleeps here until workers and timers are gone.
    terminator: Channel,

    notify: Arc<dyn Notify>,

    timer: Arc<dyn Timer>,

    batch_guard: Option<Arc<dyn BatchGuard>>,

    callbacks: Callbacks,

    // Handed to timer callbacks, which must not keep the queue alive.
    this: Weak<Core>,
}

impl Core {
    pub(crate) fn new(cfg: &QueueConfig) -> Arc<Core> {
        let mut flags = QueueFlags::ACTIVE;
        if cfg.unlocked_notify {
            flags |= QueueFlags::UNLOCKED_NOTIFY;
        }

        let state = State {
            pending: PendingList::new(),
            active: ActiveList::new(),
            seq: 0,
            outstanding_timers: 0,
            threads: 0,
            idle_threads: 0,
            flags,
        };

        let core = Arc::new_cyclic(|this| Core {
            name: cfg.name.clone(),
            state: lock::new_mutex(cfg.lock_kind, state),
            idle: Channel::new(),
            terminator: Channel::new(),
            notify: cfg.notify.clone(),
            timer: cfg.timer.clone(),
            batch_guard: cfg.batch_guard.clone(),
            callbacks: cfg.callbacks.clone(),
            this: this.clone(),
        });

        debug!(queue = %core.name, lock = ?cfg.lock_kind, "queue created");
        core
    }

    fn addr(&self) -> usize {
        self as *const Core as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_kind(&self) -> LockKind {
        // Safety: only reads which variant the raw lock is.
        unsafe { self.state.raw().kind() }
    }

    /// Queues `task` at its priority, or coalesces with a pending request.
    pub fn enqueue(&self, task: &Task) -> Result<(), TaskError> {
        self.enqueue_flags(task, EnqueueFlags::empty())
    }

    pub fn enqueue_flags(&self, task: &Task, flags: EnqueueFlags) -> Result<(), TaskError> {
        let state = self.state.lock();
        self.enqueue_locked(state, task, flags)
    }

    // Takes the guard by value: with UNLOCKED_NOTIFY the lock is released
    // before `notify` runs.
    fn enqueue_locked(
        &self,
        mut state: QueueGuard<'_, State>,
        task: &Task,
        flags: EnqueueFlags,
    ) -> Result<(), TaskError> {
        if flags.contains(EnqueueFlags::FAIL_IF_CANCELING) && state.active.is_canceling(task) {
            return Err(TaskError::Canceled);
        }

        if task.is_pending() {
            if flags.contains(EnqueueFlags::FAIL_IF_PENDING) {
                return Err(TaskError::AlreadyExists);
            }
            let pending = task.inc_pending();
            trace!(queue = %self.name, task = %task.id(), pending, "coalesced");
            return Ok(());
        }

        state.pending.insert(task.clone());
        task.set_pending(1);
        trace!(queue = %self.name, task = %task.id(), priority = task.priority(), "enqueued");

        if !state.flags.contains(QueueFlags::BLOCKED) {
            self.notify_locked(state);
        }
        Ok(())
    }

    fn notify_locked(&self, state: QueueGuard<'_, State>) {
        if state.flags.contains(QueueFlags::UNLOCKED_NOTIFY) {
            drop(state);
            self.notify.notify(self);
        } else {
            self.notify.notify(self);
        }
    }

    /// Enqueues the wrapped task once `delay` has passed.
    ///
    /// Returns the pending count the task had before the call, telling the
    /// caller whether an earlier request is still queued. A zero `delay`
    /// enqueues right away. While a timer is armed further requests are
    /// no-ops, the first delay wins.
    ///
    /// # Panics
    ///
    /// When the queue uses the default [`TimerThread`] and its thread cannot
    /// be spawned on first use.
    ///
    /// [`TimerThread`]: crate::time::TimerThread
    pub fn enqueue_after(&self, timed: &TimedTask, delay: Duration) -> Result<u16, TaskError> {
        timed.bind(self.addr())?;

        let mut state = self.state.lock();
        let prev = timed.pending();

        if delay.is_zero() {
            self.enqueue_locked(state, timed.task(), EnqueueFlags::empty())?;
            return Ok(prev);
        }

        let mut ts = timed.state();
        if ts.draining {
            return Err(TaskError::Dropped);
        }
        if ts.armed {
            return Ok(prev);
        }

        ts.armed = true;
        ts.generation += 1;
        state.outstanding_timers += 1;

        let generation = ts.generation;
        let queue = self.this.clone();
        let fired = timed.clone();
        ts.handle = Some(self.timer.arm_once(
            delay,
            Box::new(move || {
                if let Some(queue) = queue.upgrade() {
                    queue.timer_fired(&fired, generation);
                }
            }),
        ));

        trace!(queue = %self.name, task = %timed.task().id(), ?delay, "timer armed");
        Ok(prev)
    }

    fn timer_fired(&self, timed: &TimedTask, generation: u64) {
        let mut state = self.state.lock();
        {
            let mut ts = timed.state();
            if !ts.armed || ts.generation != generation {
                // The arming was rolled back by a successful cancel.
                return;
            }
            ts.armed = false;
            ts.handle = None;
        }

        self.timer_done(&mut state);
        timed.channel().wake_all();
        trace!(queue = %self.name, task = %timed.task().id(), "timer fired");

        // Plain enqueue never fails.
        let _ = self.enqueue_locked(state, timed.task(), EnqueueFlags::empty());
    }

    fn timer_done(&self, state: &mut State) {
        state.outstanding_timers -= 1;
        if state.outstanding_timers == 0 && !state.flags.contains(QueueFlags::ACTIVE) {
            self.terminator.wake_all();
        }
    }

    // Stops an armed timer, returns whether the callback was dropped.
    fn disarm(&self, state: &mut State, timed: &TimedTask) -> bool {
        let mut ts = timed.state();
        if !ts.armed {
            return false;
        }
        let Some(handle) = ts.handle else {
            return false;
        };
        if !self.timer.cancel(handle) {
            return false;
        }

        ts.armed = false;
        ts.handle = None;
        drop(ts);
        self.timer_done(state);
        true
    }

    /// Removes `task` from the pending list.
    ///
    /// Returns the number of pending requests that were dropped. When the task
    /// is running the invocation is not interrupted: the execution is marked
    /// canceling and [`TaskError::Busy`] reports the dropped count instead.
    pub fn cancel(&self, task: &Task) -> Result<u16, TaskError> {
        let mut state = self.state.lock();
        self.cancel_locked(&mut state, task)
    }

    fn cancel_locked(&self, state: &mut State, task: &Task) -> Result<u16, TaskError> {
        // A task pending on another queue is not ours to clear.
        let pending = if task.is_pending() && state.pending.remove(task) {
            task.take_pending()
        } else {
            0
        };

        let running = state.active.mark_canceling(task);
        if pending > 0 && !running {
            task.channel().wake_all();
        }
        trace!(queue = %self.name, task = %task.id(), pending, running, "canceled");

        if running {
            Err(TaskError::Busy { pending })
        } else {
            Ok(pending)
        }
    }

    /// Stops the timer of `timed` if it has not fired yet, then cancels the
    /// wrapped task. A timer that already fired shows up in the returned
    /// pending count.
    pub fn cancel_timed(&self, timed: &TimedTask) -> Result<u16, TaskError> {
        timed.bind(self.addr())?;

        let mut state = self.state.lock();
        if self.disarm(&mut state, timed) {
            trace!(queue = %self.name, task = %timed.task().id(), "timer stopped");
        }
        self.cancel_locked(&mut state, timed.task())
    }

    /// Blocks until `task` is neither pending nor running.
    ///
    /// Calling this from the body of `task` itself never returns.
    pub fn drain(&self, task: &Task) {
        let mut state = self.state.lock();
        while task.is_pending() || state.active.is_running(task) {
            task.channel().sleep(&mut state);
        }
    }

    /// Blocks until every task pending at call time has started running.
    pub fn drain_queue(&self) {
        let mut state = self.state.lock();
        self.drain_queue_locked(&mut state);
    }

    // Returns whether there was anything to wait for.
    fn drain_queue_locked(&self, state: &mut QueueGuard<'_, State>) -> bool {
        if state.pending.is_empty() {
            return false;
        }

        // No notify: the list was not empty, whoever filled it already did.
        let barrier = Task::barrier();
        barrier.set_pending(1);
        state.pending.push_barrier(barrier.clone());

        while barrier.is_pending() {
            barrier.channel().sleep(state);
        }
        true
    }

    /// Blocks until every task running at call time has returned.
    pub fn drain_active(&self) {
        let mut state = self.state.lock();
        self.drain_active_locked(&mut state);
    }

    fn drain_active_locked(&self, state: &mut QueueGuard<'_, State>) -> bool {
        if state.active.is_empty() {
            return false;
        }

        // Counted like a timer so `destroy` waits for us.
        state.outstanding_timers += 1;
        let seq = state.seq;

        while let Some(task) = state.active.started_before(seq).cloned() {
            task.channel().sleep(state);
        }

        self.timer_done(state);
        true
    }

    /// Blocks until the queue is quiescent: nothing pending and nothing
    /// running, including work re-enqueued by tasks while draining.
    pub fn drain_all(&self) {
        let mut state = self.state.lock();
        loop {
            if self.drain_queue_locked(&mut state) {
                continue;
            }
            if !self.drain_active_locked(&mut state) {
                break;
            }
        }
    }

    /// Prevents further delayed enqueues of `timed`, stops or waits out its
    /// timer, then drains the wrapped task.
    ///
    /// # Panics
    ///
    /// When another `drain_timed` of the same task is in progress.
    pub fn drain_timed(&self, timed: &TimedTask) -> Result<(), TaskError> {
        timed.bind(self.addr())?;

        let mut state = self.state.lock();
        {
            let mut ts = timed.state();
            assert!(!ts.draining, "concurrent drain_timed on the same task");
            ts.draining = true;
        }

        self.disarm(&mut state, timed);

        // The callback is running or about to, it clears `armed` under our lock.
        while timed.state().armed {
            timed.channel().sleep(&mut state);
        }

        let task = timed.task();
        while task.is_pending() || state.active.is_running(task) {
            task.channel().sleep(&mut state);
        }

        timed.state().draining = false;
        Ok(())
    }

    /// Runs pending tasks on the calling thread until the pending list is
    /// empty. Drives queues built without worker threads.
    pub fn run(&self) {
        let mut state = self.state.lock();
        self.run_locked(&mut state);
    }

    pub(crate) fn run_locked(&self, state: &mut QueueGuard<'_, State>) {
        let mut scope = BatchScope::new(self.batch_guard.as_deref());

        while let Some(task) = state.pending.pop_front() {
            let pending = task.take_pending();
            state.seq += 1;
            let seq = state.seq;
            let key = state.active.insert(task.clone(), seq);

            trace!(queue = %self.name, task = %task.id(), pending, seq, "running");
            QueueGuard::unlocked(state, || {
                scope.prepare(task.is_guarded());
                task.run(pending);
            });

            state.active.remove(key);
            task.channel().wake_all();
        }

        if scope.is_entered() {
            QueueGuard::unlocked(state, || scope.leave());
        }
    }

    /// Suppresses `notify` until [`Core::unblock`]. Tasks keep queuing.
    pub fn block(&self) {
        self.state.lock().flags.insert(QueueFlags::BLOCKED);
    }

    /// Restores `notify`, invoking it right away if work is pending.
    pub fn unblock(&self) {
        let mut state = self.state.lock();
        state.flags.remove(QueueFlags::BLOCKED);

        if !state.pending.is_empty() {
            self.notify_locked(state);
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().flags.contains(QueueFlags::BLOCKED)
    }

    /// Whether `task` is pending or running on this queue.
    pub fn is_busy(&self, task: &Task) -> bool {
        let state = self.state.lock();
        task.is_pending() || state.active.is_running(task)
    }

    pub fn is_running(&self, task: &Task) -> bool {
        self.state.lock().active.is_running(task)
    }

    /// Whether a `cancel` arrived while `task` was running and that execution
    /// has not returned yet.
    pub fn is_canceling(&self, task: &Task) -> bool {
        self.state.lock().active.is_canceling(task)
    }

    /// True when called from one of this queue's worker threads.
    pub fn is_member(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == self.addr())
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn num_threads(&self) -> usize {
        self.state.lock().threads
    }

    pub fn outstanding_timers(&self) -> usize {
        self.state.lock().outstanding_timers
    }

    /// Wakes one idle worker thread. This is what the default notifier does,
    /// custom notifiers of queues with worker threads call it too.
    pub fn wake_worker(&self) {
        self.idle.wake_one();
    }
}

// --- Worker threads and teardown ---
impl Core {
    pub(crate) fn thread_starting(&self) {
        self.state.lock().threads += 1;
    }

    /// Body of every worker thread.
    pub(crate) fn worker_main(&self) {
        CURRENT_QUEUE.with(|current| current.set(self.addr()));
        self.run_callback(CallbackKind::Init);

        {
            let mut state = self.state.lock();
            while state.flags.contains(QueueFlags::ACTIVE) {
                self.run_locked(&mut state);

                // The lock was released while tasks ran.
                if !state.flags.contains(QueueFlags::ACTIVE) {
                    break;
                }
                state.idle_threads += 1;
                self.idle.sleep(&mut state);
                state.idle_threads -= 1;
            }

            // Flush whatever was queued before shutdown was observed.
            self.run_locked(&mut state);
        }

        self.run_callback(CallbackKind::Shutdown);
        CURRENT_QUEUE.with(|current| current.set(0));
        self.thread_exited();
    }

    pub(crate) fn thread_exited(&self) {
        let mut state = self.state.lock();
        state.threads -= 1;
        self.terminator.wake_all();
    }

    fn run_callback(&self, kind: CallbackKind) {
        if let Some(cb) = self.callbacks.get(kind) {
            cb(self);
        }
    }

    /// Stops the workers and waits for them and for every outstanding timer.
    ///
    /// # Panics
    ///
    /// When a task is still running afterwards, meaning the owner skipped
    /// `drain_all`, or when called from one of the queue's own workers.
    pub(crate) fn terminate(&self) {
        assert!(
            !self.is_member(),
            "queue {} destroyed from its own worker thread",
            self.name
        );

        let mut state = self.state.lock();
        state.flags.remove(QueueFlags::ACTIVE);

        while state.threads > 0 || state.outstanding_timers > 0 {
            self.idle.wake_all();
            self.terminator.sleep(&mut state);
        }

        assert!(
            state.active.is_empty(),
            "queue {} destroyed with {} task(s) still running",
            self.name,
            state.active.len()
        );

        let dropped = state.pending.clear();
        for task in &dropped {
            task.set_pending(0);
            task.channel().wake_all();
        }

        debug!(queue = %self.name, dropped = dropped.len(), "queue destroyed");
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("name", &self.name)
            .field("lock", &self.lock_kind())
            .field("timer", &self.timer)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl Core {
    pub(crate) fn seq(&self) -> u64 {
        self.state.lock().seq
    }

    pub(crate) fn idle_threads(&self) -> usize {
        self.state.lock().idle_threads
    }

    pub(crate) fn pending_snapshot(&self) -> Vec<Task> {
        self.state.lock().pending.iter().cloned().collect()
    }
}
