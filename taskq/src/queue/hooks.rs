use crate::queue::Core;
use std::fmt;
use std::sync::Arc;

/// Informs the surrounding system that a queue has work available.
///
/// Invoked every time a task is inserted on the pending list, and on
/// [`Core::unblock`] when work is pending. Unless the queue was built with
/// [`Builder::unlocked_notify`], it runs with the queue lock held and must
/// not call back into the same queue.
///
/// Any `Fn(&Core)` closure is a valid notifier.
///
/// [`Builder::unlocked_notify`]: crate::queue::Builder::unlocked_notify
pub trait Notify: Send + Sync + 'static {
    fn notify(&self, queue: &Core);
}

impl<F> Notify for F
where
    F: Fn(&Core) + Send + Sync + 'static,
{
    fn notify(&self, queue: &Core) {
        self(queue)
    }
}

/// Default notifier: wakes one idle worker thread of the queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadNotify;

impl Notify for ThreadNotify {
    fn notify(&self, queue: &Core) {
        queue.wake_worker();
    }
}

/// A read-side guard entered around tasks flagged [`TaskFlags::GUARDED`].
///
/// The execution loop enters the guard before the first guarded task of a
/// run, keeps it across consecutive guarded tasks, and exits it before the
/// first unguarded task or once the pending list is empty. Both methods are
/// called without the queue lock, on the worker thread.
///
/// [`TaskFlags::GUARDED`]: crate::task::TaskFlags::GUARDED
pub trait BatchGuard: Send + Sync + 'static {
    fn enter(&self);

    fn exit(&self);
}

/// Points in a worker thread's life where a callback can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    /// Runs on the worker thread before it takes any task.
    Init,

    /// Runs on the worker thread after its last task, before it exits.
    Shutdown,
}

impl CallbackKind {
    fn index(self) -> usize {
        match self {
            CallbackKind::Init => 0,
            CallbackKind::Shutdown => 1,
        }
    }
}

pub type Callback = Arc<dyn Fn(&Core) + Send + Sync + 'static>;

/// At most one callback per [`CallbackKind`].
#[derive(Clone, Default)]
pub(crate) struct Callbacks([Option<Callback>; 2]);

impl Callbacks {
    /// Registers `cb`, refusing to replace an existing callback of that kind.
    pub(crate) fn set(&mut self, kind: CallbackKind, cb: Callback) -> Result<(), CallbackKind> {
        let slot = &mut self.0[kind.index()];
        if slot.is_some() {
            return Err(kind);
        }
        *slot = Some(cb);
        Ok(())
    }

    pub(crate) fn get(&self, kind: CallbackKind) -> Option<&Callback> {
        self.0[kind.index()].as_ref()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("init", &self.get(CallbackKind::Init).is_some())
            .field("shutdown", &self.get(CallbackKind::Shutdown).is_some())
            .finish()
    }
}

/// Tracks whether the [`BatchGuard`] is entered during one run of the
/// execution loop.
pub(crate) struct BatchScope<'a> {
    guard: Option<&'a dyn BatchGuard>,
    entered: bool,
}

impl<'a> BatchScope<'a> {
    pub(crate) fn new(guard: Option<&'a dyn BatchGuard>) -> Self {
        Self {
            guard,
            entered: false,
        }
    }

    /// Enters or exits the guard so that it matches what the next task needs.
    pub(crate) fn prepare(&mut self, guarded: bool) {
        let Some(guard) = self.guard else {
            return;
        };

        match (guarded, self.entered) {
            (true, false) => guard.enter(),
            (false, true) => guard.exit(),
            _ => return,
        }
        self.entered = guarded;
    }

    pub(crate) fn is_entered(&self) -> bool {
        self.entered
    }

    pub(crate) fn leave(&mut self) {
        self.prepare(false);
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        // Only reachable with the guard entered when a task body unwinds.
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<&'static str>>);

    impl BatchGuard for Log {
        fn enter(&self) {
            self.0.lock().push("enter");
        }

        fn exit(&self) {
            self.0.lock().push("exit");
        }
    }

    #[test]
    fn test_batch_scope_batches_consecutive_guarded_tasks() {
        let log = Log::default();
        {
            let mut scope = BatchScope::new(Some(&log));
            for guarded in [true, true, false, false, true, true] {
                scope.prepare(guarded);
            }
            assert!(scope.is_entered());
        }

        assert_eq!(*log.0.lock(), vec!["enter", "exit", "enter", "exit"]);
    }

    #[test]
    fn test_batch_scope_without_guard() {
        let mut scope = BatchScope::new(None);
        scope.prepare(true);
        assert!(!scope.is_entered());
    }

    #[test]
    fn test_callbacks_set_once() {
        let mut callbacks = Callbacks::default();
        assert!(callbacks.get(CallbackKind::Init).is_none());

        assert!(callbacks.set(CallbackKind::Init, Arc::new(|_: &Core| {})).is_ok());
        assert_eq!(
            callbacks.set(CallbackKind::Init, Arc::new(|_: &Core| {})).err(),
            Some(CallbackKind::Init)
        );
        assert!(callbacks.set(CallbackKind::Shutdown, Arc::new(|_: &Core| {})).is_ok());
        assert!(callbacks.get(CallbackKind::Shutdown).is_some());
    }
}
