use crate::queue::BatchGuard;
use crate::task::{Task, TaskFlags, TimedTask};
use parking_lot::Mutex;
use std::sync::Arc;

/// Ordered log of task executions, shared by every task it creates.
///
/// Also usable as a [`BatchGuard`], in which case guard transitions show up
/// in the same log as "enter" and "exit".
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    calls: Arc<Mutex<Vec<(&'static str, u16)>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, name: &'static str, pending: u16) {
        self.calls.lock().push((name, pending));
    }

    pub(crate) fn task(&self, name: &'static str, priority: u8) -> Task {
        self.task_with_flags(name, priority, TaskFlags::empty())
    }

    pub(crate) fn task_with_flags(&self, name: &'static str, priority: u8, flags: TaskFlags) -> Task {
        let recorder = self.clone();
        Task::with_flags(priority, flags, move |pending| recorder.record(name, pending))
    }

    pub(crate) fn timed_task(&self, name: &'static str, priority: u8) -> TimedTask {
        let recorder = self.clone();
        TimedTask::new(priority, move |pending| recorder.record(name, pending))
    }

    pub(crate) fn calls(&self) -> Vec<(&'static str, u16)> {
        self.calls.lock().clone()
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|(name, _)| *name).collect()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|(n, _)| *n == name).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

impl BatchGuard for Recorder {
    fn enter(&self) {
        self.record("enter", 0);
    }

    fn exit(&self) {
        self.record("exit", 0);
    }
}
