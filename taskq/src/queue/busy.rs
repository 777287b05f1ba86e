use crate::task::Task;
use slab::Slab;

/// Marks one in-flight execution of a task.
#[derive(Debug)]
pub(crate) struct BusyEntry {
    pub(crate) task: Task,

    /// Queue sequence number when the task was dequeued. Bounds `drain_active`.
    pub(crate) seq: u64,

    /// A `cancel` arrived while the task was running.
    pub(crate) canceling: bool,
}

/// Busy entries of a queue, one per running callback. A task can show up more
/// than once when a re-enqueued task is picked up by a second worker before the
/// first execution returned.
#[derive(Debug, Default)]
pub(crate) struct ActiveList {
    entries: Slab<BusyEntry>,
}

impl ActiveList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a running task, the returned key removes it again.
    pub(crate) fn insert(&mut self, task: Task, seq: u64) -> usize {
        self.entries.insert(BusyEntry {
            task,
            seq,
            canceling: false,
        })
    }

    #[track_caller]
    pub(crate) fn remove(&mut self, key: usize) -> BusyEntry {
        self.entries.remove(key)
    }

    fn entries_of<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = &'a BusyEntry> {
        self.entries.iter().map(|(_, e)| e).filter(move |e| e.task.ptr_eq(task))
    }

    pub(crate) fn is_running(&self, task: &Task) -> bool {
        self.entries_of(task).next().is_some()
    }

    pub(crate) fn is_canceling(&self, task: &Task) -> bool {
        self.entries_of(task).any(|e| e.canceling)
    }

    /// Flags every running execution of `task` as canceling. Returns whether
    /// the task was running at all.
    pub(crate) fn mark_canceling(&mut self, task: &Task) -> bool {
        let mut found = false;
        for (_, entry) in self.entries.iter_mut() {
            if entry.task.ptr_eq(task) {
                entry.canceling = true;
                found = true;
            }
        }
        found
    }

    /// A task that started at or before `seq` and is still running.
    pub(crate) fn started_before(&self, seq: u64) -> Option<&Task> {
        self.entries
            .iter()
            .map(|(_, e)| e)
            .find(|e| e.seq <= seq)
            .map(|e| &e.task)
    }
}
