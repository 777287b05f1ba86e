use crate::time::{Timer, TimerCallback, TimerHandle};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Entry {
    deadline: Instant,
    generation: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,

    // Armed callbacks, keyed by generation. Cancelling removes the callback and
    // leaves the heap entry behind, it is skipped when it expires.
    callbacks: HashMap<u64, TimerCallback>,

    next_generation: u64,

    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Default [`Timer`]: a min-heap of deadlines served by one background thread.
///
/// The thread is spawned on the first `arm_once` and stopped when the
/// `TimerThread` is dropped. Callbacks run on that thread, in deadline order,
/// with no lock held. Callbacks still armed at drop time are discarded.
pub struct TimerThread {
    name: String,
    shared: Arc<Shared>,
    handle: OnceLock<thread::JoinHandle<()>>,
}

impl TimerThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::default(),
            handle: OnceLock::new(),
        }
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_started(&self) {
        self.handle.get_or_init(|| {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || run(&shared))
                .expect("failed to spawn timer thread")
        });
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();

    while !state.shutdown {
        match state.heap.peek().map(|e| e.deadline) {
            None => shared.cond.wait(&mut state),
            Some(deadline) if deadline > Instant::now() => {
                shared.cond.wait_until(&mut state, deadline);
            }
            Some(_) => fire_next(&mut state),
        }
    }
}

fn fire_next(state: &mut MutexGuard<'_, State>) {
    let Some(entry) = state.heap.pop() else {
        return;
    };

    if let Some(callback) = state.callbacks.remove(&entry.generation) {
        // Once removed from `callbacks`, `cancel` reports the timer as fired.
        MutexGuard::unlocked(state, callback);
    }
}

impl Timer for TimerThread {
    /// # Panics
    ///
    /// When the timer thread cannot be spawned on first use.
    fn arm_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        self.ensure_started();

        let mut state = self.shared.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let entry = Entry {
            deadline: Instant::now() + delay,
            generation,
        };

        let is_earliest = state.heap.peek().is_none_or(|e| entry > *e);
        state.heap.push(entry);
        state.callbacks.insert(generation, callback);

        if is_earliest {
            self.shared.cond.notify_one();
        }

        TimerHandle::new(generation)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.shared.state.lock();
        let cancelled = state.callbacks.remove(&handle.as_u64()).is_some();

        if state.callbacks.is_empty() {
            state.heap.clear();
        }

        cancelled
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.callbacks.clear();
        }
        self.shared.cond.notify_all();

        // The last reference can go away inside a callback, on the timer
        // thread itself. It exits on its own once it sees `shutdown`.
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            tracing::warn!(timer = %self.name, "timer thread panicked");
        }
    }
}

impl fmt::Debug for TimerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerThread")
            .field("name", &self.name)
            .field("armed", &self.len())
            .field("started", &self.handle.get().is_some())
            .finish()
    }
}
