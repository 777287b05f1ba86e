use crate::queue::Core;
use crate::queue::builder::{QueueConfig, ThreadNameFn};
use crate::utils::thread::{set_current_thread_affinity, set_current_thread_nice};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Per-thread scheduling options applied by [`Taskqueue::start_threads`].
///
/// Failing to apply an option is logged and does not prevent the thread from
/// running tasks.
///
/// [`Taskqueue::start_threads`]: crate::queue::Taskqueue::start_threads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadOpts {
    nice: Option<i32>,
    cpus: Option<Vec<usize>>,
}

impl ThreadOpts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Niceness of the worker threads, lower runs first.
    pub fn nice(mut self, val: i32) -> Self {
        self.nice = Some(val);
        self
    }

    /// Restricts the worker threads to `cpus`.
    pub fn cpus(mut self, cpus: impl IntoIterator<Item = usize>) -> Self {
        self.cpus = Some(cpus.into_iter().collect());
        self
    }
}

/// Worker threads of one queue.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    thread_name: ThreadNameFn,
    thread_stack_size: Option<usize>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(crate) fn new(cfg: &QueueConfig) -> Self {
        Self {
            thread_name: cfg.thread_name.clone(),
            thread_stack_size: cfg.thread_stack_size,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns up to `count` workers. A failed spawn is logged and does not
    /// stop the threads already running, only starting none at all is an
    /// error.
    pub(crate) fn start(&self, core: &Arc<Core>, count: usize, opts: &ThreadOpts) -> Result<usize> {
        if count == 0 {
            return Err(anyhow!("thread count must be greater than 0"));
        }

        let mut handles = self.handles.lock();
        let mut started = 0;

        for _ in 0..count {
            // Counted before the thread exists so `destroy` always waits for it.
            core.thread_starting();

            match self.spawn_worker_thread(core.clone(), opts.clone()) {
                Ok(handle) => {
                    handles.push(handle);
                    started += 1;
                }
                Err(e) => {
                    core.thread_exited();
                    warn!(queue = %core.name(), error = %e, "failed to spawn worker thread");
                }
            }
        }

        if started == 0 {
            return Err(anyhow!(
                "queue {}: none of {} worker thread(s) could be started",
                core.name(),
                count
            ));
        }

        debug!(queue = %core.name(), started, requested = count, "worker threads started");
        Ok(started)
    }

    fn spawn_worker_thread(&self, core: Arc<Core>, opts: ThreadOpts) -> io::Result<thread::JoinHandle<()>> {
        let mut builder = thread::Builder::new().name((self.thread_name.0)());

        if let Some(stack_size) = self.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        builder.spawn(move || {
            apply_thread_opts(&core, &opts);
            core.worker_main();
        })
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let panicked = handles
            .drain(..)
            .filter_map(|handle| handle.join().err())
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", panicked))
        }
    }
}

fn apply_thread_opts(core: &Core, opts: &ThreadOpts) {
    if let Some(cpus) = &opts.cpus {
        if let Err(e) = set_current_thread_affinity(cpus) {
            warn!(queue = %core.name(), ?cpus, error = %e, "failed to set worker cpu affinity");
        }
    }

    if let Some(nice) = opts.nice {
        if let Err(e) = set_current_thread_nice(nice) {
            warn!(queue = %core.name(), nice, error = %e, "failed to set worker priority");
        }
    }
}
