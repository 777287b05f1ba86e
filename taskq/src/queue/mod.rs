//! Priority task queues serviced by worker threads.
//!
//! A queue is created through a [`Builder`] and owned by a [`Taskqueue`].
//! Producers submit [`Task`]s through the owner or through any number of
//! cheap [`Handle`] clones. Both dereference to [`Core`], which carries every
//! task operation.
//!
//! [`Task`]: crate::task::Task

pub(crate) mod builder;
pub use builder::Builder;

pub(crate) mod busy;

pub(crate) mod core;
pub use self::core::{Core, EnqueueFlags};

pub(crate) mod hooks;
pub use hooks::{BatchGuard, Callback, CallbackKind, Notify, ThreadNotify};

pub(crate) mod lock;
pub use lock::LockKind;

pub(crate) mod pending;

pub(crate) mod pool;
pub use pool::ThreadOpts;


use anyhow::Result;
use builder::QueueConfig;
use pool::ThreadPool;
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

/// A reference to a queue that producers can clone freely.
///
/// A handle does not keep the worker threads alive: once the owning
/// [`Taskqueue`] is destroyed, tasks enqueued through a handle are only run by
/// explicit [`Core::run`] calls.
#[derive(Debug, Clone)]
pub struct Handle(Arc<Core>);

impl Deref for Handle {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.0
    }
}

impl Handle {
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Owner of a queue and of its worker threads.
///
/// Dropping the owner destroys the queue like [`Taskqueue::destroy`].
#[derive(Debug)]
pub struct Taskqueue {
    handle: Handle,
    pool: ThreadPool,
    destroyed: bool,
}

impl Taskqueue {
    pub(crate) fn new(cfg: &QueueConfig) -> Self {
        Self {
            handle: Handle(Core::new(cfg)),
            pool: ThreadPool::new(cfg),
            destroyed: false,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Spawns `count` worker threads running the execution loop.
    ///
    /// Returns how many started. Failures to spawn are logged, only starting
    /// none at all is an error.
    pub fn start_threads(&self, count: usize, opts: ThreadOpts) -> Result<usize> {
        self.pool.start(&self.handle.0, count, &opts)
    }

    /// Stops the worker threads once they ran every pending task, waits for
    /// outstanding timers, then joins the threads.
    ///
    /// # Panics
    ///
    /// When a task is still running after the workers exited, which means
    /// [`Core::drain_all`] was not called first, or when called from one of
    /// the queue's own workers.
    pub fn destroy(mut self) {
        self.destroy_inner();
    }

    fn destroy_inner(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.handle.terminate();

        if let Err(e) = self.pool.join_all() {
            warn!(queue = %self.handle.name(), error = %e, "error joining worker threads");
        }
    }
}

impl Deref for Taskqueue {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.handle
    }
}

impl Drop for Taskqueue {
    fn drop(&mut self) {
        // Do not turn a panic into an abort.
        if std::thread::panicking() {
            return;
        }
        self.destroy_inner();
    }
}
