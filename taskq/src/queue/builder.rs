use crate::queue::hooks::{BatchGuard, CallbackKind, Callbacks, Notify, ThreadNotify};
use crate::queue::lock::LockKind;
use crate::queue::{Core, Taskqueue, ThreadOpts};
use crate::time::{Timer, TimerThread};
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn(queue: &str) -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));
    let queue = queue.to_owned();

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("{queue}-{id}")
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates a [`Taskqueue`].
///
/// ```
/// use taskq::{Builder, Task};
///
/// let queue = Builder::new("events").worker_threads(2).try_build()?;
/// let task = Task::new(0, |pending| println!("coalesced {pending} request(s)"));
///
/// queue.enqueue(&task)?;
/// queue.drain(&task);
/// queue.destroy();
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Builder {
    /// Name of the queue, used in logs and as the default thread name prefix.
    name: String,

    lock_kind: LockKind,

    /// Told when work becomes available. Defaults to waking an idle worker.
    notify: Option<Arc<dyn Notify>>,

    unlocked_notify: bool,

    /// Provider of delayed enqueues. Defaults to a [`TimerThread`].
    timer: Option<Arc<dyn Timer>>,

    batch_guard: Option<Arc<dyn BatchGuard>>,

    callbacks: Callbacks,

    // Reported by `try_build`, setters do not fail.
    duplicate_callback: Option<CallbackKind>,

    /// Worker threads started by `try_build`. None leaves the queue without
    /// threads until `start_threads` is called, or drives it through `run`.
    worker_threads: Option<usize>,

    /// Applied to the threads started by `try_build`.
    thread_opts: ThreadOpts,

    thread_name: Option<ThreadNameFn>,

    thread_stack_size: Option<usize>,
}

impl Builder {
    /// Returns a builder for a queue named `name`.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new(name: impl Into<String>) -> Builder {
        Builder {
            name: name.into(),
            lock_kind: LockKind::default(),
            notify: None,
            unlocked_notify: false,
            timer: None,
            batch_guard: None,
            callbacks: Callbacks::default(),
            duplicate_callback: None,
            worker_threads: None,
            thread_opts: ThreadOpts::default(),
            thread_name: None,
            thread_stack_size: None,
        }
    }

    /// Selects the lock guarding the queue. Fixed for the queue's lifetime.
    ///
    /// With [`LockKind::Spin`] none of the hooks may block while the queue
    /// calls them with the lock held.
    pub fn lock_kind(mut self, kind: LockKind) -> Self {
        self.lock_kind = kind;
        self
    }

    /// Replaces the default notifier, which wakes one idle worker thread.
    pub fn notify<N: Notify>(mut self, notify: N) -> Self {
        self.notify = Some(Arc::new(notify));
        self
    }

    /// Calls the notifier after releasing the queue lock instead of with the
    /// lock held.
    pub fn unlocked_notify(mut self, val: bool) -> Self {
        self.unlocked_notify = val;
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Sets the guard entered around tasks flagged `GUARDED`.
    pub fn batch_guard<G: BatchGuard>(mut self, guard: G) -> Self {
        self.batch_guard = Some(Arc::new(guard));
        self
    }

    /// Registers a callback run by every worker thread at `kind`. Each kind
    /// accepts one callback, `try_build` fails on a second one.
    pub fn callback<F>(mut self, kind: CallbackKind, f: F) -> Self
    where
        F: Fn(&Core) + Send + Sync + 'static,
    {
        if self.callbacks.set(kind, Arc::new(f)).is_err() {
            self.duplicate_callback.get_or_insert(kind);
        }
        self
    }

    /// Number of worker threads started by `try_build`.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Scheduling priority and CPU affinity of the threads started by
    /// `try_build`.
    pub fn thread_opts(mut self, opts: ThreadOpts) -> Self {
        self.thread_opts = opts;
        self
    }

    /// Sets the name of every worker thread.
    ///
    /// The default name is "{queue}-{id}", where id is monotonically
    /// increasing. Thread names are truncated beyond 15 bytes according to
    /// pthread limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = Some(ThreadNameFn(Arc::new(move || val.clone())));
        self
    }

    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = Some(ThreadNameFn(Arc::new(f)));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured queue and starts its worker threads, if any
    /// were requested.
    pub fn try_build(self) -> Result<Taskqueue> {
        let cfg = QueueConfig::try_from(self)?;
        let queue = Taskqueue::new(&cfg);

        if let Some(count) = cfg.worker_threads {
            queue.start_threads(count, cfg.thread_opts.clone())?;
        }

        Ok(queue)
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("lock_kind", &self.lock_kind)
            .field("unlocked_notify", &self.unlocked_notify)
            .field("timer", &self.timer)
            .field("callbacks", &self.callbacks)
            .field("worker_threads", &self.worker_threads)
            .field("thread_opts", &self.thread_opts)
            .field("thread_stack_size", &self.thread_stack_size)
            .finish_non_exhaustive()
    }
}

// Validated builder, consumed by the queue and its thread pool.
#[derive(Clone)]
pub(crate) struct QueueConfig {
    pub(crate) name: String,
    pub(crate) lock_kind: LockKind,
    pub(crate) notify: Arc<dyn Notify>,
    pub(crate) unlocked_notify: bool,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) batch_guard: Option<Arc<dyn BatchGuard>>,
    pub(crate) callbacks: Callbacks,
    pub(crate) worker_threads: Option<usize>,
    pub(crate) thread_opts: ThreadOpts,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl QueueConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(anyhow!("queue name must not be empty"));
        }
        if self.name.contains('\0') {
            return Err(anyhow!("queue name must not contain NUL bytes"));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for QueueConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        if let Some(kind) = builder.duplicate_callback {
            return Err(anyhow!("{kind:?} callback registered twice"));
        }

        let thread_name = builder
            .thread_name
            .unwrap_or_else(|| default_thread_name_fn(&builder.name));

        let timer = builder
            .timer
            .unwrap_or_else(|| Arc::new(TimerThread::new(format!("{}-timer", builder.name))));

        let cfg = QueueConfig {
            name: builder.name,
            lock_kind: builder.lock_kind,
            notify: builder.notify.unwrap_or_else(|| Arc::new(ThreadNotify)),
            unlocked_notify: builder.unlocked_notify,
            timer,
            batch_guard: builder.batch_guard,
            callbacks: builder.callbacks,
            worker_threads: builder.worker_threads,
            thread_opts: builder.thread_opts,
            thread_name,
            thread_stack_size: builder.thread_stack_size,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
