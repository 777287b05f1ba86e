use crate::queue::{Builder, LockKind, Taskqueue};
use anyhow::Result;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) mod mocks;
pub(crate) use mocks::ManualTimer;

pub(crate) mod spy;
pub(crate) use spy::Recorder;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue with `threads` workers, zero leaves it to be driven by `run`.
pub(crate) fn build_queue(kind: LockKind, threads: usize) -> Result<Taskqueue> {
    let mut builder = Builder::new("test").lock_kind(kind);
    if threads > 0 {
        builder = builder.worker_threads(threads);
    }
    builder.try_build()
}

/// Polls `cond` until it holds. Panics if it does not within a few seconds so
/// a broken wakeup fails the test instead of hanging it.
#[track_caller]
pub(crate) fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in {WAIT_TIMEOUT:?}");
        thread::sleep(Duration::from_millis(1));
    }
}
