//! Lock discipline of a queue.
//!
//! A queue is guarded by a single lock chosen at creation: a regular blocking
//! mutex or a spin lock. Both are exposed as one [`QueueLock`] so the rest of
//! the engine is written once against `lock_api`. Sleeping on a condition is
//! done with `parking_lot_core`, which lets us release the queue lock only
//! after the sleeping thread is registered on its wait channel.
//!
//! With a spin lock the caller must not block while holding it, this is a
//! documented contract and not enforced.

use crossbeam_utils::Backoff;
use parking_lot::lock_api::{self, GuardSend, RawMutex};
use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which lock guards a queue. Fixed for the lifetime of the queue.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// A parking mutex, waiters sleep.
    #[default]
    Blocking,

    /// A busy-waiting lock for callers that must not be descheduled while
    /// holding it.
    Spin,
}

/// A test-and-test-and-set spin lock.
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let backoff = Backoff::new();
        while !self.try_lock() {
            while self.is_locked() {
                backoff.snooze();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Enum dispatch over both raw locks, selected at runtime.
pub enum QueueLock {
    Blocking(parking_lot::RawMutex),
    Spin(RawSpinLock),
}

impl QueueLock {
    pub(crate) fn new(kind: LockKind) -> Self {
        match kind {
            LockKind::Blocking => QueueLock::Blocking(<parking_lot::RawMutex as RawMutex>::INIT),
            LockKind::Spin => QueueLock::Spin(RawSpinLock::INIT),
        }
    }

    pub(crate) fn kind(&self) -> LockKind {
        match self {
            QueueLock::Blocking(_) => LockKind::Blocking,
            QueueLock::Spin(_) => LockKind::Spin,
        }
    }
}

unsafe impl RawMutex for QueueLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = QueueLock::Blocking(<parking_lot::RawMutex as RawMutex>::INIT);

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        match self {
            QueueLock::Blocking(raw) => raw.lock(),
            QueueLock::Spin(raw) => raw.lock(),
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        match self {
            QueueLock::Blocking(raw) => raw.try_lock(),
            QueueLock::Spin(raw) => raw.try_lock(),
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        // Safety: forwarded contract, the caller holds the lock.
        unsafe {
            match self {
                QueueLock::Blocking(raw) => raw.unlock(),
                QueueLock::Spin(raw) => raw.unlock(),
            }
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        match self {
            QueueLock::Blocking(raw) => raw.is_locked(),
            QueueLock::Spin(raw) => raw.is_locked(),
        }
    }
}

impl fmt::Debug for QueueLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueLock")
            .field("kind", &self.kind())
            .field("locked", &self.is_locked())
            .finish()
    }
}

pub(crate) type QueueMutex<T> = lock_api::Mutex<QueueLock, T>;
pub(crate) type QueueGuard<'a, T> = lock_api::MutexGuard<'a, QueueLock, T>;

pub(crate) fn new_mutex<T>(kind: LockKind, val: T) -> QueueMutex<T> {
    QueueMutex::from_raw(QueueLock::new(kind), val)
}

/// An address to sleep on.
///
/// `parking_lot` keys its own locks by their address. A channel is a distinct
/// non-zero-sized field that is never a lock, so waiters parked on it can not
/// steal wakeups meant for a mutex.
#[derive(Debug, Default)]
pub(crate) struct Channel {
    _slot: u8,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    fn key(&self) -> usize {
        self as *const Channel as usize
    }

    /// Releases the queue lock and sleeps until woken through this channel,
    /// then re-acquires the lock. Callers re-check their condition in a loop.
    pub(crate) fn sleep<T>(&self, guard: &mut QueueGuard<'_, T>) {
        // Safety:
        // - we hold the lock through `guard`, so unlocking the raw mutex is
        //   valid. It is only released once this thread is queued on the
        //   channel, wakers hold the same lock, so no wakeup is lost.
        // - the raw mutex is re-acquired before returning, which makes `guard`
        //   valid again.
        // - `key` is the address of a channel we own, never of a lock.
        unsafe {
            let raw = QueueGuard::mutex(guard).raw();
            parking_lot_core::park(
                self.key(),
                || true,
                || raw.unlock(),
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                None,
            );
            raw.lock();
        }
    }

    pub(crate) fn wake_one(&self) -> bool {
        // Safety: `key` is the address of a channel we own.
        unsafe { parking_lot_core::unpark_one(self.key(), |_| DEFAULT_UNPARK_TOKEN).unparked_threads > 0 }
    }

    pub(crate) fn wake_all(&self) -> usize {
        // Safety: `key` is the address of a channel we own.
        unsafe { parking_lot_core::unpark_all(self.key(), DEFAULT_UNPARK_TOKEN) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    assert_impl_all!(QueueMutex<usize>: Send, Sync);

    #[rstest]
    #[case::blocking(LockKind::Blocking)]
    #[case::spin(LockKind::Spin)]
    fn test_mutual_exclusion(#[case] kind: LockKind) {
        let mutex = Arc::new(new_mutex(kind, 0usize));
        assert_eq!(mutex.raw_kind(), kind);

        let handles = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*mutex.lock(), 4000);
    }

    #[rstest]
    #[case::blocking(LockKind::Blocking)]
    #[case::spin(LockKind::Spin)]
    fn test_sleep_releases_lock_and_wakes(#[case] kind: LockKind) {
        struct Shared {
            mutex: QueueMutex<bool>,
            chan: Channel,
        }

        let shared = Arc::new(Shared {
            mutex: new_mutex(kind, false),
            chan: Channel::new(),
        });

        let sleeper = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut guard = shared.mutex.lock();
                while !*guard {
                    shared.chan.sleep(&mut guard);
                }
            })
        };

        // The sleeper must have released the lock for us to get it.
        thread::sleep(Duration::from_millis(20));
        {
            let mut guard = shared.mutex.lock();
            *guard = true;
            shared.chan.wake_all();
        }

        sleeper.join().unwrap();
        assert!(!shared.mutex.is_locked());
    }

    #[test]
    fn test_wake_without_sleepers() {
        let chan = Channel::new();
        assert!(!chan.wake_one());
        assert_eq!(chan.wake_all(), 0);
    }

    trait RawKind {
        fn raw_kind(&self) -> LockKind;
    }

    impl<T> RawKind for QueueMutex<T> {
        fn raw_kind(&self) -> LockKind {
            // Safety: only inspecting the lock variant.
            unsafe { self.raw().kind() }
        }
    }
}
