//! Implementation of a simple test-and-set spinlock for very short critical sections.
//!
//! The lock is a single atomic flag. Acquiring it is a `swap(true, Acquire)`,
//! releasing it is a `store(false, Release)`, so everything written while the
//! lock was held is visible to the next thread that acquires it.
//!
//! There is no owner tracking: locking twice from the same thread deadlocks and
//! unlocking a lock you do not hold breaks mutual exclusion for whoever does.
//! The lock is not fair, any spinning thread may win.
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use log::trace;

use crate::relax::cpu_relax;

/// Raw spinlock. It does not own the data it protects, see
/// [`SpinMutex`](crate::mutex::SpinMutex) for a guarded version.
///
/// Neither `Clone` nor `Copy`. All operations take `&self`, so the lock cannot be
/// moved while another thread holds a reference to it.
#[derive(Debug)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Create a new, unlocked lock
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    /// Spin until the lock is acquired. Never gives up.
    #[inline]
    pub fn lock(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            cpu_relax();
        }
    }

    /// Try to take the lock exactly once, returns true if successful
    #[must_use]
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    /// Spin on [`try_lock`](Self::try_lock) for at most `timeout`.
    ///
    /// If `now + timeout` cannot be represented as an [`Instant`] the wait is
    /// effectively unbounded and this behaves like [`lock`](Self::lock).
    #[must_use]
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => {
                self.lock();
                true
            }
        }
    }

    /// Spin on [`try_lock`](Self::try_lock) until `deadline` has passed.
    ///
    /// The deadline is checked before every attempt, so a deadline that already
    /// passed returns false without touching the lock. The bound is best effort:
    /// an attempt started right before the deadline may finish after it.
    #[must_use]
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        while deadline > Instant::now() {
            if self.try_lock() {
                return true;
            }
            cpu_relax();
        }
        trace!("spinlock deadline passed without acquiring the lock");
        false
    }

    /// Release the lock
    ///
    /// # Safety
    /// The caller must hold the lock. Releasing a lock held by someone else lets a
    /// second thread into the critical section.
    #[inline]
    pub unsafe fn unlock(&self) {
        debug_assert!(
            self.locked.load(Ordering::Relaxed),
            "unlock() called on an unlocked SpinLock"
        );
        self.locked.store(false, Ordering::Release);
    }

    /// Snapshot of the flag. Only useful for diagnostics, the answer may be stale
    /// by the time it is returned.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Run `f` with the lock held. The lock is released even if `f` panics.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Release<'a>(&'a SpinLock);

        impl Drop for Release<'_> {
            fn drop(&mut self) {
                // SAFETY: only constructed right after `lock()` returned
                unsafe { self.0.unlock() }
            }
        }

        self.lock();
        let _release = Release(self);
        f()
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::UnsafeCell,
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use anyhow::{anyhow, Result};

    use super::SpinLock;

    /// Value that is only touched while `lock` is held
    struct Guarded<T> {
        lock: SpinLock,
        value: UnsafeCell<T>,
    }

    unsafe impl<T: Send> Sync for Guarded<T> {}

    impl<T> Guarded<T> {
        fn new(value: T) -> Self {
            Guarded {
                lock: SpinLock::new(),
                value: UnsafeCell::new(value),
            }
        }

        fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
            self.lock.lock();
            let result = f(unsafe { &mut *self.value.get() });
            unsafe { self.lock.unlock() };
            result
        }
    }

    #[test]
    fn new_lock_is_unlocked() {
        let l = SpinLock::new();
        assert!(!l.is_locked());
        assert!(!SpinLock::default().is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let l = SpinLock::new();
        assert!(l.try_lock());
        assert!(l.is_locked());
        assert!(!l.try_lock(), "second try_lock on a held lock must fail");
        unsafe { l.unlock() };
        assert!(!l.is_locked());
        assert!(l.try_lock(), "try_lock after unlock must succeed");
        unsafe { l.unlock() };
    }

    #[test]
    fn try_lock_fails_from_other_thread() -> Result<()> {
        let l = Arc::new(SpinLock::new());
        l.lock();

        let other = l.clone();
        let acquired = thread::spawn(move || other.try_lock())
            .join()
            .map_err(|_| anyhow!("try_lock thread panicked"))?;
        assert!(!acquired);

        unsafe { l.unlock() };
        let other = l.clone();
        let acquired = thread::spawn(move || {
            let ok = other.try_lock();
            if ok {
                unsafe { other.unlock() };
            }
            ok
        })
        .join()
        .map_err(|_| anyhow!("try_lock thread panicked"))?;
        assert!(acquired);
        Ok(())
    }

    #[test]
    fn mutual_exclusion() {
        const ITERATIONS: usize = 100_000;
        for threads in [2, 4, 16] {
            let counter = Guarded::new(0usize);
            crossbeam::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|_| {
                        for _ in 0..ITERATIONS {
                            counter.with(|v| *v += 1);
                        }
                    });
                }
            })
            .expect("worker thread panicked");

            assert_eq!(counter.value.into_inner(), threads * ITERATIONS);
        }
    }

    /// Writer publishes `rounds` payloads one at a time, the reader checks each one.
    /// Both sides yield while the other has not caught up, so a single cpu
    /// does not burn a whole time slice per round.
    fn handoff(rounds: u64) {
        // (round, payload). odd round: writer published, even round: reader consumed
        let shared = Guarded::new((0u64, [0u64; 8]));

        crossbeam::scope(|s| {
            s.spawn(|_| {
                for i in 1..=rounds {
                    while !shared.with(|state| {
                        if state.0 != 2 * (i - 1) {
                            return false;
                        }
                        state.1 = [i; 8];
                        state.0 = 2 * i - 1;
                        true
                    }) {
                        thread::yield_now();
                    }
                }
            });
            s.spawn(|_| {
                for i in 1..=rounds {
                    let payload = loop {
                        let consumed = shared.with(|state| {
                            if state.0 != 2 * i - 1 {
                                return None;
                            }
                            state.0 = 2 * i;
                            Some(state.1)
                        });
                        match consumed {
                            Some(payload) => break payload,
                            None => thread::yield_now(),
                        }
                    };
                    assert_eq!(payload, [i; 8], "stale payload in round {}", i);
                }
            });
        })
        .expect("worker thread panicked");
    }

    #[test]
    fn release_makes_writes_visible() {
        handoff(20_000);
    }

    #[test]
    fn handoff_finishes_in_time() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        thread::spawn(move || {
            handoff(2_000);
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(60))
            .expect("2000 handoffs did not finish within 60s");
    }

    #[test]
    fn try_lock_for_times_out_on_held_lock() {
        let l = SpinLock::new();
        l.lock();

        let requested = Duration::from_millis(50);
        let start = Instant::now();
        assert!(!l.try_lock_for(requested));
        let elapsed = start.elapsed();

        assert!(elapsed >= requested, "returned after {:?}", elapsed);
        assert!(
            elapsed < requested + Duration::from_millis(500),
            "returned after {:?}",
            elapsed
        );
        unsafe { l.unlock() };
    }

    #[test]
    fn try_lock_until_past_deadline_does_not_acquire() {
        let l = SpinLock::new();
        let deadline = Instant::now();
        thread::sleep(Duration::from_millis(1));
        assert!(!l.try_lock_until(deadline));
        assert!(!l.is_locked());
    }

    #[test]
    fn try_lock_for_acquires_free_lock() {
        let l = SpinLock::new();
        assert!(l.try_lock_for(Duration::from_millis(10)));
        assert!(l.is_locked());
        unsafe { l.unlock() };
    }

    #[test]
    fn try_lock_for_huge_timeout_acquires() {
        let l = SpinLock::new();
        assert!(l.try_lock_for(Duration::MAX));
        unsafe { l.unlock() };
    }

    #[test]
    fn try_lock_for_waits_for_release() {
        let l = SpinLock::new();
        l.lock();
        crossbeam::scope(|s| {
            s.spawn(|_| {
                thread::sleep(Duration::from_millis(20));
                unsafe { l.unlock() };
            });
            assert!(l.try_lock_for(Duration::from_secs(10)));
        })
        .expect("unlock thread panicked");
        unsafe { l.unlock() };
    }

    #[test]
    fn recursive_lock_is_bounded_by_timeout() {
        let l = SpinLock::new();
        l.lock();
        // a plain lock() here would spin forever
        assert!(!l.try_lock_for(Duration::from_millis(20)));
        unsafe { l.unlock() };
    }

    #[test]
    fn with_lock_releases_on_panic() {
        let l = SpinLock::new();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            l.with_lock(|| panic!("boom"));
        }));
        assert!(r.is_err());
        assert!(!l.is_locked());
        assert_eq!(l.with_lock(|| 7), 7);
    }
}
