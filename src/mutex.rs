//! `lock_api` glue, so the raw locks can back a guarded `Mutex<T>`.
//!
//! The guard releases the lock on drop, which keeps callers away from
//! the `unsafe fn unlock` of the raw locks.
use std::time::{Duration, Instant};

use lock_api::{GuardSend, RawMutex, RawMutexTimed};

use crate::{
    padded::{CacheLine, LineSize, PaddedSpinLock},
    spinlock::SpinLock,
};

unsafe impl RawMutex for SpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: SpinLock = SpinLock::new();

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        SpinLock::lock(self)
    }

    #[inline]
    fn try_lock(&self) -> bool {
        SpinLock::try_lock(self)
    }

    #[inline]
    unsafe fn unlock(&self) {
        SpinLock::unlock(self)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        SpinLock::is_locked(self)
    }
}

unsafe impl RawMutexTimed for SpinLock {
    type Duration = Duration;
    type Instant = Instant;

    fn try_lock_for(&self, timeout: Duration) -> bool {
        SpinLock::try_lock_for(self, timeout)
    }

    fn try_lock_until(&self, timeout: Instant) -> bool {
        SpinLock::try_lock_until(self, timeout)
    }
}

unsafe impl<const N: usize> RawMutex for PaddedSpinLock<N>
where
    LineSize<N>: CacheLine,
{
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = PaddedSpinLock::new();

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        PaddedSpinLock::lock(self)
    }

    #[inline]
    fn try_lock(&self) -> bool {
        PaddedSpinLock::try_lock(self)
    }

    #[inline]
    unsafe fn unlock(&self) {
        PaddedSpinLock::unlock(self)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        PaddedSpinLock::is_locked(self)
    }
}

unsafe impl<const N: usize> RawMutexTimed for PaddedSpinLock<N>
where
    LineSize<N>: CacheLine,
{
    type Duration = Duration;
    type Instant = Instant;

    fn try_lock_for(&self, timeout: Duration) -> bool {
        PaddedSpinLock::try_lock_for(self, timeout)
    }

    fn try_lock_until(&self, timeout: Instant) -> bool {
        PaddedSpinLock::try_lock_until(self, timeout)
    }
}

pub type SpinMutex<T> = lock_api::Mutex<SpinLock, T>;
pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, SpinLock, T>;

/// Mutex whose lock sits alone on an `N` byte cache line. The data is stored
/// after the padded lock, so it starts on the next line.
pub type PaddedSpinMutex<T, const N: usize = 64> = lock_api::Mutex<PaddedSpinLock<N>, T>;
pub type PaddedSpinMutexGuard<'a, T, const N: usize = 64> =
    lock_api::MutexGuard<'a, PaddedSpinLock<N>, T>;

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use anyhow::{anyhow, Result};

    use super::{PaddedSpinMutex, SpinMutex};

    #[test]
    fn guard_releases_on_drop() {
        let m = SpinMutex::new(5u32);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.is_locked());
            assert!(m.try_lock().is_none());
        }
        assert!(!m.is_locked());
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn timed_lock_through_guard() {
        let m: PaddedSpinMutex<Vec<u8>, 128> = PaddedSpinMutex::new(Vec::new());
        let g = m.lock();
        assert!(m.try_lock_for(Duration::from_millis(10)).is_none());
        drop(g);
        m.try_lock_for(Duration::from_millis(10))
            .expect("lock is free")
            .push(1);
        assert_eq!(m.into_inner(), vec![1]);
    }

    #[test]
    fn shared_counter() -> Result<()> {
        let m: Arc<PaddedSpinMutex<usize>> = Arc::new(PaddedSpinMutex::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().map_err(|_| anyhow!("counter thread panicked"))?;
        }
        assert_eq!(*m.lock(), 40_000);
        Ok(())
    }
}
