//! [`SpinLock`] padded out to a whole cache line.
//!
//! Useful when many independent locks live next to each other in memory, e.g. one
//! lock per hash bucket. Without padding two unrelated locks can share a line and
//! every acquire on one invalidates the other ("false sharing").
//!
//! The line size is a const generic. Only sizes that have an alignment marker
//! below are accepted, anything else fails to compile, and so does a line size
//! smaller than the lock itself.
use std::{
    mem::{self, MaybeUninit},
    time::{Duration, Instant},
};

use crate::spinlock::SpinLock;

/// Maps a cache line size to a zero sized type with that alignment and to the
/// padding that follows the lock.
pub trait CacheLine {
    /// zero sized, `align_of::<Align>() == N`
    type Align;
    /// `N - size_of::<SpinLock>()` bytes, never read
    type Padding;
}

/// Marker carrying a cache line size, see [`CacheLine`]
pub struct LineSize<const N: usize>;

macro_rules! cache_line {
    ($($name:ident => $n:literal),+ $(,)?) => {
        $(
            #[doc = concat!("Zero sized type aligned to ", stringify!($n), " bytes")]
            #[derive(Debug, Clone, Copy)]
            #[repr(align($n))]
            pub struct $name;

            impl CacheLine for LineSize<$n> {
                type Align = $name;
                type Padding = [u8; $n - mem::size_of::<SpinLock>()];
            }
        )+
    };
}

cache_line! {
    Align8 => 8,
    Align16 => 16,
    Align32 => 32,
    Align64 => 64,
    Align128 => 128,
    Align256 => 256,
}

/// A [`SpinLock`] that occupies exactly `N` bytes aligned to `N`.
///
/// All operations forward to the embedded lock unchanged.
#[repr(C)]
pub struct PaddedSpinLock<const N: usize = 64>
where
    LineSize<N>: CacheLine,
{
    _align: [<LineSize<N> as CacheLine>::Align; 0],
    lock: SpinLock,
    _padding: MaybeUninit<<LineSize<N> as CacheLine>::Padding>,
}

/// The common case, a lock on its own 64 byte cache line
pub type CachelineSpinLock = PaddedSpinLock<64>;

impl<const N: usize> PaddedSpinLock<N>
where
    LineSize<N>: CacheLine,
{
    /// Size in bytes of one instance, equal to the line size
    pub const SIZE: usize = N;

    pub const fn new() -> Self {
        PaddedSpinLock {
            _align: [],
            lock: SpinLock::new(),
            _padding: MaybeUninit::uninit(),
        }
    }

    #[inline]
    pub fn lock(&self) {
        self.lock.lock()
    }

    #[must_use]
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }

    #[must_use]
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        self.lock.try_lock_for(timeout)
    }

    #[must_use]
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        self.lock.try_lock_until(deadline)
    }

    /// # Safety
    /// Same contract as [`SpinLock::unlock`]: the caller must hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.lock.unlock()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.with_lock(f)
    }

    /// The embedded lock, mostly for layout checks
    pub fn inner(&self) -> &SpinLock {
        &self.lock
    }
}

impl<const N: usize> Default for PaddedSpinLock<N>
where
    LineSize<N>: CacheLine,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> std::fmt::Debug for PaddedSpinLock<N>
where
    LineSize<N>: CacheLine,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaddedSpinLock")
            .field("line_size", &N)
            .field("lock", &self.lock)
            .finish()
    }
}

const _: () = assert!(mem::size_of::<CachelineSpinLock>() == 64);
const _: () = assert!(mem::align_of::<CachelineSpinLock>() == 64);
