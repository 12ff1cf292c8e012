pub mod config;
pub mod mutex;
pub mod padded;
pub mod relax;
pub mod spinlock;

pub use mutex::{PaddedSpinMutex, PaddedSpinMutexGuard, SpinMutex, SpinMutexGuard};
pub use padded::{CachelineSpinLock, PaddedSpinLock};
pub use spinlock::SpinLock;
