use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    mem,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use cacheline_spinlock::{
    config::StressConfig,
    padded::{CacheLine, LineSize, PaddedSpinLock},
    CachelineSpinLock, SpinLock,
};
use clap::ValueEnum;
use crossbeam::channel::{Receiver, TryRecvError};
use lock_api::{RawMutex, RawMutexTimed};
use log::{debug, info, warn};
use strum::{EnumIter, IntoEnumIterator};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("mutual exclusion violated: expected counter {expected}, observed {observed}")]
    MutualExclusion { expected: usize, observed: usize },
    #[error("stale read in round {iteration}: expected {expected}, observed {observed}")]
    StaleRead {
        iteration: u64,
        expected: u64,
        observed: u64,
    },
    #[error("bounded acquire returned after {elapsed:?}, requested {requested:?}")]
    TimeoutBound {
        requested: Duration,
        elapsed: Duration,
    },
    #[error("{what} acquired a lock that was held")]
    UnexpectedAcquire { what: String },
    #[error("{what} failed to acquire a free lock")]
    UnexpectedContention { what: String },
    #[error("layout mismatch for {what}: expected {expected}, observed {observed}")]
    Layout {
        what: String,
        expected: usize,
        observed: usize,
    },
    #[error("received abort signal")]
    Aborted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait Check {
    fn get_name(&self) -> String;
    fn get_description(&self) -> &str;
    fn run(&self) -> Result<(), CheckError>;
}

/// Raw locks the checks can run against
pub trait TimedLock:
    RawMutexTimed<Duration = Duration, Instant = Instant> + Send + Sync + 'static
{
}

impl<L> TimedLock for L where
    L: RawMutexTimed<Duration = Duration, Instant = Instant> + Send + Sync + 'static
{
}

///This enum describes all known checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, EnumIter, strum::Display)]
pub enum CheckName {
    MutualExclusion,
    TryLock,
    TimeoutBound,
    ReleaseVisibility,
    PaddingIsolation,
    BoundedSelfDeadlock,
}

///Group similar checks together
#[derive(Debug, Clone, Copy, ValueEnum, strum::Display)]
pub enum CheckGroup {
    ///All known checks
    All,
    ///Single threaded semantics and memory layout, finishes quickly
    Basic,
    ///Many threads hammering the same lock
    Stress,
    ///Checks for the time bounded acquire
    Timing,
}

impl From<CheckGroup> for Vec<CheckName> {
    fn from(group: CheckGroup) -> Self {
        match group {
            CheckGroup::All => CheckName::iter().collect(),
            CheckGroup::Basic => vec![CheckName::TryLock, CheckName::PaddingIsolation],
            CheckGroup::Stress => vec![CheckName::MutualExclusion, CheckName::ReleaseVisibility],
            CheckGroup::Timing => vec![CheckName::TimeoutBound, CheckName::BoundedSelfDeadlock],
        }
    }
}

/// Lock type(s) the checks are run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LockVariant {
    Plain,
    Padded,
    Both,
}

impl CheckName {
    /// Build the checks for `variant`. Layout checks do not depend on the variant
    /// and are only built once.
    pub fn instantiate(
        &self,
        abort_chan: &Receiver<()>,
        config: &StressConfig,
        variant: LockVariant,
    ) -> Vec<Box<dyn Check>> {
        if *self == CheckName::PaddingIsolation {
            return vec![Box::new(PaddingIsolationCheck)];
        }

        let mut checks = Vec::new();
        if matches!(variant, LockVariant::Plain | LockVariant::Both) {
            checks.push(self.instantiate_for::<SpinLock>("plain", abort_chan, config));
        }
        if matches!(variant, LockVariant::Padded | LockVariant::Both) {
            checks.push(self.instantiate_for::<CachelineSpinLock>("padded", abort_chan, config));
        }
        checks
    }

    fn instantiate_for<L: TimedLock>(
        &self,
        variant: &'static str,
        abort_chan: &Receiver<()>,
        config: &StressConfig,
    ) -> Box<dyn Check> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let slack = Duration::from_millis(config.timeout_slack_ms);
        match self {
            CheckName::MutualExclusion => Box::new(MutualExclusionCheck::<L>::new(
                variant,
                abort_chan.clone(),
                config,
            )),
            CheckName::TryLock => Box::new(TryLockCheck::<L>::new(variant)),
            CheckName::TimeoutBound => {
                Box::new(TimeoutBoundCheck::<L>::new(variant, timeout, slack))
            }
            CheckName::ReleaseVisibility => Box::new(ReleaseVisibilityCheck::<L>::new(
                variant,
                abort_chan.clone(),
                config.visibility_rounds as u64,
            )),
            CheckName::PaddingIsolation => Box::new(PaddingIsolationCheck),
            CheckName::BoundedSelfDeadlock => {
                Box::new(BoundedSelfDeadlockCheck::<L>::new(variant, timeout, slack))
            }
        }
    }
}

fn check_abort(abort_chan: &Receiver<()>) -> Result<(), CheckError> {
    match abort_chan.try_recv() {
        Ok(()) => Err(CheckError::Aborted),
        Err(TryRecvError::Empty) => Ok(()),
        Err(e) => Err(anyhow!("error checking abort channel : {}", e).into()),
    }
}

/// Value that is only accessed while `lock` is held
struct Guarded<L, T> {
    lock: L,
    value: UnsafeCell<T>,
}

unsafe impl<L: Sync, T: Send> Sync for Guarded<L, T> {}

impl<L: RawMutex, T> Guarded<L, T> {
    fn new(value: T) -> Self {
        Guarded {
            lock: L::INIT,
            value: UnsafeCell::new(value),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.lock.lock();
        // SAFETY: we hold the lock, so nobody else has a reference to value
        let result = f(unsafe { &mut *self.value.get() });
        unsafe { self.lock.unlock() };
        result
    }

    fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct MutualExclusionCheck<L> {
    variant: &'static str,
    abort_chan: Receiver<()>,
    thread_counts: Vec<usize>,
    iterations: usize,
    repetitions: usize,
    _lock: PhantomData<L>,
}

impl<L: TimedLock> MutualExclusionCheck<L> {
    pub fn new(variant: &'static str, abort_chan: Receiver<()>, config: &StressConfig) -> Self {
        MutualExclusionCheck {
            variant,
            abort_chan,
            thread_counts: config.thread_counts.clone(),
            iterations: config.iterations,
            repetitions: config.repetitions,
            _lock: PhantomData,
        }
    }

    fn run_once(&self, threads: usize) -> Result<(), CheckError> {
        let counter = Guarded::<L, usize>::new(0);
        crossbeam::scope(|s| {
            for _ in 0..threads {
                s.spawn(|_| {
                    for _ in 0..self.iterations {
                        counter.with(|v| *v += 1);
                    }
                });
            }
        })
        .map_err(|_| anyhow!("counter thread panicked"))?;

        let expected = threads * self.iterations;
        let observed = counter.into_inner();
        if observed != expected {
            return Err(CheckError::MutualExclusion { expected, observed });
        }
        Ok(())
    }
}

impl<L: TimedLock> Check for MutualExclusionCheck<L> {
    fn get_name(&self) -> String {
        format!("{}[{}]", CheckName::MutualExclusion, self.variant)
    }

    fn get_description(&self) -> &str {
        "Concurrent increments of a shared counter, the final value must match exactly"
    }

    fn run(&self) -> Result<(), CheckError> {
        for &threads in &self.thread_counts {
            for rep in 0..self.repetitions {
                check_abort(&self.abort_chan)?;
                debug!(
                    "{} threads, repetition {}/{}",
                    threads,
                    rep + 1,
                    self.repetitions
                );
                let start = Instant::now();
                self.run_once(threads)?;
                debug!(
                    "{} threads x {} increments took {:?}",
                    threads,
                    self.iterations,
                    start.elapsed()
                );
            }
        }
        Ok(())
    }
}

pub struct TryLockCheck<L> {
    variant: &'static str,
    _lock: PhantomData<L>,
}

impl<L: TimedLock> TryLockCheck<L> {
    pub fn new(variant: &'static str) -> Self {
        TryLockCheck {
            variant,
            _lock: PhantomData,
        }
    }
}

impl<L: TimedLock> Check for TryLockCheck<L> {
    fn get_name(&self) -> String {
        format!("{}[{}]", CheckName::TryLock, self.variant)
    }

    fn get_description(&self) -> &str {
        "try_lock fails on a held lock from any thread and succeeds once it is released"
    }

    fn run(&self) -> Result<(), CheckError> {
        let lock = L::INIT;
        if !lock.try_lock() {
            return Err(CheckError::UnexpectedContention {
                what: "try_lock on a new lock".to_string(),
            });
        }
        if lock.try_lock() {
            return Err(CheckError::UnexpectedAcquire {
                what: "second try_lock from the holding thread".to_string(),
            });
        }

        let acquired = crossbeam::scope(|s| s.spawn(|_| lock.try_lock()).join())
            .map_err(|_| anyhow!("try_lock thread panicked"))?
            .map_err(|_| anyhow!("try_lock thread panicked"))?;
        if acquired {
            return Err(CheckError::UnexpectedAcquire {
                what: "try_lock from another thread".to_string(),
            });
        }

        unsafe { lock.unlock() };
        if !lock.try_lock() {
            return Err(CheckError::UnexpectedContention {
                what: "try_lock after unlock".to_string(),
            });
        }
        unsafe { lock.unlock() };
        Ok(())
    }
}

/// Fail unless `elapsed` lies in `[requested, requested + slack]`
fn check_bound(requested: Duration, slack: Duration, elapsed: Duration) -> Result<(), CheckError> {
    if elapsed < requested || elapsed > requested + slack {
        return Err(CheckError::TimeoutBound { requested, elapsed });
    }
    if elapsed > requested + slack / 2 {
        warn!(
            "bounded acquire overshot by {:?}, is the machine overloaded?",
            elapsed - requested
        );
    }
    Ok(())
}

pub struct TimeoutBoundCheck<L> {
    variant: &'static str,
    timeout: Duration,
    slack: Duration,
    _lock: PhantomData<L>,
}

impl<L: TimedLock> TimeoutBoundCheck<L> {
    pub fn new(variant: &'static str, timeout: Duration, slack: Duration) -> Self {
        TimeoutBoundCheck {
            variant,
            timeout,
            slack,
            _lock: PhantomData,
        }
    }

    fn expect_timeout(
        &self,
        what: &str,
        acquire: impl FnOnce(Duration) -> bool,
    ) -> Result<(), CheckError> {
        let start = Instant::now();
        if acquire(self.timeout) {
            return Err(CheckError::UnexpectedAcquire {
                what: what.to_string(),
            });
        }
        let elapsed = start.elapsed();
        debug!("{} gave up after {:?}", what, elapsed);
        check_bound(self.timeout, self.slack, elapsed)
    }
}

impl<L: TimedLock> Check for TimeoutBoundCheck<L> {
    fn get_name(&self) -> String {
        format!("{}[{}]", CheckName::TimeoutBound, self.variant)
    }

    fn get_description(&self) -> &str {
        "try_lock_for/try_lock_until on a held lock give up no earlier than requested and not much later"
    }

    fn run(&self) -> Result<(), CheckError> {
        let lock = L::INIT;
        lock.lock();

        self.expect_timeout("try_lock_for", |t| lock.try_lock_for(t))?;
        self.expect_timeout("try_lock_until", |t| {
            lock.try_lock_until(Instant::now() + t)
        })?;
        crossbeam::scope(|s| {
            s.spawn(|_| {
                self.expect_timeout("try_lock_for from another thread", |t| {
                    lock.try_lock_for(t)
                })
            })
            .join()
        })
        .map_err(|_| anyhow!("timeout thread panicked"))?
        .map_err(|_| anyhow!("timeout thread panicked"))??;

        unsafe { lock.unlock() };
        if !lock.try_lock_for(self.timeout) {
            return Err(CheckError::UnexpectedContention {
                what: "try_lock_for on a released lock".to_string(),
            });
        }
        unsafe { lock.unlock() };
        Ok(())
    }
}

pub struct ReleaseVisibilityCheck<L> {
    variant: &'static str,
    abort_chan: Receiver<()>,
    rounds: u64,
    _lock: PhantomData<L>,
}

/// Round counter plus payload. Odd round: the writer published, even round:
/// the reader consumed.
struct Handoff {
    round: u64,
    payload: [u64; 8],
}

impl<L: TimedLock> ReleaseVisibilityCheck<L> {
    pub fn new(variant: &'static str, abort_chan: Receiver<()>, rounds: u64) -> Self {
        ReleaseVisibilityCheck {
            variant,
            abort_chan,
            rounds,
            _lock: PhantomData,
        }
    }

    fn writer(&self, shared: &Guarded<L, Handoff>, stop: &AtomicBool) -> Result<(), CheckError> {
        for i in 1..=self.rounds {
            if i % 4096 == 0 {
                if let Err(e) = check_abort(&self.abort_chan) {
                    stop.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
            loop {
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let published = shared.with(|h| {
                    if h.round != 2 * (i - 1) {
                        return false;
                    }
                    h.payload = [i; 8];
                    h.round = 2 * i - 1;
                    true
                });
                if published {
                    break;
                }
                thread::yield_now();
            }
        }
        Ok(())
    }

    fn reader(&self, shared: &Guarded<L, Handoff>, stop: &AtomicBool) -> Result<(), CheckError> {
        for i in 1..=self.rounds {
            loop {
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let consumed = shared.with(|h| {
                    if h.round != 2 * i - 1 {
                        return None;
                    }
                    h.round = 2 * i;
                    Some(h.payload)
                });
                let Some(payload) = consumed else {
                    thread::yield_now();
                    continue;
                };
                if let Some(&observed) = payload.iter().find(|&&v| v != i) {
                    stop.store(true, Ordering::Relaxed);
                    return Err(CheckError::StaleRead {
                        iteration: i,
                        expected: i,
                        observed,
                    });
                }
                break;
            }
        }
        Ok(())
    }
}

impl<L: TimedLock> Check for ReleaseVisibilityCheck<L> {
    fn get_name(&self) -> String {
        format!("{}[{}]", CheckName::ReleaseVisibility, self.variant)
    }

    fn get_description(&self) -> &str {
        "Writes made before unlock are seen by the next thread that acquires the lock"
    }

    fn run(&self) -> Result<(), CheckError> {
        let shared = Guarded::<L, Handoff>::new(Handoff {
            round: 0,
            payload: [0; 8],
        });
        let stop = AtomicBool::new(false);

        let (writer, reader) = crossbeam::scope(|s| {
            let writer = s.spawn(|_| self.writer(&shared, &stop));
            let reader = s.spawn(|_| self.reader(&shared, &stop));
            (writer.join(), reader.join())
        })
        .map_err(|_| anyhow!("handoff thread panicked"))?;

        writer.map_err(|_| anyhow!("writer thread panicked"))??;
        reader.map_err(|_| anyhow!("reader thread panicked"))??;
        info!("{} handoffs without a stale read", self.rounds);
        Ok(())
    }
}

/// Size, alignment and array stride of `PaddedSpinLock<N>`
fn check_padded_layout<const N: usize>() -> Result<(), CheckError>
where
    LineSize<N>: CacheLine,
{
    let what = format!("PaddedSpinLock<{}>", N);
    let size = mem::size_of::<PaddedSpinLock<N>>();
    if size != N {
        return Err(CheckError::Layout {
            what: format!("size_of {}", what),
            expected: N,
            observed: size,
        });
    }
    let align = mem::align_of::<PaddedSpinLock<N>>();
    if align != N {
        return Err(CheckError::Layout {
            what: format!("align_of {}", what),
            expected: N,
            observed: align,
        });
    }

    let locks: [PaddedSpinLock<N>; 2] = Default::default();
    let first = locks[0].inner() as *const SpinLock as usize;
    let second = locks[1].inner() as *const SpinLock as usize;
    if second - first != N {
        return Err(CheckError::Layout {
            what: format!("array stride of {}", what),
            expected: N,
            observed: second - first,
        });
    }
    debug!("{}: size {}, align {}, stride {}", what, size, align, N);
    Ok(())
}

pub struct PaddingIsolationCheck;

impl Check for PaddingIsolationCheck {
    fn get_name(&self) -> String {
        CheckName::PaddingIsolation.to_string()
    }

    fn get_description(&self) -> &str {
        "Padded locks are exactly one line long and adjacent instances never share a line"
    }

    fn run(&self) -> Result<(), CheckError> {
        check_padded_layout::<8>()?;
        check_padded_layout::<16>()?;
        check_padded_layout::<32>()?;
        check_padded_layout::<64>()?;
        check_padded_layout::<128>()?;
        check_padded_layout::<256>()?;
        Ok(())
    }
}

pub struct BoundedSelfDeadlockCheck<L> {
    variant: &'static str,
    timeout: Duration,
    slack: Duration,
    _lock: PhantomData<L>,
}

impl<L: TimedLock> BoundedSelfDeadlockCheck<L> {
    pub fn new(variant: &'static str, timeout: Duration, slack: Duration) -> Self {
        BoundedSelfDeadlockCheck {
            variant,
            timeout,
            slack,
            _lock: PhantomData,
        }
    }
}

impl<L: TimedLock> Check for BoundedSelfDeadlockCheck<L> {
    fn get_name(&self) -> String {
        format!("{}[{}]", CheckName::BoundedSelfDeadlock, self.variant)
    }

    fn get_description(&self) -> &str {
        "Re-acquiring a held lock from the same thread with a timeout gives up instead of hanging"
    }

    fn run(&self) -> Result<(), CheckError> {
        let lock = L::INIT;
        lock.lock();
        let start = Instant::now();
        let acquired = lock.try_lock_for(self.timeout);
        let elapsed = start.elapsed();
        unsafe { lock.unlock() };

        if acquired {
            return Err(CheckError::UnexpectedAcquire {
                what: "recursive try_lock_for".to_string(),
            });
        }
        check_bound(self.timeout, self.slack, elapsed)
    }
}
