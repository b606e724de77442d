//! Rank-checked locking primitives for the task scheduler core.
//!
//! A `lock_api`-based `RawMutex`/`RawRwLock` pair, built on `std::sync`
//! since this scheduler runs real OS threads rather than kernel contexts.

mod condvar;
mod mutex;
mod rank;
mod raw_spin;
mod slot_rwlock;

pub use condvar::{RankedCondvar, WaitOutcome};
pub use mutex::{
    LocalThreadId, RankedMutex, RankedMutexGuard, ReentrantRankedMutex, ReentrantRankedMutexGuard,
};
pub use rank::{check_acquire, Rank, RankViolation};
pub use raw_spin::RawSpinlock;
pub use slot_rwlock::{ReadGuard as SlotReadGuard, SlotRwLock, WriteGuard as SlotWriteGuard};

#[cfg(debug_assertions)]
pub use rank::is_held;
