// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Rank-checked mutexes.
//!
//! `RankedMutex` wraps a real `std::sync::Mutex` so that a [`RankedCondvar`]
//! (see `condvar.rs`) can bind to it the way `std::sync::Condvar` requires.
//! `ReentrantRankedMutex` is the general-purpose recursive primitive spec
//! §4.1 asks the lock registry to support; `TaskLock` itself does not use it
//! (see `DESIGN.md`) but application code built on top of this crate can.

use crate::raw_spin::RawSpinlock;
use crate::rank::{self, Rank};
use lock_api::GetThreadId;
use std::ops::{Deref, DerefMut};
use std::ptr::addr_of;
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};

/// A non-recursive, rank-checked mutex built on `std::sync::Mutex`.
pub struct RankedMutex<T> {
    rank: Rank,
    inner: StdMutex<T>,
}

pub struct RankedMutexGuard<'a, T> {
    rank: Rank,
    inner: Option<StdMutexGuard<'a, T>>,
}

impl<T> RankedMutex<T> {
    pub const fn new(rank: Rank, value: T) -> Self {
        Self { rank, inner: StdMutex::new(value) }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Locks the mutex, blocking the calling OS thread.
    ///
    /// # Panics (debug builds only)
    /// Panics if the calling thread already holds a rank that the partial
    /// order forbids while acquiring `self.rank`.
    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        rank::check_acquire(self.rank);
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::error!(rank = ?self.rank, "mutex poisoned, recovering");
                poisoned.into_inner()
            }
        };
        rank::note_acquired(self.rank);
        RankedMutexGuard { rank: self.rank, inner: Some(guard) }
    }

    pub fn try_lock(&self) -> Option<RankedMutexGuard<'_, T>> {
        rank::check_acquire(self.rank);
        let guard = match self.inner.try_lock() {
            Ok(g) => g,
            Err(std::sync::TryLockError::WouldBlock) => return None,
            Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
        };
        rank::note_acquired(self.rank);
        Some(RankedMutexGuard { rank: self.rank, inner: Some(guard) })
    }

    /// Gives `std::sync::Condvar` access to the inner mutex/guard. Only
    /// meant to be used by [`crate::condvar::RankedCondvar`].
    pub(crate) fn std_mutex(&self) -> &StdMutex<T> {
        &self.inner
    }
}

impl<'a, T> RankedMutexGuard<'a, T> {
    pub(crate) fn into_std(mut self) -> StdMutexGuard<'a, T> {
        self.inner.take().expect("guard already consumed")
    }

    pub(crate) fn from_std(rank: Rank, guard: StdMutexGuard<'a, T>) -> Self {
        // The condvar wait already held `rank` for the duration of the
        // sleep from the registry's point of view; re-entering here would
        // double-count, so callers coming back from a condvar wait must use
        // this constructor instead of `lock()`.
        RankedMutexGuard { rank, inner: Some(guard) }
    }
}

impl<T> Deref for RankedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard already consumed")
    }
}

impl<T> DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard already consumed")
    }
}

impl<T> Drop for RankedMutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            rank::note_released(self.rank);
        }
    }
}

/// A unique, non-human-readable identifier for the calling OS thread, taken
/// from the address of a thread-local byte — identical technique to the
/// teacher's `libs/sync/src/reentrant_mutex.rs::LocalThreadId`.
pub struct LocalThreadId;

// Safety: the returned id is derived from the address of a `thread_local`
// byte, which is unique and stable for the lifetime of the thread.
unsafe impl GetThreadId for LocalThreadId {
    const INIT: Self = LocalThreadId;

    fn nonzero_thread_id(&self) -> std::num::NonZeroUsize {
        thread_local! {
            static X: u8 = const { 0 };
        }
        X.with(|x| std::num::NonZeroUsize::new(addr_of!(*x) as usize).expect("thread id was zero"))
    }
}

/// A recursive, rank-checked mutex. The same OS thread may lock it more than
/// once without deadlocking.
pub struct ReentrantRankedMutex<T> {
    rank: Rank,
    inner: lock_api::ReentrantMutex<RawSpinlock, LocalThreadId, T>,
}

type RawReentrantGuard<'a, T> = lock_api::ReentrantMutexGuard<'a, RawSpinlock, LocalThreadId, T>;

/// Wraps the raw `lock_api` guard so its `Drop` can balance the rank
/// bookkeeping; `lock_api::ReentrantMutexGuard` itself has no hook for that.
pub struct ReentrantRankedMutexGuard<'a, T> {
    rank: Rank,
    inner: RawReentrantGuard<'a, T>,
}

impl<T> Deref for ReentrantRankedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> Drop for ReentrantRankedMutexGuard<'_, T> {
    fn drop(&mut self) {
        rank::note_released(self.rank);
    }
}

impl<T> ReentrantRankedMutex<T> {
    pub fn new(rank: Rank, value: T) -> Self {
        assert!(rank.allows_recursion(), "{rank:?} is not declared recursive");
        Self { rank, inner: lock_api::ReentrantMutex::new(value) }
    }

    pub fn lock(&self) -> ReentrantRankedMutexGuard<'_, T> {
        rank::check_acquire(self.rank);
        let guard = self.inner.lock();
        rank::note_acquired(self.rank);
        ReentrantRankedMutexGuard { rank: self.rank, inner: guard }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_round_trips() {
        let m = RankedMutex::new(Rank::ResLookupLock, 0u32);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn reentrant_mutex_allows_same_thread_relock() {
        let m = ReentrantRankedMutex::new(Rank::TaskLock, 0u32);
        let g1 = m.lock();
        let g2 = m.lock();
        assert_eq!(*g1, 0);
        assert_eq!(*g2, 0);
    }
}
