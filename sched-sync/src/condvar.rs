// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Condition variables bound to one rank-tagged mutex.
//!
//! Built directly on `std::sync::Condvar`, which already gives us the
//! platform wait/timed-wait/signal/broadcast primitives a no_std wait queue
//! would have to hand-roll with an intrusive list of wakers. Spurious
//! wakeups are possible here too (the platform condvar may wake early);
//! every caller is expected to loop on its own predicate.

use crate::mutex::{RankedMutex, RankedMutexGuard};
use crate::rank::{self, Rank};
use std::sync::Condvar as StdCondvar;
use std::time::Duration;

pub struct RankedCondvar {
    rank: Rank,
    inner: StdCondvar,
}

/// Whether a timed wait returned because the deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
}

impl RankedCondvar {
    /// Binds a new condvar to `mutex`'s rank: a condition variable is bound
    /// at creation to one rank-tagged mutex.
    pub fn new<T>(mutex: &RankedMutex<T>) -> Self {
        Self { rank: mutex.rank(), inner: StdCondvar::new() }
    }

    fn check_bound<T>(&self, guard: &RankedMutexGuard<'_, T>, mutex_rank: Rank) {
        debug_assert_eq!(
            self.rank, mutex_rank,
            "condvar bound to a different rank than the guard passed to wait"
        );
        let _ = guard;
    }

    /// Atomically releases `guard` and sleeps; reacquires before returning.
    pub fn wait<'a, T>(&self, guard: RankedMutexGuard<'a, T>) -> RankedMutexGuard<'a, T> {
        self.check_bound(&guard, self.rank);
        rank::note_released(self.rank);
        let std_guard = guard.into_std();
        let std_guard = self.inner.wait(std_guard).unwrap_or_else(|p| p.into_inner());
        rank::note_acquired(self.rank);
        RankedMutexGuard::from_std(self.rank, std_guard)
    }

    /// As [`wait`](Self::wait) but returns whether `timeout` elapsed before
    /// a wakeup. `timeout == None` waits indefinitely (a non-positive
    /// configured wait disables the timed wait entirely).
    pub fn wait_timeout<'a, T>(
        &self,
        guard: RankedMutexGuard<'a, T>,
        timeout: Option<Duration>,
    ) -> (RankedMutexGuard<'a, T>, WaitOutcome) {
        self.check_bound(&guard, self.rank);
        rank::note_released(self.rank);
        let std_guard = guard.into_std();
        let (std_guard, outcome) = match timeout {
            None => (self.inner.wait(std_guard).unwrap_or_else(|p| p.into_inner()), WaitOutcome::Woken),
            Some(dur) => {
                let (g, timeout_result) = self
                    .inner
                    .wait_timeout(std_guard, dur)
                    .unwrap_or_else(|p| p.into_inner());
                let outcome = if timeout_result.timed_out() { WaitOutcome::TimedOut } else { WaitOutcome::Woken };
                (g, outcome)
            }
        };
        rank::note_acquired(self.rank);
        (RankedMutexGuard::from_std(self.rank, std_guard), outcome)
    }

    /// Like [`wait_timeout`](Self::wait_timeout), but calls `publish` with
    /// the calling thread's id *before* releasing the mutex and sleeping,
    /// and `unpublish` after waking: publishes the wait into the current
    /// task first, so that a cancellation request can broadcast it and
    /// break it out.
    pub fn wait_timeout_published<'a, T>(
        &self,
        guard: RankedMutexGuard<'a, T>,
        timeout: Option<Duration>,
        publish: impl FnOnce(),
        unpublish: impl FnOnce(),
    ) -> (RankedMutexGuard<'a, T>, WaitOutcome) {
        publish();
        let (guard, outcome) = self.wait_timeout(guard, timeout);
        unpublish();
        (guard, outcome)
    }

    /// Wakes one waiter.
    pub fn signal(&self) {
        self.inner.notify_one();
    }

    /// Wakes all waiters.
    pub fn broadcast(&self) {
        self.inner.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_and_signal_round_trip() {
        let mutex = Arc::new(RankedMutex::new(Rank::TaskLock, false));
        let condvar = Arc::new(RankedCondvar::new(&mutex));

        let m2 = mutex.clone();
        let c2 = condvar.clone();
        let handle = thread::spawn(move || {
            let mut guard = m2.lock();
            while !*guard {
                guard = c2.wait(guard);
            }
        });

        thread::sleep(Duration::from_millis(10));
        *mutex.lock() = true;
        condvar.signal();
        handle.join().unwrap();
    }

    #[test]
    fn timed_wait_reports_timeout() {
        let mutex = RankedMutex::new(Rank::TaskLock, ());
        let condvar = RankedCondvar::new(&mutex);
        let guard = mutex.lock();
        let (_guard, outcome) = condvar.wait_timeout(guard, Some(Duration::from_millis(5)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
