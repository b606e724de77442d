// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The closed set of lock ranks and the partial-order table that detects
//! out-of-order acquisition.
//!
//! Follows the usual `lock_api`-based `RawMutex` split (one rank-checked
//! wrapper type around a cheap raw primitive) but adds rank bookkeeping on
//! top, since a hosted, heap-using scheduler can't rely on convention alone
//! to keep lock order consistent across threads.

use std::cell::Cell;

/// A lock rank. The set is closed: no embedder may add a rank at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Rank {
    /// The single scheduler mutex: serialises all modifications to the task
    /// graph, schedule lists, thread context states and thread pool counters.
    TaskLock = 0,
    /// Per-requirement spinlock guarding a requirement node tree.
    ReqNodeLock = 1,
    /// Per-pool spinlock guarding a resource pool's lookup table.
    ResLookupLock = 2,
}

impl Rank {
    pub const COUNT: usize = 3;

    pub const ALL: [Rank; Self::COUNT] = [Rank::TaskLock, Rank::ReqNodeLock, Rank::ResLookupLock];

    #[inline]
    const fn index(self) -> usize {
        self as u8 as usize
    }

    #[inline]
    const fn mask(self) -> u32 {
        1 << self.index()
    }

    /// Ranks for which the same thread is permitted to hold more than one
    /// concurrently-acquired instance (different pools / requirement trees).
    #[inline]
    pub const fn is_concurrent(self) -> bool {
        matches!(self, Rank::ReqNodeLock | Rank::ResLookupLock)
    }

    /// Ranks for which acquiring this rank is allowed while the *same* rank
    /// is already held on this thread (recursive mutexes only).
    #[inline]
    pub const fn allows_recursion(self) -> bool {
        matches!(self, Rank::TaskLock)
    }
}

/// `INCOMPATIBLE[r]` is the bitmask of ranks that MUST NOT already be held by
/// the calling thread when it acquires rank `r`.
///
/// Lock order, outermost to innermost: `TaskLock` -> `ReqNodeLock` ->
/// `ResLookupLock`. A thread already holding an inner rank may not reach
/// back out to acquire an outer one; the pool spinlock is released before
/// the user `fix` callback runs, since that callback may itself need to
/// re-acquire `TaskLock`.
const fn build_incompatible() -> [u32; Rank::COUNT] {
    let task = Rank::TaskLock.mask();
    let req = Rank::ReqNodeLock.mask();
    let res = Rank::ResLookupLock.mask();
    let mut table = [0u32; Rank::COUNT];
    table[Rank::TaskLock.index()] = req | res;
    table[Rank::ReqNodeLock.index()] = res;
    table[Rank::ResLookupLock.index()] = 0;
    // Non-recursive ranks are self-incompatible; recursive ranks are not.
    let mut i = 0;
    while i < Rank::COUNT {
        let rank = Rank::ALL[i];
        if !rank.allows_recursion() {
            table[rank.index()] |= rank.mask();
        }
        i += 1;
    }
    table
}

const INCOMPATIBLE: [u32; Rank::COUNT] = build_incompatible();

static_assertions::const_assert!(INCOMPATIBLE[Rank::TaskLock as usize] & Rank::TaskLock.mask() == 0);

#[derive(Debug)]
pub struct RankViolation {
    pub attempted: Rank,
    pub held: Vec<Rank>,
}

impl std::fmt::Display for RankViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lock order violation: attempted to acquire {:?} while holding {:?}",
            self.attempted, self.held
        )
    }
}

impl std::error::Error for RankViolation {}

thread_local! {
    static HELD_MASK: Cell<u32> = const { Cell::new(0) };
    static HELD_COUNTS: Cell<[u16; Rank::COUNT]> = const { Cell::new([0; Rank::COUNT]) };
}

fn held_set() -> Vec<Rank> {
    let mask = HELD_MASK.with(|c| c.get());
    Rank::ALL.iter().copied().filter(|r| mask & r.mask() != 0).collect()
}

/// Checks that acquiring `rank` on the current thread would not violate the
/// partial order, panicking in debug builds and logging in release builds.
pub fn check_acquire(rank: Rank) {
    let held = HELD_MASK.with(|c| c.get());
    let mut forbidden = INCOMPATIBLE[rank as usize];
    if rank.is_concurrent() {
        // A thread may hold several instances of a concurrent rank at once,
        // provided each is for a different pool or requirement tree; only
        // the table's cross-rank bits apply here, not the self bit.
        forbidden &= !rank.mask();
    }
    if held & forbidden != 0 {
        let violation = RankViolation { attempted: rank, held: held_set() };
        tracing::error!(?violation, "lock rank violation");
        debug_assert!(false, "{violation}");
    }
}

/// Records that `rank` has just been acquired by the current thread.
pub fn note_acquired(rank: Rank) {
    HELD_COUNTS.with(|c| {
        let mut counts = c.get();
        counts[rank.index()] += 1;
        c.set(counts);
    });
    HELD_MASK.with(|c| c.set(c.get() | rank.mask()));
}

/// Records that `rank` has just been released by the current thread. Only
/// clears the held bit once the last concurrent instance of that rank is
/// released.
pub fn note_released(rank: Rank) {
    HELD_COUNTS.with(|c| {
        let mut counts = c.get();
        debug_assert!(counts[rank.index()] > 0, "unbalanced unlock of {rank:?}");
        counts[rank.index()] -= 1;
        let now_zero = counts[rank.index()] == 0;
        c.set(counts);
        if now_zero {
            HELD_MASK.with(|m| m.set(m.get() & !rank.mask()));
        }
    });
}

/// Debug-only probe: is `rank` currently held by this thread?
#[cfg(debug_assertions)]
pub fn is_held(rank: Rank) -> bool {
    HELD_MASK.with(|c| c.get()) & rank.mask() != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_forbids_reentering_outward() {
        note_acquired(Rank::ReqNodeLock);
        assert!(is_held(Rank::ReqNodeLock));
        // Acquiring TaskLock while ReqNodeLock is held is a violation; we
        // can't assert the panic here since debug_assert behavior varies by
        // build, but we can assert the table encodes it.
        assert_ne!(INCOMPATIBLE[Rank::TaskLock as usize] & Rank::ReqNodeLock.mask(), 0);
        note_released(Rank::ReqNodeLock);
        assert!(!is_held(Rank::ReqNodeLock));
    }

    #[test]
    fn concurrent_ranks_stack() {
        note_acquired(Rank::ResLookupLock);
        note_acquired(Rank::ResLookupLock);
        assert!(is_held(Rank::ResLookupLock));
        note_released(Rank::ResLookupLock);
        assert!(is_held(Rank::ResLookupLock));
        note_released(Rank::ResLookupLock);
        assert!(!is_held(Rank::ResLookupLock));
    }

    #[test]
    fn task_lock_allows_recursion_in_table() {
        assert_eq!(INCOMPATIBLE[Rank::TaskLock as usize] & Rank::TaskLock.mask(), 0);
        assert_ne!(INCOMPATIBLE[Rank::ReqNodeLock as usize] & Rank::ReqNodeLock.mask(), 0);
    }

    #[test]
    fn check_acquire_allows_second_instance_of_a_concurrent_rank() {
        note_acquired(Rank::ResLookupLock);
        check_acquire(Rank::ResLookupLock);
        note_acquired(Rank::ResLookupLock);
        assert!(is_held(Rank::ResLookupLock));
        note_released(Rank::ResLookupLock);
        note_released(Rank::ResLookupLock);
        assert!(!is_held(Rank::ResLookupLock));
    }
}
