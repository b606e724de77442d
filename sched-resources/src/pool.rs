// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A pool of typed resources, keyed by an application-defined integer id,
//! behind a spin-locked open-addressed hash.

use crate::entry::{Entry, EntryState, GroupKey, Owner};
use crate::error::Error;
use hashbrown::HashMap;
use sched_sync::{Rank, RankedMutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct FixRequest {
    pub id: u64,
    /// If the pool cannot satisfy this request, the whole batch may still
    /// succeed with this request left unresolved.
    pub optional: bool,
}

struct Inner<R> {
    entries: Vec<Entry<R>>,
    /// Open-addressed (via `hashbrown`) id -> entry index lookup. Only
    /// entries with `id.is_some()` appear here.
    lookup: HashMap<u64, usize>,
    nprovided: u32,
    ndetached: u32,
}

/// A pool of resources of one type, shared by every group that draws on a
/// [`crate::requirement::Requirement`] referencing it.
pub struct Pool<R> {
    resource_type: u32,
    maximum: u32,
    /// When set, a freed entry keeps its `id` (and cached `resource`)
    /// instead of being cleared, so a later fix of the same id is free.
    cache_unfixed: bool,
    inner: RankedMutex<Inner<R>>,
}

impl<R> Pool<R> {
    pub fn new(resource_type: u32, maximum: u32, cache_unfixed: bool) -> Self {
        let inner = Inner { entries: Vec::new(), lookup: HashMap::new(), nprovided: 0, ndetached: 0 };
        Self {
            resource_type,
            maximum,
            cache_unfixed,
            inner: RankedMutex::new(Rank::ResLookupLock, inner),
        }
    }

    pub fn resource_type(&self) -> u32 {
        self.resource_type
    }

    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    /// `nresources`: currently-live entries (free + provisioned + detached).
    pub fn live_count(&self) -> u32 {
        self.inner.lock().entries.len() as u32
    }

    pub fn provided_count(&self) -> u32 {
        self.inner.lock().nprovided
    }

    pub fn detached_count(&self) -> u32 {
        self.inner.lock().ndetached
    }

    /// Invariant: `nprovided + ndetached <= nresources <= maximum`.
    pub fn check_invariant(&self) -> bool {
        let inner = self.inner.lock();
        inner.nprovided + inner.ndetached <= inner.entries.len() as u32
            && inner.entries.len() as u32 <= self.maximum
    }

    /// Reserves `needed` raw entries for `group`, taking free entries first
    /// and allocating fresh ones up to `maximum`. Entries
    /// reserved this way are unfixed (no id) until a later [`Pool::fix`]
    /// call assigns one. Returns the indices reserved; on partial failure
    /// everything reserved so far is rolled back and `Err` is returned.
    pub fn reserve(&self, group: GroupKey, needed: u32) -> Result<Vec<usize>, Error> {
        let mut inner = self.inner.lock();
        if inner.nprovided + inner.ndetached + needed > self.maximum {
            return Err(Error::PoolExhausted { resource_type: self.resource_type });
        }
        let mut reserved = Vec::with_capacity(needed as usize);
        for _ in 0..needed {
            if let Some(idx) = inner
                .entries
                .iter()
                .position(|e| e.state == EntryState::Free && e.owner == Owner::Pool)
            {
                inner.entries[idx].owner = Owner::Group(group);
                reserved.push(idx);
            } else if (inner.entries.len() as u32) < self.maximum {
                let idx = inner.entries.len();
                let mut entry = Entry::new_free();
                entry.owner = Owner::Group(group);
                inner.entries.push(entry);
                reserved.push(idx);
            } else {
                // Roll back what we already reserved this call.
                for idx in reserved {
                    inner.entries[idx].owner = Owner::Pool;
                }
                return Err(Error::PoolExhausted { resource_type: self.resource_type });
            }
        }
        inner.nprovided += needed;
        Ok(reserved)
    }

    /// Releases entries owned by `group` back to the pool. Detached entries become pool-owned and bump
    /// `ndetached`; everything else becomes free and is reparented to
    /// `reparent_to` (the nearest requirement-bearing ancestor group, or
    /// `None` to hand it back to the pool outright).
    pub fn release_group(&self, group: GroupKey, reparent_to: Option<GroupKey>) {
        let mut inner = self.inner.lock();
        let mut released = 0u32;
        for entry in inner.entries.iter_mut() {
            if entry.owner != Owner::Group(group) {
                continue;
            }
            match entry.state {
                EntryState::Detached => {
                    entry.owner = Owner::Pool;
                }
                _ => {
                    released += 1;
                    entry.owner = match reparent_to {
                        Some(g) => Owner::Group(g),
                        None => Owner::Pool,
                    };
                    entry.state = EntryState::Free;
                    if !self.cache_unfixed {
                        entry.id = None;
                        entry.resource = None;
                    }
                }
            }
        }
        inner.nprovided = inner.nprovided.saturating_sub(released);
        let rebuild: Vec<(u64, usize)> = inner
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.id.map(|id| (id, i)))
            .collect();
        inner.lookup.clear();
        inner.lookup.extend(rebuild);
    }

    /// Marks a group-owned entry detached: it still counts against the
    /// group's footprint but is no longer touched until the group is
    /// deprovisioned.
    pub fn detach(&self, group: GroupKey, entry_index: usize) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[entry_index];
        debug_assert_eq!(entry.owner, Owner::Group(group));
        entry.state = EntryState::Detached;
        inner.ndetached += 1;
        inner.nprovided = inner.nprovided.saturating_sub(1);
    }

    /// The three-pass fix choreography. `fix_fn` is the user
    /// plug-in; it runs with the pool's spinlock released, as required so it
    /// may take any other lock without violating rank order.
    ///
    /// Returns one slot per request, in order; a request is `None` only if
    /// it was marked `optional` and the pool had no room for it.
    pub fn fix(
        &self,
        group: GroupKey,
        requests: &[FixRequest],
        fix_fn: impl Fn(u64) -> Option<R>,
    ) -> Result<Vec<Option<usize>>, Error> {
        enum Plan {
            // `already_provisioned`: this entry was already owned by `group`
            // (reserved or previously fixed) and so already counted in
            // `nprovided`; claiming it here must not count it again.
            Existing { index: usize, needs_fix: bool, already_provisioned: bool },
            New { needs_fix: bool },
        }

        let mut plans: Vec<Option<Plan>> = Vec::with_capacity(requests.len());
        {
            let inner = self.inner.lock();
            let mut taken = vec![false; inner.entries.len()];
            let mut new_needed = 0u32;

            for req in requests {
                let best = Self::pass1_best(&inner, &taken, group, req.id);
                if let Some(index) = best {
                    let entry = &inner.entries[index];
                    let needs_fix = !(entry.id == Some(req.id) && entry.resource.is_some());
                    let already_provisioned = entry.owner == Owner::Group(group);
                    taken[index] = true;
                    plans.push(Some(Plan::Existing { index, needs_fix, already_provisioned }));
                    continue;
                }
                if (inner.entries.len() as u32) + new_needed < self.maximum {
                    new_needed += 1;
                    plans.push(Some(Plan::New { needs_fix: true }));
                } else if req.optional {
                    plans.push(None);
                } else {
                    return Err(Error::PoolExhausted { resource_type: self.resource_type });
                }
            }
        }

        // Commit: mutate the table, then run user `fix` callbacks with the
        // lock released.
        let mut pending: Vec<(usize, usize, u64, bool)> = Vec::new(); // (request_idx, entry_idx, id, newly_counted)
        let mut waiting: Vec<(usize, usize)> = Vec::new(); // (request_idx, entry_idx) already Fixing elsewhere
        let mut results = vec![None; requests.len()];
        {
            let mut inner = self.inner.lock();
            let mut newly_provisioned = 0u32;
            for (req_idx, (req, plan)) in requests.iter().zip(plans.into_iter()).enumerate() {
                let Some(plan) = plan else { continue };
                match plan {
                    Plan::Existing { index, needs_fix, already_provisioned } => {
                        let entry = &mut inner.entries[index];
                        entry.owner = Owner::Group(group);
                        if !already_provisioned {
                            newly_provisioned += 1;
                        }
                        if needs_fix {
                            if entry.state == EntryState::Fixing {
                                waiting.push((req_idx, index));
                            } else {
                                entry.id = Some(req.id);
                                entry.resource = None;
                                entry.state = EntryState::Fixing;
                                inner.lookup.insert(req.id, index);
                                pending.push((req_idx, index, req.id, !already_provisioned));
                            }
                        } else {
                            results[req_idx] = Some(index);
                        }
                    }
                    Plan::New { .. } => {
                        let index = inner.entries.len();
                        let mut entry = Entry::new_free();
                        entry.owner = Owner::Group(group);
                        entry.id = Some(req.id);
                        entry.state = EntryState::Fixing;
                        inner.entries.push(entry);
                        inner.lookup.insert(req.id, index);
                        newly_provisioned += 1;
                        pending.push((req_idx, index, req.id, true));
                    }
                }
            }
            inner.nprovided += newly_provisioned;
        }

        for (req_idx, index, id, newly_counted) in pending {
            match fix_fn(id) {
                Some(resource) => {
                    let mut inner = self.inner.lock();
                    inner.entries[index].resource = Some(resource);
                    inner.entries[index].state = EntryState::Fixed;
                    results[req_idx] = Some(index);
                }
                None => {
                    let mut inner = self.inner.lock();
                    inner.entries[index].state = EntryState::Free;
                    inner.entries[index].owner = Owner::Pool;
                    if newly_counted {
                        inner.nprovided = inner.nprovided.saturating_sub(1);
                    }
                    return Err(Error::FixFailed { resource_type: self.resource_type });
                }
            }
        }

        for (req_idx, index) in waiting {
            self.spin_until_fixed(index, Duration::from_millis(200))?;
            results[req_idx] = Some(index);
        }

        Ok(results)
    }

    /// Reverses a successful `fix`: the entry is dropped back to `Free`
    /// (keeping its id and cached resource if `cache_unfixed`) or, if
    /// already `Detached`, left untouched — detaching is undone only by
    /// de-provisioning the owning group.
    pub fn unfix(&self, group: GroupKey, entry_index: usize) -> Option<R> {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[entry_index];
        debug_assert_eq!(entry.owner, Owner::Group(group));
        if entry.state == EntryState::Detached {
            return None;
        }
        let resource = entry.resource.take();
        entry.state = EntryState::Free;
        inner.nprovided = inner.nprovided.saturating_sub(1);
        if !self.cache_unfixed {
            if let Some(id) = entry.id.take() {
                inner.lookup.remove(&id);
            }
        }
        resource
    }

    pub fn with_entry<T>(&self, entry_index: usize, f: impl FnOnce(&Entry<R>) -> T) -> T {
        let inner = self.inner.lock();
        f(&inner.entries[entry_index])
    }

    fn pass1_best(inner: &Inner<R>, taken: &[bool], group: GroupKey, id: u64) -> Option<usize> {
        // Preference 1: same id, owned by this group, any non-free state.
        if let Some(&idx) = inner.lookup.get(&id) {
            let e = &inner.entries[idx];
            if !taken[idx] && e.owner == Owner::Group(group) && e.state != EntryState::Free {
                return Some(idx);
            }
        }
        // Preference 2: any id, owned by this group, free.
        if let Some((idx, _)) = inner
            .entries
            .iter()
            .enumerate()
            .find(|(i, e)| !taken[*i] && e.owner == Owner::Group(group) && e.state == EntryState::Free)
        {
            return Some(idx);
        }
        // Preference 3: same id, free, owned by the pool or an ancestor —
        // never another live group's reserved-but-unfixed slot.
        if let Some(&idx) = inner.lookup.get(&id) {
            let e = &inner.entries[idx];
            if !taken[idx] && e.state == EntryState::Free && e.owner == Owner::Pool {
                return Some(idx);
            }
        }
        // Preference 4: any id, free, owned by the pool or an ancestor.
        inner
            .entries
            .iter()
            .enumerate()
            .find(|(i, e)| !taken[*i] && e.state == EntryState::Free && e.owner == Owner::Pool)
            .map(|(idx, _)| idx)
    }

    fn spin_until_fixed(&self, index: usize, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            {
                let inner = self.inner.lock();
                match inner.entries[index].state {
                    EntryState::Fixed => return Ok(()),
                    EntryState::Free => {
                        return Err(Error::FixFailed { resource_type: self.resource_type })
                    }
                    _ => {}
                }
            }
            if start.elapsed() > timeout {
                return Err(Error::FixFailed { resource_type: self.resource_type });
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

