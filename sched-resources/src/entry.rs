// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resource entries: the unit of ownership inside a [`crate::pool::Pool`].

/// Opaque owner key for a group, supplied by the embedder (`sched-core`'s
/// `GroupId` converts to/from this so this crate stays independent of the
/// task graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Pool,
    Group(GroupKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Free,
    Fixing,
    Fixed,
    Detached,
}

/// A single slot in a resource pool.
///
/// Invariants: an entry with `state == Free` has no id unless the
/// pool caches unfixed entries; an entry with `state` in `{Fixing, Fixed,
/// Detached}` is owned by a group.
#[derive(Debug)]
pub struct Entry<R> {
    pub(crate) state: EntryState,
    pub(crate) owner: Owner,
    pub(crate) id: Option<u64>,
    pub(crate) resource: Option<R>,
}

impl<R> Entry<R> {
    pub(crate) fn new_free() -> Self {
        Self { state: EntryState::Free, owner: Owner::Pool, id: None, resource: None }
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn resource(&self) -> Option<&R> {
        self.resource.as_ref()
    }
}
