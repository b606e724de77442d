// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks: the atomic unit of work.

use crate::arena::Index;
use crate::error::Reason;
use crate::group::GroupId;
use crate::link::LinkId;
use sched_sync::RankedCondvar;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type TaskId = Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Constructing,
    Depending,
    Ready,
    Cancelled,
    Running,
    Cancelling,
    Finalising,
    Done,
}

/// An ordering of a task's current eligibility, used by the helper/dispatch/
/// join searches. Declaration order IS the preference
/// order: variants compare with the derived `Ord`, and a search prefers the
/// smallest class it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Runnability {
    /// Ready, provisioned, and the designated joiner of no groups with
    /// outstanding members (or joiner of nothing at all) — cheapest to run
    /// recursively since it cannot itself block on a join.
    JoinsNothing,
    JoinsEmptyGroup,
    JoinsMaybeEmptyGroup,
    JoinsNonEmptyGroup,
    /// Already executing on another thread; a searcher can only wait on it.
    Running,
    /// Ready but its group has not been provisioned yet.
    ReadyUnprovisioned,
}

impl Runnability {
    /// The highest class the join/helper paths will still run recursively
    /// on the calling thread: if found and class≤helpable, run recursively
    /// on this thread.
    pub const HELPABLE_MAX: Runnability = Runnability::JoinsNonEmptyGroup;

    pub fn is_helpable(self) -> bool {
        self <= Self::HELPABLE_MAX
    }
}

// `is_helpable` relies on derived `Ord` following declaration order; this
// pins that assumption so a reordering of the variants above trips a
// compile error here instead of silently changing dispatch preference.
static_assertions::const_assert!(
    (Runnability::HELPABLE_MAX as u8) < (Runnability::Running as u8)
        && (Runnability::Running as u8) < (Runnability::ReadyUnprovisioned as u8)
);

pub type Worker = dyn Fn() -> bool + Send + Sync;
pub type Cleanup = dyn Fn() + Send + Sync;

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_trace_id() -> u64 {
    NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A task's data as held in the scheduler's arena. Unlike a C
/// worker/cleanup/args triple, a worker closure captures whatever state it
/// needs directly — the idiomatic Rust equivalent of a function pointer
/// plus an opaque argument.
pub struct Task {
    pub(crate) state: TaskState,
    pub(crate) runnability: Runnability,
    pub(crate) refcount: u32,
    pub(crate) group: GroupId,
    pub(crate) worker: Option<Arc<Worker>>,
    pub(crate) cleanup: Option<Arc<Cleanup>>,
    pub(crate) pre_links: Vec<LinkId>,
    pub(crate) post_links: Vec<LinkId>,
    /// Groups this task is the designated joiner of: a task joins
    /// at most the groups it constructed; a task may be the joiner of
    /// several groups.
    pub(crate) joins: Vec<GroupId>,
    pub(crate) trace_id: u64,
    pub(crate) waiting_on: Option<Arc<RankedCondvar>>,
    pub(crate) success: bool,
    pub(crate) failure_reason: Option<Reason>,
    /// Schedule-recomputation scratch (used by the schedule rebuild's second pass).
    pub(crate) mark: i64,
}

impl Task {
    pub(crate) fn new(group: GroupId, worker: Option<Arc<Worker>>, cleanup: Option<Arc<Cleanup>>) -> Self {
        Self {
            state: TaskState::Constructing,
            runnability: Runnability::ReadyUnprovisioned,
            refcount: 2, // returned handle + group list
            group,
            worker,
            cleanup,
            pre_links: Vec::new(),
            post_links: Vec::new(),
            joins: Vec::new(),
            trace_id: next_trace_id(),
            waiting_on: None,
            success: false,
            failure_reason: None,
            mark: 0,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn runnability(&self) -> Runnability {
        self.runnability
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn failure_reason(&self) -> Option<Reason> {
        self.failure_reason
    }

    pub fn is_cancelling(&self) -> bool {
        matches!(self.state, TaskState::Cancelling | TaskState::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runnability_order_prefers_joins_nothing() {
        assert!(Runnability::JoinsNothing < Runnability::Running);
        assert!(Runnability::JoinsNonEmptyGroup.is_helpable());
        assert!(!Runnability::Running.is_helpable());
        assert!(!Runnability::ReadyUnprovisioned.is_helpable());
    }
}
