// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task groups: hierarchical containers of tasks, joined exactly once.

use crate::arena::Index;
use crate::error::Reason;
use crate::task::TaskId;
use sched_resources::{NodeId, Requirement};
use std::sync::Arc;

pub type GroupId = Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Constructing,
    Active,
    Closed,
    Cancelled,
    Joined,
}

/// Why provisioning last left a group in its current state: provisioned,
/// deprovisioned, cancelled, or one of several failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStatus {
    Unprovisioned,
    Provisioned,
    Deprovisioned,
    Cancelled,
    Failed(Reason),
}

/// An application-defined tag identifying what kind of requirement-tree
/// node a group's type maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupType(pub u32);

pub struct TaskGroup<R> {
    pub(crate) state: GroupState,
    pub(crate) refcount: u32,
    pub(crate) parent: Option<GroupId>,
    pub(crate) children: Vec<GroupId>,
    pub(crate) tasks: Vec<TaskId>,
    /// `None` means "join with parent".
    pub(crate) joiner: Option<TaskId>,
    pub(crate) requirement: Option<Arc<Requirement<R>>>,
    pub(crate) requirement_node: Option<NodeId>,
    pub(crate) provision_status: ProvisionStatus,
    /// Snapshot of the global resource generation at the last provisioning
    /// attempt, to avoid re-trying under unchanged conditions.
    pub(crate) resource_generation_snapshot: u64,
    pub(crate) group_type: GroupType,
    pub(crate) result_ok: bool,
    pub(crate) error_reason: Option<Reason>,
    pub(crate) trace_id: u64,
}

impl<R> TaskGroup<R> {
    pub(crate) fn new(
        parent: Option<GroupId>,
        group_type: GroupType,
        requirement: Option<Arc<Requirement<R>>>,
        requirement_node: Option<NodeId>,
    ) -> Self {
        Self {
            state: GroupState::Constructing,
            refcount: 1,
            parent,
            children: Vec::new(),
            tasks: Vec::new(),
            joiner: None,
            requirement,
            requirement_node,
            provision_status: ProvisionStatus::Unprovisioned,
            resource_generation_snapshot: 0,
            group_type,
            result_ok: true,
            error_reason: None,
            trace_id: crate::task::next_trace_id(),
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    pub fn children(&self) -> &[GroupId] {
        &self.children
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn joiner(&self) -> Option<TaskId> {
        self.joiner
    }

    pub fn provision_status(&self) -> ProvisionStatus {
        self.provision_status
    }

    pub fn group_type(&self) -> GroupType {
        self.group_type
    }

    pub fn error_reason(&self) -> Option<Reason> {
        self.error_reason
    }

    pub fn is_open_to_outside_creators(&self) -> bool {
        matches!(self.state, GroupState::Constructing | GroupState::Active)
    }
}
