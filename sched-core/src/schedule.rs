// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The global schedule: an ordered sequence of tasks and a parallel
//! sequence of unprovisioned groups, rebuilt by a two-pass topological sort
//! whenever a dependency edge changes.

use crate::arena::Arena;
use crate::group::{GroupId, ProvisionStatus, TaskGroup};
use crate::link::{LinkId, TaskLink};
use crate::task::{Task, TaskId};
use hashbrown::{HashMap, HashSet};

pub struct GlobalSchedule {
    tasks: Vec<TaskId>,
    groups: Vec<GroupId>,
    dirty: bool,
}

impl Default for GlobalSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalSchedule {
    pub fn new() -> Self {
        Self { tasks: Vec::new(), groups: Vec::new(), dirty: true }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn unprovisioned_groups(&self) -> &[GroupId] {
        &self.groups
    }

    /// Rebuilds both lists if `dirty`; a no-op otherwise (spec: "traversal
    /// is unordered otherwise").
    pub fn recompute<R>(
        &mut self,
        tasks: &Arena<Task>,
        groups: &Arena<TaskGroup<R>>,
        links: &Arena<TaskLink>,
        root: GroupId,
    ) {
        if !self.dirty {
            return;
        }
        let (task_order, group_order) = pass_a(tasks, groups, links, root);
        #[cfg(debug_assertions)]
        check_acyclic(tasks, links, &task_order);

        let (task_order, group_order) = pass_b(tasks, groups, links, task_order, group_order);
        self.tasks = task_order;
        self.groups = group_order;
        self.dirty = false;
    }
}

/// Pass A: depth-first predecessor walk. Every task is appended to the
/// tail of the task order only after all of its predecessors have been
/// appended (a standard DFS post-order topological sort); every
/// still-unprovisioned group is appended the first time one of its tasks
/// is first visited (pre-order, deduplicated). The result is *a* valid
/// topological order, not yet biased for provisioning — that is Pass B's
/// job.
fn pass_a<R>(
    tasks: &Arena<Task>,
    groups: &Arena<TaskGroup<R>>,
    links: &Arena<TaskLink>,
    root: GroupId,
) -> (Vec<TaskId>, Vec<GroupId>) {
    let mut task_order = Vec::new();
    let mut group_order = Vec::new();
    let mut visited_tasks = HashSet::new();
    let mut visited_groups = HashSet::new();

    fn visit_task(
        id: TaskId,
        tasks: &Arena<Task>,
        links: &Arena<TaskLink>,
        groups_seen: &mut HashSet<GroupId>,
        group_order: &mut Vec<GroupId>,
        visited: &mut HashSet<TaskId>,
        order: &mut Vec<TaskId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        let Some(task) = tasks.get(id) else { return };
        if groups_seen.insert(task.group) {
            group_order.push(task.group);
        }
        for &link_id in &task.pre_links {
            if let Some(link) = links.get(link_id) {
                visit_task(link.pre, tasks, links, groups_seen, group_order, visited, order);
            }
        }
        order.push(id);
    }

    fn visit_group<R>(
        id: GroupId,
        groups: &Arena<TaskGroup<R>>,
        tasks: &Arena<Task>,
        links: &Arena<TaskLink>,
        visited_groups: &mut HashSet<GroupId>,
        visited_tasks: &mut HashSet<TaskId>,
        task_order: &mut Vec<TaskId>,
        group_order: &mut Vec<GroupId>,
    ) {
        if !visited_groups.insert(id) {
            return;
        }
        let Some(group) = groups.get(id) else { return };
        if group.provision_status == ProvisionStatus::Unprovisioned && !group_order.contains(&id) {
            group_order.push(id);
        }
        for &task_id in &group.tasks {
            visit_task(task_id, tasks, links, visited_groups, group_order, visited_tasks, task_order);
        }
        for &child in &group.children {
            visit_group(child, groups, tasks, links, visited_groups, visited_tasks, task_order, group_order);
        }
    }

    visit_group(root, groups, tasks, links, &mut visited_groups, &mut visited_tasks, &mut task_order, &mut group_order);
    (task_order, group_order)
}

/// Pass B: walks the task order tail to head, assigning each task a
/// decreasing mark. A predecessor in the same group gets `mark - 1`; a
/// predecessor in a different group gets `mark - group_size` (so
/// cross-group predecessors sort ahead of their dependent group's first
/// task), and the predecessor's *group* mark is reduced by the same
/// amount. Tasks and groups are then stable-sorted by mark.
fn pass_b<R>(
    tasks: &Arena<Task>,
    groups: &Arena<TaskGroup<R>>,
    links: &Arena<TaskLink>,
    task_order: Vec<TaskId>,
    group_order: Vec<GroupId>,
) -> (Vec<TaskId>, Vec<GroupId>) {
    let mut task_mark: HashMap<TaskId, i64> = task_order.iter().map(|&id| (id, 0)).collect();
    let mut group_mark: HashMap<GroupId, i64> = group_order.iter().map(|&id| (id, 0)).collect();
    let group_size = |g: GroupId| groups.get(g).map(|grp| grp.tasks.len() as i64).unwrap_or(1).max(1);

    for &id in task_order.iter().rev() {
        let Some(task) = tasks.get(id) else { continue };
        let current = *task_mark.get(&id).unwrap_or(&0);
        for &link_id in &task.pre_links {
            let Some(pre_id) = predecessor_of(links, link_id) else { continue };
            let Some(pre_task) = tasks.get(pre_id) else { continue };
            let delta = if pre_task.group == task.group { 1 } else { group_size(pre_task.group) };
            let new_mark = current - delta;
            let entry = task_mark.entry(pre_id).or_insert(0);
            if new_mark < *entry {
                *entry = new_mark;
            }
            if pre_task.group != task.group {
                let gentry = group_mark.entry(pre_task.group).or_insert(0);
                if new_mark < *gentry {
                    *gentry = new_mark;
                }
            }
        }
    }

    let mut order = task_order;
    let mut groups_out = group_order;
    order.sort_by_key(|id| *task_mark.get(id).unwrap_or(&0));
    groups_out.sort_by_key(|id| *group_mark.get(id).unwrap_or(&0));
    (order, groups_out)
}

fn predecessor_of(links: &Arena<TaskLink>, link_id: LinkId) -> Option<TaskId> {
    links.get(link_id).map(|link| link.pre)
}

/// Debug-only cycle check on the derived group-to-group dependency graph;
/// the dependency graph is not asserted acyclic elsewhere, so this exists
/// as an explicit cycle-check diagnostic in debug builds. Walks
/// the task predecessor DAG a second time with a white/gray/black coloring;
/// panics naming the offending cycle if a back-edge into a gray node is
/// found. Pass A's DFS already can't loop forever (it dedups via
/// `visited`), so this exists purely to surface a logic error rather than
/// to protect Pass A itself.
#[cfg(debug_assertions)]
fn check_acyclic(tasks: &Arena<Task>, links: &Arena<TaskLink>, order: &[TaskId]) {
    #[derive(PartialEq, Eq, Clone, Copy)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut color: HashMap<TaskId, Color> = order.iter().map(|&id| (id, Color::White)).collect();
    let mut stack = Vec::new();

    fn visit(
        id: TaskId,
        tasks: &Arena<Task>,
        links: &Arena<TaskLink>,
        color: &mut HashMap<TaskId, Color>,
        stack: &mut Vec<TaskId>,
    ) {
        match color.get(&id) {
            Some(Color::Black) | None => return,
            Some(Color::Gray) => {
                stack.push(id);
                panic!("cycle detected in task dependency graph: {stack:?}");
            }
            Some(Color::White) => {}
        }
        color.insert(id, Color::Gray);
        stack.push(id);
        if let Some(task) = tasks.get(id) {
            for &link_id in &task.pre_links {
                if let Some(link) = links.get(link_id) {
                    visit(link.pre, tasks, links, color, stack);
                }
            }
        }
        stack.pop();
        color.insert(id, Color::Black);
    }

    for &id in order {
        visit(id, tasks, links, &mut color, &mut stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupType;
    use crate::link::depend;
    use crate::task::Task;

    #[test]
    fn recompute_orders_predecessors_before_dependents() {
        let mut tasks = Arena::new();
        let mut groups: Arena<TaskGroup<()>> = Arena::new();
        let mut links = Arena::new();
        let root = groups.insert(TaskGroup::new(None, GroupType(0), None, None));
        let a = tasks.insert(Task::new(root, None, None));
        let b = tasks.insert(Task::new(root, None, None));
        groups.get_mut(root).unwrap().tasks = vec![a, b];
        depend(&mut tasks, &mut links, a, b).unwrap();

        let mut schedule = GlobalSchedule::new();
        schedule.recompute(&tasks, &groups, &links, root);
        let pos_a = schedule.tasks().iter().position(|&t| t == a).unwrap();
        let pos_b = schedule.tasks().iter().position(|&t| t == b).unwrap();
        assert!(pos_a < pos_b);
    }
}
