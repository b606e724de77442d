// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task links: two-way dependency edges (`depend`/`replace`).

use crate::arena::{Arena, Index};
use crate::error::{Reason, SchedError};
use crate::task::{Task, TaskId, TaskState};

pub type LinkId = Index;

/// A small two-way edge between two tasks, carrying one reference on each
/// endpoint; lives on both endpoints' `pre_links`/`post_links` lists.
pub struct TaskLink {
    pub pre: TaskId,
    pub post: TaskId,
}

/// `depend(pre, post)`: adds an edge from `pre` to `post`.
///
/// `post` must be `Constructing` or `Depending` on the current task,
/// enforced by an assertion-grade predecessor walk — here a recoverable
/// `Err` rather than a panic, since a library should not abort its caller's
/// process over a misuse it can report. If `pre` has already finished
/// successfully, no link is created. If `pre` has failed or been cancelled,
/// `post` is cancelled instead and the caller is told to propagate that
/// cancellation (returns `Ok(None)` for "no link, nothing else to do",
/// `Ok(Some(link))` for a real edge, and the post's failure reason when a
/// cancellation was triggered so the caller can propagate it).
pub fn depend(
    tasks: &mut Arena<Task>,
    links: &mut Arena<TaskLink>,
    pre: TaskId,
    post: TaskId,
) -> Result<Option<LinkId>, SchedError> {
    if pre == post {
        return Err(SchedError::SelfDependency);
    }
    let post_task = tasks.get(post).ok_or(SchedError::InvalidDependency)?;
    if !matches!(post_task.state, TaskState::Constructing | TaskState::Depending) {
        return Err(SchedError::InvalidDependency);
    }

    let pre_task = tasks.get(pre).ok_or(SchedError::InvalidDependency)?;
    match pre_task.state {
        TaskState::Done if pre_task.success => return Ok(None),
        TaskState::Done | TaskState::Cancelled => {
            let reason = pre_task.failure_reason.unwrap_or(Reason::WorkerFailed);
            cancel_task(tasks, post, reason);
            return Ok(None);
        }
        _ => {}
    }

    let link_id = links.insert(TaskLink { pre, post });
    tasks.get_mut(pre).unwrap().post_links.push(link_id);
    tasks.get_mut(post).unwrap().pre_links.push(link_id);
    let post_task = tasks.get_mut(post).unwrap();
    if post_task.state == TaskState::Constructing {
        post_task.state = TaskState::Depending;
    }
    Ok(Some(link_id))
}

/// `replace(r, in, out)`: splices two tasks `in_task`/`out_task` in for one
/// existing task `r`, transferring `r`'s incoming edges to `in_task` and
/// outgoing edges to `out_task`, and inserting `in_task -> out_task` if
/// distinct. Permitted only when `r` is constructing, is depending on the
/// current task, or is the current task itself.
pub fn replace(
    tasks: &mut Arena<Task>,
    links: &mut Arena<TaskLink>,
    r: TaskId,
    in_task: TaskId,
    out_task: TaskId,
    current: Option<TaskId>,
) -> Result<(), SchedError> {
    if r == in_task && in_task == out_task {
        return Ok(()); // replace(r, r, r) is a no-op.
    }
    let r_task = tasks.get(r).ok_or(SchedError::InvalidDependency)?;
    let permitted = matches!(r_task.state, TaskState::Constructing | TaskState::Depending) || Some(r) == current;
    if !permitted {
        return Err(SchedError::InvalidDependency);
    }

    let pre_links: Vec<LinkId> = tasks.get(r).unwrap().pre_links.clone();
    let post_links: Vec<LinkId> = tasks.get(r).unwrap().post_links.clone();

    for link_id in pre_links {
        if let Some(link) = links.get_mut(link_id) {
            link.post = in_task;
        }
        tasks.get_mut(in_task).unwrap().pre_links.push(link_id);
    }
    for link_id in post_links {
        if let Some(link) = links.get_mut(link_id) {
            link.pre = out_task;
        }
        tasks.get_mut(out_task).unwrap().post_links.push(link_id);
    }
    tasks.get_mut(r).unwrap().pre_links.clear();
    tasks.get_mut(r).unwrap().post_links.clear();

    if in_task != out_task {
        depend(tasks, links, in_task, out_task)?;
    }
    Ok(())
}

/// Cancellation propagated through a dependency edge:
/// not the full group-cancelling `cancel`, just the single task's
/// transition plus reason capture. Group-level propagation is driven from
/// `crate::group`.
pub(crate) fn cancel_task(tasks: &mut Arena<Task>, task: TaskId, reason: Reason) {
    let Some(t) = tasks.get_mut(task) else { return };
    if matches!(t.state, TaskState::Done | TaskState::Cancelled) {
        return;
    }
    t.state = match t.state {
        TaskState::Running => TaskState::Cancelling,
        _ => TaskState::Cancelled,
    };
    t.success = false;
    t.failure_reason = Some(reason);
    if let Some(condvar) = t.waiting_on.take() {
        condvar.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupId;

    fn dummy_task(tasks: &mut Arena<Task>, group: GroupId) -> TaskId {
        tasks.insert(Task::new(group, None, None))
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut tasks = Arena::new();
        let mut links = Arena::new();
        let group = GroupId { index: 0, generation: 0 };
        let a = dummy_task(&mut tasks, group);
        assert_eq!(depend(&mut tasks, &mut links, a, a), Err(SchedError::SelfDependency));
    }

    #[test]
    fn depend_creates_link_and_marks_depending() {
        let mut tasks = Arena::new();
        let mut links = Arena::new();
        let group = GroupId { index: 0, generation: 0 };
        let a = dummy_task(&mut tasks, group);
        let b = dummy_task(&mut tasks, group);
        let link = depend(&mut tasks, &mut links, a, b).unwrap();
        assert!(link.is_some());
        assert_eq!(tasks.get(b).unwrap().state, TaskState::Depending);
        assert_eq!(tasks.get(b).unwrap().pre_links.len(), 1);
        assert_eq!(tasks.get(a).unwrap().post_links.len(), 1);
    }

    #[test]
    fn depend_on_failed_predecessor_cancels_successor() {
        let mut tasks = Arena::new();
        let mut links = Arena::new();
        let group = GroupId { index: 0, generation: 0 };
        let a = dummy_task(&mut tasks, group);
        let b = dummy_task(&mut tasks, group);
        tasks.get_mut(a).unwrap().state = TaskState::Done;
        tasks.get_mut(a).unwrap().success = false;
        tasks.get_mut(a).unwrap().failure_reason = Some(Reason::WorkerFailed);

        let link = depend(&mut tasks, &mut links, a, b).unwrap();
        assert!(link.is_none());
        assert_eq!(tasks.get(b).unwrap().state, TaskState::Cancelled);
    }

    #[test]
    fn replace_self_is_noop() {
        let mut tasks = Arena::new();
        let mut links = Arena::new();
        let group = GroupId { index: 0, generation: 0 };
        let a = dummy_task(&mut tasks, group);
        assert!(replace(&mut tasks, &mut links, a, a, a, None).is_ok());
    }
}
