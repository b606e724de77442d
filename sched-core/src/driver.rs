// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler driver: dispatcher/helper/join loops, generation-guarded
//! scans, thread extension, and provisioning glue.

use crate::context::{SpecialiserContext, ThreadContext, WaitState};
use crate::error::Reason;
use crate::group::{GroupId, GroupState, ProvisionStatus};
use crate::task::{Runnability, Task, TaskId, TaskState};
use crate::{GraphState, Scheduler};
use hashbrown::HashSet;
use sched_resources::GroupKey;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn group_key(id: GroupId) -> GroupKey {
    GroupKey(((id.index as u64) << 32) | id.generation as u64)
}

/// The pool thread main loop ("Dispatcher"): while
/// current-scheduled < active-limit, look for a dispatchable task and run
/// it; otherwise wait in state=wait-dispatch.
pub(crate) fn dispatcher_loop<R: Send + Sync + 'static>(scheduler: &Scheduler<R>, ctx: Arc<ThreadContext>) {
    loop {
        if scheduler.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut guard = scheduler.state.lock();
        guard.schedule.recompute(&guard.tasks, &guard.groups, &guard.links, guard.root);

        if guard.constrained {
            ctx.set_state(WaitState::WaitDispatch);
            let _ = ctx.condvar.wait_timeout(guard, Some(Duration::from_millis(50)));
            ctx.set_state(WaitState::Running);
            continue;
        }

        if let Some(task_id) = find_dispatchable(&mut guard) {
            let task = guard.tasks.get_mut(task_id).unwrap();
            task.state = TaskState::Running;
            task.runnability = Runnability::Running;
            drop(guard);
            run_task(scheduler, task_id, Some(ctx.as_ref()));
            continue;
        }

        ctx.set_state(WaitState::WaitDispatch);
        let timeout = guard.params.task_helper_wait().or(Some(Duration::from_millis(100)));
        let _ = ctx.condvar.wait_timeout(guard, timeout);
        ctx.set_state(WaitState::Running);
    }
}

/// Finds a task whose runnability is helpable, or a ready-but-unprovisioned
/// one whose group can be provisioned right now, attempting that
/// provisioning inline.
fn find_dispatchable<R>(state: &mut GraphState<R>) -> Option<TaskId> {
    let candidates: Vec<TaskId> = state.schedule.tasks().to_vec();
    let resource_gen = state.gens.resource();
    for id in candidates {
        let Some(task) = state.tasks.get(id) else { continue };
        if task.state != TaskState::Ready {
            continue;
        }
        let group = task.group;
        let class = classify_runnability(state, id);
        if class.is_helpable() {
            return Some(id);
        }
        if class == Runnability::ReadyUnprovisioned {
            // Don't retry a provisioning attempt against unchanged pool
            // state; `resource_generation_snapshot` is bumped to the
            // current generation on the last failed attempt and cleared
            // implicitly whenever the global generation advances.
            let tried_since_change = state
                .groups
                .get(group)
                .map(|g| g.resource_generation_snapshot == resource_gen)
                .unwrap_or(false);
            if tried_since_change {
                continue;
            }
            if try_provision_group(state, group) {
                return Some(id);
            }
        }
    }
    None
}

/// Executes a task's worker on the calling thread through the
/// specialiser chain, then its cleanup, then finalizes its state. Used by
/// the dispatcher, the helper path, and `join`'s recursive-activation step
/// alike, modeling the call stack as a stack of (task, previous-task)
/// frames in the thread context.
pub(crate) fn run_task<R: Send + Sync + 'static>(
    scheduler: &Scheduler<R>,
    task_id: TaskId,
    ctx: Option<&ThreadContext>,
) {
    let (worker, cleanup) = {
        let guard = scheduler.state.lock();
        match guard.tasks.get(task_id) {
            Some(t) => (t.worker.clone(), t.cleanup.clone()),
            None => return,
        }
    };

    let thread_id = ctx.map(|c| c.id).unwrap_or(0);
    let mut spec_ctx = SpecialiserContext { task: task_id, thread_id };
    let chain = scheduler.specialiser_chain.lock().unwrap().clone();
    let mut success = true;
    chain.run(&mut spec_ctx, &mut |_ctx| {
        success = match &worker {
            Some(w) => w(),
            None => true,
        };
    });
    if let Some(c) = &cleanup {
        c();
    }

    let mut guard = scheduler.state.lock();
    finish_task(&mut guard, task_id, success);
    wake_all(&guard);
}

fn finish_task<R>(state: &mut GraphState<R>, task_id: TaskId, success: bool) {
    // A task cancelled while `Running` was already subtracted from
    // `incomplete_count` by `propagate_cancel`/`cancel_group` at the moment
    // it moved to `Cancelling`; don't double-count it here, and don't
    // clobber the reason it was cancelled for with a generic worker-failure
    // reason.
    let was_cancelling = {
        let Some(task) = state.tasks.get_mut(task_id) else { return };
        let was_cancelling = task.state == TaskState::Cancelling;
        task.state = TaskState::Done;
        task.success = success;
        task.runnability = Runnability::JoinsNothing;
        if !success && task.failure_reason.is_none() {
            task.failure_reason = Some(Reason::WorkerFailed);
        }
        was_cancelling
    };
    if !was_cancelling {
        state.incomplete_count = state.incomplete_count.saturating_sub(1);
    }

    let (post_links, reason) = {
        let task = state.tasks.get(task_id).unwrap();
        (task.post_links.clone(), task.failure_reason)
    };
    for link_id in post_links {
        let Some(post) = state.links.get(link_id).map(|l| l.post) else { continue };
        if success {
            maybe_ready(state, post);
        } else {
            propagate_cancel(state, post, reason.unwrap_or(Reason::WorkerFailed));
        }
    }
    state.schedule.mark_dirty();
}

/// Cancellation cascades strictly along dependency edges: if a predecessor
/// has failed or been cancelled, its successor is cancelled and the
/// cancellation propagates further. It does NOT climb into the owning
/// group — only an explicit `cancel(group)` call does that.
pub(crate) fn propagate_cancel<R>(state: &mut GraphState<R>, task_id: TaskId, reason: Reason) {
    let mut stack = vec![task_id];
    while let Some(id) = stack.pop() {
        let already_terminal = matches!(
            state.tasks.get(id).map(|t| t.state),
            Some(TaskState::Done) | Some(TaskState::Cancelled)
        );
        if already_terminal {
            continue;
        }
        let was_incomplete = state
            .tasks
            .get(id)
            .map(|t| !matches!(t.state, TaskState::Done | TaskState::Cancelled))
            .unwrap_or(false);
        crate::link::cancel_task(&mut state.tasks, id, reason);
        if was_incomplete {
            state.incomplete_count = state.incomplete_count.saturating_sub(1);
        }
        let post_links = state.tasks.get(id).map(|t| t.post_links.clone()).unwrap_or_default();
        for link_id in post_links {
            if let Some(post) = state.links.get(link_id).map(|l| l.post) {
                stack.push(post);
            }
        }
    }
    state.schedule.mark_dirty();
}

fn maybe_ready<R>(state: &mut GraphState<R>, task_id: TaskId) {
    let Some(task) = state.tasks.get(task_id) else { return };
    if task.state != TaskState::Depending {
        return;
    }
    let pre_links = task.pre_links.clone();
    let all_done = pre_links.iter().all(|&l| {
        state
            .links
            .get(l)
            .and_then(|link| state.tasks.get(link.pre))
            .map(|p| p.state == TaskState::Done && p.success)
            .unwrap_or(true)
    });
    if all_done {
        state.tasks.get_mut(task_id).unwrap().state = TaskState::Ready;
        state.schedule.mark_dirty();
    }
}

/// An ordering of a task's eligibility, reconstructed on demand from
/// current state rather than cached, so it can never drift out of sync
/// with the task/group it describes.
pub(crate) fn classify_runnability<R>(state: &GraphState<R>, task_id: TaskId) -> Runnability {
    let Some(task) = state.tasks.get(task_id) else { return Runnability::JoinsNothing };
    // `Cancelling`/`Finalising` are still executing on the worker thread that
    // owns them; a searcher must wait, never re-run them on another thread.
    if matches!(task.state, TaskState::Running | TaskState::Cancelling | TaskState::Finalising) {
        return Runnability::Running;
    }
    if matches!(task.state, TaskState::Constructing | TaskState::Depending) {
        return Runnability::ReadyUnprovisioned;
    }
    if task.state != TaskState::Ready {
        return Runnability::JoinsNothing;
    }
    if let Some(group) = state.groups.get(task.group) {
        if group.requirement.is_some() && group.provision_status != ProvisionStatus::Provisioned {
            return Runnability::ReadyUnprovisioned;
        }
    }
    if task.joins.is_empty() {
        return Runnability::JoinsNothing;
    }
    let mut worst = Runnability::JoinsEmptyGroup;
    for &joined in &task.joins {
        let Some(jg) = state.groups.get(joined) else { continue };
        let class = if jg.tasks.is_empty() && jg.children.is_empty() {
            Runnability::JoinsEmptyGroup
        } else if jg.state == GroupState::Active {
            Runnability::JoinsMaybeEmptyGroup
        } else {
            Runnability::JoinsNonEmptyGroup
        };
        if class > worst {
            worst = class;
        }
    }
    worst
}

fn collect_subtree<R>(state: &GraphState<R>, group: GroupId) -> HashSet<GroupId> {
    let mut set = HashSet::new();
    let mut stack = vec![group];
    while let Some(g) = stack.pop() {
        if !set.insert(g) {
            continue;
        }
        if let Some(grp) = state.groups.get(g) {
            for &c in &grp.children {
                stack.push(c);
            }
        }
    }
    set
}

fn find_join_predecessor<R>(state: &GraphState<R>, group: GroupId) -> Option<(TaskId, Runnability)> {
    let subtree = collect_subtree(state, group);
    let mut best: Option<(TaskId, Runnability)> = None;
    for (id, task) in state.tasks.iter() {
        if !subtree.contains(&task.group) {
            continue;
        }
        if matches!(task.state, TaskState::Done | TaskState::Cancelled) {
            continue;
        }
        let class = classify_runnability(state, id);
        if best.map(|(_, b)| class < b).unwrap_or(true) {
            best = Some((id, class));
        }
    }
    best
}

pub(crate) fn try_provision_group<R>(state: &mut GraphState<R>, group: GroupId) -> bool {
    let Some(g) = state.groups.get(group) else { return false };
    if g.provision_status == ProvisionStatus::Provisioned {
        return true;
    }
    let Some(req) = g.requirement.clone() else {
        state.groups.get_mut(group).unwrap().provision_status = ProvisionStatus::Provisioned;
        return true;
    };
    let Some(node) = g.requirement_node else {
        state.groups.get_mut(group).unwrap().provision_status = ProvisionStatus::Provisioned;
        return true;
    };
    match req.provision(node, group_key(group)) {
        Ok(_reserved) => {
            let g = state.groups.get_mut(group).unwrap();
            g.provision_status = ProvisionStatus::Provisioned;
            state.gens.bump_resource();
            state.schedule.mark_dirty();
            true
        }
        Err(e) => {
            if !matches!(e, sched_resources::Error::ReqLimit) {
                tracing::warn!(?group, error = %e, "provisioning failed");
            }
            state.groups.get_mut(group).unwrap().resource_generation_snapshot = state.gens.resource();
            false
        }
    }
}

fn nearest_requirement_ancestor<R>(state: &GraphState<R>, group: GroupId) -> Option<GroupId> {
    let mut cur = state.groups.get(group)?.parent;
    while let Some(g) = cur {
        if state.groups.get(g).map(|x| x.requirement.is_some()).unwrap_or(false) {
            return Some(g);
        }
        cur = state.groups.get(g).and_then(|x| x.parent);
    }
    None
}

pub(crate) fn deprovision_group<R>(state: &mut GraphState<R>, group: GroupId) {
    let Some(g) = state.groups.get(group) else { return };
    if g.provision_status != ProvisionStatus::Provisioned {
        return;
    }
    let Some(req) = g.requirement.clone() else { return };
    let Some(node) = g.requirement_node else { return };
    let reparent = nearest_requirement_ancestor(state, group);
    req.deprovision(node, group_key(group), reparent.map(group_key));
    state.groups.get_mut(group).unwrap().provision_status = ProvisionStatus::Deprovisioned;
    state.gens.bump_resource();
}

fn wake_one<R>(state: &GraphState<R>, target: WaitState) {
    if let Some(ctx) = state.threads.iter().find(|t| t.state() == target) {
        ctx.condvar.signal();
    }
}

pub(crate) fn wake_all<R>(state: &GraphState<R>) {
    for ctx in &state.threads {
        ctx.condvar.signal();
    }
}

fn extend_thread_limit<R>(state: &mut GraphState<R>) -> bool {
    if state.active_limit < state.hard_max {
        state.active_limit += 1;
        true
    } else {
        false
    }
}

fn unextend_thread_limit<R>(state: &mut GraphState<R>, extended: bool) {
    if extended {
        state.active_limit = state.active_limit.saturating_sub(1);
    }
}

/// Must be called exactly once per group, by the designated joiner task (or
/// any thread, in this implementation — the "joiner task" identity check is
/// the caller's responsibility, matching the C API's lack of a typed "this
/// is the joiner" token).
pub(crate) fn join<R: Send + Sync + 'static>(
    scheduler: &Scheduler<R>,
    group: GroupId,
    ctx: &ThreadContext,
) -> Result<(), Reason> {
    loop {
        let mut guard = scheduler.state.lock();
        guard.schedule.recompute(&guard.tasks, &guard.groups, &guard.links, guard.root);

        let Some((task_id, class)) = find_join_predecessor(&guard, group) else {
            return finish_join(&mut guard, group);
        };

        if class.is_helpable() {
            let task = guard.tasks.get_mut(task_id).unwrap();
            task.state = TaskState::Running;
            task.runnability = Runnability::Running;
            drop(guard);
            run_task(scheduler, task_id, Some(ctx));
            continue;
        }

        if class == Runnability::Running {
            let extended = extend_thread_limit(&mut guard);
            wake_one(&guard, WaitState::WaitDispatch);
            ctx.set_state(WaitState::WaitJoin);
            let timeout = guard.params.task_join_wait();
            let (mut guard, _outcome) = ctx.condvar.wait_timeout(guard, timeout);
            ctx.set_state(WaitState::Running);
            unextend_thread_limit(&mut guard, extended);
            continue;
        }

        // ReadyUnprovisioned, or a task still Constructing/Depending on
        // something outside this group's subtree.
        let task_state = guard.tasks.get(task_id).map(|t| t.state);
        if task_state == Some(TaskState::Ready) {
            let tgroup = guard.tasks.get(task_id).unwrap().group;
            if try_provision_group(&mut guard, tgroup) {
                continue;
            }
        }
        ctx.set_state(WaitState::WaitJoin);
        let timeout = guard.params.task_join_wait();
        let _ = ctx.condvar.wait_timeout(guard, timeout);
        ctx.set_state(WaitState::Running);
    }
}

/// Recursively deprovisions and marks joined all sub-groups (depth-first
/// children first), then this group; accumulates the cumulative result and
/// error reason.
fn finish_join<R>(state: &mut GraphState<R>, group: GroupId) -> Result<(), Reason> {
    let children = state.groups.get(group).map(|g| g.children.clone()).unwrap_or_default();
    let mut error: Option<Reason> = None;
    for child in children {
        if let Err(e) = finish_join(state, child) {
            error.get_or_insert(e);
        }
    }

    let tasks = state.groups.get(group).map(|g| g.tasks.clone()).unwrap_or_default();
    for t in tasks {
        if let Some(task) = state.tasks.get(t) {
            if !task.success {
                if let Some(r) = task.failure_reason {
                    error.get_or_insert(r);
                }
            }
        }
    }

    deprovision_group(state, group);
    let Some(g) = state.groups.get_mut(group) else { return Ok(()) };
    g.state = GroupState::Joined;
    let final_reason = error.or(g.error_reason);
    g.result_ok = final_reason.is_none();
    g.error_reason = final_reason;
    match final_reason {
        Some(r) => Err(r),
        None => Ok(()),
    }
}

/// Recursively cancels sub-groups, cancels all member tasks with the
/// reason, and captures the reason into the group's error slot.
pub(crate) fn cancel_group<R>(state: &mut GraphState<R>, group: GroupId, reason: Reason) {
    let Some(g) = state.groups.get(group) else { return };
    if g.state == GroupState::Cancelled {
        return;
    }
    let children = g.children.clone();
    let tasks = g.tasks.clone();

    for t in tasks {
        propagate_cancel(state, t, reason);
    }
    for c in children {
        cancel_group(state, c, reason);
    }

    if let Some(g) = state.groups.get_mut(group) {
        g.state = GroupState::Cancelled;
        g.error_reason.get_or_insert(reason);
        g.result_ok = false;
        g.provision_status = ProvisionStatus::Cancelled;
    }
    state.schedule.mark_dirty();
}

/// Runs helpable tasks recursively on the calling thread until the
/// incomplete-task count falls under the low-water mark ("Helper"),
/// invoked from `ready` and `close`.
pub(crate) fn maybe_help<R: Send + Sync + 'static>(scheduler: &Scheduler<R>) {
    {
        let guard = scheduler.state.lock();
        if guard.incomplete_count <= guard.params.task_helper_start_threshold() {
            return;
        }
    }
    loop {
        let mut guard = scheduler.state.lock();
        if guard.incomplete_count <= guard.params.task_helper_end_threshold() {
            return;
        }
        let Some(task_id) = find_dispatchable(&mut guard) else { return };
        let task = guard.tasks.get_mut(task_id).unwrap();
        task.state = TaskState::Running;
        task.runnability = Runnability::Running;
        drop(guard);
        run_task(scheduler, task_id, None);
    }
}

/// `constrain_to_single`: atomically verifies `scheduled == 1` and drops
/// the active-thread limit to 0, holding all pool threads in wait-dispatch
/// until `unconstrain_to_single` restores the limit.
pub(crate) fn constrain_to_single<R>(state: &mut GraphState<R>) -> bool {
    if state.scheduled != 1 {
        return false;
    }
    state.constrained = true;
    state.saved_active_limit = state.active_limit;
    state.active_limit = 0;
    true
}

pub(crate) fn unconstrain_to_single<R>(state: &mut GraphState<R>) {
    state.constrained = false;
    state.active_limit = state.saved_active_limit.max(1);
}
