// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A task scheduler and resource provisioning core for a multi-threaded
//! print interpreter: a ranked lock registry
//! ([`sched_sync`]), resource pools and requirement trees
//! ([`sched_resources`]), and on top of both, a task graph — tasks, groups,
//! dependency links, a two-pass global schedule, and a thread pool driven
//! by dispatcher/helper/joiner roles.
//!
//! `R` is the application's resource payload type (the thing a pool entry
//! ultimately holds once fixed — e.g. a decoded font or a rendered band).

mod arena;
mod context;
mod driver;
mod error;
mod group;
mod link;
mod params;
mod schedule;
mod task;
mod vector;

pub use context::{SpecialiserChain, SpecialiserContext, ThreadContext, WaitState};
pub use error::{Reason, SchedError};
pub use group::{GroupId, GroupState, GroupType, ProvisionStatus, TaskGroup};
pub use link::LinkId;
pub use params::{ParamError, SchedulerParams, StartupParams, MAX_POOL_THREADS};
pub use sched_resources::{Combinator, FixRequest, NodeId, Pool, Requirement};
pub use task::{Cleanup, Runnability, Task, TaskId, TaskState, Worker};
pub use vector::TaskVector;

use arena::Arena;
use link::TaskLink;
use schedule::GlobalSchedule;
use sched_sync::{Rank, RankedCondvar, RankedMutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A global resource-state counter, bumped whenever provisioning or
/// deprovisioning changes pool occupancy. Groups cache the generation they
/// last failed provisioning under (`TaskGroup::resource_generation_snapshot`)
/// so the dispatcher doesn't retry a doomed provisioning attempt every
/// scan — only once the generation has actually moved.
#[derive(Default)]
pub(crate) struct Generations {
    resource: u64,
}

impl Generations {
    pub(crate) fn resource(&self) -> u64 {
        self.resource
    }

    pub(crate) fn bump_resource(&mut self) {
        self.resource = self.resource.wrapping_add(1);
    }
}

/// Everything a pool thread (or an external caller of `join`/`ready`)
/// touches, behind the single `TaskLock`-ranked mutex: it serialises all
/// modifications to the task graph, schedule lists, thread context states,
/// and thread pool counters.
pub(crate) struct GraphState<R> {
    pub(crate) tasks: Arena<Task>,
    pub(crate) groups: Arena<TaskGroup<R>>,
    pub(crate) links: Arena<TaskLink>,
    pub(crate) schedule: GlobalSchedule,
    pub(crate) threads: Vec<Arc<ThreadContext>>,
    pub(crate) root: GroupId,
    #[allow(dead_code)] // reserved for reparenting detached entries with no live ancestor
    pub(crate) orphaned: GroupId,
    pub(crate) gens: Generations,
    pub(crate) active_limit: u32,
    pub(crate) hard_max: u32,
    pub(crate) saved_active_limit: u32,
    pub(crate) scheduled: u32,
    pub(crate) incomplete_count: u32,
    pub(crate) params: SchedulerParams,
    pub(crate) constrained: bool,
}

/// The scheduler facade: owns the task graph, the thread pool, and the
/// configuration surface. `R` must be `Send + Sync + 'static` since
/// provisioned resources cross thread boundaries with their owning group.
pub struct Scheduler<R> {
    pub(crate) state: RankedMutex<GraphState<R>>,
    shutdown: AtomicBool,
    next_thread_id: AtomicU32,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Run before every worker invocation. Guarded by a plain
    /// `Mutex` rather than the `TaskLock`-ranked one: the chain is read once
    /// per task run and replaced rarely, so it doesn't belong in the hot
    /// graph-state lock.
    pub(crate) specialiser_chain: Mutex<SpecialiserChain>,
}

impl<R: Send + Sync + 'static> Scheduler<R> {
    /// Builds a scheduler with `startup`'s thread pool and spawns its
    /// initial active threads.
    pub fn new(startup: StartupParams, params: SchedulerParams) -> Arc<Self> {
        let (active, hard_max) = startup.resolve();

        let mut groups: Arena<TaskGroup<R>> = Arena::new();
        let root = groups.insert(TaskGroup::new(None, GroupType(0), None, None));
        let orphaned = groups.insert(TaskGroup::new(None, GroupType(u32::MAX), None, None));
        groups.get_mut(root).unwrap().state = GroupState::Active;
        groups.get_mut(orphaned).unwrap().state = GroupState::Active;

        let graph = GraphState {
            tasks: Arena::new(),
            groups,
            links: Arena::new(),
            schedule: GlobalSchedule::new(),
            threads: Vec::new(),
            root,
            orphaned,
            gens: Generations::default(),
            active_limit: active,
            hard_max,
            saved_active_limit: active,
            scheduled: 0,
            incomplete_count: 0,
            params,
            constrained: false,
        };

        let scheduler = Arc::new(Self {
            state: RankedMutex::new(Rank::TaskLock, graph),
            shutdown: AtomicBool::new(false),
            next_thread_id: AtomicU32::new(0),
            join_handles: Mutex::new(Vec::new()),
            specialiser_chain: Mutex::new(SpecialiserChain::new()),
        });

        for _ in 0..active {
            scheduler.spawn_pool_thread();
        }
        scheduler
    }

    fn spawn_pool_thread(self: &Arc<Self>) {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(ThreadContext::new(id, RankedCondvar::new(&self.state)));
        {
            let mut state = self.state.lock();
            state.threads.push(ctx.clone());
            state.scheduled += 1;
        }
        let scheduler = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("sched-pool-{id}"))
            .spawn(move || driver::dispatcher_loop(&scheduler, ctx))
            .expect("failed to spawn pool thread");
        self.join_handles.lock().unwrap().push(handle);
    }

    /// Creates a group under `parent` (or the scheduler's root group, if
    /// `None`). A group with no explicit requirement inherits its parent's.
    pub fn create_group(
        &self,
        parent: Option<GroupId>,
        group_type: GroupType,
        requirement: Option<Arc<Requirement<R>>>,
        requirement_node: Option<NodeId>,
    ) -> GroupId {
        let mut state = self.state.lock();
        let parent = parent.unwrap_or(state.root);
        let (requirement, requirement_node) = if requirement.is_some() {
            (requirement, requirement_node)
        } else {
            state
                .groups
                .get(parent)
                .map(|p| (p.requirement.clone(), p.requirement_node))
                .unwrap_or((None, None))
        };
        let mut group = TaskGroup::new(Some(parent), group_type, requirement, requirement_node);
        group.state = GroupState::Active;
        let id = state.groups.insert(group);
        if let Some(p) = state.groups.get_mut(parent) {
            p.children.push(id);
        }
        state.schedule.mark_dirty();
        id
    }

    /// Creates a task inside `group`. Rejected once the group is closed to
    /// outside creators: only a member task of a closed group may still add
    /// work to it, and this API models an outside caller.
    pub fn create_task(
        &self,
        group: GroupId,
        worker: Option<Arc<Worker>>,
        cleanup: Option<Arc<Cleanup>>,
    ) -> Result<TaskId, SchedError> {
        let mut state = self.state.lock();
        let g = state.groups.get(group).ok_or(SchedError::InvalidDependency)?;
        if !g.is_open_to_outside_creators() {
            if let Some(reason) = g.error_reason {
                return Err(SchedError::GroupCancelled(reason));
            }
            return Err(SchedError::GroupClosed);
        }
        let id = state.tasks.insert(Task::new(group, worker, cleanup));
        state.groups.get_mut(group).unwrap().tasks.push(id);
        state.incomplete_count += 1;
        state.schedule.mark_dirty();
        Ok(id)
    }

    /// Adds a dependency edge: `post` cannot run until `pre` finishes.
    pub fn depend(&self, pre: TaskId, post: TaskId) -> Result<Option<LinkId>, SchedError> {
        let mut state = self.state.lock();
        let result = link::depend(&mut state.tasks, &mut state.links, pre, post);
        state.schedule.mark_dirty();
        result
    }

    /// Replaces `in_task` with `out_task` on dependency edge `r`.
    pub fn replace(
        &self,
        r: TaskId,
        in_task: TaskId,
        out_task: TaskId,
        current: Option<TaskId>,
    ) -> Result<(), SchedError> {
        let mut state = self.state.lock();
        let result = link::replace(&mut state.tasks, &mut state.links, r, in_task, out_task, current);
        state.schedule.mark_dirty();
        result
    }

    /// Marks `task` ready to run once its dependencies (if any remain
    /// unresolved) are satisfied, then walks the helper path.
    pub fn ready(&self, task: TaskId) -> Result<(), SchedError> {
        let became_ready = {
            let mut state = self.state.lock();
            let Some(t) = state.tasks.get(task) else { return Err(SchedError::InvalidDependency) };
            if !matches!(t.state, TaskState::Constructing | TaskState::Depending) {
                return Ok(());
            }
            let pre_links = t.pre_links.clone();
            let has_unmet = pre_links.iter().any(|&l| {
                state
                    .links
                    .get(l)
                    .and_then(|link| state.tasks.get(link.pre))
                    .map(|p| p.state != TaskState::Done || !p.success)
                    .unwrap_or(false)
            });
            let new_state = if has_unmet { TaskState::Depending } else { TaskState::Ready };
            state.tasks.get_mut(task).unwrap().state = new_state;
            state.schedule.mark_dirty();
            if new_state == TaskState::Ready {
                driver::wake_all(&state);
            }
            new_state == TaskState::Ready
        };
        if became_ready {
            driver::maybe_help(self);
        }
        Ok(())
    }

    /// Closes `group` to outside creators; members may still add work
    /// until the group is actually joined.
    pub fn close_group(&self, group: GroupId) -> Result<(), SchedError> {
        {
            let mut state = self.state.lock();
            let g = state.groups.get_mut(group).ok_or(SchedError::InvalidDependency)?;
            if matches!(g.state, GroupState::Constructing | GroupState::Active) {
                g.state = GroupState::Closed;
            }
        }
        driver::maybe_help(self);
        Ok(())
    }

    /// `set_joiner(group, joiner)`: `None` means "join with the parent".
    pub fn set_joiner(&self, group: GroupId, joiner: Option<TaskId>) -> Result<(), SchedError> {
        let mut state = self.state.lock();
        state.groups.get(group).ok_or(SchedError::InvalidDependency)?;
        state.groups.get_mut(group).unwrap().joiner = joiner;
        if let Some(t) = joiner {
            if let Some(task) = state.tasks.get_mut(t) {
                task.joins.push(group);
            }
        }
        Ok(())
    }

    /// Cancels `group` and everything beneath it.
    ///
    /// Cancelling a group does NOT release the caller's own reference to
    /// it — exactly as creating a group does not consume the creator's
    /// reference. The caller is still responsible for eventually
    /// `join`-ing (or otherwise dropping its reference to) a cancelled
    /// group, same as an un-cancelled one; `cancel` only changes what
    /// `join` will observe and return.
    pub fn cancel_group(&self, group: GroupId, reason: Reason) {
        let mut state = self.state.lock();
        driver::cancel_group(&mut state, group, reason);
        driver::wake_all(&state);
    }

    /// Runs helpable predecessors recursively on
    /// the calling thread, waits on non-helpable ones, and finally
    /// deprovisions and marks the group (and its sub-groups) joined.
    /// Must be called at most once per group.
    pub fn join(&self, group: GroupId) -> Result<(), Reason> {
        let ctx = Arc::new(ThreadContext::new(
            self.next_thread_id.fetch_add(1, Ordering::Relaxed),
            RankedCondvar::new(&self.state),
        ));
        {
            let mut state = self.state.lock();
            state.threads.push(ctx.clone());
        }
        let result = driver::join(self, group, &ctx);
        {
            let mut state = self.state.lock();
            state.threads.retain(|t| !Arc::ptr_eq(t, &ctx));
        }
        result
    }

    /// Low-memory mode: holds every pool thread but one in
    /// wait-dispatch until [`Scheduler::unconstrain_to_single`] is called.
    /// Fails if more than one thread is currently scheduled.
    pub fn constrain_to_single(&self) -> bool {
        let mut state = self.state.lock();
        driver::constrain_to_single(&mut state)
    }

    pub fn unconstrain_to_single(&self) {
        let mut state = self.state.lock();
        driver::unconstrain_to_single(&mut state);
        driver::wake_all(&state);
    }

    /// Fixes a batch of resource ids against `group`'s requirement for
    /// `resource_type`.
    pub fn fix(
        &self,
        group: GroupId,
        resource_type: u32,
        requests: &[FixRequest],
        fix_fn: impl Fn(u64) -> Option<R>,
    ) -> Result<Vec<Option<usize>>, SchedError> {
        let req = {
            let state = self.state.lock();
            let g = state.groups.get(group).ok_or(SchedError::InvalidDependency)?;
            g.requirement.clone().ok_or(SchedError::Resource(Reason::ResourceExhausted))?
        };
        req.fix(resource_type, driver::group_key(group), requests, fix_fn)
            .map_err(|_| SchedError::Resource(Reason::ResourceExhausted))
    }

    pub fn unfix(&self, group: GroupId, resource_type: u32, entry_index: usize) -> Option<R> {
        let req = {
            let state = self.state.lock();
            state.groups.get(group)?.requirement.clone()?
        };
        req.unfix(resource_type, driver::group_key(group), entry_index)
    }

    /// Registers an externally-owned condvar as the one that will be
    /// broadcast if `task` is cancelled while some other part of the
    /// embedder is blocked waiting on it outside this crate's own wait
    /// paths: this publishes the wait into the current task so a
    /// cancellation request can broadcast it and break it out.
    pub fn publish_external_wait(&self, task: TaskId, condvar: Arc<RankedCondvar>) {
        let mut state = self.state.lock();
        if let Some(t) = state.tasks.get_mut(task) {
            t.waiting_on = Some(condvar);
        }
    }

    pub fn clear_external_wait(&self, task: TaskId) {
        let mut state = self.state.lock();
        if let Some(t) = state.tasks.get_mut(task) {
            t.waiting_on = None;
        }
    }

    /// Whether `task` has been cancelled or is in the process of being
    /// cancelled. A worker blocked on a published external wait checks this
    /// after being woken to decide whether to unwind early.
    pub fn is_cancelling(&self, task: TaskId) -> bool {
        self.state.lock().tasks.get(task).map(|t| t.is_cancelling()).unwrap_or(true)
    }

    pub fn params(&self) -> SchedulerParams {
        self.state.lock().params
    }

    pub fn set_params(&self, params: SchedulerParams) {
        self.state.lock().params = params;
    }

    /// Replaces the chain of context specialisers run before every worker
    /// invocation. The built-in "run the worker" terminal link
    /// is always appended internally; it is never part of the chain the
    /// caller supplies here.
    pub fn set_specialiser_chain(&self, chain: SpecialiserChain) {
        *self.specialiser_chain.lock().unwrap() = chain;
    }
}

impl<R> Drop for Scheduler<R> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let state = self.state.lock();
            driver::wake_all(&state);
        }
        if let Ok(mut handles) = self.join_handles.lock() {
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}
