// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The literal end-to-end scenarios and boundary behaviors from spec §8,
//! run against a real two-thread pool.

use sched_core::{
    Cleanup, Combinator, FixRequest, GroupType, Pool, Reason, Requirement, SchedError, Scheduler,
    SchedulerParams, SpecialiserChain, StartupParams, TaskId, Worker,
};
use sched_sync::{Rank, RankedCondvar, RankedMutex};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn scheduler(threads: u32) -> Arc<Scheduler<()>> {
    Scheduler::new(
        StartupParams { n_threads: Some(threads), n_threads_max: Some(threads) },
        SchedulerParams::default(),
    )
}

fn worker(f: impl Fn() -> bool + Send + Sync + 'static) -> Arc<Worker> {
    Arc::new(f) as Arc<Worker>
}

fn cleanup(f: impl Fn() + Send + Sync + 'static) -> Arc<Cleanup> {
    Arc::new(f) as Arc<Cleanup>
}

// Scenario 1: create group G, tasks A, B in G, depend(A,B), ready both,
// join(G). Expected: A runs then B runs, join returns Ok.
#[test]
fn depend_then_join_runs_predecessor_before_dependent() {
    let sched = scheduler(2);
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let g = sched.create_group(None, GroupType(0), None, None);
    let o1 = order.clone();
    let a = sched
        .create_task(g, Some(worker(move || { o1.lock().unwrap().push("A"); true })), None)
        .unwrap();
    let o2 = order.clone();
    let b = sched
        .create_task(g, Some(worker(move || { o2.lock().unwrap().push("B"); true })), None)
        .unwrap();
    sched.depend(a, b).unwrap();
    sched.ready(a).unwrap();
    sched.ready(b).unwrap();

    assert!(sched.join(g).is_ok());
    assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
}

// Scenario 2: A's worker returns false. Expected: A completes with
// result=false, B is cancelled without running, join returns the
// cancellation reason.
#[test]
fn predecessor_failure_cancels_successor_and_join_reports_reason() {
    let sched = scheduler(2);
    let b_ran = Arc::new(Mutex::new(false));

    let g = sched.create_group(None, GroupType(0), None, None);
    let a = sched.create_task(g, Some(worker(|| false)), None).unwrap();
    let br = b_ran.clone();
    let b = sched
        .create_task(g, Some(worker(move || { *br.lock().unwrap() = true; true })), None)
        .unwrap();
    sched.depend(a, b).unwrap();
    sched.ready(a).unwrap();
    sched.ready(b).unwrap();

    assert_eq!(sched.join(g), Err(Reason::WorkerFailed));
    assert!(!*b_ran.lock().unwrap());
}

// Scenario 3: a group with requirement min=max=1 of resource type T over a
// pool with maximum=1. Readying a task provisions the one entry; join
// returns Ok and the entry is back in the pool afterwards.
#[test]
fn resource_provisioning_round_trips_through_join() {
    let sched = scheduler(2);

    let mut req = Requirement::<()>::new(1);
    let pool = Arc::new(Pool::new(7, 1, false));
    req.add_pool(7, pool.clone());
    let root_node = req.root();
    req.set_bounds(root_node, 7, 1, 1);
    let req = Arc::new(req);

    let g = sched.create_group(None, GroupType(0), Some(req.clone()), Some(root_node));
    let a = sched.create_task(g, Some(worker(|| true)), None).unwrap();
    sched.ready(a).unwrap();

    assert!(sched.join(g).is_ok());
    assert_eq!(pool.provided_count(), 0);
    assert!(pool.check_invariant());
}

// Scenario 4: two sibling groups both require the single entry a
// maximum=1 pool can provide. Exactly one is provisioned at a time; both
// eventually run and join successfully; pool invariants hold throughout.
#[test]
fn sibling_groups_serialize_on_a_saturated_pool() {
    let sched = scheduler(2);

    let mut req = Requirement::<()>::new(2);
    let pool = Arc::new(Pool::new(9, 1, false));
    req.add_pool(9, pool.clone());
    let root_node = req.root();
    req.set_bounds(root_node, 9, 1, 1);
    let req = Arc::new(req);

    let g1 = sched.create_group(None, GroupType(0), Some(req.clone()), Some(root_node));
    let g2 = sched.create_group(None, GroupType(0), Some(req.clone()), Some(root_node));
    let ran = Arc::new(Mutex::new(Vec::new()));
    let r1 = ran.clone();
    let a = sched.create_task(g1, Some(worker(move || { r1.lock().unwrap().push(1); true })), None).unwrap();
    let r2 = ran.clone();
    let b = sched.create_task(g2, Some(worker(move || { r2.lock().unwrap().push(2); true })), None).unwrap();
    sched.ready(a).unwrap();
    sched.ready(b).unwrap();

    assert!(pool.check_invariant());
    assert!(sched.join(g1).is_ok());
    assert!(sched.join(g2).is_ok());

    let mut seen = ran.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
    assert_eq!(pool.provided_count(), 0);
}

// Scenario 5: a task publishes an externally-owned condvar as its current
// wait; cancelling its group broadcasts that condvar and the task observes
// is_cancelling() and unwinds. join reports the cancellation reason.
#[test]
fn external_wait_is_broken_by_group_cancellation() {
    let sched = scheduler(2);
    let ext_mutex = Arc::new(RankedMutex::new(Rank::ResLookupLock, ()));
    let ext_condvar = Arc::new(RankedCondvar::new(&ext_mutex));
    let task_slot: Arc<Mutex<Option<TaskId>>> = Arc::new(Mutex::new(None));

    let g = sched.create_group(None, GroupType(0), None, None);

    let sched_w = sched.clone();
    let slot_w = task_slot.clone();
    let em = ext_mutex.clone();
    let ec = ext_condvar.clone();
    let a = sched
        .create_task(
            g,
            Some(worker(move || {
                let task = slot_w.lock().unwrap().expect("task id published before ready()");
                sched_w.publish_external_wait(task, ec.clone());
                let mut guard = em.lock();
                let mut woken_by_cancel = false;
                for _ in 0..50 {
                    if sched_w.is_cancelling(task) {
                        woken_by_cancel = true;
                        break;
                    }
                    let (g2, _outcome) = ec.wait_timeout(guard, Some(Duration::from_millis(20)));
                    guard = g2;
                }
                sched_w.clear_external_wait(task);
                !woken_by_cancel
            })),
            None,
        )
        .unwrap();
    *task_slot.lock().unwrap() = Some(a);
    sched.ready(a).unwrap();

    // Give the dispatcher a moment to pick up the task and publish its wait.
    std::thread::sleep(Duration::from_millis(30));
    sched.cancel_group(g, Reason::NotAnError);

    assert_eq!(sched.join(g), Err(Reason::NotAnError));
}

// Scenario 6: constrain_to_single with nthreads_scheduled == 1 holds the
// sole pool thread in wait-dispatch until unconstrain_to_single.
#[test]
fn constrain_to_single_blocks_dispatch_until_released() {
    let sched = scheduler(1);
    assert!(sched.constrain_to_single());

    let ran = Arc::new(Mutex::new(false));
    let r = ran.clone();
    let g = sched.create_group(None, GroupType(0), None, None);
    let a = sched.create_task(g, Some(worker(move || { *r.lock().unwrap() = true; true })), None).unwrap();
    sched.ready(a).unwrap();

    std::thread::sleep(Duration::from_millis(80));
    assert!(!*ran.lock().unwrap(), "task ran while pool was constrained to single");

    sched.unconstrain_to_single();
    assert!(sched.join(g).is_ok());
    assert!(*ran.lock().unwrap());
}

// Boundary: joining a group with zero tasks and zero sub-groups succeeds
// without sleeping.
#[test]
fn joining_empty_group_succeeds_immediately() {
    let sched = scheduler(1);
    let g = sched.create_group(None, GroupType(0), None, None);
    assert!(sched.join(g).is_ok());
}

// Boundary: a self-dependency is rejected rather than accepted.
#[test]
fn self_dependency_is_rejected() {
    let sched = scheduler(1);
    let g = sched.create_group(None, GroupType(0), None, None);
    let a = sched.create_task(g, None, None).unwrap();
    assert_eq!(sched.depend(a, a), Err(SchedError::SelfDependency));
}

// fix/unfix round-trip: fixing an id then unfixing it returns the pool to
// its pre-fix occupancy.
#[test]
fn fix_then_unfix_round_trips_pool_state() {
    let sched: Arc<Scheduler<u32>> = Scheduler::new(
        StartupParams { n_threads: Some(1), n_threads_max: Some(1) },
        SchedulerParams::default(),
    );
    let mut req = Requirement::<u32>::new(1);
    let pool = Arc::new(Pool::new(3, 2, false));
    req.add_pool(3, pool.clone());
    let root_node = req.root();
    let req = Arc::new(req);

    let g = sched.create_group(None, GroupType(0), Some(req), Some(root_node));
    let before = pool.provided_count();

    let requests = [FixRequest { id: 11, optional: false }];
    let results = sched.fix(g, 3, &requests, |id| Some(id as u32)).unwrap();
    let idx = results[0].unwrap();
    assert_eq!(pool.provided_count(), before + 1);

    let resource = sched.unfix(g, 3, idx);
    assert_eq!(resource, Some(11));
    assert_eq!(pool.provided_count(), before);
}

// Exercises the `Any` combinator: a node with two leaf children under
// `Combinator::Any` provisions successfully once either child can.
#[test]
fn any_combinator_provisions_via_either_child() {
    let sched = scheduler(1);
    let mut req = Requirement::<()>::new(4);
    let pool_a = Arc::new(Pool::new(1, 0, false)); // exhausted: maximum 0
    let pool_b = Arc::new(Pool::new(2, 1, false));
    req.add_pool(1, pool_a.clone());
    req.add_pool(2, pool_b.clone());
    let root = req.root();
    let left = req.add_child(root, Combinator::Any, 0, 4);
    let right = req.add_child(root, Combinator::Any, 0, 4);
    req.set_bounds(left, 1, 1, 1);
    req.set_bounds(right, 2, 1, 1);
    let req = Arc::new(req);

    let g = sched.create_group(None, GroupType(0), Some(req), Some(root));
    let a = sched.create_task(g, Some(worker(|| true)), None).unwrap();
    sched.ready(a).unwrap();

    assert!(sched.join(g).is_ok());
    assert_eq!(pool_b.provided_count(), 0);
}

// The specialiser chain runs before the worker, and cleanup runs after it,
// in that order, on every task the scheduler executes (spec §4.7).
#[test]
fn specialiser_chain_wraps_worker_then_cleanup_runs() {
    let sched = scheduler(1);
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let o1 = order.clone();
    let chain = SpecialiserChain::new().with_link(move |ctx, next| {
        o1.lock().unwrap().push("link");
        next(ctx);
    });
    sched.set_specialiser_chain(chain);

    let g = sched.create_group(None, GroupType(0), None, None);
    let o2 = order.clone();
    let o3 = order.clone();
    let a = sched
        .create_task(
            g,
            Some(worker(move || { o2.lock().unwrap().push("worker"); true })),
            Some(cleanup(move || { o3.lock().unwrap().push("cleanup"); })),
        )
        .unwrap();
    sched.ready(a).unwrap();

    assert!(sched.join(g).is_ok());
    assert_eq!(*order.lock().unwrap(), vec!["link", "worker", "cleanup"]);
}
