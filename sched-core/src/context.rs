// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread context and the specialiser chain.

use crate::task::TaskId;
use sched_sync::RankedCondvar;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitState {
    Running = 0,
    WaitDispatch = 1,
    WaitHelp = 2,
    WaitJoin = 3,
    WaitMemory = 4,
    /// A wake has been posted but the thread has not yet resumed; prevents
    /// a second `signal` from being "lost" by waking nobody. Signalling
    /// preserves this interim state to prevent a second wakeup until the
    /// first has resumed.
    Signalled = 5,
}

impl WaitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::WaitDispatch,
            2 => Self::WaitHelp,
            3 => Self::WaitJoin,
            4 => Self::WaitMemory,
            _ => Self::Signalled,
        }
    }
}

/// A per-thread structure: parent pointer, currently-executing task, a
/// condvar private to this thread (bound to the scheduler mutex), and an
/// atomic wait state. The thread's link on the global thread list is just
/// this context's position in `Scheduler`'s `Vec<ThreadContext>`.
pub struct ThreadContext {
    pub id: u32,
    pub condvar: RankedCondvar,
    state: AtomicU8,
    /// Stack of (task, previous task) frames for recursive self-activation.
    pub task_stack: Vec<TaskId>,
}

impl ThreadContext {
    pub fn new(id: u32, condvar: RankedCondvar) -> Self {
        Self { id, condvar, state: AtomicU8::new(WaitState::Running as u8), task_stack: Vec::new() }
    }

    pub fn state(&self) -> WaitState {
        WaitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WaitState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.task_stack.last().copied()
    }
}

/// The context handed down the specialiser chain for one worker invocation.
pub struct SpecialiserContext {
    pub task: TaskId,
    pub thread_id: u32,
}

type SpecialiserLink = dyn Fn(&mut SpecialiserContext, &mut dyn FnMut(&mut SpecialiserContext)) + Send + Sync;

/// Rather than dynamic dispatch through a linked list of callbacks, the
/// natural alternative is a builder pattern: each specialiser is a typed
/// wrapper that owns a sub-context and delegates by calling the next. In
/// practice that typed nesting is awkward to store heterogeneously in a
/// `Vec`, so the chain is represented as an ordered list of closures, each
/// of which must call its `next` continuation exactly once — the same
/// contract a C callback gets from a `done` function, just expressed as a
/// continuation rather than an explicit "done" call.
#[derive(Clone)]
pub struct SpecialiserChain {
    links: std::sync::Arc<Vec<std::sync::Arc<SpecialiserLink>>>,
}

impl Default for SpecialiserChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecialiserChain {
    pub fn new() -> Self {
        Self { links: std::sync::Arc::new(Vec::new()) }
    }

    /// Appends a link to the chain's tail.
    pub fn with_link(mut self, link: impl Fn(&mut SpecialiserContext, &mut dyn FnMut(&mut SpecialiserContext)) + Send + Sync + 'static) -> Self {
        std::sync::Arc::make_mut(&mut self.links).push(std::sync::Arc::new(link));
        self
    }

    /// Runs the chain from the first link through to `terminal`, which is
    /// always the built-in "run the worker" tail call.
    pub fn run(&self, ctx: &mut SpecialiserContext, terminal: &mut dyn FnMut(&mut SpecialiserContext)) {
        run_from(&self.links, 0, ctx, terminal);
    }
}

fn run_from(
    links: &[std::sync::Arc<SpecialiserLink>],
    index: usize,
    ctx: &mut SpecialiserContext,
    terminal: &mut dyn FnMut(&mut SpecialiserContext),
) {
    match links.get(index) {
        Some(link) => {
            let mut next = |ctx: &mut SpecialiserContext| run_from(links, index + 1, ctx, terminal);
            link(ctx, &mut next);
        }
        None => terminal(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_runs_links_in_order_then_terminal() {
        let log = std::sync::Mutex::new(Vec::new());
        let chain = SpecialiserChain::new()
            .with_link(|ctx, next| {
                next(ctx);
            })
            .with_link(|ctx, next| {
                next(ctx);
            });
        let mut ctx = SpecialiserContext { task: TaskId { index: 0, generation: 0 }, thread_id: 0 };
        chain.run(&mut ctx, &mut |_ctx| {
            log.lock().unwrap().push("terminal");
        });
        assert_eq!(*log.lock().unwrap(), vec!["terminal"]);
    }
}
