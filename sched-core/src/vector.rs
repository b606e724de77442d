// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task vectors: a reference-counted fixed-length array of
//! `(task, args)` slots, used to keep a set of related tasks (e.g. bands of
//! a page) addressable by index.

use crate::task::TaskId;
use std::sync::Mutex;

struct Inner<A> {
    slots: Vec<Option<(TaskId, A)>>,
    refcount: u32,
}

/// A synchronized, fixed-length array of task slots. Cloning shares the
/// backing storage (bumps the refcount); the last clone dropped releases
/// every task reference still held by a populated slot.
pub struct TaskVector<A> {
    inner: std::sync::Arc<Mutex<Inner<A>>>,
}

impl<A> Clone for TaskVector<A> {
    fn clone(&self) -> Self {
        self.inner.lock().unwrap().refcount += 1;
        Self { inner: self.inner.clone() }
    }
}

impl<A> Drop for TaskVector<A> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.refcount -= 1;
        if inner.refcount == 0 {
            inner.slots.clear();
        }
    }
}

impl<A> TaskVector<A> {
    pub fn new(len: usize) -> Self {
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, || None);
        Self { inner: std::sync::Arc::new(Mutex::new(Inner { slots, refcount: 1 })) }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `(task, args)` into `index`, returning whatever was there.
    pub fn store(&self, index: usize, task: TaskId, args: A) -> Option<(TaskId, A)> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::replace(&mut inner.slots[index], Some((task, args)))
    }

    /// Releases the slot at `index`, returning its contents (the caller
    /// drops the task reference by dropping the returned `TaskId`'s
    /// associated handle, same as any other task reference in this crate).
    pub fn release(&self, index: usize) -> Option<(TaskId, A)> {
        let mut inner = self.inner.lock().unwrap();
        inner.slots[index].take()
    }

    pub fn with_slot<T>(&self, index: usize, f: impl FnOnce(Option<&(TaskId, A)>) -> T) -> T {
        let inner = self.inner.lock().unwrap();
        f(inner.slots[index].as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_release_round_trips() {
        let v: TaskVector<u32> = TaskVector::new(4);
        let task = TaskId { index: 1, generation: 0 };
        assert!(v.store(0, task, 7).is_none());
        v.with_slot(0, |slot| assert_eq!(slot.map(|(_, a)| *a), Some(7)));
        let released = v.release(0);
        assert_eq!(released.map(|(_, a)| a), Some(7));
        assert!(v.release(0).is_none());
    }

    #[test]
    fn clone_shares_storage_and_refcounts() {
        let v = TaskVector::<u32>::new(1);
        let task = TaskId { index: 0, generation: 0 };
        v.store(0, task, 1);
        let v2 = v.clone();
        v2.with_slot(0, |slot| assert!(slot.is_some()));
    }
}
