// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A read-write lock over `N` application-item slots.
//!
//! One lock holds up to `N` slots (`N` = the hard thread limit), each bound
//! to an application-provided key. Many readers may hold one slot; a writer
//! excludes all. A write lock may be downgraded to a read lock, and a
//! "release if contested" probe lets cooperative code yield a slot it no
//! longer strictly needs. A thread may hold at most one slot at a time.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Idle,
    Read(u32),
    Write,
}

struct Slot<K, T> {
    key: Option<K>,
    item: Option<T>,
    holder: Holder,
    /// Number of threads currently blocked wanting this slot, for the
    /// "release if contested" probe.
    waiters: u32,
}

pub struct SlotRwLock<K, T> {
    slots: Vec<Mutex<Slot<K, T>>>,
    read_ready: Vec<Condvar>,
    write_ready: Vec<Condvar>,
}

pub struct ReadGuard<'a, K, T> {
    lock: &'a SlotRwLock<K, T>,
    index: usize,
}

pub struct WriteGuard<'a, K, T> {
    lock: &'a SlotRwLock<K, T>,
    index: usize,
}

thread_local! {
    static HELD_SLOT: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

impl<K: PartialEq + Clone, T> SlotRwLock<K, T> {
    pub fn with_capacity(n: usize) -> Self {
        let mut slots = Vec::with_capacity(n);
        let mut read_ready = Vec::with_capacity(n);
        let mut write_ready = Vec::with_capacity(n);
        for _ in 0..n {
            slots.push(Mutex::new(Slot { key: None, item: None, holder: Holder::Idle, waiters: 0 }));
            read_ready.push(Condvar::new());
            write_ready.push(Condvar::new());
        }
        Self { slots, read_ready, write_ready }
    }

    /// Finds a slot already holding `key`, or claims a free one, inserting
    /// `make_item()` into it. Panics if the calling thread already holds a
    /// slot: a client thread may hold at most one lock at a time.
    fn find_or_claim(&self, key: &K, make_item: impl FnOnce() -> T) -> usize {
        assert!(!HELD_SLOT.with(|h| h.get()), "thread already holds a slot-rwlock slot");
        loop {
            let mut found_free = None;
            for (i, slot_mutex) in self.slots.iter().enumerate() {
                let slot = slot_mutex.lock().unwrap();
                if slot.key.as_ref() == Some(key) {
                    return i;
                }
                if slot.key.is_none() && found_free.is_none() {
                    found_free = Some(i);
                }
            }
            if let Some(i) = found_free {
                let mut slot = self.slots[i].lock().unwrap();
                // Re-check: another thread may have claimed it meanwhile.
                if slot.key.is_none() {
                    slot.key = Some(key.clone());
                    slot.item = Some(make_item());
                    return i;
                }
            } else {
                panic!("slot-rwlock exhausted: no free slot for new key");
            }
        }
    }

    pub fn lock_read(&self, key: K, make_item: impl FnOnce() -> T) -> ReadGuard<'_, K, T> {
        let index = self.find_or_claim(&key, make_item);
        let mut slot = self.slots[index].lock().unwrap();
        slot.waiters += 1;
        while matches!(slot.holder, Holder::Write) {
            slot = self.read_ready[index].wait(slot).unwrap();
        }
        slot.waiters -= 1;
        slot.holder = match slot.holder {
            Holder::Idle => Holder::Read(1),
            Holder::Read(n) => Holder::Read(n + 1),
            Holder::Write => unreachable!(),
        };
        drop(slot);
        HELD_SLOT.with(|h| h.set(true));
        ReadGuard { lock: self, index }
    }

    pub fn lock_write(&self, key: K, make_item: impl FnOnce() -> T) -> WriteGuard<'_, K, T> {
        let index = self.find_or_claim(&key, make_item);
        let mut slot = self.slots[index].lock().unwrap();
        slot.waiters += 1;
        while slot.holder != Holder::Idle {
            slot = self.write_ready[index].wait(slot).unwrap();
        }
        slot.waiters -= 1;
        slot.holder = Holder::Write;
        drop(slot);
        HELD_SLOT.with(|h| h.set(true));
        WriteGuard { lock: self, index }
    }

    fn release_read(&self, index: usize) {
        let mut slot = self.slots[index].lock().unwrap();
        slot.holder = match slot.holder {
            Holder::Read(1) => Holder::Idle,
            Holder::Read(n) => Holder::Read(n - 1),
            other => other,
        };
        if slot.holder == Holder::Idle {
            drop(slot);
            self.write_ready[index].notify_one();
        }
        HELD_SLOT.with(|h| h.set(false));
    }

    fn release_write(&self, index: usize) {
        {
            let mut slot = self.slots[index].lock().unwrap();
            slot.holder = Holder::Idle;
        }
        self.read_ready[index].notify_all();
        self.write_ready[index].notify_one();
        HELD_SLOT.with(|h| h.set(false));
    }
}

impl<K, T> ReadGuard<'_, K, T> {
    pub fn with_item<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let slot = self.lock.slots[self.index].lock().unwrap();
        f(slot.item.as_ref().expect("slot item missing"))
    }
}

impl<K: PartialEq + Clone, T> WriteGuard<'_, K, T> {
    pub fn with_item_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut slot = self.lock.slots[self.index].lock().unwrap();
        f(slot.item.as_mut().expect("slot item missing"))
    }

    /// "Unlock if wanted" probe: releases the write lock and returns `None`
    /// if another thread is waiting for this slot, otherwise hands the guard
    /// back unchanged so the caller keeps holding it.
    pub fn release_if_contested(self) -> Option<Self> {
        let index = self.index;
        let lock = self.lock;
        let contested = {
            let slot = lock.slots[index].lock().unwrap();
            slot.waiters > 0
        };
        if contested {
            std::mem::forget(self);
            lock.release_write(index);
            None
        } else {
            Some(self)
        }
    }
}

impl<K, T> Drop for ReadGuard<'_, K, T> {
    fn drop(&mut self) {
        self.lock.release_read(self.index);
    }
}

impl<K, T> Drop for WriteGuard<'_, K, T> {
    fn drop(&mut self) {
        self.lock.release_write(self.index);
    }
}

impl<K: PartialEq + Clone, T> SlotRwLock<K, T> {
    /// Downgrades a write lock to a read lock on the same slot without
    /// allowing another writer to intervene.
    pub fn downgrade<'a>(&'a self, guard: WriteGuard<'a, K, T>) -> ReadGuard<'a, K, T> {
        let index = guard.index;
        std::mem::forget(guard);
        {
            let mut slot = self.slots[index].lock().unwrap();
            debug_assert_eq!(slot.holder, Holder::Write);
            slot.holder = Holder::Read(1);
        }
        self.read_ready[index].notify_all();
        ReadGuard { lock: self, index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_then_write_excludes() {
        let lock: SlotRwLock<u32, i32> = SlotRwLock::with_capacity(4);
        let r = lock.lock_read(1, || 10);
        r.with_item(|v| assert_eq!(*v, 10));
        drop(r);
        let w = lock.lock_write(1, || 10);
        w.with_item_mut(|v| *v += 1);
        w.with_item_mut(|v| assert_eq!(*v, 11));
    }

    #[test]
    fn downgrade_preserves_value() {
        let lock: SlotRwLock<u32, i32> = SlotRwLock::with_capacity(4);
        let w = lock.lock_write(1, || 5);
        let r = lock.downgrade(w);
        r.with_item(|v| assert_eq!(*v, 5));
    }
}
