// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bare test-and-test-and-set spinlock implementing [`lock_api::RawMutex`].
//!
//! A classic test-and-test-and-set loop targeting `std::sync::atomic`
//! rather than `core::sync::atomic`, since this workspace is hosted.

use lock_api::GuardSend;
use std::sync::atomic::{AtomicBool, Ordering};

/// Low-level mutual exclusion lock used for the `ReqNodeLock` and
/// `ResLookupLock` ranks, where hold times are short and contention is
/// expected to be low: a lightweight per-requirement spinlock.
pub struct RawSpinlock {
    locked: AtomicBool,
}

// Safety: `RawSpinlock` has no thread affinity.
unsafe impl lock_api::RawMutex for RawSpinlock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { locked: AtomicBool::new(false) };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                std::hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
