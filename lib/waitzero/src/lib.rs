// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Countdown-to-zero synchronizer.
//!
//! A `WaitZero` is armed with a count by one producer, decremented by
//! many releasers, and waited on by one consumer. `wait` returns when
//! the count reaches zero and not before; releases past zero are a
//! caller bug and panic in debug builds.
//!
//! The intended use is startup fan-out: arm with the number of threads
//! being started, have each thread release exactly once when it is
//! either up or has recorded its failure, and wait in the starter. The
//! release acts as the publication point for anything the thread wrote
//! before it (the mutex pair provides the ordering).

use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct WaitZero {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WaitZero {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the counter. Must not be called while a `wait` is pending.
    pub fn arm(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count = n;
        if n == 0 {
            self.zero.notify_all();
        }
    }

    /// Decrements by one, waking the waiter on the transition to zero.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        debug_assert!(*count > 0, "release past zero");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Blocks until the count is zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count != 0 {
            count = self.zero.wait(count).unwrap();
        }
    }
}
