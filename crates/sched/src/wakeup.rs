// SPDX-License-Identifier: Apache-2.0

//! Wakeup queue for throttled rate-limit classes.

use slotmap::Key;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Min-heap of throttled classes keyed by wakeup TSC.
///
/// Entries are not removed when a class is destroyed; stale keys simply miss
/// in the arena when they expire and are skipped by the scheduler.
#[derive(Debug)]
pub struct WakeupQueue<K: Key> {
    heap: BinaryHeap<Reverse<(u64, K)>>,
}

impl<K: Key> Default for WakeupQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> WakeupQueue<K> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        WakeupQueue {
            heap: BinaryHeap::new(),
        }
    }

    /// Schedules `tc` to wake at `wakeup_time`.
    pub fn push(&mut self, wakeup_time: u64, tc: K) {
        self.heap.push(Reverse((wakeup_time, tc)));
    }

    /// Earliest scheduled wakeup, if any.
    #[must_use]
    pub fn next_wakeup(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    /// Pops the earliest entry if its wakeup time is at or before `now`.
    pub fn pop_expired(&mut self, now: u64) -> Option<(u64, K)> {
        match self.heap.peek() {
            Some(Reverse((t, _))) if *t <= now => {
                let Reverse(entry) = self.heap.pop().expect("peeked entry");
                Some(entry)
            }
            _ => None,
        }
    }

    /// Number of pending wakeups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if no wakeups are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
