// SPDX-License-Identifier: Apache-2.0

//! The per-worker scheduler: tree traversal, wakeups, and idle accounting.
//!
//! The scheduler is deliberately clock-free: `next` and `done` take explicit
//! TSC values. The worker loop feeds real timestamps; tests feed synthetic
//! ones and get fully deterministic behaviour.

use crate::resource::ResourceArr;
use crate::tree::{TcId, TcTree};
use crate::wakeup::WakeupQueue;

/// Aggregate per-scheduler statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedStats {
    /// Usage accumulated across every scheduled task.
    pub usage: ResourceArr,
    /// Rounds that found no runnable leaf.
    pub cnt_idle: u64,
    /// Cycles spent in idle rounds.
    pub cycles_idle: u64,
}

/// A per-worker scheduler over a traffic-class tree with leaves of type `T`.
#[derive(Debug)]
pub struct Scheduler<T> {
    tree: TcTree<T>,
    wakeup: WakeupQueue<TcId>,
    stats: SchedStats,
    last_stats: SchedStats,
}

impl<T> Scheduler<T> {
    /// Creates a scheduler whose root class is named `root_name`.
    #[must_use]
    pub fn new(root_name: impl Into<String>) -> Self {
        Scheduler {
            tree: TcTree::new(root_name),
            wakeup: WakeupQueue::new(),
            stats: SchedStats::default(),
            last_stats: SchedStats::default(),
        }
    }

    /// The traffic-class tree.
    #[must_use]
    pub fn tree(&self) -> &TcTree<T> {
        &self.tree
    }

    /// Mutable access to the traffic-class tree.
    pub fn tree_mut(&mut self) -> &mut TcTree<T> {
        &mut self.tree
    }

    /// Selects the leaf to run next, first resuming any throttled classes
    /// whose wakeup time has passed.
    pub fn next(&mut self, tsc: u64) -> Option<TcId> {
        self.resume_throttled(tsc);
        self.tree.pick_next()
    }

    /// Charges `usage` for a completed leaf run. The leaf's blocked flag
    /// must already reflect the task result (see
    /// [`TcTree::set_leaf_blocked`]).
    pub fn done(&mut self, leaf: TcId, usage: &ResourceArr, tsc: u64) {
        self.stats.usage.accumulate(usage);
        self.tree
            .finish_and_account(&mut self.wakeup, leaf, usage, tsc);
    }

    /// Records an idle round.
    pub fn account_idle(&mut self, cycles: u64) {
        self.stats.cnt_idle += 1;
        self.stats.cycles_idle += cycles;
    }

    /// Drains the wakeup heap, unblocking every throttled class whose
    /// deadline is at or before `now`.
    pub fn resume_throttled(&mut self, now: u64) {
        while let Some((event_tsc, id)) = self.wakeup.pop_expired(now) {
            let _ = self.tree.unthrottle(id, event_tsc, now);
        }
    }

    /// Earliest pending wakeup, if any.
    #[must_use]
    pub fn next_wakeup(&self) -> Option<u64> {
        self.wakeup.next_wakeup()
    }

    /// Aggregate statistics since start (or the last reset).
    #[must_use]
    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    /// Usage accumulated since the previous checkpoint, then re-arms the
    /// checkpoint. Used for periodic rate reporting.
    pub fn checkpoint_delta(&mut self) -> SchedStats {
        let delta = SchedStats {
            usage: self.stats.usage.delta(&self.last_stats.usage),
            cnt_idle: self.stats.cnt_idle - self.last_stats.cnt_idle,
            cycles_idle: self.stats.cycles_idle - self.last_stats.cycles_idle,
        };
        self.last_stats = self.stats;
        delta
    }

    /// Zeroes scheduler and per-class statistics.
    pub fn reset_stats(&mut self) {
        self.stats = SchedStats::default();
        self.last_stats = SchedStats::default();
        self.tree.reset_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::tree::{Attach, PolicyParams};

    #[test]
    fn idle_rounds_are_accounted() {
        let mut sched: Scheduler<()> = Scheduler::new("root");
        assert!(sched.next(0).is_none());
        sched.account_idle(123);
        assert_eq!(sched.stats().cnt_idle, 1);
        assert_eq!(sched.stats().cycles_idle, 123);
    }

    #[test]
    fn checkpoint_delta_windows_usage() {
        let mut sched: Scheduler<()> = Scheduler::new("root");
        let leaf = sched
            .tree_mut()
            .create("leaf", PolicyParams::Leaf)
            .expect("create");
        let root = sched.tree().root();
        sched
            .tree_mut()
            .attach(root, leaf, Attach::RoundRobin, 0)
            .expect("attach");
        sched.tree_mut().attach_task(leaf, (), 0).expect("task");

        let leaf = sched.next(10).expect("runnable");
        sched.done(leaf, &ResourceArr::new(1, 5, 32, 256), 15);

        let delta = sched.checkpoint_delta();
        assert_eq!(delta.usage[Resource::Packets], 32);
        let delta = sched.checkpoint_delta();
        assert_eq!(delta.usage[Resource::Packets], 0);
    }
}
