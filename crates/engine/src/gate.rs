// SPDX-License-Identifier: Apache-2.0

//! Gates: the typed edges between modules.
//!
//! An output gate points at one input gate of a downstream module, or at
//! nothing (a disconnected gate drops). Input gates keep backlinks to every
//! upstream output gate, which makes disconnect and destroy O(1) instead of
//! a graph scan. Both sides carry an ordered hook list and output gates
//! count the batches and packets crossing the edge.

use crate::graph::ModuleId;
use crate::hooks::GateHook;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Gate index within a module.
pub type GateIdx = u16;

/// A module may have up to this many input/output gates (separately).
pub const MAX_GATES: GateIdx = 8192;

/// Sentinel output-gate index: free the packet and count a silent drop.
pub const DROP_GATE: GateIdx = MAX_GATES;

/// Sentinel for "no gate".
pub const INVALID_GATE: GateIdx = u16::MAX;

/// Per-edge counters, updated by the owning worker and readable from the
/// control plane.
#[derive(Debug, Default)]
pub struct GateCounters {
    /// Batches that crossed the edge.
    pub batches: AtomicU64,
    /// Packets that crossed the edge.
    pub packets: AtomicU64,
    /// TSC of the most recent crossing.
    pub last_tsc: AtomicU64,
}

impl GateCounters {
    pub(crate) fn record(&self, packets: u64, tsc: u64) {
        let _ = self.batches.fetch_add(1, Ordering::Relaxed);
        let _ = self.packets.fetch_add(packets, Ordering::Relaxed);
        self.last_tsc.store(tsc, Ordering::Relaxed);
    }

    /// (batches, packets, last_tsc) snapshot.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.batches.load(Ordering::Relaxed),
            self.packets.load(Ordering::Relaxed),
            self.last_tsc.load(Ordering::Relaxed),
        )
    }
}

/// Ordered, name-unique hook list shared by both gate directions.
#[derive(Default)]
pub struct HookList {
    hooks: Vec<Box<dyn GateHook>>,
}

impl HookList {
    /// Installs a hook, keeping the list ordered by (priority, name).
    /// Fails if a hook with the same name is present.
    pub fn add(&mut self, hook: Box<dyn GateHook>) -> Result<(), Box<dyn GateHook>> {
        if self.hooks.iter().any(|h| h.name() == hook.name()) {
            return Err(hook);
        }
        let pos = self
            .hooks
            .iter()
            .position(|h| (h.priority(), h.name()) > (hook.priority(), hook.name()))
            .unwrap_or(self.hooks.len());
        self.hooks.insert(pos, hook);
        Ok(())
    }

    /// Removes the hook with the given name, returning whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.name() != name);
        self.hooks.len() != before
    }

    /// Finds a hook by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&dyn GateHook> {
        self.hooks.iter().find(|h| h.name() == name).map(|h| h.as_ref())
    }

    /// Runs every hook over the batch, in priority order.
    pub fn run(&self, batch: &pktflow_packet::PacketBatch) {
        for hook in &self.hooks {
            hook.process_batch(batch);
        }
    }

    /// Returns true if no hooks are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for HookList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name()))
            .finish()
    }
}

/// Output gate: one per emitting slot of a module.
#[derive(Debug)]
pub struct OGate {
    /// Downstream (module, igate) pair; `None` while disconnected.
    pub target: Option<(ModuleId, GateIdx)>,
    /// Hooks run over every batch leaving through this gate.
    pub hooks: HookList,
    /// Edge counters.
    pub counters: Arc<GateCounters>,
}

impl OGate {
    pub(crate) fn new() -> Self {
        OGate {
            target: None,
            hooks: HookList::default(),
            counters: Arc::new(GateCounters::default()),
        }
    }
}

/// Input gate: one per receiving slot of a module.
#[derive(Debug)]
pub struct IGate {
    /// Drain priority inside one task execution; lower values drain first.
    pub priority: u32,
    /// Whether concurrent emissions within a task merge into one batch.
    pub mergeable: bool,
    /// Upstream (module, ogate) pairs targeting this gate.
    pub upstream: Vec<(ModuleId, GateIdx)>,
    /// Hooks run over every batch entering through this gate.
    pub hooks: HookList,
}

impl IGate {
    pub(crate) fn new(priority: u32, mergeable: bool) -> Self {
        IGate {
            priority,
            mergeable,
            upstream: Vec::new(),
            hooks: HookList::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pktflow_packet::PacketBatch;

    struct Probe {
        name: &'static str,
        priority: u16,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl GateHook for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u16 {
            self.priority
        }
        fn process_batch(&self, _batch: &PacketBatch) {
            self.log.lock().push(self.name);
        }
    }

    #[test]
    fn hooks_run_in_priority_order_and_names_are_unique() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookList::default();
        let make = |name, priority| {
            Box::new(Probe {
                name,
                priority,
                log: log.clone(),
            })
        };
        hooks.add(make("late", 10)).unwrap_or_else(|_| panic!("add"));
        hooks.add(make("early", 1)).unwrap_or_else(|_| panic!("add"));
        hooks.add(make("mid", 5)).unwrap_or_else(|_| panic!("add"));
        assert!(hooks.add(make("late", 5)).is_err(), "duplicate name");

        hooks.run(&PacketBatch::new());
        assert_eq!(*log.lock(), vec!["early", "mid", "late"]);

        assert!(hooks.remove("late"));
        assert!(!hooks.remove("late"));
        assert!(hooks.find("early").is_some());
    }

    #[test]
    fn gate_counters_accumulate() {
        let counters = GateCounters::default();
        counters.record(32, 100);
        counters.record(16, 200);
        assert_eq!(counters.snapshot(), (2, 48, 200));
    }
}
