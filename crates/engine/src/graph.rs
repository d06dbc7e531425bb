// SPDX-License-Identifier: Apache-2.0

//! The module graph: an arena of module nodes wired by gates.
//!
//! Modules, gates, and tasks live in arenas and reference each other by key
//! and index, never by pointer, so the cyclic gate graph (module → ogate →
//! downstream module → igate → upstream ogates) carries no ownership cycles.
//! Input gates keep upstream backlinks, making disconnect and the
//! destroy-time liveness check O(degree) instead of a whole-graph scan.
//!
//! The graph is wrapped in a `RwLock` by the pipeline: workers hold a read
//! guard while executing a task; every mutation here happens under the
//! all-workers-paused invariant with the write guard held.

use crate::error::Error;
use crate::gate::{GateIdx, IGate, MAX_GATES, OGate};
use crate::hooks::GateHook;
use crate::module::{MAX_TASKS_PER_MODULE, Module, ModuleRegistry, snake_case_name};
use crate::task::{Task, TaskId};
use parking_lot::{Mutex, MutexGuard};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;

new_key_type! {
    /// Key of a module in the graph arena.
    pub struct ModuleId;
}

/// One module instance and its gate space.
pub struct ModuleNode {
    name: String,
    class_name: String,
    module: Mutex<Box<dyn Module>>,
    igates: Vec<Option<IGate>>,
    ogates: Vec<Option<OGate>>,
    tasks: Vec<TaskId>,
}

impl ModuleNode {
    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class this instance was created from.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Tasks registered on this module.
    #[must_use]
    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    /// Locks the module state for a call.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Module>> {
        self.module.lock()
    }

    /// The output gate at `idx`, if allocated.
    #[must_use]
    pub fn ogate(&self, idx: GateIdx) -> Option<&OGate> {
        self.ogates.get(idx as usize)?.as_ref()
    }

    /// The input gate at `idx`, if allocated.
    #[must_use]
    pub fn igate(&self, idx: GateIdx) -> Option<&IGate> {
        self.igates.get(idx as usize)?.as_ref()
    }

    /// Indices of allocated, connected output gates.
    #[must_use]
    pub fn connected_ogates(&self) -> Vec<GateIdx> {
        self.ogates
            .iter()
            .enumerate()
            .filter_map(|(i, g)| {
                g.as_ref()
                    .and_then(|og| og.target.map(|_| i as GateIdx))
            })
            .collect()
    }

    fn any_upstream(&self) -> bool {
        self.igates
            .iter()
            .flatten()
            .any(|ig| !ig.upstream.is_empty())
    }
}

/// The process-wide module graph.
#[derive(Default)]
pub struct ModuleGraph {
    modules: SlotMap<ModuleId, ModuleNode>,
    tasks: SlotMap<TaskId, Task>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if the graph has no modules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Looks a module up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    /// The node for `id`.
    ///
    /// # Panics
    /// Panics on a stale id; graph ids are only handed out by this graph.
    #[must_use]
    pub fn node(&self, id: ModuleId) -> &ModuleNode {
        &self.modules[id]
    }

    /// Iterates over all modules.
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &ModuleNode)> {
        self.modules.iter()
    }

    /// The task for `tid`, if still registered.
    #[must_use]
    pub fn task(&self, tid: TaskId) -> Option<Task> {
        self.tasks.get(tid).copied()
    }

    /// Creates a module instance. With `name = None` the instance is named
    /// `snake_case(class)` plus the first free ordinal.
    pub fn create_module(
        &mut self,
        registry: &ModuleRegistry,
        class: &str,
        name: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<ModuleId, Error> {
        let factory = registry.get(class)?;

        let name = match name {
            Some(n) => {
                if self.by_name.contains_key(n) {
                    return Err(Error::ModuleAlreadyExists {
                        module: n.to_owned(),
                    });
                }
                n.to_owned()
            }
            None => {
                let base = snake_case_name(class);
                let mut i = 0usize;
                loop {
                    let candidate = format!("{base}{i}");
                    if !self.by_name.contains_key(&candidate) {
                        break candidate;
                    }
                    i += 1;
                }
            }
        };

        let module = (factory.create)(config).map_err(|e| Error::ModuleInitFailed {
            module: name.clone(),
            details: e.to_string(),
        })?;

        let id = self.modules.insert(ModuleNode {
            name: name.clone(),
            class_name: class.to_owned(),
            module: Mutex::new(module),
            igates: Vec::new(),
            ogates: Vec::new(),
            tasks: Vec::new(),
        });
        let _ = self.by_name.insert(name, id);
        Ok(id)
    }

    /// Destroys a module. Fails with a busy error while any upstream output
    /// gate still targets it or any of its tasks is attached; the module's
    /// own downstream connections are released automatically.
    pub fn destroy_module(&mut self, id: ModuleId) -> Result<(), Error> {
        let node = &self.modules[id];
        if !node.tasks.is_empty() {
            return Err(Error::ModuleInUse {
                module: node.name.clone(),
                reason: format!("{} task(s) still attached", node.tasks.len()),
            });
        }
        if node.any_upstream() {
            return Err(Error::ModuleInUse {
                module: node.name.clone(),
                reason: "upstream output gates still connected".to_owned(),
            });
        }

        for ogate in self.modules[id].connected_ogates() {
            self.disconnect(id, ogate)?;
        }

        let mut node = self.modules.remove(id).expect("checked above");
        node.module.get_mut().deinit();
        let _ = self.by_name.remove(&node.name);
        Ok(())
    }

    /// Connects `src`'s output gate to `dst`'s input gate.
    pub fn connect(
        &mut self,
        src: ModuleId,
        ogate: GateIdx,
        dst: ModuleId,
        igate: GateIdx,
    ) -> Result<(), Error> {
        let (dst_receives, igate_limit, igate_priority, igate_mergeable) = {
            let module = self.modules[dst].lock();
            (
                module.can_receive(),
                module.num_igates().min(MAX_GATES),
                module.igate_priority(igate),
                module.igate_mergeable(igate),
            )
        };
        if !dst_receives {
            return Err(Error::NotAReceiver {
                module: self.modules[dst].name.clone(),
            });
        }
        if igate >= igate_limit {
            return Err(Error::GateOutOfRange {
                module: self.modules[dst].name.clone(),
                gate: igate,
            });
        }
        let ogate_limit = self.modules[src].lock().num_ogates().min(MAX_GATES);
        if ogate >= ogate_limit {
            return Err(Error::GateOutOfRange {
                module: self.modules[src].name.clone(),
                gate: ogate,
            });
        }

        // Allocate the gate slots on demand.
        {
            let src_node = &mut self.modules[src];
            let slot = ogate as usize;
            if src_node.ogates.len() <= slot {
                src_node.ogates.resize_with(slot + 1, || None);
            }
            let gate = src_node.ogates[slot].get_or_insert_with(OGate::new);
            if gate.target.is_some() {
                return Err(Error::GateBusy {
                    module: src_node.name.clone(),
                    gate: ogate,
                });
            }
            gate.target = Some((dst, igate));
        }
        {
            let dst_node = &mut self.modules[dst];
            let slot = igate as usize;
            if dst_node.igates.len() <= slot {
                dst_node.igates.resize_with(slot + 1, || None);
            }
            let gate = dst_node.igates[slot]
                .get_or_insert_with(|| IGate::new(igate_priority, igate_mergeable));
            gate.upstream.push((src, ogate));
        }
        Ok(())
    }

    /// Disconnects `src`'s output gate. Disconnecting an unconnected gate is
    /// a no-op.
    pub fn disconnect(&mut self, src: ModuleId, ogate: GateIdx) -> Result<(), Error> {
        if ogate >= MAX_GATES {
            return Err(Error::GateOutOfRange {
                module: self.modules[src].name.clone(),
                gate: ogate,
            });
        }
        let target = {
            let src_node = &mut self.modules[src];
            match src_node.ogates.get_mut(ogate as usize) {
                Some(Some(gate)) => gate.target.take(),
                _ => None,
            }
        };
        if let Some((dst, igate)) = target {
            if let Some(Some(gate)) = self.modules[dst].igates.get_mut(igate as usize) {
                gate.upstream.retain(|&up| up != (src, ogate));
            }
        }
        Ok(())
    }

    /// Registers a task on a module.
    pub fn add_task(&mut self, module: ModuleId, arg: u64) -> Result<TaskId, Error> {
        let node = &self.modules[module];
        if !node.lock().can_run_task() {
            return Err(Error::TasksNotSupported {
                module: node.name.clone(),
            });
        }
        if node.tasks.len() >= MAX_TASKS_PER_MODULE {
            return Err(Error::TooManyTasks {
                module: node.name.clone(),
            });
        }
        let tid = self.tasks.insert(Task::new(module, arg));
        self.modules[module].tasks.push(tid);
        Ok(tid)
    }

    /// Unregisters a task.
    pub fn remove_task(&mut self, tid: TaskId) {
        if let Some(task) = self.tasks.remove(tid) {
            self.modules[task.module].tasks.retain(|&t| t != tid);
        }
    }

    /// Records which leaf class owns a task.
    pub fn set_task_owner(&mut self, tid: TaskId, owner: Option<(u32, pktflow_sched::TcId)>) {
        if let Some(task) = self.tasks.get_mut(tid) {
            task.owner = owner;
        }
    }

    /// Tears the whole graph down: every module is deinitialised and every
    /// task dropped. Only called under the pause invariant.
    pub fn clear(&mut self) {
        for (_, node) in self.modules.iter_mut() {
            node.module.get_mut().deinit();
        }
        self.modules.clear();
        self.tasks.clear();
        self.by_name.clear();
    }

    /// Installs a hook on an output gate.
    pub fn add_ogate_hook(
        &mut self,
        module: ModuleId,
        ogate: GateIdx,
        hook: Box<dyn GateHook>,
    ) -> Result<(), Error> {
        let node = &mut self.modules[module];
        let gate_desc = format!("{}:o{}", node.name, ogate);
        let module_name = node.name.clone();
        // Hooks only make sense on a live edge.
        let gate = node
            .ogates
            .get_mut(ogate as usize)
            .and_then(|g| g.as_mut())
            .filter(|g| g.target.is_some())
            .ok_or(Error::GateOutOfRange {
                module: module_name,
                gate: ogate,
            })?;
        gate.hooks.add(hook).map_err(|hook| Error::HookAlreadyInstalled {
            gate: gate_desc,
            hook: hook.name().to_owned(),
        })
    }

    /// Removes a hook from an output gate.
    pub fn remove_ogate_hook(
        &mut self,
        module: ModuleId,
        ogate: GateIdx,
        name: &str,
    ) -> Result<(), Error> {
        let node = &mut self.modules[module];
        let gate_desc = format!("{}:o{}", node.name, ogate);
        let removed = node
            .ogates
            .get_mut(ogate as usize)
            .and_then(|g| g.as_mut())
            .is_some_and(|g| g.hooks.remove(name));
        if removed {
            Ok(())
        } else {
            Err(Error::UnknownHook {
                gate: gate_desc,
                hook: name.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleFactory;
    use crate::run::RunContext;
    use pktflow_packet::PacketBatch;

    struct Passthrough;
    impl Module for Passthrough {
        fn can_receive(&self) -> bool {
            true
        }
        fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
            while let Some(pkt) = batch.pop_front() {
                ctx.emit_packet(pkt, 0);
            }
        }
    }

    struct Producer;
    impl Module for Producer {
        fn can_run_task(&self) -> bool {
            true
        }
        fn run_task(
            &mut self,
            _ctx: &mut RunContext<'_>,
            _batch: &mut PacketBatch,
            _arg: u64,
        ) -> crate::module::TaskResult {
            crate::module::TaskResult::default()
        }
    }

    fn registry() -> ModuleRegistry {
        let mut r = ModuleRegistry::new();
        r.register(ModuleFactory {
            class_name: "Passthrough",
            create: |_| Ok(Box::new(Passthrough)),
        });
        r.register(ModuleFactory {
            class_name: "Producer",
            create: |_| Ok(Box::new(Producer)),
        });
        r
    }

    #[test]
    fn default_names_take_free_ordinals() {
        let reg = registry();
        let mut g = ModuleGraph::new();
        let cfg = serde_json::Value::Null;
        let a = g.create_module(&reg, "Passthrough", None, &cfg).expect("a");
        let b = g.create_module(&reg, "Passthrough", None, &cfg).expect("b");
        assert_eq!(g.node(a).name(), "passthrough0");
        assert_eq!(g.node(b).name(), "passthrough1");
        assert!(matches!(
            g.create_module(&reg, "Passthrough", Some("passthrough0"), &cfg),
            Err(Error::ModuleAlreadyExists { .. })
        ));
    }

    #[test]
    fn connect_checks_capability_and_occupancy() {
        let reg = registry();
        let mut g = ModuleGraph::new();
        let cfg = serde_json::Value::Null;
        let src = g.create_module(&reg, "Producer", None, &cfg).expect("src");
        let dst = g.create_module(&reg, "Passthrough", None, &cfg).expect("dst");

        // Producers cannot receive.
        assert!(matches!(
            g.connect(dst, 0, src, 0),
            Err(Error::NotAReceiver { .. })
        ));

        g.connect(src, 0, dst, 0).expect("connect");
        assert!(matches!(
            g.connect(src, 0, dst, 0),
            Err(Error::GateBusy { .. })
        ));

        // Backlink present.
        assert_eq!(g.node(dst).igate(0).expect("igate").upstream, vec![(src, 0)]);

        // Disconnect is idempotent and clears the backlink.
        g.disconnect(src, 0).expect("disconnect");
        g.disconnect(src, 0).expect("disconnect again");
        assert!(g.node(dst).igate(0).expect("igate").upstream.is_empty());
    }

    #[test]
    fn destroy_refuses_live_references() {
        let reg = registry();
        let mut g = ModuleGraph::new();
        let cfg = serde_json::Value::Null;
        let src = g.create_module(&reg, "Producer", None, &cfg).expect("src");
        let dst = g.create_module(&reg, "Passthrough", None, &cfg).expect("dst");
        g.connect(src, 0, dst, 0).expect("connect");

        // Upstream gate still targets dst.
        let err = g.destroy_module(dst).expect_err("busy");
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
        // State unchanged: still connected.
        assert!(g.node(src).ogate(0).expect("ogate").target.is_some());

        // A module with a registered task refuses destruction too.
        let tid = g.add_task(src, 0).expect("task");
        let err = g.destroy_module(src).expect_err("busy");
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);

        g.remove_task(tid);
        // src's own downstream edge is released by its destruction.
        g.destroy_module(src).expect("destroy src");
        assert!(g.node(dst).igate(0).expect("igate").upstream.is_empty());
        g.destroy_module(dst).expect("destroy dst");
        assert!(g.is_empty());
    }

    #[test]
    fn task_registration_enforces_capability_and_limit() {
        let reg = registry();
        let mut g = ModuleGraph::new();
        let cfg = serde_json::Value::Null;
        let sink = g.create_module(&reg, "Passthrough", None, &cfg).expect("m");
        assert!(matches!(
            g.add_task(sink, 0),
            Err(Error::TasksNotSupported { .. })
        ));

        let src = g.create_module(&reg, "Producer", None, &cfg).expect("m");
        for _ in 0..MAX_TASKS_PER_MODULE {
            let _ = g.add_task(src, 0).expect("task");
        }
        assert!(matches!(g.add_task(src, 0), Err(Error::TooManyTasks { .. })));
    }
}
