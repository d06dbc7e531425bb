// SPDX-License-Identifier: Apache-2.0

//! The process-wide control plane.
//!
//! A [`Pipeline`] owns every name table (modules, traffic classes, ports),
//! the per-socket packet pools, and the worker handles. Initialisation order
//! is pools → workers (parked) → graph/TC mutations → resume.
//!
//! Mutations of the module graph and the traffic-class trees require every
//! worker to be observably paused; violations return a busy error and leave
//! state untouched. Read-only queries (listings, stats) run at any time.

use crate::error::Error;
use crate::gate::GateIdx;
use crate::graph::{ModuleGraph, ModuleId};
use crate::hooks::Tcpdump;
use crate::module::ModuleRegistry;
use crate::port::{Port, PortRegistry};
use crate::tsc;
use crate::worker::{WorkerHandle, WorkerStatus, launch_worker};
use parking_lot::{Mutex, RwLock};
use pktflow_config::{TcPolicy, TcSpec, UNSET_PRIORITY};
use pktflow_packet::{HeapPool, PacketPool, PoolId};
use pktflow_sched::{
    Attach, PolicyKind, PolicyParams, Resource, ResourceArr, TcId,
    limit_to_work_units_per_cycle, to_work_units,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Where a named traffic class lives.
#[derive(Debug, Clone)]
struct TcHome {
    wid: u32,
    auto_free: bool,
}

/// A named port instance.
pub type PortCell = Arc<Mutex<Box<dyn Port>>>;

/// Snapshot of one worker for listings.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    /// Worker id.
    pub wid: u32,
    /// Pinned core.
    pub core: u32,
    /// NUMA socket.
    pub socket: u32,
    /// Lifecycle state.
    pub status: String,
    /// Packets sent to a dead end by this worker.
    pub silent_drops: u64,
    /// TSC cached at the worker's current round.
    pub current_tsc: u64,
}

/// Snapshot of one traffic class for listings.
#[derive(Debug, Clone, Serialize)]
pub struct TcInfo {
    /// Class name.
    pub name: String,
    /// Worker the class lives on; `None` for orphans.
    pub wid: Option<u32>,
    /// Policy kind.
    pub policy: String,
    /// Whether the class is currently blocked.
    pub blocked: bool,
    /// Parent class name, if attached.
    pub parent: Option<String>,
}

/// Snapshot of one connected edge for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Emitting module.
    pub src: String,
    /// Output gate on the emitting module.
    pub ogate: GateIdx,
    /// Receiving module.
    pub dst: String,
    /// Input gate on the receiving module.
    pub igate: GateIdx,
    /// Batches that crossed the edge.
    pub batches: u64,
    /// Packets that crossed the edge.
    pub packets: u64,
    /// TSC of the most recent crossing.
    pub last_tsc: u64,
}

/// Statistics snapshot of one traffic class.
#[derive(Debug, Clone, Serialize)]
pub struct TcStatsInfo {
    /// Class name.
    pub name: String,
    /// Worker the class lives on.
    pub wid: u32,
    /// (count, cycles, packets, bits) usage tuple.
    pub usage: [u64; 4],
    /// Times the class was throttled.
    pub cnt_throttled: u64,
}

/// The process-wide dataplane.
pub struct Pipeline {
    registry: ModuleRegistry,
    port_registry: PortRegistry,
    graph: Arc<RwLock<ModuleGraph>>,
    workers: Mutex<BTreeMap<u32, WorkerHandle>>,
    pools: Mutex<HashMap<u32, Arc<dyn PacketPool>>>,
    tc_homes: Mutex<HashMap<String, TcHome>>,
    orphans: Mutex<Vec<TcSpec>>,
    ports: Mutex<HashMap<String, PortCell>>,
}

impl Pipeline {
    /// Creates an empty pipeline with the given module registry.
    #[must_use]
    pub fn new(registry: ModuleRegistry) -> Self {
        Pipeline {
            registry,
            port_registry: PortRegistry::with_builtin(),
            graph: Arc::new(RwLock::new(ModuleGraph::new())),
            workers: Mutex::new(BTreeMap::new()),
            pools: Mutex::new(HashMap::new()),
            tc_homes: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// The shared module graph (read by workers, written under pause).
    #[must_use]
    pub fn graph(&self) -> &Arc<RwLock<ModuleGraph>> {
        &self.graph
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Creates the packet pool for a socket. Pools are created once at
    /// startup.
    pub fn create_pool(&self, socket: u32, capacity: usize) -> Result<(), Error> {
        let mut pools = self.pools.lock();
        if pools.contains_key(&socket) {
            return Err(Error::InvalidArgument {
                field: "pool.socket".to_owned(),
                reason: format!("socket {socket} already has a pool"),
            });
        }
        let id = PoolId(socket as u16);
        let _ = pools.insert(socket, Arc::new(HeapPool::new(id, socket, capacity)));
        Ok(())
    }

    /// The pool local to `socket`, falling back to any pool when the socket
    /// has none.
    pub fn pool_for_socket(&self, socket: u32) -> Result<Arc<dyn PacketPool>, Error> {
        let pools = self.pools.lock();
        if let Some(pool) = pools.get(&socket) {
            return Ok(pool.clone());
        }
        pools
            .values()
            .next()
            .cloned()
            .ok_or(Error::NoPacketPool { socket })
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Launches a worker pinned to `core`. The worker parks itself paused.
    pub fn add_worker(&self, wid: u32, core: u32) -> Result<(), Error> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&wid) {
            return Err(Error::WorkerAlreadyExists { wid });
        }
        if workers.values().any(|w| w.shared().core == core) {
            return Err(Error::CoreInUse { core });
        }
        let socket = crate::worker::socket_of_core(core);
        let pool = self.pool_for_socket(socket)?;
        let handle = launch_worker(wid, core, self.graph.clone(), pool)?;
        let _ = workers.insert(wid, handle);
        tracing::info!(wid, core, "worker.added");
        Ok(())
    }

    /// Pauses every worker, spinning until each is observably parked.
    pub fn pause_all(&self) {
        for handle in self.workers.lock().values() {
            handle.pause();
        }
    }

    /// Attaches pending orphan classes, then resumes every paused worker.
    pub fn resume_all(&self) {
        self.process_orphans();
        for handle in self.workers.lock().values() {
            handle.resume();
        }
    }

    /// Returns true if any worker is currently running.
    #[must_use]
    pub fn any_worker_running(&self) -> bool {
        self.workers
            .lock()
            .values()
            .any(|w| w.shared().status() == WorkerStatus::Running)
    }

    /// Pauses, stops, and joins every worker.
    pub fn destroy_workers(&self) {
        let mut workers = self.workers.lock();
        let handles: Vec<WorkerHandle> = std::mem::take(&mut *workers)
            .into_values()
            .collect();
        drop(workers);
        for handle in handles {
            handle.destroy();
        }
    }

    /// Snapshot of every worker.
    #[must_use]
    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .lock()
            .values()
            .map(|w| {
                let s = w.shared();
                WorkerInfo {
                    wid: s.wid,
                    core: s.core,
                    socket: s.socket,
                    status: s.status().to_string(),
                    silent_drops: s.silent_drops(),
                    current_tsc: s.current_tsc(),
                }
            })
            .collect()
    }

    fn ensure_all_paused(&self, operation: &'static str) -> Result<(), Error> {
        let all_paused = self
            .workers
            .lock()
            .values()
            .all(|w| w.shared().status() == WorkerStatus::Paused);
        if all_paused {
            Ok(())
        } else {
            Err(Error::WorkersNotPaused { operation })
        }
    }

    // ------------------------------------------------------------------
    // Modules and gates
    // ------------------------------------------------------------------

    /// Creates a module instance. Requires all workers paused.
    pub fn create_module(
        &self,
        class: &str,
        name: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<String, Error> {
        self.ensure_all_paused("create_module")?;
        let mut graph = self.graph.write();
        let id = graph.create_module(&self.registry, class, name, config)?;
        let name = graph.node(id).name().to_owned();
        tracing::info!(module = %name, class, "module.created");
        Ok(name)
    }

    /// Destroys a module. Requires all workers paused; fails while upstream
    /// gates or tasks still reference it.
    pub fn destroy_module(&self, name: &str) -> Result<(), Error> {
        self.ensure_all_paused("destroy_module")?;
        let mut graph = self.graph.write();
        let id = self.find_module(&graph, name)?;
        graph.destroy_module(id)?;
        tracing::info!(module = %name, "module.destroyed");
        Ok(())
    }

    /// Connects two modules' gates. Requires all workers paused.
    pub fn connect_modules(
        &self,
        src: &str,
        ogate: GateIdx,
        dst: &str,
        igate: GateIdx,
    ) -> Result<(), Error> {
        self.ensure_all_paused("connect_modules")?;
        let mut graph = self.graph.write();
        let src_id = self.find_module(&graph, src)?;
        let dst_id = self.find_module(&graph, dst)?;
        graph.connect(src_id, ogate, dst_id, igate)?;
        tracing::debug!(src, ogate, dst, igate, "modules.connected");
        Ok(())
    }

    /// Disconnects an output gate (idempotent). Requires all workers paused.
    pub fn disconnect_modules(&self, src: &str, ogate: GateIdx) -> Result<(), Error> {
        self.ensure_all_paused("disconnect_modules")?;
        let mut graph = self.graph.write();
        let src_id = self.find_module(&graph, src)?;
        graph.disconnect(src_id, ogate)?;
        tracing::debug!(src, ogate, "modules.disconnected");
        Ok(())
    }

    /// Names of all modules, sorted.
    #[must_use]
    pub fn list_modules(&self) -> Vec<String> {
        let graph = self.graph.read();
        let mut names: Vec<String> = graph.iter().map(|(_, n)| n.name().to_owned()).collect();
        names.sort_unstable();
        names
    }

    /// Every connected edge with its counters, sorted by source.
    #[must_use]
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let graph = self.graph.read();
        let mut out = Vec::new();
        for (_, node) in graph.iter() {
            for ogate in node.connected_ogates() {
                let gate = node.ogate(ogate).expect("connected gate");
                let Some((dst, igate)) = gate.target else {
                    continue;
                };
                let (batches, packets, last_tsc) = gate.counters.snapshot();
                out.push(ConnectionInfo {
                    src: node.name().to_owned(),
                    ogate,
                    dst: graph.node(dst).name().to_owned(),
                    igate,
                    batches,
                    packets,
                    last_tsc,
                });
            }
        }
        out.sort_by(|a, b| (&a.src, a.ogate).cmp(&(&b.src, b.ogate)));
        out
    }

    /// Runs a module command. Thread-unsafe commands require all workers
    /// paused; unknown commands are rejected.
    pub fn run_module_command(
        &self,
        module: &str,
        command: &str,
        arg: &serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let graph = self.graph.read();
        let id = self.find_module(&graph, module)?;
        let node = graph.node(id);
        let mut guard = node.lock();
        let desc = guard
            .commands()
            .iter()
            .find(|c| c.name == command)
            .copied()
            .ok_or_else(|| Error::UnknownCommand {
                module: module.to_owned(),
                command: command.to_owned(),
            })?;
        if !desc.thread_safe {
            self.ensure_all_paused("run_module_command")?;
        }
        guard.run_command(command, arg)
    }

    /// Starts streaming an output gate's traffic as pcap into `fifo_path`.
    /// Requires all workers paused.
    pub fn enable_tcpdump(&self, module: &str, ogate: GateIdx, fifo_path: &str) -> Result<(), Error> {
        self.ensure_all_paused("enable_tcpdump")?;
        let hook = Tcpdump::open(fifo_path).map_err(|error| Error::Io {
            context: format!("opening tcpdump fifo `{fifo_path}`"),
            error,
        })?;
        let mut graph = self.graph.write();
        let id = self.find_module(&graph, module)?;
        graph.add_ogate_hook(id, ogate, Box::new(hook))?;
        tracing::info!(module, ogate, fifo = fifo_path, "tcpdump.enabled");
        Ok(())
    }

    /// Stops the pcap stream on an output gate. Requires all workers paused.
    pub fn disable_tcpdump(&self, module: &str, ogate: GateIdx) -> Result<(), Error> {
        self.ensure_all_paused("disable_tcpdump")?;
        let mut graph = self.graph.write();
        let id = self.find_module(&graph, module)?;
        graph.remove_ogate_hook(id, ogate, Tcpdump::NAME)?;
        tracing::info!(module, ogate, "tcpdump.disabled");
        Ok(())
    }

    fn find_module(&self, graph: &ModuleGraph, name: &str) -> Result<ModuleId, Error> {
        graph.find(name).ok_or_else(|| Error::UnknownModule {
            module: name.to_owned(),
        })
    }

    // ------------------------------------------------------------------
    // Traffic classes and tasks
    // ------------------------------------------------------------------

    /// Adds a traffic class. Requires all workers paused. A class with
    /// neither a parent nor a worker id becomes an orphan, attached later.
    pub fn add_tc(&self, spec: &TcSpec) -> Result<(), Error> {
        self.ensure_all_paused("add_tc")?;
        spec.validate().map_err(|e| Error::Config(Box::new(e)))?;

        {
            let homes = self.tc_homes.lock();
            let orphans = self.orphans.lock();
            if homes.contains_key(&spec.name) || orphans.iter().any(|o| o.name == spec.name) {
                return Err(Error::Tc(pktflow_sched::Error::DuplicateName {
                    name: spec.name.clone(),
                }));
            }
        }

        let wid = match (&spec.parent, spec.wid) {
            (Some(parent), _) => match self.tc_homes.lock().get(parent) {
                Some(home) => home.wid,
                None => {
                    return Err(Error::UnknownTc {
                        name: parent.clone(),
                    });
                }
            },
            (None, Some(wid)) => wid,
            (None, None) => {
                self.orphans.lock().push(spec.clone());
                tracing::debug!(tc = %spec.name, "tc.orphaned");
                return Ok(());
            }
        };
        self.materialize_tc(wid, spec)
    }

    /// Creates and attaches a class on a specific worker's tree.
    fn materialize_tc(&self, wid: u32, spec: &TcSpec) -> Result<(), Error> {
        let workers = self.workers.lock();
        let handle = workers.get(&wid).ok_or(Error::UnknownWorker { wid })?;
        let mut sched = handle.shared().scheduler.lock();
        let tree = sched.tree_mut();
        let now = tsc::rdtsc();

        let params = match spec.policy {
            TcPolicy::Priority => PolicyParams::Priority,
            TcPolicy::WeightedFair => PolicyParams::WeightedFair {
                resource: spec.share_resource,
            },
            TcPolicy::RoundRobin => PolicyParams::RoundRobin,
            TcPolicy::RateLimit => {
                let (resource, limit) = spec.rate_limit().unwrap_or((Resource::Count, 0));
                let burst = spec.max_burst.get(&resource).copied().unwrap_or(0);
                PolicyParams::RateLimit {
                    resource,
                    limit: if limit == 0 {
                        0
                    } else {
                        limit_to_work_units_per_cycle(limit, tsc::tsc_hz())
                    },
                    max_burst: to_work_units(burst),
                }
            }
            TcPolicy::Leaf => PolicyParams::Leaf,
        };

        let parent_id = match &spec.parent {
            Some(parent) => tree.find(parent).ok_or_else(|| Error::UnknownTc {
                name: parent.clone(),
            })?,
            None => tree.root(),
        };
        let attach = match tree.get(parent_id).map(|c| c.kind()) {
            Some(PolicyKind::Priority) => {
                if spec.priority == UNSET_PRIORITY {
                    return Err(Error::InvalidArgument {
                        field: format!("tc.{}.priority", spec.name),
                        reason: "a child of a priority class needs a priority".to_owned(),
                    });
                }
                Attach::Priority(spec.priority)
            }
            Some(PolicyKind::WeightedFair) => Attach::Share(spec.share),
            Some(PolicyKind::RoundRobin) => Attach::RoundRobin,
            Some(PolicyKind::RateLimit) => Attach::Sole,
            Some(PolicyKind::Leaf) | None => {
                return Err(Error::InvalidArgument {
                    field: format!("tc.{}.parent", spec.name),
                    reason: "parent cannot be a leaf".to_owned(),
                });
            }
        };

        let id = tree.create(spec.name.clone(), params).map_err(Error::Tc)?;
        if let Err(e) = tree.attach(parent_id, id, attach, now) {
            let _ = tree.destroy(id);
            return Err(Error::Tc(e));
        }
        drop(sched);
        drop(workers);

        let _ = self.tc_homes.lock().insert(
            spec.name.clone(),
            TcHome {
                wid,
                auto_free: spec.auto_free,
            },
        );
        tracing::info!(tc = %spec.name, wid, "tc.added");
        Ok(())
    }

    /// Attaches pending orphans: classes whose placement became resolvable
    /// (named parent now exists, or fall back to the lowest worker id).
    fn process_orphans(&self) {
        let pending: Vec<TcSpec> = std::mem::take(&mut *self.orphans.lock());
        for spec in pending {
            let wid = match &spec.parent {
                Some(parent) => self.tc_homes.lock().get(parent).map(|h| h.wid),
                None => spec
                    .wid
                    .or_else(|| self.workers.lock().keys().next().copied()),
            };
            match wid {
                Some(wid) => {
                    if let Err(e) = self.materialize_tc(wid, &spec) {
                        tracing::warn!(tc = %spec.name, error = %e, "tc.orphan_attach_failed");
                        self.orphans.lock().push(spec);
                    }
                }
                None => self.orphans.lock().push(spec),
            }
        }
    }

    /// Creates a task on `module` and attaches it under the named leaf.
    /// Requires all workers paused.
    pub fn attach_task(&self, module: &str, tc_name: &str, arg: u64) -> Result<(), Error> {
        self.ensure_all_paused("attach_task")?;

        // An orphan leaf gets materialised on demand.
        if !self.tc_homes.lock().contains_key(tc_name) {
            let orphan = {
                let mut orphans = self.orphans.lock();
                match orphans.iter().position(|o| o.name == tc_name) {
                    Some(i) => Some(orphans.remove(i)),
                    None => None,
                }
            };
            if let Some(spec) = orphan {
                let wid = spec
                    .wid
                    .or_else(|| self.workers.lock().keys().next().copied())
                    .ok_or(Error::UnknownWorker { wid: 0 })?;
                self.materialize_tc(wid, &spec)?;
            }
        }

        let wid = self
            .tc_homes
            .lock()
            .get(tc_name)
            .map(|h| h.wid)
            .ok_or_else(|| Error::UnknownTc {
                name: tc_name.to_owned(),
            })?;

        // Never hold the graph and a scheduler lock at the same time; the
        // worker loop takes them in the opposite order.
        let tid = {
            let mut graph = self.graph.write();
            let module_id = self.find_module(&graph, module)?;
            graph.add_task(module_id, arg)?
        };

        let attach_result = {
            let workers = self.workers.lock();
            let handle = workers.get(&wid).ok_or(Error::UnknownWorker { wid })?;
            let mut sched = handle.shared().scheduler.lock();
            match sched.tree().find(tc_name) {
                Some(leaf) => sched
                    .tree_mut()
                    .attach_task(leaf, tid, tsc::rdtsc())
                    .map(|()| leaf)
                    .map_err(Error::Tc),
                None => Err(Error::UnknownTc {
                    name: tc_name.to_owned(),
                }),
            }
        };

        match attach_result {
            Ok(leaf) => {
                self.graph.write().set_task_owner(tid, Some((wid, leaf)));
                tracing::info!(module, tc = tc_name, "task.attached");
                Ok(())
            }
            Err(e) => {
                self.graph.write().remove_task(tid);
                Err(e)
            }
        }
    }

    /// Detaches the task owned by the named leaf, destroying the leaf too if
    /// it was created `auto_free`. Requires all workers paused.
    pub fn detach_task(&self, tc_name: &str) -> Result<(), Error> {
        self.ensure_all_paused("detach_task")?;
        let home = self
            .tc_homes
            .lock()
            .get(tc_name)
            .cloned()
            .ok_or_else(|| Error::UnknownTc {
                name: tc_name.to_owned(),
            })?;

        let task = {
            let workers = self.workers.lock();
            let handle = workers
                .get(&home.wid)
                .ok_or(Error::UnknownWorker { wid: home.wid })?;
            let mut sched = handle.shared().scheduler.lock();
            let leaf = sched
                .tree()
                .find(tc_name)
                .ok_or_else(|| Error::UnknownTc {
                    name: tc_name.to_owned(),
                })?;
            let task = sched.tree_mut().detach_task(leaf).map_err(Error::Tc)?;
            if home.auto_free {
                let tree = sched.tree_mut();
                tree.detach(leaf).map_err(Error::Tc)?;
                tree.destroy(leaf).map_err(Error::Tc)?;
                tracing::info!(tc = tc_name, "tc.auto_freed");
            }
            task
        };
        if home.auto_free {
            let _ = self.tc_homes.lock().remove(tc_name);
        }
        if let Some(tid) = task {
            self.graph.write().remove_task(tid);
        }
        Ok(())
    }

    /// Snapshot of every traffic class, orphans included.
    #[must_use]
    pub fn list_tcs(&self) -> Vec<TcInfo> {
        let mut out = Vec::new();
        for (wid, handle) in self.workers.lock().iter() {
            let sched = handle.shared().scheduler.lock();
            let tree = sched.tree();
            for (_, class) in tree.iter() {
                out.push(TcInfo {
                    name: class.name().to_owned(),
                    wid: Some(*wid),
                    policy: class.kind().to_string(),
                    blocked: class.blocked(),
                    parent: class
                        .parent()
                        .and_then(|p| tree.get(p))
                        .map(|p| p.name().to_owned()),
                });
            }
        }
        for spec in self.orphans.lock().iter() {
            out.push(TcInfo {
                name: spec.name.clone(),
                wid: None,
                policy: policy_label(spec.policy).to_owned(),
                blocked: true,
                parent: spec.parent.clone(),
            });
        }
        out
    }

    /// Usage statistics of every traffic class.
    #[must_use]
    pub fn get_tc_stats(&self) -> Vec<TcStatsInfo> {
        let mut out = Vec::new();
        for (wid, handle) in self.workers.lock().iter() {
            let sched = handle.shared().scheduler.lock();
            for (_, class) in sched.tree().iter() {
                let stats = class.stats();
                out.push(TcStatsInfo {
                    name: class.name().to_owned(),
                    wid: *wid,
                    usage: stats.usage.0,
                    cnt_throttled: stats.cnt_throttled,
                });
            }
        }
        out
    }

    /// Usage tuple of one named class.
    pub fn tc_usage(&self, tc_name: &str) -> Result<ResourceArr, Error> {
        let wid = self
            .tc_homes
            .lock()
            .get(tc_name)
            .map(|h| h.wid)
            .ok_or_else(|| Error::UnknownTc {
                name: tc_name.to_owned(),
            })?;
        let workers = self.workers.lock();
        let handle = workers.get(&wid).ok_or(Error::UnknownWorker { wid })?;
        let sched = handle.shared().scheduler.lock();
        let tree = sched.tree();
        let id = tree.find(tc_name).ok_or_else(|| Error::UnknownTc {
            name: tc_name.to_owned(),
        })?;
        Ok(tree.get(id).map(|c| c.stats().usage).unwrap_or_default())
    }

    /// Zeroes all per-class and per-scheduler statistics.
    pub fn reset_tcs(&self) {
        for handle in self.workers.lock().values() {
            handle.shared().scheduler.lock().reset_stats();
        }
    }

    /// Tears down every module, task, class, and port. Requires all workers
    /// paused; the workers themselves survive.
    pub fn reset_all(&self) -> Result<(), Error> {
        self.ensure_all_paused("reset_all")?;
        for (wid, handle) in self.workers.lock().iter() {
            let mut sched = handle.shared().scheduler.lock();
            *sched = pktflow_sched::Scheduler::new(format!("!root_w{wid}"));
        }
        self.graph.write().clear();
        self.tc_homes.lock().clear();
        self.orphans.lock().clear();
        self.ports.lock().clear();
        tracing::info!("pipeline.reset");
        Ok(())
    }

    /// The TcId of a named class on its worker, for tests and tooling.
    pub fn find_tc(&self, tc_name: &str) -> Result<(u32, TcId), Error> {
        let wid = self
            .tc_homes
            .lock()
            .get(tc_name)
            .map(|h| h.wid)
            .ok_or_else(|| Error::UnknownTc {
                name: tc_name.to_owned(),
            })?;
        let workers = self.workers.lock();
        let handle = workers.get(&wid).ok_or(Error::UnknownWorker { wid })?;
        let sched = handle.shared().scheduler.lock();
        let id = sched.tree().find(tc_name).ok_or_else(|| Error::UnknownTc {
            name: tc_name.to_owned(),
        })?;
        Ok((wid, id))
    }

    // ------------------------------------------------------------------
    // Spec-driven bring-up
    // ------------------------------------------------------------------

    /// Brings up a whole dataplane from a validated spec, in the required
    /// order: pools → workers (parked) → modules → connections → classes →
    /// tasks. The caller resumes the workers afterwards.
    pub fn apply_spec(&self, spec: &pktflow_config::PipelineSpec) -> Result<(), Error> {
        spec.validate().map_err(|e| Error::Config(Box::new(e)))?;

        if spec.pools.is_empty() {
            self.create_pool(0, 16 * 1024)?;
        }
        for pool in &spec.pools {
            self.create_pool(pool.socket, pool.capacity)?;
        }
        for worker in &spec.workers {
            self.add_worker(worker.wid, worker.core)?;
        }
        for module in &spec.modules {
            let _ = self.create_module(&module.class, module.name.as_deref(), &module.config)?;
        }
        for conn in &spec.connections {
            self.connect_modules(&conn.src, conn.ogate, &conn.dst, conn.igate)?;
        }
        for tc in &spec.tcs {
            self.add_tc(tc)?;
        }
        for task in &spec.tasks {
            self.attach_task(&task.module, &task.tc, task.arg)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    /// Creates a port through a registered driver.
    pub fn create_port(
        &self,
        driver: &str,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut ports = self.ports.lock();
        if ports.contains_key(name) {
            return Err(Error::PortAlreadyExists {
                port: name.to_owned(),
            });
        }
        let factory = self.port_registry.get(driver)?;
        let port = (factory.create)(config)?;
        let _ = ports.insert(name.to_owned(), Arc::new(Mutex::new(port)));
        tracing::info!(port = name, driver, "port.created");
        Ok(())
    }

    /// Destroys a named port. Requires all workers paused (a module may be
    /// polling it).
    pub fn destroy_port(&self, name: &str) -> Result<(), Error> {
        self.ensure_all_paused("destroy_port")?;
        match self.ports.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownPort {
                port: name.to_owned(),
            }),
        }
    }

    /// Looks a port up by name.
    #[must_use]
    pub fn get_port(&self, name: &str) -> Option<PortCell> {
        self.ports.lock().get(name).cloned()
    }

    /// Names of all ports, sorted.
    #[must_use]
    pub fn list_ports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

const fn policy_label(policy: TcPolicy) -> &'static str {
    match policy {
        TcPolicy::Priority => "priority",
        TcPolicy::WeightedFair => "weighted_fair",
        TcPolicy::RoundRobin => "round_robin",
        TcPolicy::RateLimit => "rate_limit",
        TcPolicy::Leaf => "leaf",
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.destroy_workers();
    }
}
