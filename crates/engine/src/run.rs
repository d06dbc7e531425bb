// SPDX-License-Identifier: Apache-2.0

//! The per-task execution engine: split batches, the chained fast path, and
//! the merge queue.
//!
//! One task invocation is a local mini-scheduler over the module graph
//! reachable from the task's module. Packets emitted during a module call
//! accumulate in per-output-gate split batches; when a split batch fills or
//! the module returns, the gate "fires": its hooks run, its counters bump,
//! and the batch is handed to the downstream input gate, either through the
//! next-register (chained fast path, zero queueing) or through a small
//! priority queue keyed by input-gate priority (merged path). The drain loop
//! runs until both are empty, then control returns to the scheduler.

use crate::gate::{DROP_GATE, GateIdx, INVALID_GATE, MAX_GATES};
use crate::graph::{ModuleGraph, ModuleId};
use crate::module::TaskResult;
use crate::task::TaskId;
use pktflow_packet::{Packet, PacketBatch, PacketPool};

struct MergeEntry {
    module: ModuleId,
    igate: GateIdx,
    priority: u32,
    seq: u64,
    batch: PacketBatch,
}

/// Worker-local execution state threaded through every module entry point.
///
/// The context owns all per-task scratch: split batches, the next-register,
/// the merge queue, and the dead batch. It also carries the cached clock and
/// the identity of the module/gate currently executing.
pub struct RunContext<'a> {
    graph: &'a ModuleGraph,
    pool: &'a dyn PacketPool,

    /// TSC at the start of this scheduling round.
    pub current_tsc: u64,
    /// Nanosecond clock at the start of this scheduling round.
    pub current_ns: u64,

    current_module: Option<ModuleId>,
    current_igate: GateIdx,

    splits: Vec<(GateIdx, PacketBatch)>,
    next_reg: Option<(ModuleId, GateIdx, PacketBatch)>,
    queue: Vec<MergeEntry>,
    seq: u64,

    dead: PacketBatch,
    silent_drops: u64,
    wakeups: Vec<ModuleId>,
}

impl<'a> RunContext<'a> {
    /// Creates a context for one task invocation.
    #[must_use]
    pub fn new(graph: &'a ModuleGraph, pool: &'a dyn PacketPool, tsc: u64, ns: u64) -> Self {
        RunContext {
            graph,
            pool,
            current_tsc: tsc,
            current_ns: ns,
            current_module: None,
            current_igate: INVALID_GATE,
            splits: Vec::new(),
            next_reg: None,
            queue: Vec::new(),
            seq: 0,
            dead: PacketBatch::new(),
            silent_drops: 0,
            wakeups: Vec::new(),
        }
    }

    /// The input gate the current batch arrived on.
    #[must_use]
    pub fn current_igate(&self) -> GateIdx {
        self.current_igate
    }

    /// The worker's NUMA-local packet pool.
    #[must_use]
    pub fn pool(&self) -> &dyn PacketPool {
        self.pool
    }

    /// Allocates `n` packets from the worker's pool into `batch`; returns
    /// `true` only if all were allocated.
    pub fn alloc_packets(&mut self, n: usize, batch: &mut PacketBatch) -> bool {
        self.pool.alloc_bulk(n, batch)
    }

    /// Returns every packet in `batch` to the pool without counting drops
    /// (terminal consumption, e.g. a sink).
    pub fn free_batch(&mut self, batch: &mut PacketBatch) {
        self.pool.free_bulk(batch);
    }

    /// Routes one packet out of the current module.
    ///
    /// `DROP_GATE` frees the packet (counted as a silent drop). A
    /// disconnected or never-connected gate below [`MAX_GATES`] behaves the
    /// same. Anything else out of range is a programming fault.
    ///
    /// # Panics
    /// Panics when called outside a `run_task`/`process_batch` chain, or
    /// with a gate index above [`MAX_GATES`].
    pub fn emit_packet(&mut self, pkt: Box<Packet>, ogate: GateIdx) {
        if ogate == DROP_GATE {
            self.drop_packet(pkt);
            return;
        }
        assert!(
            ogate < MAX_GATES,
            "emitted on invalid output gate {ogate}"
        );
        let module = self
            .current_module
            .expect("emit_packet outside a module entry point");

        let slot = match self.splits.iter().position(|(g, _)| *g == ogate) {
            Some(i) => i,
            None => {
                self.splits.push((ogate, PacketBatch::new()));
                self.splits.len() - 1
            }
        };
        self.splits[slot].1.add(pkt);
        if self.splits[slot].1.is_full() {
            let (_, batch) = self.splits.remove(slot);
            self.fire(module, ogate, batch);
        }
    }

    /// Frees one packet as a silent drop.
    pub fn drop_packet(&mut self, pkt: Box<Packet>) {
        self.dead.add(pkt);
        if self.dead.is_full() {
            self.flush_dead();
        }
    }

    /// Asks the worker to unblock the current module's tasks once the
    /// current task finishes draining. Used by modules that buffer work
    /// (e.g. a queue receiving packets while its drain task is blocked).
    pub fn request_wakeup(&mut self) {
        let module = self
            .current_module
            .expect("request_wakeup outside a module entry point");
        if !self.wakeups.contains(&module) {
            self.wakeups.push(module);
        }
    }

    /// Silent drops accumulated by this context.
    #[must_use]
    pub fn silent_drops(&self) -> u64 {
        self.silent_drops
    }

    /// Modules that requested task wakeups during this run.
    #[must_use]
    pub fn wakeups(&self) -> &[ModuleId] {
        &self.wakeups
    }

    fn flush_dead(&mut self) {
        self.silent_drops += self.dead.cnt() as u64;
        self.pool.free_bulk(&mut self.dead);
    }

    /// Fires an output gate: hooks, counters, downstream handoff.
    fn fire(&mut self, module: ModuleId, ogate_idx: GateIdx, mut batch: PacketBatch) {
        let graph = self.graph;
        let node = graph.node(module);
        let target = node.ogate(ogate_idx).and_then(|og| og.target);
        match target {
            None => {
                // Dead end: the gate was never connected or has been
                // disconnected since. Packets fall through to the drop path.
                while let Some(pkt) = batch.pop_front() {
                    self.drop_packet(pkt);
                }
            }
            Some((dst, igate_idx)) => {
                let og = node.ogate(ogate_idx).expect("target implies gate");
                og.hooks.run(&batch);
                og.counters.record(batch.cnt() as u64, self.current_tsc);
                self.add_to_run(dst, igate_idx, batch);
            }
        }
    }

    /// Hands a batch to a downstream input gate: chained fast path when the
    /// next-register is free, the gate is non-mergeable, and nothing is
    /// queued for it; merged path otherwise.
    fn add_to_run(&mut self, dst: ModuleId, igate_idx: GateIdx, mut batch: PacketBatch) {
        let graph = self.graph;
        let igate = graph
            .node(dst)
            .igate(igate_idx)
            .expect("connected target igate");
        let pending = self
            .queue
            .iter()
            .position(|e| e.module == dst && e.igate == igate_idx);

        if self.next_reg.is_none() && !igate.mergeable && pending.is_none() {
            self.next_reg = Some((dst, igate_idx, batch));
            return;
        }

        if let Some(i) = pending {
            self.queue[i].batch.absorb(&mut batch);
            if batch.is_empty() {
                return;
            }
            // Overflow beyond batch capacity becomes a fresh entry.
        }
        let priority = igate.priority;
        self.queue.push(MergeEntry {
            module: dst,
            igate: igate_idx,
            priority,
            seq: self.seq,
            batch,
        });
        self.seq += 1;
    }

    /// Pops the queue entry with the best (lowest) priority, FIFO within a
    /// priority.
    fn pop_queue(&mut self) -> Option<(ModuleId, GateIdx, PacketBatch)> {
        let best = self
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority, e.seq))
            .map(|(i, _)| i)?;
        let entry = self.queue.remove(best);
        Some((entry.module, entry.igate, entry.batch))
    }

    /// Flushes the current module's split batches and dead packets.
    fn finish_module(&mut self) {
        let module = self.current_module.expect("finish without module");
        // Fire in emission order; firing never adds new splits (hooks do
        // not emit), so draining from the front is stable.
        while !self.splits.is_empty() {
            let (ogate, batch) = self.splits.remove(0);
            self.fire(module, ogate, batch);
        }
        if !self.dead.is_empty() {
            self.flush_dead();
        }
    }
}

/// Runs one task to completion: the module's task entry, then the full
/// gate-drain loop. Returns the task's result for scheduler accounting.
///
/// # Panics
/// Panics if the task is no longer registered (scheduling a detached task is
/// a programming fault).
pub fn run_task(ctx: &mut RunContext<'_>, task_id: TaskId) -> TaskResult {
    let graph = ctx.graph;
    let task = graph.task(task_id).expect("ran a detached task");

    let mut scratch = PacketBatch::new();
    ctx.current_module = Some(task.module);
    let result = {
        let mut module = graph.node(task.module).lock();
        module.run_task(ctx, &mut scratch, task.arg)
    };
    // Anything the module left in its scratch batch is dropped.
    while let Some(pkt) = scratch.pop_front() {
        ctx.drop_packet(pkt);
    }
    ctx.finish_module();

    loop {
        let (mid, igate_idx, mut batch) = match ctx.next_reg.take() {
            Some(entry) => entry,
            None => match ctx.pop_queue() {
                Some(entry) => entry,
                None => break,
            },
        };

        ctx.current_igate = igate_idx;
        ctx.current_module = Some(mid);
        let node = graph.node(mid);
        if let Some(igate) = node.igate(igate_idx) {
            igate.hooks.run(&batch);
        }
        {
            let mut module = node.lock();
            module.process_batch(ctx, &mut batch);
        }
        // Unconsumed packets are dropped, not leaked.
        while let Some(pkt) = batch.pop_front() {
            ctx.drop_packet(pkt);
        }
        ctx.finish_module();
    }

    ctx.current_module = None;
    ctx.current_igate = INVALID_GATE;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, ModuleFactory, ModuleRegistry};
    use crate::testing::source_config;
    use pktflow_packet::{HeapPool, PoolId};
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn registry() -> ModuleRegistry {
        let mut r = ModuleRegistry::new();
        crate::testing::register(&mut r);
        r
    }

    fn pool() -> HeapPool {
        HeapPool::new(PoolId(0), 0, 4096)
    }

    fn summary(graph: &ModuleGraph, name: &str) -> Value {
        let id = graph.find(name).expect("module");
        graph
            .node(id)
            .lock()
            .run_command("get_summary", &Value::Null)
            .expect("get_summary")
    }

    struct Setup {
        graph: ModuleGraph,
        task: TaskId,
    }

    /// src -> sink, with the source producing one full burst per run.
    fn source_sink() -> Setup {
        let reg = registry();
        let mut graph = ModuleGraph::new();
        let src = graph
            .create_module(&reg, "TestSource", Some("src"), &source_config(60, 32))
            .expect("src");
        let sink = graph
            .create_module(&reg, "CountingSink", Some("sink"), &Value::Null)
            .expect("sink");
        graph.connect(src, 0, sink, 0).expect("connect");
        let task = graph.add_task(src, 0).expect("task");
        Setup { graph, task }
    }

    #[test]
    fn packets_flow_source_to_sink() {
        let setup = source_sink();
        let pool = pool();
        for _ in 0..10 {
            let mut ctx = RunContext::new(&setup.graph, &pool, 0, 0);
            let result = run_task(&mut ctx, setup.task);
            assert_eq!(result.packets, 32);
            assert_eq!(result.bits, 32 * 60 * 8);
            assert_eq!(ctx.silent_drops(), 0);
        }
        let s = summary(&setup.graph, "sink");
        assert_eq!(s["packets"], 320);
        assert_eq!(s["batches"], 10);
        // Batch conservation: everything the source made went back to the
        // pool through the sink.
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn disconnected_gate_counts_silent_drops() {
        let mut setup = source_sink();
        let src = setup.graph.find("src").expect("src");
        setup.graph.disconnect(src, 0).expect("disconnect");

        let pool = pool();
        let mut total_drops = 0;
        for _ in 0..100 {
            let mut ctx = RunContext::new(&setup.graph, &pool, 0, 0);
            let _ = run_task(&mut ctx, setup.task);
            total_drops += ctx.silent_drops();
        }
        assert_eq!(total_drops, 3200);
        assert_eq!(summary(&setup.graph, "sink")["packets"], 0);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn edge_preserves_packet_order() {
        // The source stamps ascending sequence numbers; on a single edge the
        // sink must observe them in order.
        let setup = source_sink();
        let pool = pool();
        for _ in 0..50 {
            let mut ctx = RunContext::new(&setup.graph, &pool, 0, 0);
            let _ = run_task(&mut ctx, setup.task);
        }
        let s = summary(&setup.graph, "sink");
        assert_eq!(s["packets"], 1600);
        assert_eq!(s["out_of_order"], 0);
    }

    #[test]
    fn gate_counters_track_the_edge() {
        let setup = source_sink();
        let pool = pool();
        let mut ctx = RunContext::new(&setup.graph, &pool, 7, 7);
        let _ = run_task(&mut ctx, setup.task);

        let src = setup.graph.find("src").expect("src");
        let snapshot = setup
            .graph
            .node(src)
            .ogate(0)
            .expect("ogate")
            .counters
            .snapshot();
        assert_eq!(snapshot, (1, 32, 7));
    }

    struct FanOut {
        gates: Vec<GateIdx>,
    }
    impl Module for FanOut {
        fn can_receive(&self) -> bool {
            true
        }
        fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
            let mut i = 0usize;
            while let Some(pkt) = batch.pop_front() {
                let gate = self.gates[i % self.gates.len()];
                ctx.emit_packet(pkt, gate);
                i += 1;
            }
        }
    }

    #[test]
    fn fan_out_conserves_packets_across_sinks() {
        let reg = registry();
        let mut graph = ModuleGraph::new();
        let src = graph
            .create_module(&reg, "TestSource", Some("src"), &source_config(60, 32))
            .expect("src");
        let fan = {
            let mut r = ModuleRegistry::new();
            r.register(ModuleFactory {
                class_name: "FanOut",
                create: |_| {
                    Ok(Box::new(FanOut {
                        gates: vec![0, 1, 2, 3],
                    }))
                },
            });
            graph
                .create_module(&r, "FanOut", Some("fan"), &Value::Null)
                .expect("fan")
        };
        graph.connect(src, 0, fan, 0).expect("connect");

        for i in 0..4u16 {
            let sink = graph
                .create_module(&reg, "CountingSink", Some(&format!("sink{i}")), &Value::Null)
                .expect("sink");
            graph.connect(fan, i, sink, 0).expect("connect");
        }

        let task = graph.add_task(src, 0).expect("task");
        let pool = pool();
        let mut drops = 0;
        for _ in 0..100 {
            let mut ctx = RunContext::new(&graph, &pool, 0, 0);
            let _ = run_task(&mut ctx, task);
            drops += ctx.silent_drops();
        }

        let delivered: u64 = (0..4)
            .map(|i| {
                summary(&graph, &format!("sink{i}"))["packets"]
                    .as_u64()
                    .expect("count")
            })
            .sum();
        assert_eq!(delivered + drops, 3200, "conservation violated");
        assert_eq!(drops, 0);
        // Round-robin fan-out: exactly a quarter each.
        for i in 0..4 {
            assert_eq!(summary(&graph, &format!("sink{i}"))["packets"], 800);
        }
        assert_eq!(pool.stats().in_use, 0);
    }

    /// Receives on a mergeable input gate.
    struct MergeSink {
        batches: u64,
        packets: u64,
    }
    impl Module for MergeSink {
        fn can_receive(&self) -> bool {
            true
        }
        fn igate_mergeable(&self, _igate: GateIdx) -> bool {
            true
        }
        fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
            self.batches += 1;
            self.packets += batch.cnt() as u64;
            ctx.free_batch(batch);
        }
        fn run_command(
            &mut self,
            command: &str,
            _arg: &Value,
        ) -> Result<Value, crate::error::Error> {
            match command {
                "get_summary" => Ok(serde_json::json!({
                    "batches": self.batches,
                    "packets": self.packets,
                })),
                other => Err(crate::error::Error::UnknownCommand {
                    module: "merge_sink".to_owned(),
                    command: other.to_owned(),
                }),
            }
        }
    }

    #[test]
    fn mergeable_igate_coalesces_fanned_in_emissions() {
        // src -> fan(2 gates) -> both gates into one mergeable igate: the
        // two 16-packet sub-batches merge into a single 32-packet delivery.
        let reg = registry();
        let mut graph = ModuleGraph::new();
        let src = graph
            .create_module(&reg, "TestSource", Some("src"), &source_config(60, 32))
            .expect("src");
        let mut local = ModuleRegistry::new();
        local.register(ModuleFactory {
            class_name: "FanOut",
            create: |_| Ok(Box::new(FanOut { gates: vec![0, 1] })),
        });
        local.register(ModuleFactory {
            class_name: "MergeSink",
            create: |_| {
                Ok(Box::new(MergeSink {
                    batches: 0,
                    packets: 0,
                }))
            },
        });
        let fan = graph
            .create_module(&local, "FanOut", Some("fan"), &Value::Null)
            .expect("fan");
        let sink = graph
            .create_module(&local, "MergeSink", Some("msink"), &Value::Null)
            .expect("sink");
        graph.connect(src, 0, fan, 0).expect("connect");
        graph.connect(fan, 0, sink, 0).expect("connect");
        graph.connect(fan, 1, sink, 0).expect("connect");

        let task = graph.add_task(src, 0).expect("task");
        let pool = pool();
        let mut ctx = RunContext::new(&graph, &pool, 0, 0);
        let _ = run_task(&mut ctx, task);

        let s = summary(&graph, "msink");
        assert_eq!(s["packets"], 32);
        assert_eq!(s["batches"], 1, "mergeable igate must coalesce");
        assert_eq!(pool.stats().in_use, 0);
    }
}
