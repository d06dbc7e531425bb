// SPDX-License-Identifier: Apache-2.0

//! End-to-end dataplane scenarios, driven by a synthetic cycle clock.
//!
//! Each test wires built-in modules into a graph, hangs their tasks under a
//! traffic-class tree, and replays the worker loop by hand: pick a leaf, run
//! its task through the gate engine, charge the usage tuple. The virtual
//! clock advances a fixed cost per round, so every scenario is deterministic.

use pktflow_engine::graph::ModuleGraph;
use pktflow_engine::run::{RunContext, run_task};
use pktflow_engine::task::TaskId;
use pktflow_modules::default_registry;
use pktflow_packet::{HeapPool, PacketPool, PoolId};
use pktflow_sched::{
    Attach, PolicyParams, Resource, ResourceArr, Scheduler, TcId, to_work_units,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

/// Virtual cost of one scheduling round, in cycles.
const RUN_CYCLES: u64 = 1000;

struct Bench {
    graph: ModuleGraph,
    pool: HeapPool,
    sched: Scheduler<TaskId>,
    now: u64,
    silent_drops: u64,
}

impl Bench {
    fn new() -> Self {
        Bench {
            graph: ModuleGraph::new(),
            pool: HeapPool::new(PoolId(0), 0, 65536),
            sched: Scheduler::new("root"),
            now: 0,
            silent_drops: 0,
        }
    }

    fn module(&mut self, class: &str, name: &str, config: &Value) -> pktflow_engine::ModuleId {
        let registry = default_registry();
        self.graph
            .create_module(&registry, class, Some(name), config)
            .expect("create module")
    }

    fn leaf(&mut self, parent: TcId, name: &str, how: Attach, module: &str) -> TcId {
        let leaf = self
            .sched
            .tree_mut()
            .create(name, PolicyParams::Leaf)
            .expect("create leaf");
        self.sched
            .tree_mut()
            .attach(parent, leaf, how, self.now)
            .expect("attach leaf");
        let mid = self.graph.find(module).expect("module");
        let tid = self.graph.add_task(mid, 0).expect("task");
        self.graph.set_task_owner(tid, Some((0, leaf)));
        self.sched
            .tree_mut()
            .attach_task(leaf, tid, self.now)
            .expect("attach task");
        leaf
    }

    /// One worker-loop round; returns the leaf that ran, if any.
    fn round(&mut self) -> Option<TcId> {
        let leaf = self.sched.next(self.now);
        let Some(leaf) = leaf else {
            self.sched.account_idle(RUN_CYCLES);
            self.now += RUN_CYCLES;
            return None;
        };
        let tid = *self.sched.tree().leaf_task(leaf).expect("task");
        let mut ctx = RunContext::new(&self.graph, &self.pool, self.now, self.now);
        let result = run_task(&mut ctx, tid);
        self.silent_drops += ctx.silent_drops();

        let mut to_unblock = Vec::new();
        for &mid in ctx.wakeups() {
            for &t in self.graph.node(mid).tasks() {
                if let Some(task) = self.graph.task(t) {
                    if let Some((_, tc)) = task.owner {
                        to_unblock.push(tc);
                    }
                }
            }
        }
        drop(ctx);

        self.now += RUN_CYCLES;
        let usage = ResourceArr::new(1, RUN_CYCLES, u64::from(result.packets), result.bits);
        self.sched.tree_mut().set_leaf_blocked(leaf, result.block);
        self.sched.done(leaf, &usage, self.now);
        for tc in to_unblock {
            self.sched.tree_mut().unblock_leaf(tc, self.now);
        }
        Some(leaf)
    }

    fn sink_packets(&self, name: &str) -> u64 {
        let id = self.graph.find(name).expect("sink");
        self.graph
            .node(id)
            .lock()
            .run_command("get_summary", &Value::Null)
            .expect("summary")["packets"]
            .as_u64()
            .expect("count")
    }
}

/// S1: a source whose only gate is disconnected sends everything to the
/// dead end; after 100 bursts of 32 the worker counted 3200 silent drops
/// and nothing ever reached a module.
#[test]
fn s1_drop_all() {
    let mut bench = Bench::new();
    let _src = bench.module("source", "src", &pktflow_modules::source::config(60, 32));
    let root = bench.sched.tree().root();
    let _leaf = bench.leaf(root, "leaf_src", Attach::RoundRobin, "src");

    for _ in 0..100 {
        assert!(bench.round().is_some());
    }
    assert_eq!(bench.silent_drops, 3200);
    assert_eq!(bench.pool.stats().in_use, 0);
}

/// S2: two sources under a priority class; the higher-priority source owns
/// the dataplane while it stays runnable.
#[test]
fn s2_priority_preemption() {
    let mut bench = Bench::new();
    let src_cfg = pktflow_modules::source::config(60, 32);
    let a = bench.module("source", "src_a", &src_cfg);
    let b = bench.module("source", "src_b", &src_cfg);
    let sink_a = bench.module("sink", "sink_a", &Value::Null);
    let sink_b = bench.module("sink", "sink_b", &Value::Null);
    bench.graph.connect(a, 0, sink_a, 0).expect("connect");
    bench.graph.connect(b, 0, sink_b, 0).expect("connect");

    let root = bench.sched.tree().root();
    let prio = bench
        .sched
        .tree_mut()
        .create("prio", PolicyParams::Priority)
        .expect("prio");
    bench
        .sched
        .tree_mut()
        .attach(root, prio, Attach::RoundRobin, 0)
        .expect("attach");
    let _leaf_a = bench.leaf(prio, "leaf_a", Attach::Priority(2), "src_a");
    let _leaf_b = bench.leaf(prio, "leaf_b", Attach::Priority(1), "src_b");

    for _ in 0..1000 {
        let _ = bench.round();
    }
    assert_eq!(bench.sink_packets("sink_a"), 32_000);
    assert_eq!(bench.sink_packets("sink_b"), 0);
}

/// S3: two unbounded sources under a weighted-fair class with shares 3:1 on
/// the packets resource converge to a 3:1 packet split.
#[test]
fn s3_weighted_fair() {
    let mut bench = Bench::new();
    let src_cfg = pktflow_modules::source::config(60, 32);
    let a = bench.module("source", "src_a", &src_cfg);
    let b = bench.module("source", "src_b", &src_cfg);
    let sink_a = bench.module("sink", "sink_a", &Value::Null);
    let sink_b = bench.module("sink", "sink_b", &Value::Null);
    bench.graph.connect(a, 0, sink_a, 0).expect("connect");
    bench.graph.connect(b, 0, sink_b, 0).expect("connect");

    let root = bench.sched.tree().root();
    let wfq = bench
        .sched
        .tree_mut()
        .create(
            "wfq",
            PolicyParams::WeightedFair {
                resource: Resource::Packets,
            },
        )
        .expect("wfq");
    bench
        .sched
        .tree_mut()
        .attach(root, wfq, Attach::RoundRobin, 0)
        .expect("attach");
    let _leaf_a = bench.leaf(wfq, "leaf_a", Attach::Share(3), "src_a");
    let _leaf_b = bench.leaf(wfq, "leaf_b", Attach::Share(1), "src_b");

    for _ in 0..40_000 {
        let _ = bench.round();
    }
    let ratio = bench.sink_packets("sink_a") as f64 / bench.sink_packets("sink_b") as f64;
    assert!((2.85..=3.15).contains(&ratio), "packet ratio {ratio}");
}

/// S4: a rate-limited source stays under limit * window + burst on the bits
/// resource over a long measurement window.
#[test]
fn s4_rate_limit() {
    let mut bench = Bench::new();
    let src = bench.module("source", "src", &pktflow_modules::source::config(60, 32));
    let sink = bench.module("sink", "sink", &Value::Null);
    bench.graph.connect(src, 0, sink, 0).expect("connect");

    // One burst is 32 * 60 * 8 = 15360 bits. Allow one burst per ten
    // rounds: 15360 bits per 10 * RUN_CYCLES cycles, burst allowance of two
    // full batches.
    let bits_per_burst = 32 * 60 * 8u64;
    let limit_per_cycle = to_work_units(bits_per_burst) / (10 * RUN_CYCLES);
    let burst_bits = 2 * bits_per_burst;

    let root = bench.sched.tree().root();
    let rl = bench
        .sched
        .tree_mut()
        .create(
            "rl",
            PolicyParams::RateLimit {
                resource: Resource::Bits,
                limit: limit_per_cycle,
                max_burst: to_work_units(burst_bits),
            },
        )
        .expect("rl");
    bench
        .sched
        .tree_mut()
        .attach(root, rl, Attach::RoundRobin, 0)
        .expect("attach");
    let _leaf = bench.leaf(rl, "leaf_src", Attach::Sole, "src");

    // Warm up past the burst allowance.
    for _ in 0..1000 {
        let _ = bench.round();
    }
    let start_bits = bench.sink_packets("sink") * 60 * 8;
    let start_tsc = bench.now;

    let window_rounds = 20_000u64;
    for _ in 0..window_rounds {
        let _ = bench.round();
    }
    let window = bench.now - start_tsc;
    let measured_bits = bench.sink_packets("sink") * 60 * 8 - start_bits;

    // limit_per_cycle amplified by 2^32; convert the bound back to bits.
    let allowed_bits = bits_per_burst * (window / (10 * RUN_CYCLES)) + burst_bits;
    assert!(
        measured_bits <= allowed_bits,
        "measured {measured_bits} bits, bound {allowed_bits}"
    );
    // And the limiter does not starve the class.
    assert!(
        measured_bits >= allowed_bits * 9 / 10 - 2 * burst_bits,
        "measured only {measured_bits} bits against {allowed_bits}"
    );
    let stats = bench.sched.tree().get(rl).expect("rl").stats();
    assert!(stats.cnt_throttled > 0, "limiter never throttled");
}

/// S5: source → hash LB over 4 gates → 4 sinks. With per-packet flow
/// variation each sink sees close to a quarter of the traffic, and packets
/// are conserved end to end.
#[test]
fn s5_hash_lb_fan_out() {
    let mut bench = Bench::new();
    let src = bench.module("source", "src", &pktflow_modules::source::config(60, 32));
    let lb = bench.module(
        "hash_lb",
        "lb",
        &json!({ "mode": "l3", "gates": [0, 1, 2, 3] }),
    );
    bench.graph.connect(src, 0, lb, 0).expect("connect");
    for i in 0..4u16 {
        let sink = bench.module("sink", &format!("sink{i}"), &Value::Null);
        bench.graph.connect(lb, i, sink, 0).expect("connect");
    }

    let root = bench.sched.tree().root();
    let _leaf = bench.leaf(root, "leaf_src", Attach::RoundRobin, "src");

    let rounds = 4000u64;
    for _ in 0..rounds {
        let _ = bench.round();
    }

    let total: u64 = (0..4).map(|i| bench.sink_packets(&format!("sink{i}"))).sum();
    assert_eq!(total + bench.silent_drops, rounds * 32, "conservation");
    assert_eq!(bench.silent_drops, 0);

    let expected = (rounds * 32 / 4) as f64;
    for i in 0..4 {
        let got = bench.sink_packets(&format!("sink{i}")) as f64;
        let deviation = (got - expected).abs() / expected;
        assert!(
            deviation < 0.05,
            "sink{i} got {got}, expected ~{expected} (deviation {deviation:.3})"
        );
    }
}

/// A queue between a source and a sink: the drain task blocks on empty and
/// is woken by the next enqueue; nothing is lost at steady state.
#[test]
fn queue_blocks_and_wakes() {
    let mut bench = Bench::new();
    let src = bench.module("source", "src", &pktflow_modules::source::config(60, 32));
    let queue = bench.module("queue", "q", &json!({ "size": 256 }));
    let sink = bench.module("sink", "sink", &Value::Null);
    bench.graph.connect(src, 0, queue, 0).expect("connect");
    bench.graph.connect(queue, 0, sink, 0).expect("connect");

    let root = bench.sched.tree().root();
    let _leaf_src = bench.leaf(root, "leaf_src", Attach::RoundRobin, "src");
    let leaf_q = bench.leaf(root, "leaf_q", Attach::RoundRobin, "q");

    // Before any packet arrives, the drain task parks itself.
    for _ in 0..4 {
        let _ = bench.round();
    }
    assert!(bench.sink_packets("sink") > 0, "queue never drained");

    // Round-robin alternates producer and drainer, so the queue stays
    // near-empty and nothing is dropped.
    for _ in 0..1000 {
        let _ = bench.round();
    }
    let q = bench.graph.find("q").expect("q");
    let status = bench
        .graph
        .node(q)
        .lock()
        .run_command("get_status", &Value::Null)
        .expect("status");
    assert_eq!(status["dropped"], 0);

    let drained = bench.sink_packets("sink");
    let occupancy = status["occupancy"].as_u64().expect("occupancy");
    let produced: u64 = bench
        .sched
        .tree()
        .get(bench.sched.tree().find("leaf_src").expect("leaf"))
        .expect("class")
        .stats()
        .usage[Resource::Packets];
    assert_eq!(produced, drained + occupancy, "queue conservation");
    let _ = leaf_q;
}

/// Random drop at rate 0 forwards everything; at rate 1 it drops
/// everything (as silent drops, since the drop gate is the dead end).
#[test]
fn random_drop_extremes() {
    for (rate, expect_delivered) in [(0.0, 3200u64), (1.0, 0u64)] {
        let mut bench = Bench::new();
        let src = bench.module("source", "src", &pktflow_modules::source::config(60, 32));
        let rd = bench.module(
            "random_drop",
            "rd",
            &json!({ "drop_rate": rate, "seed": 7 }),
        );
        let sink = bench.module("sink", "sink", &Value::Null);
        bench.graph.connect(src, 0, rd, 0).expect("connect");
        bench.graph.connect(rd, 0, sink, 0).expect("connect");
        let root = bench.sched.tree().root();
        let _leaf = bench.leaf(root, "leaf_src", Attach::RoundRobin, "src");

        for _ in 0..100 {
            let _ = bench.round();
        }
        assert_eq!(bench.sink_packets("sink"), expect_delivered);
        assert_eq!(bench.silent_drops, 3200 - expect_delivered);
        assert_eq!(bench.pool.stats().in_use, 0);
    }
}

/// Two sources funnel into one merge module; its mergeable input gate
/// coalesces the batches and the merged stream reaches the sink intact.
#[test]
fn merge_coalesces_fan_in() {
    let mut bench = Bench::new();
    let a = bench.module("source", "src_a", &pktflow_modules::source::config(60, 16));
    let b = bench.module("source", "src_b", &pktflow_modules::source::config(60, 16));
    let merge = bench.module("merge", "m", &Value::Null);
    let sink = bench.module("sink", "sink", &Value::Null);
    bench.graph.connect(a, 0, merge, 0).expect("connect");
    bench.graph.connect(b, 0, merge, 0).expect("connect");
    bench.graph.connect(merge, 0, sink, 0).expect("connect");

    let root = bench.sched.tree().root();
    let _leaf_a = bench.leaf(root, "leaf_a", Attach::RoundRobin, "src_a");
    let _leaf_b = bench.leaf(root, "leaf_b", Attach::RoundRobin, "src_b");

    for _ in 0..200 {
        let _ = bench.round();
    }
    // 200 rounds alternate the two sources, 16 packets each.
    assert_eq!(bench.sink_packets("sink"), 200 * 16);
    assert_eq!(bench.silent_drops, 0);
    assert_eq!(bench.pool.stats().in_use, 0);
}

/// Rewrite stamps its templates in round-robin order.
#[test]
fn rewrite_cycles_templates() {
    let mut bench = Bench::new();
    let src = bench.module("source", "src", &pktflow_modules::source::config(64, 32));
    let rw = bench.module(
        "rewrite",
        "rw",
        &json!({ "templates": ["aa".repeat(60), "bb".repeat(60)] }),
    );
    let sink = bench.module("sink", "sink", &Value::Null);
    bench.graph.connect(src, 0, rw, 0).expect("connect");
    bench.graph.connect(rw, 0, sink, 0).expect("connect");
    let root = bench.sched.tree().root();
    let _leaf = bench.leaf(root, "leaf_src", Attach::RoundRobin, "src");

    for _ in 0..10 {
        let _ = bench.round();
    }
    let summary = {
        let id = bench.graph.find("sink").expect("sink");
        bench
            .graph
            .node(id)
            .lock()
            .run_command("get_summary", &Value::Null)
            .expect("summary")
    };
    assert_eq!(summary["packets"], 320);
    // Templates are 60 bytes, applied to every packet.
    assert_eq!(summary["bytes"], 320 * 60);
}
