// SPDX-License-Identifier: Apache-2.0

//! Worker threads: one per core, pinned, driving the scheduler loop.
//!
//! Lifecycle: a launched worker initialises its scheduler and parks itself
//! in `Paused` on its eventfd. The control plane resumes it with
//! `SIGNAL_UNBLOCK` and stops it with `SIGNAL_QUIT`. A running worker polls
//! its status every [`PAUSE_CHECK_MASK`]` + 1` scheduler rounds; `Pausing`
//! makes it block on the eventfd, which is its only suspension point. It
//! never sleeps while runnable (real-time polling model).

use crate::graph::ModuleGraph;
use crate::run::{RunContext, run_task};
use crate::task::TaskId;
use crate::tsc;
use nix::sys::eventfd::EventFd;
use parking_lot::{Mutex, RwLock};
use pktflow_packet::PacketPool;
use pktflow_sched::{ResourceArr, Scheduler};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;

/// Eventfd value that resumes a paused worker.
pub const SIGNAL_UNBLOCK: u64 = 1;

/// Eventfd value that makes a paused worker exit.
pub const SIGNAL_QUIT: u64 = 2;

/// The worker re-checks its status whenever `round & PAUSE_CHECK_MASK == 0`,
/// i.e. every 256 rounds, amortising the atomic load.
pub const PAUSE_CHECK_MASK: u64 = 0xff;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    /// Pause requested (or initial state); the worker will park soon.
    Pausing = 0,
    /// Parked on the eventfd.
    Paused = 1,
    /// Executing the scheduler loop.
    Running = 2,
    /// The thread has exited.
    Finished = 3,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> WorkerStatus {
        match v {
            0 => WorkerStatus::Pausing,
            1 => WorkerStatus::Paused,
            2 => WorkerStatus::Running,
            _ => WorkerStatus::Finished,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WorkerStatus::Pausing => "pausing",
            WorkerStatus::Paused => "paused",
            WorkerStatus::Running => "running",
            WorkerStatus::Finished => "finished",
        };
        write!(f, "{label}")
    }
}

/// Worker state shared between the worker thread and the control plane.
pub struct WorkerShared {
    /// Worker id.
    pub wid: u32,
    /// Core the worker is pinned to.
    pub core: u32,
    /// NUMA socket of that core.
    pub socket: u32,
    status: AtomicU8,
    event: EventFd,
    /// The worker's scheduler. The worker locks it for each round; the
    /// control plane only touches it under the pause invariant (or for
    /// read-only stats snapshots).
    pub scheduler: Mutex<Scheduler<TaskId>>,
    current_tsc: AtomicU64,
    current_ns: AtomicU64,
    silent_drops: AtomicU64,
}

impl WorkerShared {
    fn new(wid: u32, core: u32, socket: u32) -> Result<Self, crate::error::Error> {
        let event = EventFd::new().map_err(|e| crate::error::Error::Io {
            context: format!("creating eventfd for worker {wid}"),
            error: std::io::Error::from_raw_os_error(e as i32),
        })?;
        Ok(WorkerShared {
            wid,
            core,
            socket,
            status: AtomicU8::new(WorkerStatus::Pausing as u8),
            event,
            scheduler: Mutex::new(Scheduler::new(format!("!root_w{wid}"))),
            current_tsc: AtomicU64::new(0),
            current_ns: AtomicU64::new(0),
            silent_drops: AtomicU64::new(0),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// TSC cached at the start of the worker's current round.
    #[must_use]
    pub fn current_tsc(&self) -> u64 {
        self.current_tsc.load(Ordering::Relaxed)
    }

    /// Nanosecond clock cached at the start of the worker's current round.
    #[must_use]
    pub fn current_ns(&self) -> u64 {
        self.current_ns.load(Ordering::Relaxed)
    }

    /// Packets this worker sent to a dead end.
    #[must_use]
    pub fn silent_drops(&self) -> u64 {
        self.silent_drops.load(Ordering::Relaxed)
    }

    fn signal(&self, value: u64) {
        let buf = value.to_ne_bytes();
        let _: usize = nix::unistd::write(&self.event, &buf).expect("eventfd write");
    }

    fn wait_signal(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = nix::unistd::read(&self.event, &mut buf).expect("eventfd read");
        assert_eq!(n, 8, "short eventfd read");
        u64::from_ne_bytes(buf)
    }
}

/// Control-plane handle to one worker thread.
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Shared worker state.
    #[must_use]
    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Requests a pause and spins until the worker is observably parked.
    pub fn pause(&self) {
        if self.shared.status() == WorkerStatus::Running {
            self.shared.set_status(WorkerStatus::Pausing);
            while self.shared.status() == WorkerStatus::Pausing {
                std::hint::spin_loop();
            }
        }
    }

    /// Resumes a paused worker and spins until it is observably running.
    pub fn resume(&self) {
        if self.shared.status() == WorkerStatus::Paused {
            self.shared.signal(SIGNAL_UNBLOCK);
            while self.shared.status() == WorkerStatus::Paused {
                std::hint::spin_loop();
            }
        }
    }

    /// Pauses the worker, tells it to quit, and joins the thread.
    pub fn destroy(mut self) {
        self.pause();
        if self.shared.status() == WorkerStatus::Paused {
            self.shared.signal(SIGNAL_QUIT);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Returns true if the core exists on this machine.
#[must_use]
pub fn is_cpu_present(core: u32) -> bool {
    core_affinity::get_core_ids()
        .is_some_and(|cores| cores.iter().any(|c| c.id == core as usize))
}

/// NUMA socket of a core, from sysfs; 0 when the topology is unreadable.
#[must_use]
pub fn socket_of_core(core: u32) -> u32 {
    let path = format!("/sys/devices/system/cpu/cpu{core}/topology/physical_package_id");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Restricts the calling (master) thread to every core except the given
/// worker cores. The master may touch packet pools but never runs a task.
pub fn exclude_cores_from_master(worker_cores: &[u32]) -> Result<(), crate::error::Error> {
    let Some(all) = core_affinity::get_core_ids() else {
        return Ok(());
    };
    let mut set = nix::sched::CpuSet::new();
    let mut any = false;
    for core in all {
        if !worker_cores.contains(&(core.id as u32)) {
            set.set(core.id).map_err(|e| crate::error::Error::Io {
                context: "building master affinity mask".to_owned(),
                error: std::io::Error::from_raw_os_error(e as i32),
            })?;
            any = true;
        }
    }
    if !any {
        // Every core runs a worker; leave the master mask alone.
        return Ok(());
    }
    nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set).map_err(|e| {
        crate::error::Error::Io {
            context: "setting master affinity mask".to_owned(),
            error: std::io::Error::from_raw_os_error(e as i32),
        }
    })
}

/// Spawns a worker pinned to `core` and waits until it has parked itself in
/// `Paused`.
pub fn launch_worker(
    wid: u32,
    core: u32,
    graph: Arc<RwLock<ModuleGraph>>,
    pool: Arc<dyn PacketPool>,
) -> Result<WorkerHandle, crate::error::Error> {
    if !is_cpu_present(core) {
        return Err(crate::error::Error::InvalidCore { core });
    }
    let shared = Arc::new(WorkerShared::new(wid, core, socket_of_core(core))?);
    let thread_shared = shared.clone();
    let thread_name = format!("pktflow-worker-{wid}");
    let join = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || worker_main(&thread_shared, &graph, pool.as_ref()))
        .map_err(|e| crate::error::Error::ThreadSpawn {
            thread_name,
            error: e,
        })?;

    // The worker parks itself before its first scheduling round.
    while shared.status() != WorkerStatus::Paused {
        std::hint::spin_loop();
    }

    Ok(WorkerHandle {
        shared,
        join: Some(join),
    })
}

/// Parks the worker on its eventfd. Returns true if it must exit.
fn block_worker(shared: &WorkerShared) -> bool {
    shared.set_status(WorkerStatus::Paused);
    match shared.wait_signal() {
        SIGNAL_UNBLOCK => {
            shared.set_status(WorkerStatus::Running);
            false
        }
        SIGNAL_QUIT => true,
        other => unreachable!("unexpected eventfd signal {other}"),
    }
}

/// The worker thread entry point: pin, park, then run the scheduler loop.
fn worker_main(shared: &WorkerShared, graph: &RwLock<ModuleGraph>, pool: &dyn PacketPool) {
    let pinned = core_affinity::set_for_current(core_affinity::CoreId {
        id: shared.core as usize,
    });
    if !pinned {
        tracing::warn!(wid = shared.wid, core = shared.core, "core_affinity.set_failed");
    }
    tracing::info!(
        wid = shared.wid,
        core = shared.core,
        socket = shared.socket,
        "worker.start"
    );

    let mut round: u64 = 0;
    loop {
        // Periodic check every 256 rounds, to keep the fast path clean.
        if round & PAUSE_CHECK_MASK == 0
            && shared.status() == WorkerStatus::Pausing
            && block_worker(shared)
        {
            break;
        }
        round = round.wrapping_add(1);

        let now = tsc::rdtsc();
        let mut sched = shared.scheduler.lock();
        let Some(leaf) = sched.next(now) else {
            let after = tsc::rdtsc();
            sched.account_idle(after.saturating_sub(now));
            continue;
        };

        let task_id = *sched.tree().leaf_task(leaf).expect("leaf owns a task");
        shared.current_tsc.store(now, Ordering::Relaxed);
        shared
            .current_ns
            .store(tsc::tsc_to_ns(now), Ordering::Relaxed);

        let mut to_unblock = Vec::new();
        let (result, drops) = {
            let graph = graph.read();
            let mut ctx = RunContext::new(&graph, pool, now, tsc::tsc_to_ns(now));
            let result = run_task(&mut ctx, task_id);
            for &mid in ctx.wakeups() {
                for &tid in graph.node(mid).tasks() {
                    if let Some(task) = graph.task(tid) {
                        if let Some((wid, tc)) = task.owner {
                            if wid == shared.wid {
                                to_unblock.push(tc);
                            }
                        }
                    }
                }
            }
            (result, ctx.silent_drops())
        };

        let after = tsc::rdtsc();
        let usage = ResourceArr::new(
            1,
            after.saturating_sub(now),
            u64::from(result.packets),
            result.bits,
        );
        sched.tree_mut().set_leaf_blocked(leaf, result.block);
        sched.done(leaf, &usage, after);
        for tc in to_unblock {
            sched.tree_mut().unblock_leaf(tc, after);
        }
        if drops > 0 {
            let _ = shared.silent_drops.fetch_add(drops, Ordering::Relaxed);
        }
    }

    shared.set_status(WorkerStatus::Finished);
    tracing::info!(wid = shared.wid, core = shared.core, "worker.quit");
}
