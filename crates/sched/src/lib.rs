// SPDX-License-Identifier: Apache-2.0

//! Hierarchical traffic-class scheduler.
//!
//! A worker owns one [`Scheduler`], which owns one [`TcTree`]. Interior
//! classes enforce a policy (strict priority, weighted-fair stride
//! scheduling, round robin, or token-bucket rate limiting) and leaves own
//! the tasks the worker actually runs. Every completed run is charged up the
//! tree as a (count, cycles, packets, bits) tuple; rate-limited ancestors
//! throttle themselves onto a wakeup queue and resume when their deadline
//! passes.

pub mod error;
pub mod heap;
pub mod resource;
pub mod scheduler;
pub mod tree;
pub mod wakeup;

pub use error::Error;
pub use resource::{
    MAX_LIMIT_POW, MAX_SHARE, NUM_RESOURCES, QUANTUM, Resource, ResourceArr, STRIDE1,
    USAGE_AMPLIFIER_POW, limit_to_work_units_per_cycle, to_work_units,
};
pub use scheduler::{SchedStats, Scheduler};
pub use tree::{
    Attach, LeafPolicy, Policy, PolicyKind, PolicyParams, PriorityChild, PriorityPolicy,
    RateLimitPolicy, RoundRobinPolicy, TcId, TcStats, TcTree, TrafficClass, WeightedFairPolicy,
};
pub use wakeup::WakeupQueue;
