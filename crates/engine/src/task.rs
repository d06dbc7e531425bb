// SPDX-License-Identifier: Apache-2.0

//! Tasks: the unit a scheduler leaf runs.

use crate::graph::ModuleId;
use pktflow_sched::TcId;
use slotmap::new_key_type;

new_key_type! {
    /// Key of a task in the graph's task arena.
    pub struct TaskId;
}

/// A (module, argument) pair owned by exactly one leaf traffic class.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    /// The module whose task entry this task invokes.
    pub module: ModuleId,
    /// Opaque argument handed to the module on every invocation.
    pub arg: u64,
    /// The leaf class owning this task: (worker id, class id).
    pub owner: Option<(u32, TcId)>,
}

impl Task {
    /// Creates a task not yet owned by any leaf.
    #[must_use]
    pub fn new(module: ModuleId, arg: u64) -> Self {
        Task {
            module,
            arg,
            owner: None,
        }
    }
}
