// SPDX-License-Identifier: Apache-2.0

//! The module contract and the class registry.
//!
//! A module is a named node of the dataplane graph. Its capability set is
//! {process batches?, run tasks?, commands?}: sinks and filters implement
//! [`Module::process_batch`], sources implement [`Module::run_task`], and a
//! module may implement both. Classes are created through a registry of
//! factories keyed by class name; configuration and command arguments are
//! opaque `serde_json::Value`s decoded by the module itself.

use crate::error::Error;
use crate::gate::{GateIdx, MAX_GATES};
use crate::run::RunContext;
use pktflow_packet::PacketBatch;
use std::collections::HashMap;

/// Maximum number of tasks a single module may register.
pub const MAX_TASKS_PER_MODULE: usize = 32;

/// Outcome of one task invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskResult {
    /// The task has nothing to do; block the owning leaf until an external
    /// wakeup.
    pub block: bool,
    /// Packets produced or moved by this invocation.
    pub packets: u32,
    /// Bits produced or moved by this invocation.
    pub bits: u64,
}

/// A control-channel command exposed by a module.
#[derive(Debug, Clone, Copy)]
pub struct CommandDesc {
    /// Command name.
    pub name: &'static str,
    /// Whether the command may run while workers are running. Thread-unsafe
    /// commands require all workers paused.
    pub thread_safe: bool,
}

/// The capability contract every dataplane module implements.
pub trait Module: Send {
    /// Whether this module accepts batches on input gates. Only modules that
    /// return true may be the target of a connection.
    fn can_receive(&self) -> bool {
        false
    }

    /// Whether this module's class defines a task entry.
    fn can_run_task(&self) -> bool {
        false
    }

    /// Handles a batch arriving on an input gate (see
    /// [`RunContext::current_igate`]). Every packet must be emitted through
    /// [`RunContext::emit_packet`], handed to [`RunContext::free_batch`], or
    /// left in `batch` to be freed as a silent drop.
    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        let _ = (ctx, batch);
        unreachable!("process_batch called on a module without the receive capability");
    }

    /// Task entry invoked by the scheduler through a leaf class. `batch` is
    /// a cleared scratch batch the module may fill and emit.
    fn run_task(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch, arg: u64)
    -> TaskResult {
        let _ = (ctx, batch, arg);
        unreachable!("run_task called on a module without the task capability");
    }

    /// Commands this module answers to.
    fn commands(&self) -> &'static [CommandDesc] {
        &[]
    }

    /// Runs a named command. The default rejects everything.
    fn run_command(
        &mut self,
        command: &str,
        arg: &serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let _ = arg;
        Err(Error::UnknownCommand {
            module: String::new(),
            command: command.to_owned(),
        })
    }

    /// Drain priority of an input gate; lower drains first.
    fn igate_priority(&self, igate: GateIdx) -> u32 {
        let _ = igate;
        0
    }

    /// Whether emissions into an input gate may be merged within one task.
    fn igate_mergeable(&self, igate: GateIdx) -> bool {
        let _ = igate;
        false
    }

    /// Highest usable input-gate index plus one.
    fn num_igates(&self) -> GateIdx {
        MAX_GATES
    }

    /// Highest usable output-gate index plus one.
    fn num_ogates(&self) -> GateIdx {
        MAX_GATES
    }

    /// Releases module resources; called right before destruction.
    fn deinit(&mut self) {}
}

/// Factory for one module class.
#[derive(Clone)]
pub struct ModuleFactory {
    /// Unique class name (e.g. `"source"`, `"hash_lb"`).
    pub class_name: &'static str,
    /// Builds and initialises an instance from its configuration.
    pub create: fn(config: &serde_json::Value) -> Result<Box<dyn Module>, Error>,
}

/// Registry of module classes known to the dataplane.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<&'static str, ModuleFactory>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class; the last registration of a name wins.
    pub fn register(&mut self, factory: ModuleFactory) {
        let _ = self.factories.insert(factory.class_name, factory);
    }

    /// Looks a class up by name.
    pub fn get(&self, class_name: &str) -> Result<&ModuleFactory, Error> {
        self.factories
            .get(class_name)
            .ok_or_else(|| Error::UnknownModuleClass {
                class: class_name.to_owned(),
            })
    }

    /// Registered class names, sorted.
    #[must_use]
    pub fn class_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Derives a default instance name from a class name: `HashLB` → `hash_lb`,
/// then the first free ordinal is appended by the graph (`hash_lb0`).
#[must_use]
pub fn snake_case_name(class_name: &str) -> String {
    let mut out = String::with_capacity(class_name.len() + 4);
    let mut prev_lower = false;
    for ch in class_name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = ch.is_ascii_lowercase();
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_conversion() {
        assert_eq!(snake_case_name("Source"), "source");
        assert_eq!(snake_case_name("HashLb"), "hash_lb");
        assert_eq!(snake_case_name("RandomSplit"), "random_split");
        assert_eq!(snake_case_name("sink"), "sink");
    }

    #[test]
    fn registry_lookup() {
        struct Nop;
        impl Module for Nop {}

        let mut registry = ModuleRegistry::new();
        registry.register(ModuleFactory {
            class_name: "nop",
            create: |_| Ok(Box::new(Nop)),
        });
        assert!(registry.get("nop").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(Error::UnknownModuleClass { .. })
        ));
        assert_eq!(registry.class_names(), vec!["nop"]);
    }
}
