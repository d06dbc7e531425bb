// SPDX-License-Identifier: Apache-2.0

//! Built-in modules for the pktflow dataplane.
//!
//! Each module implements the engine's capability contract: sources drive
//! packets from a task entry, sinks and filters process batches arriving on
//! input gates, and [`queue::Queue`] does both. [`default_registry`] yields
//! the registry the daemon starts with.

pub mod hash_lb;
pub mod merge;
pub mod queue;
pub mod random_drop;
pub mod random_split;
pub mod random_update;
pub mod rewrite;
pub mod sink;
pub mod source;

use pktflow_engine::ModuleRegistry;

/// The registry of all built-in module classes.
#[must_use]
pub fn default_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    source::register(&mut registry);
    sink::register(&mut registry);
    queue::register(&mut registry);
    merge::register(&mut registry);
    random_drop::register(&mut registry);
    random_split::register(&mut registry);
    random_update::register(&mut registry);
    hash_lb::register(&mut registry);
    rewrite::register(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_all_builtin_classes() {
        let registry = default_registry();
        let names = registry.class_names();
        for class in [
            "hash_lb",
            "merge",
            "queue",
            "random_drop",
            "random_split",
            "random_update",
            "rewrite",
            "sink",
            "source",
        ] {
            assert!(names.contains(&class), "missing class {class}");
        }
    }
}
