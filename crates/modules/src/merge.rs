// SPDX-License-Identifier: Apache-2.0

//! Funnels any number of input gates into output gate 0.
//!
//! Its input gates are mergeable, so emissions from several upstream
//! modules within one task execution coalesce into a single downstream
//! batch instead of one per producer.

use pktflow_engine::gate::GateIdx;
use pktflow_engine::module::{Module, ModuleFactory, ModuleRegistry};
use pktflow_engine::RunContext;
use pktflow_packet::PacketBatch;

/// Fan-in module.
#[derive(Default)]
pub struct Merge;

impl Module for Merge {
    fn can_receive(&self) -> bool {
        true
    }

    fn igate_mergeable(&self, _igate: GateIdx) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        while let Some(pkt) = batch.pop_front() {
            ctx.emit_packet(pkt, 0);
        }
    }
}

/// Registers the `merge` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "merge",
        create: |_| Ok(Box::new(Merge)),
    });
}
