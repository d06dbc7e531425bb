// SPDX-License-Identifier: Apache-2.0

//! Terminal consumer: frees every packet it receives.

use pktflow_engine::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry};
use pktflow_engine::{Error, RunContext};
use pktflow_packet::PacketBatch;
use serde_json::{Value, json};

/// Frees all arriving packets, counting them on the way out.
#[derive(Default)]
pub struct Sink {
    batches: u64,
    packets: u64,
    bytes: u64,
}

const COMMANDS: &[CommandDesc] = &[
    CommandDesc {
        name: "get_summary",
        thread_safe: true,
    },
    CommandDesc {
        name: "reset",
        thread_safe: true,
    },
];

impl Module for Sink {
    fn can_receive(&self) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        self.batches += 1;
        self.packets += batch.cnt() as u64;
        self.bytes += batch.total_bytes() as u64;
        ctx.free_batch(batch);
    }

    fn commands(&self) -> &'static [CommandDesc] {
        COMMANDS
    }

    fn run_command(&mut self, command: &str, _arg: &Value) -> Result<Value, Error> {
        match command {
            "get_summary" => Ok(json!({
                "batches": self.batches,
                "packets": self.packets,
                "bytes": self.bytes,
            })),
            "reset" => {
                *self = Sink::default();
                Ok(Value::Null)
            }
            other => Err(Error::UnknownCommand {
                module: "sink".to_owned(),
                command: other.to_owned(),
            }),
        }
    }
}

/// Registers the `sink` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "sink",
        create: |_| Ok(Box::new(Sink::default())),
    });
}
