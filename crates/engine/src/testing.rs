// SPDX-License-Identifier: Apache-2.0

//! Minimal modules for exercising the engine in tests.
//!
//! [`TestSource`] synthesises sequence-stamped packets from the worker's
//! pool; [`CountingSink`] consumes and counts them, answering a
//! `get_summary` command. Both are registered through [`register`].

use crate::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry, TaskResult};
use crate::run::RunContext;
use pktflow_packet::{MAX_BURST, PacketBatch};
use serde_json::{Value, json};

/// Emits `burst` packets of `pkt_size` bytes per task invocation, each
/// stamped with a monotonically increasing sequence number in its
/// scratchpad.
pub struct TestSource {
    pkt_size: usize,
    burst: usize,
    seq: u64,
}

/// Builds the configuration value for a [`TestSource`].
#[must_use]
pub fn source_config(pkt_size: usize, burst: usize) -> Value {
    json!({ "pkt_size": pkt_size, "burst": burst })
}

impl TestSource {
    fn from_config(config: &Value) -> Self {
        TestSource {
            pkt_size: config["pkt_size"].as_u64().unwrap_or(60) as usize,
            burst: (config["burst"].as_u64().unwrap_or(MAX_BURST as u64) as usize)
                .min(MAX_BURST),
            seq: 0,
        }
    }
}

impl Module for TestSource {
    fn can_run_task(&self) -> bool {
        true
    }

    fn run_task(
        &mut self,
        ctx: &mut RunContext<'_>,
        batch: &mut PacketBatch,
        _arg: u64,
    ) -> TaskResult {
        if !ctx.alloc_packets(self.burst, batch) {
            return TaskResult {
                block: false,
                packets: 0,
                bits: 0,
            };
        }
        let mut bits = 0u64;
        let mut packets = 0u32;
        while let Some(mut pkt) = batch.pop_front() {
            if pkt.set_data(&vec![0u8; self.pkt_size]).is_err() {
                ctx.drop_packet(pkt);
                continue;
            }
            pkt.scratchpad_mut()[..8].copy_from_slice(&self.seq.to_le_bytes());
            self.seq += 1;
            bits += (pkt.len() * 8) as u64;
            packets += 1;
            ctx.emit_packet(pkt, 0);
        }
        TaskResult {
            block: false,
            packets,
            bits,
        }
    }
}

/// Consumes every packet it receives, tracking counts, bytes, and sequence
/// ordering. Counters are read through the `get_summary` command.
#[derive(Default)]
pub struct CountingSink {
    batches: u64,
    packets: u64,
    bytes: u64,
    last_seq: Option<u64>,
    out_of_order: u64,
}

const SINK_COMMANDS: &[CommandDesc] = &[
    CommandDesc {
        name: "get_summary",
        thread_safe: true,
    },
    CommandDesc {
        name: "reset",
        thread_safe: true,
    },
];

impl Module for CountingSink {
    fn can_receive(&self) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        self.batches += 1;
        for pkt in batch.iter() {
            self.packets += 1;
            self.bytes += pkt.len() as u64;
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&pkt.scratchpad()[..8]);
            let seq = u64::from_le_bytes(seq_bytes);
            if let Some(last) = self.last_seq {
                if seq <= last {
                    self.out_of_order += 1;
                }
            }
            self.last_seq = Some(seq);
        }
        ctx.free_batch(batch);
    }

    fn commands(&self) -> &'static [CommandDesc] {
        SINK_COMMANDS
    }

    fn run_command(&mut self, command: &str, _arg: &Value) -> Result<Value, crate::error::Error> {
        match command {
            "get_summary" => Ok(json!({
                "batches": self.batches,
                "packets": self.packets,
                "bytes": self.bytes,
                "out_of_order": self.out_of_order,
            })),
            "reset" => {
                *self = CountingSink::default();
                Ok(Value::Null)
            }
            other => Err(crate::error::Error::UnknownCommand {
                module: "counting_sink".to_owned(),
                command: other.to_owned(),
            }),
        }
    }
}

/// Registers the test modules under `"TestSource"` and `"CountingSink"`.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "TestSource",
        create: |config| Ok(Box::new(TestSource::from_config(config))),
    });
    registry.register(ModuleFactory {
        class_name: "CountingSink",
        create: |_| Ok(Box::new(CountingSink::default())),
    });
}
