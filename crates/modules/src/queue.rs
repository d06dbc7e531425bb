// SPDX-License-Identifier: Apache-2.0

//! Bounded packet queue decoupling upstream producers from a drain task.
//!
//! Arriving batches are buffered; a task attached to the module drains up to
//! one burst per invocation onto output gate 0. With an empty queue the
//! drain task reports itself blocked, and the next enqueue requests a wakeup
//! so the scheduler readmits the leaf.

use pktflow_engine::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry, TaskResult};
use pktflow_engine::{Error, RunContext};
use pktflow_packet::{MAX_BURST, Packet, PacketBatch};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Config {
    size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config { size: 1024 }
    }
}

/// FIFO packet buffer with a drain task.
pub struct Queue {
    queue: VecDeque<Box<Packet>>,
    capacity: usize,
    dropped: u64,
}

const COMMANDS: &[CommandDesc] = &[
    CommandDesc {
        name: "get_status",
        thread_safe: true,
    },
    CommandDesc {
        name: "set_size",
        thread_safe: false,
    },
];

impl Queue {
    fn from_config(config: &Value) -> Result<Self, Error> {
        let cfg: Config = if config.is_null() {
            Config::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| Error::InvalidArgument {
                field: "queue.config".to_owned(),
                reason: e.to_string(),
            })?
        };
        if cfg.size == 0 {
            return Err(Error::InvalidArgument {
                field: "queue.size".to_owned(),
                reason: "must be positive".to_owned(),
            });
        }
        Ok(Queue {
            queue: VecDeque::with_capacity(cfg.size.min(4096)),
            capacity: cfg.size,
            dropped: 0,
        })
    }
}

impl Module for Queue {
    fn can_receive(&self) -> bool {
        true
    }

    fn can_run_task(&self) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        let was_empty = self.queue.is_empty();
        while let Some(pkt) = batch.pop_front() {
            if self.queue.len() >= self.capacity {
                self.dropped += 1;
                ctx.drop_packet(pkt);
            } else {
                self.queue.push_back(pkt);
            }
        }
        if was_empty && !self.queue.is_empty() {
            // The drain task may be parked on an empty queue.
            ctx.request_wakeup();
        }
    }

    fn run_task(
        &mut self,
        ctx: &mut RunContext<'_>,
        _batch: &mut PacketBatch,
        _arg: u64,
    ) -> TaskResult {
        if self.queue.is_empty() {
            return TaskResult {
                block: true,
                packets: 0,
                bits: 0,
            };
        }
        let mut packets = 0u32;
        let mut bits = 0u64;
        for _ in 0..MAX_BURST {
            let Some(pkt) = self.queue.pop_front() else {
                break;
            };
            packets += 1;
            bits += (pkt.len() * 8) as u64;
            ctx.emit_packet(pkt, 0);
        }
        TaskResult {
            block: self.queue.is_empty(),
            packets,
            bits,
        }
    }

    fn commands(&self) -> &'static [CommandDesc] {
        COMMANDS
    }

    fn run_command(&mut self, command: &str, arg: &Value) -> Result<Value, Error> {
        match command {
            "get_status" => Ok(json!({
                "occupancy": self.queue.len(),
                "size": self.capacity,
                "dropped": self.dropped,
            })),
            "set_size" => {
                let size = arg["size"].as_u64().unwrap_or(0) as usize;
                if size == 0 {
                    return Err(Error::InvalidArgument {
                        field: "size".to_owned(),
                        reason: "must be positive".to_owned(),
                    });
                }
                self.capacity = size;
                Ok(Value::Null)
            }
            other => Err(Error::UnknownCommand {
                module: "queue".to_owned(),
                command: other.to_owned(),
            }),
        }
    }

    fn deinit(&mut self) {
        self.queue.clear();
    }
}

/// Registers the `queue` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "queue",
        create: |config| Ok(Box::new(Queue::from_config(config)?)),
    });
}
