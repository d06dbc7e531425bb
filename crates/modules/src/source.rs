// SPDX-License-Identifier: Apache-2.0

//! Infinite packet generator.
//!
//! Every task invocation allocates a burst from the worker's pool, fills
//! each packet to the configured size, and emits it on output gate 0. The
//! payload carries a per-packet 64-bit sequence number so downstream hashing
//! and ordering checks see varying data.

use pktflow_engine::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry, TaskResult};
use pktflow_engine::{Error, RunContext};
use pktflow_packet::{MAX_BURST, PacketBatch};
use serde::Deserialize;
use serde_json::{Value, json};

/// Byte offset where the sequence number is written into the payload. It
/// occupies the IPv4 address fields of an Ethernet/IPv4 frame, so hashing
/// modules see a fresh flow per packet.
const SEQ_OFFSET: usize = 26;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Config {
    pkt_size: usize,
    burst: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pkt_size: 60,
            burst: MAX_BURST,
        }
    }
}

/// Synthesises packets at line rate.
pub struct Source {
    pkt_size: usize,
    burst: usize,
    seq: u64,
}

const COMMANDS: &[CommandDesc] = &[
    CommandDesc {
        name: "set_burst",
        thread_safe: true,
    },
    CommandDesc {
        name: "set_pkt_size",
        thread_safe: false,
    },
];

impl Source {
    fn from_config(config: &Value) -> Result<Self, Error> {
        let cfg: Config = if config.is_null() {
            Config::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| Error::InvalidArgument {
                field: "source.config".to_owned(),
                reason: e.to_string(),
            })?
        };
        if cfg.burst == 0 || cfg.burst > MAX_BURST {
            return Err(Error::InvalidArgument {
                field: "source.burst".to_owned(),
                reason: format!("{} is outside [1, {MAX_BURST}]", cfg.burst),
            });
        }
        if cfg.pkt_size < SEQ_OFFSET + 8 {
            return Err(Error::InvalidArgument {
                field: "source.pkt_size".to_owned(),
                reason: format!("must be at least {}", SEQ_OFFSET + 8),
            });
        }
        Ok(Source {
            pkt_size: cfg.pkt_size,
            burst: cfg.burst,
            seq: 0,
        })
    }
}

impl Module for Source {
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
            // Pool pressure is transient; try again next round.
            return TaskResult::default();
        }
        let template = vec![0u8; self.pkt_size];
        let mut packets = 0u32;
        let mut bits = 0u64;
        while let Some(mut pkt) = batch.pop_front() {
            if pkt.set_data(&template).is_err() {
                ctx.drop_packet(pkt);
                continue;
            }
            pkt.data_mut()[SEQ_OFFSET..SEQ_OFFSET + 8].copy_from_slice(&self.seq.to_le_bytes());
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

    fn commands(&self) -> &'static [CommandDesc] {
        COMMANDS
    }

    fn run_command(&mut self, command: &str, arg: &Value) -> Result<Value, Error> {
        match command {
            "set_burst" => {
                let burst = arg["burst"].as_u64().unwrap_or(0) as usize;
                if burst == 0 || burst > MAX_BURST {
                    return Err(Error::InvalidArgument {
                        field: "burst".to_owned(),
                        reason: format!("must be in [1, {MAX_BURST}]"),
                    });
                }
                self.burst = burst;
                Ok(Value::Null)
            }
            "set_pkt_size" => {
                let size = arg["pkt_size"].as_u64().unwrap_or(0) as usize;
                if size < SEQ_OFFSET + 8 || size > pktflow_packet::DATA_ROOM {
                    return Err(Error::InvalidArgument {
                        field: "pkt_size".to_owned(),
                        reason: format!(
                            "must be in [{}, {}]",
                            SEQ_OFFSET + 8,
                            pktflow_packet::DATA_ROOM
                        ),
                    });
                }
                self.pkt_size = size;
                Ok(Value::Null)
            }
            other => Err(Error::UnknownCommand {
                module: "source".to_owned(),
                command: other.to_owned(),
            }),
        }
    }
}

/// Builds a configuration value for a [`Source`].
#[must_use]
pub fn config(pkt_size: usize, burst: usize) -> Value {
    json!({ "pkt_size": pkt_size, "burst": burst })
}

/// Registers the `source` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "source",
        create: |config| Ok(Box::new(Source::from_config(config)?)),
    });
}
