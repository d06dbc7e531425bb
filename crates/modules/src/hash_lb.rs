// SPDX-License-Identifier: Apache-2.0

//! Flow-affine load balancer.
//!
//! Hashes a slice of each packet's headers (l2, l3, or l4 mode) and picks an
//! output gate from the configured set, so packets of one flow always take
//! the same gate.

use pktflow_engine::gate::GateIdx;
use pktflow_engine::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry};
use pktflow_engine::{Error, MAX_GATES, RunContext};
use pktflow_packet::{Packet, PacketBatch};
use serde::Deserialize;
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

/// Ethernet source+destination MAC.
const L2_RANGE: std::ops::Range<usize> = 0..12;
/// IPv4 source+destination address (Ethernet + IHL=5 framing).
const L3_RANGE: std::ops::Range<usize> = 26..34;
/// IPv4 addresses plus L4 ports.
const L4_RANGE: std::ops::Range<usize> = 26..38;

/// Which header fields feed the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// MAC addresses.
    L2,
    /// IP addresses.
    L3,
    /// IP addresses and ports.
    L4,
}

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default = "default_mode")]
    mode: Mode,
    gates: Vec<GateIdx>,
}

fn default_mode() -> Mode {
    Mode::L4
}

/// Hash-based load balancer.
pub struct HashLb {
    mode: Mode,
    gates: Vec<GateIdx>,
}

const COMMANDS: &[CommandDesc] = &[
    CommandDesc {
        name: "set_mode",
        thread_safe: false,
    },
    CommandDesc {
        name: "set_gates",
        thread_safe: false,
    },
];

fn validate_gates(gates: &[GateIdx]) -> Result<(), Error> {
    if gates.is_empty() {
        return Err(Error::InvalidArgument {
            field: "gates".to_owned(),
            reason: "need at least one gate".to_owned(),
        });
    }
    for &g in gates {
        if g >= MAX_GATES {
            return Err(Error::InvalidArgument {
                field: "gates".to_owned(),
                reason: format!("invalid gate {g}"),
            });
        }
    }
    Ok(())
}

impl HashLb {
    fn from_config(config: &Value) -> Result<Self, Error> {
        let cfg: Config =
            serde_json::from_value(config.clone()).map_err(|e| Error::InvalidArgument {
                field: "hash_lb.config".to_owned(),
                reason: e.to_string(),
            })?;
        validate_gates(&cfg.gates)?;
        Ok(HashLb {
            mode: cfg.mode,
            gates: cfg.gates,
        })
    }

    fn gate_for(&self, pkt: &Packet) -> GateIdx {
        let data = pkt.data();
        let range = match self.mode {
            Mode::L2 => L2_RANGE,
            Mode::L3 => L3_RANGE,
            Mode::L4 => L4_RANGE,
        };
        // Runt packets hash over whatever bytes they have.
        let key = data.get(range).unwrap_or(data);
        let hash = xxh3_64(key);
        self.gates[(hash % self.gates.len() as u64) as usize]
    }
}

impl Module for HashLb {
    fn can_receive(&self) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        while let Some(pkt) = batch.pop_front() {
            let gate = self.gate_for(&pkt);
            ctx.emit_packet(pkt, gate);
        }
    }

    fn commands(&self) -> &'static [CommandDesc] {
        COMMANDS
    }

    fn run_command(&mut self, command: &str, arg: &Value) -> Result<Value, Error> {
        match command {
            "set_mode" => {
                let mode: Mode = serde_json::from_value(arg["mode"].clone()).map_err(|_| {
                    Error::InvalidArgument {
                        field: "mode".to_owned(),
                        reason: "available LB modes: l2, l3, l4".to_owned(),
                    }
                })?;
                self.mode = mode;
                Ok(Value::Null)
            }
            "set_gates" => {
                let gates: Vec<GateIdx> = serde_json::from_value(arg["gates"].clone())
                    .map_err(|e| Error::InvalidArgument {
                        field: "gates".to_owned(),
                        reason: e.to_string(),
                    })?;
                validate_gates(&gates)?;
                self.gates = gates;
                Ok(Value::Null)
            }
            other => Err(Error::UnknownCommand {
                module: "hash_lb".to_owned(),
                command: other.to_owned(),
            }),
        }
    }
}

/// Registers the `hash_lb` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "hash_lb",
        create: |config| Ok(Box::new(HashLb::from_config(config)?)),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktflow_packet::PoolId;
    use serde_json::json;

    fn packet_with(fill: impl Fn(&mut [u8])) -> Box<Packet> {
        let mut pkt = Box::new(Packet::new(PoolId(0)));
        let mut data = [0u8; 60];
        fill(&mut data);
        pkt.set_data(&data).expect("set_data");
        pkt
    }

    #[test]
    fn same_flow_takes_the_same_gate() {
        let lb = HashLb::from_config(&json!({ "mode": "l4", "gates": [0, 1, 2, 3] }))
            .expect("hash_lb");
        let a1 = packet_with(|d| d[26..38].copy_from_slice(b"flow-a-bytes"));
        let a2 = packet_with(|d| d[26..38].copy_from_slice(b"flow-a-bytes"));
        assert_eq!(lb.gate_for(&a1), lb.gate_for(&a2));
    }

    #[test]
    fn l2_mode_ignores_l3_fields() {
        let lb = HashLb::from_config(&json!({ "mode": "l2", "gates": [0, 1, 2, 3] }))
            .expect("hash_lb");
        let a = packet_with(|d| d[26] = 0x11);
        let b = packet_with(|d| d[26] = 0x22);
        assert_eq!(lb.gate_for(&a), lb.gate_for(&b));
    }

    #[test]
    fn config_requires_gates() {
        assert!(HashLb::from_config(&json!({ "mode": "l3" })).is_err());
        assert!(HashLb::from_config(&json!({ "mode": "l3", "gates": [] })).is_err());
    }
}
