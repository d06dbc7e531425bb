// SPDX-License-Identifier: Apache-2.0

//! Splits traffic uniformly at random across a set of output gates, with an
//! optional drop probability applied first.

use pktflow_engine::gate::GateIdx;
use pktflow_engine::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry};
use pktflow_engine::{DROP_GATE, Error, MAX_GATES, RunContext};
use pktflow_packet::PacketBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;

/// Upper bound on the split set, matching the widest practical fan-out.
pub const MAX_SPLIT_GATES: usize = 16384;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    gates: Vec<GateIdx>,
    drop_rate: f64,
    seed: Option<u64>,
}

/// Uniform random splitter.
pub struct RandomSplit {
    gates: Vec<GateIdx>,
    threshold: u32,
    rng: StdRng,
}

const COMMANDS: &[CommandDesc] = &[
    CommandDesc {
        name: "set_droprate",
        thread_safe: false,
    },
    CommandDesc {
        name: "set_gates",
        thread_safe: false,
    },
];

fn validate_gates(gates: &[GateIdx]) -> Result<(), Error> {
    if gates.is_empty() || gates.len() > MAX_SPLIT_GATES {
        return Err(Error::InvalidArgument {
            field: "gates".to_owned(),
            reason: format!("need between 1 and {MAX_SPLIT_GATES} gates"),
        });
    }
    for &g in gates {
        if g >= MAX_GATES && g != DROP_GATE {
            return Err(Error::InvalidArgument {
                field: "gates".to_owned(),
                reason: format!("invalid gate {g}"),
            });
        }
    }
    Ok(())
}

fn rate_to_threshold(drop_rate: f64) -> Result<u32, Error> {
    if !(0.0..=1.0).contains(&drop_rate) {
        return Err(Error::InvalidArgument {
            field: "drop_rate".to_owned(),
            reason: format!("{drop_rate} is outside [0, 1]"),
        });
    }
    Ok((drop_rate * f64::from(u32::MAX)) as u32)
}

impl RandomSplit {
    fn from_config(config: &Value) -> Result<Self, Error> {
        let cfg: Config = serde_json::from_value(config.clone()).map_err(|e| {
            Error::InvalidArgument {
                field: "random_split.config".to_owned(),
                reason: e.to_string(),
            }
        })?;
        validate_gates(&cfg.gates)?;
        Ok(RandomSplit {
            gates: cfg.gates,
            threshold: rate_to_threshold(cfg.drop_rate)?,
            rng: match cfg.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            },
        })
    }
}

impl Module for RandomSplit {
    fn can_receive(&self) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        while let Some(pkt) = batch.pop_front() {
            let draw: u32 = self.rng.random();
            if draw < self.threshold {
                ctx.emit_packet(pkt, DROP_GATE);
                continue;
            }
            let gate = self.gates[self.rng.random_range(0..self.gates.len())];
            ctx.emit_packet(pkt, gate);
        }
    }

    fn commands(&self) -> &'static [CommandDesc] {
        COMMANDS
    }

    fn run_command(&mut self, command: &str, arg: &Value) -> Result<Value, Error> {
        match command {
            "set_droprate" => {
                let rate = arg["drop_rate"].as_f64().unwrap_or(-1.0);
                self.threshold = rate_to_threshold(rate)?;
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
                module: "random_split".to_owned(),
                command: other.to_owned(),
            }),
        }
    }
}

/// Registers the `random_split` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "random_split",
        create: |config| Ok(Box::new(RandomSplit::from_config(config)?)),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn needs_at_least_one_gate() {
        assert!(RandomSplit::from_config(&json!({ "gates": [] })).is_err());
        assert!(RandomSplit::from_config(&json!({ "gates": [0, 1, 2] })).is_ok());
    }

    #[test]
    fn drop_gate_is_a_valid_split_target() {
        assert!(RandomSplit::from_config(&json!({ "gates": [0, DROP_GATE] })).is_ok());
        assert!(RandomSplit::from_config(&json!({ "gates": [u16::MAX] })).is_err());
    }
}
