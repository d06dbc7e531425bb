// SPDX-License-Identifier: Apache-2.0

//! Drops each packet with a configured probability.

use pktflow_engine::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry};
use pktflow_engine::{DROP_GATE, Error, RunContext};
use pktflow_packet::PacketBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    drop_rate: f64,
    seed: Option<u64>,
}

/// Bernoulli packet dropper: forwards to gate 0, drops the rest.
pub struct RandomDrop {
    /// Drop when a random u32 falls below this threshold.
    threshold: u32,
    rng: StdRng,
}

const COMMANDS: &[CommandDesc] = &[CommandDesc {
    name: "set_droprate",
    thread_safe: false,
}];

fn rate_to_threshold(drop_rate: f64) -> Result<u32, Error> {
    if !(0.0..=1.0).contains(&drop_rate) {
        return Err(Error::InvalidArgument {
            field: "drop_rate".to_owned(),
            reason: format!("{drop_rate} is outside [0, 1]"),
        });
    }
    Ok((drop_rate * f64::from(u32::MAX)) as u32)
}

impl RandomDrop {
    fn from_config(config: &Value) -> Result<Self, Error> {
        let cfg: Config = if config.is_null() {
            Config::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| Error::InvalidArgument {
                field: "random_drop.config".to_owned(),
                reason: e.to_string(),
            })?
        };
        Ok(RandomDrop {
            threshold: rate_to_threshold(cfg.drop_rate)?,
            rng: match cfg.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            },
        })
    }
}

impl Module for RandomDrop {
    fn can_receive(&self) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        while let Some(pkt) = batch.pop_front() {
            let draw: u32 = self.rng.random();
            if draw < self.threshold {
                ctx.emit_packet(pkt, DROP_GATE);
            } else {
                ctx.emit_packet(pkt, 0);
            }
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
            other => Err(Error::UnknownCommand {
                module: "random_drop".to_owned(),
                command: other.to_owned(),
            }),
        }
    }
}

/// Registers the `random_drop` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "random_drop",
        create: |config| Ok(Box::new(RandomDrop::from_config(config)?)),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_out_of_range_rates() {
        assert!(RandomDrop::from_config(&json!({ "drop_rate": -0.1 })).is_err());
        assert!(RandomDrop::from_config(&json!({ "drop_rate": 1.1 })).is_err());
        assert!(RandomDrop::from_config(&json!({ "drop_rate": 0.5 })).is_ok());
    }

    #[test]
    fn threshold_extremes() {
        assert_eq!(rate_to_threshold(0.0).expect("rate"), 0);
        assert_eq!(rate_to_threshold(1.0).expect("rate"), u32::MAX);
    }
}
