// SPDX-License-Identifier: Apache-2.0

//! Writes random values into configured byte ranges of each packet.

use pktflow_engine::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry};
use pktflow_engine::{Error, RunContext};
use pktflow_packet::PacketBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;

/// Maximum number of update fields per module.
pub const MAX_FIELDS: usize = 16;

/// One randomised field: `size` bytes at `offset`, drawn uniformly from
/// `[min, max]`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FieldSpec {
    /// Byte offset into the packet data.
    pub offset: usize,
    /// Field width in bytes, at most 4.
    pub size: usize,
    /// Smallest value (inclusive).
    #[serde(default)]
    pub min: u32,
    /// Largest value (inclusive).
    #[serde(default = "default_max")]
    pub max: u32,
}

fn default_max() -> u32 {
    u32::MAX
}

#[derive(Debug, Deserialize)]
struct Config {
    fields: Vec<FieldSpec>,
    #[serde(default)]
    seed: Option<u64>,
}

/// Per-packet random field updater.
pub struct RandomUpdate {
    fields: Vec<FieldSpec>,
    rng: StdRng,
}

const COMMANDS: &[CommandDesc] = &[CommandDesc {
    name: "set_fields",
    thread_safe: false,
}];

fn validate_fields(fields: &[FieldSpec]) -> Result<(), Error> {
    if fields.is_empty() || fields.len() > MAX_FIELDS {
        return Err(Error::InvalidArgument {
            field: "fields".to_owned(),
            reason: format!("need between 1 and {MAX_FIELDS} fields"),
        });
    }
    for f in fields {
        if f.size == 0 || f.size > 4 {
            return Err(Error::InvalidArgument {
                field: "fields.size".to_owned(),
                reason: format!("{} is outside [1, 4]", f.size),
            });
        }
        if f.min > f.max {
            return Err(Error::InvalidArgument {
                field: "fields.min".to_owned(),
                reason: format!("min {} exceeds max {}", f.min, f.max),
            });
        }
    }
    Ok(())
}

impl RandomUpdate {
    fn from_config(config: &Value) -> Result<Self, Error> {
        let cfg: Config =
            serde_json::from_value(config.clone()).map_err(|e| Error::InvalidArgument {
                field: "random_update.config".to_owned(),
                reason: e.to_string(),
            })?;
        validate_fields(&cfg.fields)?;
        Ok(RandomUpdate {
            fields: cfg.fields,
            rng: match cfg.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            },
        })
    }
}

impl Module for RandomUpdate {
    fn can_receive(&self) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        while let Some(mut pkt) = batch.pop_front() {
            for f in &self.fields {
                let value = self.rng.random_range(f.min..=f.max);
                let data = pkt.data_mut();
                let end = f.offset + f.size;
                if end > data.len() {
                    continue; // runt packet, leave the field alone
                }
                // Big-endian, low `size` bytes of the drawn value.
                let bytes = value.to_be_bytes();
                data[f.offset..end].copy_from_slice(&bytes[4 - f.size..]);
            }
            ctx.emit_packet(pkt, 0);
        }
    }

    fn commands(&self) -> &'static [CommandDesc] {
        COMMANDS
    }

    fn run_command(&mut self, command: &str, arg: &Value) -> Result<Value, Error> {
        match command {
            "set_fields" => {
                let fields: Vec<FieldSpec> = serde_json::from_value(arg["fields"].clone())
                    .map_err(|e| Error::InvalidArgument {
                        field: "fields".to_owned(),
                        reason: e.to_string(),
                    })?;
                validate_fields(&fields)?;
                self.fields = fields;
                Ok(Value::Null)
            }
            other => Err(Error::UnknownCommand {
                module: "random_update".to_owned(),
                command: other.to_owned(),
            }),
        }
    }
}

/// Registers the `random_update` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "random_update",
        create: |config| Ok(Box::new(RandomUpdate::from_config(config)?)),
    });
}
