// SPDX-License-Identifier: Apache-2.0

//! Overwrites packet contents with configured templates, cycling through
//! them packet by packet.

use pktflow_engine::module::{CommandDesc, Module, ModuleFactory, ModuleRegistry};
use pktflow_engine::{Error, RunContext};
use pktflow_packet::{DATA_ROOM, PacketBatch};
use serde::Deserialize;
use serde_json::Value;

/// Maximum number of templates a rewrite module holds.
pub const MAX_TEMPLATES: usize = 512;

#[derive(Debug, Deserialize)]
struct Config {
    /// Hex-encoded packet templates.
    templates: Vec<String>,
}

/// Template-stamping rewriter.
pub struct Rewrite {
    templates: Vec<Vec<u8>>,
    next: usize,
}

const COMMANDS: &[CommandDesc] = &[CommandDesc {
    name: "set_templates",
    thread_safe: false,
}];

fn decode_templates(encoded: &[String]) -> Result<Vec<Vec<u8>>, Error> {
    if encoded.is_empty() || encoded.len() > MAX_TEMPLATES {
        return Err(Error::InvalidArgument {
            field: "templates".to_owned(),
            reason: format!("need between 1 and {MAX_TEMPLATES} templates"),
        });
    }
    encoded
        .iter()
        .map(|hex| {
            let hex = hex.trim();
            if hex.len() % 2 != 0 || hex.is_empty() {
                return Err(Error::InvalidArgument {
                    field: "templates".to_owned(),
                    reason: "templates must be non-empty even-length hex".to_owned(),
                });
            }
            let bytes = (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|e| Error::InvalidArgument {
                    field: "templates".to_owned(),
                    reason: e.to_string(),
                })?;
            if bytes.len() > DATA_ROOM {
                return Err(Error::InvalidArgument {
                    field: "templates".to_owned(),
                    reason: format!("template exceeds {DATA_ROOM} bytes"),
                });
            }
            Ok(bytes)
        })
        .collect()
}

impl Rewrite {
    fn from_config(config: &Value) -> Result<Self, Error> {
        let cfg: Config =
            serde_json::from_value(config.clone()).map_err(|e| Error::InvalidArgument {
                field: "rewrite.config".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Rewrite {
            templates: decode_templates(&cfg.templates)?,
            next: 0,
        })
    }
}

impl Module for Rewrite {
    fn can_receive(&self) -> bool {
        true
    }

    fn process_batch(&mut self, ctx: &mut RunContext<'_>, batch: &mut PacketBatch) {
        while let Some(mut pkt) = batch.pop_front() {
            let template = &self.templates[self.next];
            self.next = (self.next + 1) % self.templates.len();
            if pkt.set_data(template).is_err() {
                ctx.drop_packet(pkt);
                continue;
            }
            ctx.emit_packet(pkt, 0);
        }
    }

    fn commands(&self) -> &'static [CommandDesc] {
        COMMANDS
    }

    fn run_command(&mut self, command: &str, arg: &Value) -> Result<Value, Error> {
        match command {
            "set_templates" => {
                let encoded: Vec<String> = serde_json::from_value(arg["templates"].clone())
                    .map_err(|e| Error::InvalidArgument {
                        field: "templates".to_owned(),
                        reason: e.to_string(),
                    })?;
                self.templates = decode_templates(&encoded)?;
                self.next = 0;
                Ok(Value::Null)
            }
            other => Err(Error::UnknownCommand {
                module: "rewrite".to_owned(),
                command: other.to_owned(),
            }),
        }
    }
}

/// Registers the `rewrite` class.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(ModuleFactory {
        class_name: "rewrite",
        create: |config| Ok(Box::new(Rewrite::from_config(config)?)),
    });
}
