// SPDX-License-Identifier: Apache-2.0

//! Whole-dataplane specification: pools, workers, modules, wiring, classes,
//! and task attachments.

use crate::error::Error;
use crate::tc::{TcPolicy, TcSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One worker thread pinned to one core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Worker id, unique across the dataplane.
    pub wid: u32,
    /// CPU core the worker is pinned to.
    pub core: u32,
}

/// One packet pool, local to a NUMA socket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolSpec {
    /// NUMA socket the pool is local to.
    #[serde(default)]
    pub socket: u32,
    /// Number of packets the pool holds.
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

fn default_pool_capacity() -> usize {
    16 * 1024
}

/// One module instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Instance name; omitted names are derived from the class name.
    #[serde(default)]
    pub name: Option<String>,
    /// Module class, as registered with the module registry.
    pub class: String,
    /// Opaque per-class configuration, decoded by the module factory.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A directed edge between two modules' gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Emitting module name.
    pub src: String,
    /// Output gate on the emitting module.
    #[serde(default)]
    pub ogate: u16,
    /// Receiving module name.
    pub dst: String,
    /// Input gate on the receiving module.
    #[serde(default)]
    pub igate: u16,
}

/// Attachment of a module task under a leaf traffic class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Module owning the task.
    pub module: String,
    /// Leaf class the task is scheduled under.
    pub tc: String,
    /// Opaque argument handed to the module's task entry.
    #[serde(default)]
    pub arg: u64,
}

/// The whole dataplane, as brought up by the daemon at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Packet pools, one per NUMA socket in use.
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
    /// Worker threads.
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
    /// Module instances.
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    /// Gate connections.
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    /// Traffic classes, across all workers.
    #[serde(default)]
    pub tcs: Vec<TcSpec>,
    /// Task attachments.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl PipelineSpec {
    /// Parses a spec from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Deserialization {
            format: "YAML".to_owned(),
            details: e.to_string(),
        })
    }

    /// Reads and parses a spec from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        let spec = Self::from_yaml_str(&text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Validates cross-references and ranges. All errors are collected.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();

        let mut wids = HashSet::new();
        let mut cores = HashSet::new();
        for w in &self.workers {
            if !wids.insert(w.wid) {
                errors.push(Error::DuplicateName {
                    kind: "worker",
                    name: w.wid.to_string(),
                });
            }
            if !cores.insert(w.core) {
                errors.push(Error::InvalidField {
                    field: format!("workers[wid={}].core", w.wid),
                    reason: format!("core {} is already taken", w.core),
                });
            }
        }

        let mut sockets = HashSet::new();
        for p in &self.pools {
            if !sockets.insert(p.socket) {
                errors.push(Error::DuplicateName {
                    kind: "pool",
                    name: format!("socket{}", p.socket),
                });
            }
        }

        let mut module_names = HashSet::new();
        for m in &self.modules {
            if let Some(name) = &m.name {
                if !module_names.insert(name.as_str()) {
                    errors.push(Error::DuplicateName {
                        kind: "module",
                        name: name.clone(),
                    });
                }
            }
        }

        for c in &self.connections {
            for (end, name) in [("src", &c.src), ("dst", &c.dst)] {
                if !module_names.contains(name.as_str()) {
                    errors.push(Error::UnknownReference {
                        kind: "module",
                        name: name.clone(),
                        referrer: format!("connection {}:{} -> {} ({end})", c.src, c.ogate, c.dst),
                    });
                }
            }
        }

        let mut tc_names = HashSet::new();
        for tc in &self.tcs {
            if !tc_names.insert(tc.name.as_str()) {
                errors.push(Error::DuplicateName {
                    kind: "traffic class",
                    name: tc.name.clone(),
                });
            }
            if let Err(e) = tc.validate() {
                errors.push(e);
            }
            if let Some(parent) = &tc.parent {
                if !tc_names.contains(parent.as_str())
                    && !self.tcs.iter().any(|t| &t.name == parent)
                {
                    errors.push(Error::UnknownReference {
                        kind: "traffic class",
                        name: parent.clone(),
                        referrer: format!("tc {}", tc.name),
                    });
                }
            }
            if let Some(wid) = tc.wid {
                if !wids.contains(&wid) {
                    errors.push(Error::UnknownReference {
                        kind: "worker",
                        name: wid.to_string(),
                        referrer: format!("tc {}", tc.name),
                    });
                }
            }
        }

        for t in &self.tasks {
            if !module_names.contains(t.module.as_str()) {
                errors.push(Error::UnknownReference {
                    kind: "module",
                    name: t.module.clone(),
                    referrer: format!("task for tc {}", t.tc),
                });
            }
            match self.tcs.iter().find(|tc| tc.name == t.tc) {
                None => errors.push(Error::UnknownReference {
                    kind: "traffic class",
                    name: t.tc.clone(),
                    referrer: format!("task for module {}", t.module),
                }),
                Some(tc) if tc.policy != TcPolicy::Leaf => {
                    errors.push(Error::InvalidField {
                        field: format!("tasks[{}].tc", t.module),
                        reason: format!("class {} is not a leaf", t.tc),
                    });
                }
                Some(_) => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r"
pools:
  - socket: 0
    capacity: 1024
workers:
  - { wid: 0, core: 1 }
modules:
  - name: src0
    class: source
    config: { pkt_size: 60 }
  - name: sink0
    class: sink
connections:
  - { src: src0, dst: sink0 }
tcs:
  - { name: leaf0, policy: leaf, wid: 0 }
tasks:
  - { module: src0, tc: leaf0 }
";

    #[test]
    fn sample_spec_parses_and_validates() {
        let spec = PipelineSpec::from_yaml_str(SAMPLE).expect("parse");
        spec.validate().expect("valid");
        assert_eq!(spec.modules.len(), 2);
        assert_eq!(spec.connections[0].ogate, 0);
        assert_eq!(spec.modules[0].config["pkt_size"], 60);
    }

    #[test]
    fn dangling_connection_is_reported() {
        let mut spec = PipelineSpec::from_yaml_str(SAMPLE).expect("parse");
        spec.connections[0].dst = "nope".to_owned();
        let err = spec.validate().expect_err("invalid");
        let Error::InvalidConfiguration { errors } = err else {
            panic!("unexpected error shape");
        };
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, Error::UnknownReference { kind: "module", .. }))
        );
    }

    #[test]
    fn task_on_non_leaf_is_rejected() {
        let mut spec = PipelineSpec::from_yaml_str(SAMPLE).expect("parse");
        spec.tcs[0].policy = TcPolicy::RoundRobin;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn duplicate_cores_are_rejected() {
        let mut spec = PipelineSpec::from_yaml_str(SAMPLE).expect("parse");
        spec.workers.push(WorkerSpec { wid: 1, core: 1 });
        assert!(spec.validate().is_err());
    }
}
