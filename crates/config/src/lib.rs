// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the pktflow dataplane.
//!
//! A [`PipelineSpec`] describes everything the daemon brings up at startup:
//! packet pools, workers, modules and the connections between their gates,
//! the traffic-class tree of each worker, and the task attachments that put
//! module tasks under leaf classes. Specs are typically loaded from YAML;
//! per-module configuration blobs stay opaque (`serde_json::Value`) and are
//! decoded by the module factories themselves.

pub mod error;
pub mod pipeline;
pub mod tc;

pub use error::Error;
pub use pipeline::{ConnectionSpec, ModuleSpec, PipelineSpec, PoolSpec, TaskSpec, WorkerSpec};
pub use tc::{TcPolicy, TcSpec, UNSET_PRIORITY};
