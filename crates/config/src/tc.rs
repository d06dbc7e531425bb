// SPDX-License-Identifier: Apache-2.0

//! Traffic-class specification.

use pktflow_sched::{MAX_SHARE, Resource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sentinel priority meaning "not set".
pub const UNSET_PRIORITY: i32 = -1;

/// Scheduling policy of a traffic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcPolicy {
    /// Strict priority between children.
    Priority,
    /// Weighted-fair sharing between children.
    WeightedFair,
    /// Round robin between children.
    RoundRobin,
    /// Token-bucket rate limit over one child.
    RateLimit,
    /// Leaf; owns a task.
    Leaf,
}

/// Declarative description of one traffic class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcSpec {
    /// Globally unique class name.
    pub name: String,

    /// Scheduling policy of this class.
    pub policy: TcPolicy,

    /// Parent class name; `None` makes this a top-level class under a
    /// worker's root (or an orphan until attached).
    #[serde(default)]
    pub parent: Option<String>,

    /// Worker to place a parentless class on.
    #[serde(default)]
    pub wid: Option<u32>,

    /// Priority under a priority-policy parent; [`UNSET_PRIORITY`] when the
    /// parent uses another policy.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Share under a weighted-fair parent, in `[1, 1024]`.
    #[serde(default = "default_share")]
    pub share: u32,

    /// Resource a weighted-fair parent measures this class's consumption in.
    #[serde(default = "default_resource")]
    pub share_resource: Resource,

    /// Rate limits in units per second, keyed by resource; 0 or absent means
    /// unlimited. A rate-limit class uses exactly one entry.
    #[serde(default)]
    pub limit: HashMap<Resource, u64>,

    /// Burst allowances in units, keyed by resource.
    #[serde(default)]
    pub max_burst: HashMap<Resource, u64>,

    /// Free this class automatically when its last task is detached.
    #[serde(default)]
    pub auto_free: bool,
}

fn default_priority() -> i32 {
    UNSET_PRIORITY
}

fn default_share() -> u32 {
    1
}

fn default_resource() -> Resource {
    Resource::Count
}

impl TcSpec {
    /// Minimal leaf spec, for programmatic construction.
    #[must_use]
    pub fn leaf(name: impl Into<String>, parent: Option<String>) -> Self {
        TcSpec {
            name: name.into(),
            policy: TcPolicy::Leaf,
            parent,
            wid: None,
            priority: UNSET_PRIORITY,
            share: 1,
            share_resource: Resource::Count,
            limit: HashMap::new(),
            max_burst: HashMap::new(),
            auto_free: false,
        }
    }

    /// The single (resource, limit) pair of a rate-limit class, if any.
    #[must_use]
    pub fn rate_limit(&self) -> Option<(Resource, u64)> {
        self.limit.iter().find(|&(_, &v)| v > 0).map(|(&r, &v)| (r, v))
    }

    /// Checks the fields that can be validated in isolation.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.name.is_empty() {
            return Err(crate::error::Error::InvalidField {
                field: "tc.name".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        if self.share == 0 || self.share > MAX_SHARE {
            return Err(crate::error::Error::InvalidField {
                field: format!("tc.{}.share", self.name),
                reason: format!("{} is outside [1, {MAX_SHARE}]", self.share),
            });
        }
        if self.policy == TcPolicy::RateLimit {
            let active = self.limit.values().filter(|&&v| v > 0).count();
            if active > 1 {
                return Err(crate::error::Error::InvalidField {
                    field: format!("tc.{}.limit", self.name),
                    reason: "a rate-limit class takes exactly one limited resource".to_owned(),
                });
            }
        }
        Ok(())
    }
}
