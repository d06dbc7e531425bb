// SPDX-License-Identifier: Apache-2.0

//! Resource currencies and the fixed-width usage tuple.
//!
//! Scheduling consumption is measured in four currencies: how many times a
//! class was scheduled, how many cycles it spent, and how many packets and
//! bits it moved. Token buckets compare consumption against limits in
//! amplified "work units" (`value << USAGE_AMPLIFIER_POW`) so that rates can
//! be expressed as integer work-units-per-cycle without floating point.

use serde::{Deserialize, Serialize};

/// Number of resource currencies.
pub const NUM_RESOURCES: usize = 4;

/// Work-unit amplification: 1 work unit = 2^32 of raw resource usage.
pub const USAGE_AMPLIFIER_POW: u32 = 32;

/// Upper bound (exclusive power) on configured limits: limits must be below
/// 2^36 units per second (~64 Tbps when the unit is bits).
pub const MAX_LIMIT_POW: u32 = 36;

/// Stride numerator: a weighted-fair child advances by `STRIDE1 / share`.
pub const STRIDE1: u64 = 1 << 20;

/// Maximum weighted-fair share. Shares are relative, so 1024 is plenty.
pub const MAX_SHARE: u32 = 1 << 10;

/// Pass-advance divisor; only there to keep `stride * consumed` products
/// well inside 64 bits.
pub const QUANTUM: u64 = 1 << 10;

/// A scheduling resource currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// Number of times a class was scheduled.
    Count,
    /// CPU cycles consumed.
    Cycles,
    /// Packets processed.
    Packets,
    /// Bits processed.
    Bits,
}

impl Resource {
    /// All resources, in tuple order.
    pub const ALL: [Resource; NUM_RESOURCES] = [
        Resource::Count,
        Resource::Cycles,
        Resource::Packets,
        Resource::Bits,
    ];

    /// Position of this resource inside a [`ResourceArr`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Resource::Count => 0,
            Resource::Cycles => 1,
            Resource::Packets => 2,
            Resource::Bits => 3,
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Resource::Count => "count",
            Resource::Cycles => "cycles",
            Resource::Packets => "packets",
            Resource::Bits => "bits",
        };
        write!(f, "{label}")
    }
}

/// A usage tuple: one 64-bit counter per resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceArr(pub [u64; NUM_RESOURCES]);

impl ResourceArr {
    /// Builds a tuple from its four components.
    #[must_use]
    pub const fn new(count: u64, cycles: u64, packets: u64, bits: u64) -> Self {
        ResourceArr([count, cycles, packets, bits])
    }

    /// `self += other`, element-wise and saturating.
    pub fn accumulate(&mut self, other: &ResourceArr) {
        for i in 0..NUM_RESOURCES {
            self.0[i] = self.0[i].saturating_add(other.0[i]);
        }
    }

    /// Element-wise difference, for rate windows.
    #[must_use]
    pub fn delta(&self, earlier: &ResourceArr) -> ResourceArr {
        let mut out = ResourceArr::default();
        for i in 0..NUM_RESOURCES {
            out.0[i] = self.0[i].wrapping_sub(earlier.0[i]);
        }
        out
    }

    /// Resets every counter to zero.
    pub fn clear(&mut self) {
        self.0 = [0; NUM_RESOURCES];
    }
}

impl std::ops::Index<Resource> for ResourceArr {
    type Output = u64;

    fn index(&self, r: Resource) -> &u64 {
        &self.0[r.index()]
    }
}

impl std::ops::IndexMut<Resource> for ResourceArr {
    fn index_mut(&mut self, r: Resource) -> &mut u64 {
        &mut self.0[r.index()]
    }
}

/// Amplifies a raw resource value into work units.
#[must_use]
pub const fn to_work_units(value: u64) -> u64 {
    value << USAGE_AMPLIFIER_POW
}

/// Converts a limit in units-per-second into work-units-per-cycle.
///
/// The shifted form keeps full precision for any `tsc_hz` between 16 MHz and
/// 16 GHz without overflowing 64 bits, provided the limit respects
/// [`MAX_LIMIT_POW`].
///
/// # Panics
/// Panics if `limit_per_sec >= 2^MAX_LIMIT_POW`.
#[must_use]
pub fn limit_to_work_units_per_cycle(limit_per_sec: u64, tsc_hz: u64) -> u64 {
    assert!(
        limit_per_sec < 1u64 << MAX_LIMIT_POW,
        "limit {limit_per_sec} exceeds 2^{MAX_LIMIT_POW}",
    );
    (limit_per_sec << (USAGE_AMPLIFIER_POW - 4)) / (tsc_hz >> 4)
}
