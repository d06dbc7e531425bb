// SPDX-License-Identifier: Apache-2.0

//! The dataplane clock.
//!
//! The "TSC" is a monotonic nanosecond counter anchored at process start, so
//! one cycle equals one nanosecond and `tsc_hz()` is 10^9. Every formula in
//! the scheduler (work units, limit conversion, wakeup deadlines) holds
//! unchanged under that base.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current TSC value.
#[must_use]
pub fn rdtsc() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Clock frequency of the TSC, in cycles per second.
#[must_use]
pub const fn tsc_hz() -> u64 {
    1_000_000_000
}

/// Converts a TSC value to nanoseconds.
#[must_use]
pub const fn tsc_to_ns(tsc: u64) -> u64 {
    tsc
}
