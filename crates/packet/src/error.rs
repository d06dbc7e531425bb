// SPDX-License-Identifier: Apache-2.0

//! Errors for packet buffers and pools.

/// Errors that can occur while manipulating packet buffers or pools.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested headroom adjustment does not fit in the buffer.
    #[error("headroom exhausted: requested {requested} bytes, {available} available")]
    HeadroomExhausted {
        /// Number of bytes the caller tried to prepend.
        requested: usize,
        /// Headroom bytes actually available.
        available: usize,
    },

    /// The requested tailroom adjustment does not fit in the buffer.
    #[error("tailroom exhausted: requested {requested} bytes, {available} available")]
    TailroomExhausted {
        /// Number of bytes the caller tried to append.
        requested: usize,
        /// Tailroom bytes actually available.
        available: usize,
    },

    /// The requested trim removes more bytes than the packet holds.
    #[error("cannot remove {requested} bytes from a packet of {len} bytes")]
    TrimOutOfBounds {
        /// Number of bytes the caller tried to remove.
        requested: usize,
        /// Current data length of the packet.
        len: usize,
    },

    /// The pool has no free packets left.
    #[error("packet pool {pool:?} exhausted (capacity {capacity})")]
    PoolExhausted {
        /// Identifier of the exhausted pool.
        pool: crate::pool::PoolId,
        /// Total capacity of the pool.
        capacity: usize,
    },
}
