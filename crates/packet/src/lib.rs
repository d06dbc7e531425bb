// SPDX-License-Identifier: Apache-2.0

//! Packet buffers, fixed-capacity batches, and the packet-pool interface.
//!
//! A [`Packet`] is a handle to a fixed-size buffer with reserved headroom, a
//! data region, and a per-module scratchpad. Packets travel between modules
//! in [`PacketBatch`]es of at most [`MAX_BURST`] handles. Buffers come from a
//! [`PacketPool`]; the default [`HeapPool`] preallocates its whole capacity
//! and recycles handles through a freelist.
//!
//! Ownership is strict: a packet is owned by exactly one batch, module, or
//! pool freelist at any time. "Freeing" a packet means returning it to its
//! pool.

pub mod batch;
pub mod error;
pub mod packet;
pub mod pool;

pub use batch::{MAX_BURST, PacketBatch};
pub use error::Error;
pub use packet::{DATA_ROOM, HEADROOM, Packet, SCRATCHPAD_SIZE};
pub use pool::{HeapPool, PacketPool, PoolId, PoolStats};
