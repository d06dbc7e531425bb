// SPDX-License-Identifier: Apache-2.0

//! The packet buffer handle.
//!
//! Buffer layout (in bytes):
//!
//! ```text
//!   0          128                 128 + 1536
//!   | headroom |       data room       |
//! ```
//!
//! `data_off` marks where packet data begins inside the buffer and `data_len`
//! how many bytes are valid. Prepending headers moves `data_off` left;
//! trimming moves it right. A separate fixed-size scratchpad carries
//! per-module metadata that does not survive a trip through a port.

use crate::error::Error;
use crate::pool::PoolId;

/// Reserved headroom in front of the packet data, for header prepends.
pub const HEADROOM: usize = 128;

/// Size of the data room following the headroom.
pub const DATA_ROOM: usize = 1536;

/// Total buffer size (headroom + data room).
pub const BUFFER_SIZE: usize = HEADROOM + DATA_ROOM;

/// Size of the per-packet metadata scratchpad.
pub const SCRATCHPAD_SIZE: usize = 64;

/// A handle to a fixed-size packet buffer.
///
/// Packets are owned values: they move between batches, modules, and pool
/// freelists, and exactly one owner holds a given packet at a time. The
/// refcount only goes above one when a module explicitly shares a buffer
/// (e.g. for multicast replication) and is otherwise left at one.
pub struct Packet {
    buffer: Box<[u8; BUFFER_SIZE]>,
    data_off: u16,
    data_len: u16,
    refcnt: u32,
    pool: PoolId,
    /// Next segment of a chained packet, if any.
    next: Option<Box<Packet>>,
    scratchpad: [u8; SCRATCHPAD_SIZE],
}

impl Packet {
    /// Creates a fresh packet owned by `pool`, with full headroom and no data.
    #[must_use]
    pub fn new(pool: PoolId) -> Self {
        Packet {
            buffer: Box::new([0u8; BUFFER_SIZE]),
            data_off: HEADROOM as u16,
            data_len: 0,
            refcnt: 1,
            pool,
            next: None,
            scratchpad: [0u8; SCRATCHPAD_SIZE],
        }
    }

    /// Resets offsets, length, refcount, chain, and scratchpad.
    ///
    /// Called by pools when recycling a packet. The buffer contents are left
    /// as-is; callers must not rely on zeroed data.
    pub fn reset(&mut self) {
        self.data_off = HEADROOM as u16;
        self.data_len = 0;
        self.refcnt = 1;
        self.next = None;
        self.scratchpad = [0u8; SCRATCHPAD_SIZE];
    }

    /// Current headroom (bytes available in front of the data).
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.data_off as usize
    }

    /// Current tailroom (bytes available after the data).
    #[must_use]
    pub fn tailroom(&self) -> usize {
        BUFFER_SIZE - self.data_off as usize - self.data_len as usize
    }

    /// Length of this segment's data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data_len as usize
    }

    /// Returns true if this segment carries no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Total length across all chained segments.
    #[must_use]
    pub fn total_len(&self) -> usize {
        let mut len = self.len();
        let mut seg = self.next.as_deref();
        while let Some(s) = seg {
            len += s.len();
            seg = s.next.as_deref();
        }
        len
    }

    /// The packet data of this segment.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        let off = self.data_off as usize;
        &self.buffer[off..off + self.data_len as usize]
    }

    /// Mutable access to the packet data of this segment.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let off = self.data_off as usize;
        &mut self.buffer[off..off + self.data_len as usize]
    }

    /// Extends the data region at the front by `len` bytes and returns the
    /// newly exposed prefix, for writing a header in place.
    pub fn prepend(&mut self, len: usize) -> Result<&mut [u8], Error> {
        let available = self.headroom();
        if len > available {
            return Err(Error::HeadroomExhausted {
                requested: len,
                available,
            });
        }
        self.data_off -= len as u16;
        self.data_len += len as u16;
        let off = self.data_off as usize;
        Ok(&mut self.buffer[off..off + len])
    }

    /// Removes `len` bytes from the front of the data region.
    pub fn adj(&mut self, len: usize) -> Result<(), Error> {
        if len > self.len() {
            return Err(Error::TrimOutOfBounds {
                requested: len,
                len: self.len(),
            });
        }
        self.data_off += len as u16;
        self.data_len -= len as u16;
        Ok(())
    }

    /// Removes `len` bytes from the tail of the data region.
    pub fn trim(&mut self, len: usize) -> Result<(), Error> {
        if len > self.len() {
            return Err(Error::TrimOutOfBounds {
                requested: len,
                len: self.len(),
            });
        }
        self.data_len -= len as u16;
        Ok(())
    }

    /// Extends the data region at the tail by `len` bytes and returns the
    /// newly exposed suffix for writing.
    pub fn append(&mut self, len: usize) -> Result<&mut [u8], Error> {
        let available = self.tailroom();
        if len > available {
            return Err(Error::TailroomExhausted {
                requested: len,
                available,
            });
        }
        let start = self.data_off as usize + self.data_len as usize;
        self.data_len += len as u16;
        Ok(&mut self.buffer[start..start + len])
    }

    /// Replaces the packet data with `data` (headroom restored to default).
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() > DATA_ROOM {
            return Err(Error::TailroomExhausted {
                requested: data.len(),
                available: DATA_ROOM,
            });
        }
        self.data_off = HEADROOM as u16;
        self.data_len = data.len() as u16;
        self.data_mut().copy_from_slice(data);
        Ok(())
    }

    /// Owning pool of this packet.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// Current reference count.
    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    /// Adds a reference for a module that shares the buffer.
    pub fn incr_refcnt(&mut self) {
        self.refcnt += 1;
    }

    /// Drops a reference; returns the new count.
    ///
    /// A packet is only returned to its pool once the count reaches zero.
    pub fn decr_refcnt(&mut self) -> u32 {
        debug_assert!(self.refcnt > 0);
        self.refcnt -= 1;
        self.refcnt
    }

    /// Physical-address surrogate of this buffer.
    ///
    /// Without DMA there is no IOVA; the stable heap address of the buffer
    /// stands in so that address-keyed bookkeeping behaves like the real
    /// thing.
    #[must_use]
    pub fn paddr(&self) -> u64 {
        std::ptr::from_ref::<u8>(&self.buffer[0]) as usize as u64
    }

    /// Next segment of a chained packet.
    #[must_use]
    pub fn next_segment(&self) -> Option<&Packet> {
        self.next.as_deref()
    }

    /// Chains `seg` as the next segment, returning any previous tail.
    pub fn set_next_segment(&mut self, seg: Box<Packet>) -> Option<Box<Packet>> {
        self.next.replace(seg)
    }

    /// Detaches and returns the next segment, if any.
    pub fn take_next_segment(&mut self) -> Option<Box<Packet>> {
        self.next.take()
    }

    /// The per-module scratchpad.
    #[must_use]
    pub fn scratchpad(&self) -> &[u8; SCRATCHPAD_SIZE] {
        &self.scratchpad
    }

    /// Mutable access to the per-module scratchpad.
    pub fn scratchpad_mut(&mut self) -> &mut [u8; SCRATCHPAD_SIZE] {
        &mut self.scratchpad
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("pool", &self.pool)
            .field("data_off", &self.data_off)
            .field("data_len", &self.data_len)
            .field("refcnt", &self.refcnt)
            .field("chained", &self.next.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fresh_packet_has_full_headroom() {
        let pkt = Packet::new(PoolId(0));
        assert_eq!(pkt.headroom(), HEADROOM);
        assert_eq!(pkt.len(), 0);
        assert_eq!(pkt.tailroom(), DATA_ROOM);
        assert_eq!(pkt.refcnt(), 1);
    }

    #[test]
    fn prepend_and_adj_are_inverses() {
        let mut pkt = Packet::new(PoolId(0));
        pkt.set_data(&[0xab; 100]).expect("set_data");

        let hdr = pkt.prepend(14).expect("prepend");
        hdr.copy_from_slice(&[0x11; 14]);
        assert_eq!(pkt.len(), 114);
        assert_eq!(&pkt.data()[..14], &[0x11; 14]);

        pkt.adj(14).expect("adj");
        assert_eq!(pkt.len(), 100);
        assert_eq!(pkt.data(), &[0xab; 100]);
    }

    #[test]
    fn prepend_beyond_headroom_fails() {
        let mut pkt = Packet::new(PoolId(0));
        let err = pkt.prepend(HEADROOM + 1).expect_err("must fail");
        assert!(matches!(err, Error::HeadroomExhausted { .. }));
        // State unchanged on failure.
        assert_eq!(pkt.headroom(), HEADROOM);
    }

    #[test]
    fn trim_and_append_adjust_tail() {
        let mut pkt = Packet::new(PoolId(0));
        pkt.set_data(&[1; 64]).expect("set_data");
        pkt.trim(4).expect("trim");
        assert_eq!(pkt.len(), 60);

        let tail = pkt.append(8).expect("append");
        tail.copy_from_slice(&[2; 8]);
        assert_eq!(pkt.len(), 68);
        assert_eq!(&pkt.data()[60..], &[2; 8]);
    }

    #[test]
    fn chained_total_len() {
        let mut head = Packet::new(PoolId(0));
        head.set_data(&[0; 100]).expect("set_data");
        let mut tail = Packet::new(PoolId(0));
        tail.set_data(&[0; 50]).expect("set_data");

        assert!(head.set_next_segment(Box::new(tail)).is_none());
        assert_eq!(head.len(), 100);
        assert_eq!(head.total_len(), 150);
    }
}
