// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity packet batches.

use crate::packet::Packet;
use arrayvec::ArrayVec;

/// Maximum number of packets handed between modules in one call.
pub const MAX_BURST: usize = 32;

/// A burst of up to [`MAX_BURST`] packets.
///
/// A batch is a single-worker value: it is never shared concurrently, and
/// ownership of its packets transfers wholesale through gates.
#[derive(Default)]
#[repr(align(64))]
pub struct PacketBatch {
    pkts: ArrayVec<Box<Packet>, MAX_BURST>,
}

impl PacketBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        PacketBatch {
            pkts: ArrayVec::new(),
        }
    }

    /// Number of packets in the batch.
    #[must_use]
    pub fn cnt(&self) -> usize {
        self.pkts.len()
    }

    /// Returns true if the batch holds no packets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    /// Returns true if the batch is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pkts.is_full()
    }

    /// Appends a packet. Panics if the batch is full; callers flush full
    /// batches before adding (the engine guarantees this on the fast path).
    pub fn add(&mut self, pkt: Box<Packet>) {
        self.pkts.push(pkt);
    }

    /// Appends a packet, handing it back if the batch is full.
    pub fn try_add(&mut self, pkt: Box<Packet>) -> Result<(), Box<Packet>> {
        self.pkts.try_push(pkt).map_err(|e| e.element())
    }

    /// Moves as many packets as fit from `other` into `self`, preserving
    /// order. Packets that do not fit remain in `other`.
    pub fn absorb(&mut self, other: &mut PacketBatch) {
        let take = (MAX_BURST - self.pkts.len()).min(other.pkts.len());
        for pkt in other.pkts.drain(..take) {
            self.pkts.push(pkt);
        }
    }

    /// Removes and returns the first packet, if any.
    pub fn pop_front(&mut self) -> Option<Box<Packet>> {
        if self.pkts.is_empty() {
            None
        } else {
            Some(self.pkts.remove(0))
        }
    }

    /// Drains all packets from the batch, in order.
    pub fn drain(&mut self) -> impl Iterator<Item = Box<Packet>> + '_ {
        self.pkts.drain(..)
    }

    /// Iterates over the packets in order.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.pkts.iter().map(|p| p.as_ref())
    }

    /// Iterates mutably over the packets in order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Packet> {
        self.pkts.iter_mut().map(|p| p.as_mut())
    }

    /// Sum of the data lengths of all packets (chained segments included).
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.pkts.iter().map(|p| p.total_len()).sum()
    }

    /// Removes all packets, dropping them on the floor.
    ///
    /// Only for tests and teardown; the dataplane returns packets to their
    /// pool instead.
    pub fn clear(&mut self) {
        self.pkts.clear();
    }
}

impl std::fmt::Debug for PacketBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketBatch(cnt={})", self.cnt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolId;

    fn pkt() -> Box<Packet> {
        Box::new(Packet::new(PoolId(0)))
    }

    #[test]
    fn add_until_full() {
        let mut batch = PacketBatch::new();
        for _ in 0..MAX_BURST {
            batch.add(pkt());
        }
        assert!(batch.is_full());
        assert!(batch.try_add(pkt()).is_err());
        assert_eq!(batch.cnt(), MAX_BURST);
    }

    #[test]
    fn absorb_respects_capacity_and_order() {
        let mut a = PacketBatch::new();
        let mut b = PacketBatch::new();
        for i in 0..30 {
            let mut p = pkt();
            p.set_data(&[i as u8; 10]).expect("set_data");
            a.add(p);
        }
        for i in 0..10 {
            let mut p = pkt();
            p.set_data(&[100 + i as u8; 10]).expect("set_data");
            b.add(p);
        }

        a.absorb(&mut b);
        assert_eq!(a.cnt(), MAX_BURST);
        assert_eq!(b.cnt(), 8);
        // First absorbed packet sits right after the original 30.
        let tail: Vec<u8> = a.iter().skip(30).map(|p| p.data()[0]).collect();
        assert_eq!(tail, vec![100, 101]);
        // Leftovers keep their order too.
        assert_eq!(b.iter().next().map(|p| p.data()[0]), Some(102));
    }

    #[test]
    fn total_bytes_sums_packets() {
        let mut batch = PacketBatch::new();
        for len in [10usize, 20, 30] {
            let mut p = pkt();
            p.set_data(&vec![0u8; len]).expect("set_data");
            batch.add(p);
        }
        assert_eq!(batch.total_bytes(), 60);
    }
}
