// SPDX-License-Identifier: Apache-2.0

//! The packet-pool interface and the default heap-backed pool.
//!
//! One pool exists per NUMA socket; workers allocate from the pool local to
//! their socket. The pool is a black box to the engine: bulk alloc and bulk
//! free, plus capacity and placement metadata.

use crate::batch::PacketBatch;
use crate::error::Error;
use crate::packet::Packet;
use parking_lot::Mutex;

/// Identifies a packet pool (one per NUMA socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub u16);

/// Counters exposed by a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Packets currently out of the pool.
    pub in_use: usize,
    /// Total allocations served.
    pub allocated: u64,
    /// Total packets returned.
    pub freed: u64,
}

/// The packet-pool contract consumed by the engine.
///
/// Implementations synchronise internally; producers and consumers on
/// different workers may alloc/free concurrently.
pub trait PacketPool: Send + Sync {
    /// Allocates one packet, or `None` if the pool is exhausted.
    fn alloc(&self) -> Option<Box<Packet>>;

    /// Allocates up to `n` packets into `batch`. Returns `true` only if all
    /// `n` were allocated; on failure nothing is allocated.
    fn alloc_bulk(&self, n: usize, batch: &mut PacketBatch) -> bool;

    /// Returns one packet (and its chained segments) to the pool.
    ///
    /// # Panics
    /// Panics if the packet belongs to a different pool; freeing into the
    /// wrong pool is a programming fault.
    fn free(&self, pkt: Box<Packet>);

    /// Returns every packet in `batch` to the pool.
    fn free_bulk(&self, batch: &mut PacketBatch);

    /// Total number of packets the pool can hold.
    fn capacity(&self) -> usize;

    /// NUMA socket this pool is local to.
    fn socket(&self) -> u32;

    /// Pool identifier stamped into allocated packets.
    fn id(&self) -> PoolId;

    /// Current pool counters.
    fn stats(&self) -> PoolStats;
}

struct FreeList {
    free: Vec<Box<Packet>>,
    allocated: u64,
    freed: u64,
}

impl FreeList {
    /// Recycles `pkt` and its segment chain.
    fn recycle(&mut self, mut pkt: Box<Packet>, pool: PoolId) {
        loop {
            assert_eq!(
                pkt.pool(),
                pool,
                "packet freed into the wrong pool ({:?} != {:?})",
                pkt.pool(),
                pool,
            );
            let next = pkt.take_next_segment();
            self.free.push(pkt);
            self.freed += 1;
            match next {
                Some(seg) => pkt = seg,
                None => break,
            }
        }
    }
}

/// Default pool: the whole capacity is allocated up front and recycled
/// through a mutex-guarded freelist. Bulk operations take the lock once per
/// burst, so the per-packet cost stays small.
pub struct HeapPool {
    id: PoolId,
    socket: u32,
    capacity: usize,
    freelist: Mutex<FreeList>,
}

impl HeapPool {
    /// Creates a pool of `capacity` packets local to `socket`.
    #[must_use]
    pub fn new(id: PoolId, socket: u32, capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Box::new(Packet::new(id))).collect();
        HeapPool {
            id,
            socket,
            capacity,
            freelist: Mutex::new(FreeList {
                free,
                allocated: 0,
                freed: 0,
            }),
        }
    }

    /// Like [`PacketPool::alloc`], but returns a typed error on exhaustion.
    pub fn try_alloc(&self) -> Result<Box<Packet>, Error> {
        self.alloc().ok_or(Error::PoolExhausted {
            pool: self.id,
            capacity: self.capacity,
        })
    }
}

impl PacketPool for HeapPool {
    fn alloc(&self) -> Option<Box<Packet>> {
        let mut fl = self.freelist.lock();
        let mut pkt = fl.free.pop()?;
        fl.allocated += 1;
        pkt.reset();
        Some(pkt)
    }

    fn alloc_bulk(&self, n: usize, batch: &mut PacketBatch) -> bool {
        let mut fl = self.freelist.lock();
        if fl.free.len() < n {
            return false;
        }
        for _ in 0..n {
            let mut pkt = fl.free.pop().expect("length checked above");
            pkt.reset();
            batch.add(pkt);
        }
        fl.allocated += n as u64;
        true
    }

    fn free(&self, pkt: Box<Packet>) {
        self.freelist.lock().recycle(pkt, self.id);
    }

    fn free_bulk(&self, batch: &mut PacketBatch) {
        // One lock round for the whole burst.
        let pkts: Vec<_> = batch.drain().collect();
        let mut fl = self.freelist.lock();
        for pkt in pkts {
            fl.recycle(pkt, self.id);
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn socket(&self) -> u32 {
        self.socket
    }

    fn id(&self) -> PoolId {
        self.id
    }

    fn stats(&self) -> PoolStats {
        let fl = self.freelist.lock();
        PoolStats {
            in_use: self.capacity - fl.free.len(),
            allocated: fl.allocated,
            freed: fl.freed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let pool = HeapPool::new(PoolId(0), 0, 4);
        let pkt = pool.alloc().expect("alloc");
        assert_eq!(pool.stats().in_use, 1);
        pool.free(pkt);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().freed, 1);
    }

    #[test]
    fn bulk_alloc_is_all_or_nothing() {
        let pool = HeapPool::new(PoolId(0), 0, 8);
        let mut batch = PacketBatch::new();
        assert!(pool.alloc_bulk(8, &mut batch));
        assert_eq!(batch.cnt(), 8);

        let mut more = PacketBatch::new();
        assert!(!pool.alloc_bulk(1, &mut more));
        assert_eq!(more.cnt(), 0);

        pool.free_bulk(&mut batch);
        assert_eq!(pool.stats().in_use, 0);
        assert!(pool.alloc_bulk(8, &mut more));
    }

    #[test]
    fn recycled_packets_are_reset() {
        let pool = HeapPool::new(PoolId(0), 0, 1);
        let mut pkt = pool.alloc().expect("alloc");
        pkt.set_data(&[7; 32]).expect("set_data");
        pkt.scratchpad_mut()[0] = 0xff;
        pool.free(pkt);

        let pkt = pool.alloc().expect("realloc");
        assert_eq!(pkt.len(), 0);
        assert_eq!(pkt.scratchpad()[0], 0);
        assert_eq!(pkt.refcnt(), 1);
    }

    #[test]
    fn chained_segments_are_recycled_individually() {
        let pool = HeapPool::new(PoolId(0), 0, 2);
        let mut head = pool.alloc().expect("alloc head");
        let tail = pool.alloc().expect("alloc tail");
        assert!(head.set_next_segment(tail).is_none());

        pool.free(head);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().freed, 2);
    }

    #[test]
    #[should_panic(expected = "wrong pool")]
    fn freeing_into_wrong_pool_panics() {
        let pool_a = HeapPool::new(PoolId(0), 0, 1);
        let pool_b = HeapPool::new(PoolId(1), 0, 1);
        let pkt = pool_a.alloc().expect("alloc");
        pool_b.free(pkt);
    }
}
