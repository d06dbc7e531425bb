// SPDX-License-Identifier: Apache-2.0

//! The polled-port abstraction.
//!
//! Ports are the boundary between the module graph and the outside world:
//! a port-in module polls `recv_burst` from a task, a port-out module pushes
//! batches through `send_burst`. Real NIC drivers are out of scope; the
//! built-in loopback driver buffers transmitted packets and hands them back
//! on receive, which is enough for end-to-end tests and demos.

use crate::error::Error;
use pktflow_packet::{MAX_BURST, Packet, PacketBatch};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Per-direction port counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortStats {
    /// Packets received from the port.
    pub rx_packets: u64,
    /// Packets accepted for transmission.
    pub tx_packets: u64,
    /// Packets the port had to refuse (queue full).
    pub tx_dropped: u64,
}

/// A polled packet port.
pub trait Port: Send {
    /// Moves up to `MAX_BURST` packets from the port into `batch`; returns
    /// the number received. Never blocks.
    fn recv_burst(&mut self, batch: &mut PacketBatch) -> usize;

    /// Consumes packets from `batch` for transmission; returns the number
    /// accepted. Refused packets stay in `batch` for the caller to drop.
    fn send_burst(&mut self, batch: &mut PacketBatch) -> usize;

    /// Current counters.
    fn stats(&self) -> PortStats;
}

/// Factory for one port driver.
#[derive(Clone)]
pub struct PortFactory {
    /// Unique driver name (e.g. `"loopback"`).
    pub driver: &'static str,
    /// Builds a port instance from its configuration.
    pub create: fn(config: &Value) -> Result<Box<dyn Port>, Error>,
}

/// Registry of port drivers.
#[derive(Default)]
pub struct PortRegistry {
    factories: HashMap<&'static str, PortFactory>,
}

impl PortRegistry {
    /// Creates a registry with the built-in drivers.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = PortRegistry::default();
        registry.register(PortFactory {
            driver: "loopback",
            create: |config| {
                let capacity = config["queue_size"].as_u64().unwrap_or(1024) as usize;
                Ok(Box::new(LoopbackPort::new(capacity)))
            },
        });
        registry
    }

    /// Registers a driver; the last registration of a name wins.
    pub fn register(&mut self, factory: PortFactory) {
        let _ = self.factories.insert(factory.driver, factory);
    }

    /// Looks a driver up by name.
    pub fn get(&self, driver: &str) -> Result<&PortFactory, Error> {
        self.factories
            .get(driver)
            .ok_or_else(|| Error::UnknownPortDriver {
                driver: driver.to_owned(),
            })
    }
}

/// Test/demo driver: transmitted packets come back on receive, FIFO, through
/// a bounded queue.
pub struct LoopbackPort {
    queue: VecDeque<Box<Packet>>,
    capacity: usize,
    stats: PortStats,
}

impl LoopbackPort {
    /// Creates a loopback port buffering up to `capacity` packets.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        LoopbackPort {
            queue: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            stats: PortStats::default(),
        }
    }
}

impl Port for LoopbackPort {
    fn recv_burst(&mut self, batch: &mut PacketBatch) -> usize {
        let want = MAX_BURST - batch.cnt();
        let mut got = 0;
        while got < want {
            match self.queue.pop_front() {
                Some(pkt) => {
                    batch.add(pkt);
                    got += 1;
                }
                None => break,
            }
        }
        self.stats.rx_packets += got as u64;
        got
    }

    fn send_burst(&mut self, batch: &mut PacketBatch) -> usize {
        let mut sent = 0;
        while self.queue.len() < self.capacity {
            match batch.pop_front() {
                Some(pkt) => {
                    self.queue.push_back(pkt);
                    sent += 1;
                }
                None => break,
            }
        }
        self.stats.tx_packets += sent as u64;
        self.stats.tx_dropped += batch.cnt() as u64;
        sent
    }

    fn stats(&self) -> PortStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktflow_packet::PoolId;

    fn pkt() -> Box<Packet> {
        Box::new(Packet::new(PoolId(0)))
    }

    #[test]
    fn loopback_round_trips_fifo() {
        let mut port = LoopbackPort::new(64);
        let mut tx = PacketBatch::new();
        for i in 0..3u8 {
            let mut p = pkt();
            p.set_data(&[i; 10]).expect("set_data");
            tx.add(p);
        }
        assert_eq!(port.send_burst(&mut tx), 3);
        assert!(tx.is_empty());

        let mut rx = PacketBatch::new();
        assert_eq!(port.recv_burst(&mut rx), 3);
        let firsts: Vec<u8> = rx.iter().map(|p| p.data()[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2]);
    }

    #[test]
    fn loopback_refuses_overflow() {
        let mut port = LoopbackPort::new(2);
        let mut tx = PacketBatch::new();
        for _ in 0..4 {
            tx.add(pkt());
        }
        assert_eq!(port.send_burst(&mut tx), 2);
        assert_eq!(tx.cnt(), 2);
        assert_eq!(port.stats().tx_dropped, 2);
    }
}
