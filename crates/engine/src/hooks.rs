// SPDX-License-Identifier: Apache-2.0

//! Gate hooks: pure observers attached to gates.
//!
//! Hooks run over every batch crossing their gate, in priority order. They
//! must never emit packets of their own. The built-in hooks are [`Track`]
//! (batch/packet counters) and [`Tcpdump`] (pcap stream into a fifo for live
//! `tcpdump -r` inspection).

use pktflow_packet::PacketBatch;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// An observer attached to a gate.
///
/// Hooks take `&self`: they run on the hot path under the graph read lock,
/// so any internal state must be interiorly mutable (atomics, `&File`
/// writes).
pub trait GateHook: Send + Sync {
    /// Hook name, unique per gate.
    fn name(&self) -> &str;

    /// Run order on the gate; lower runs first.
    fn priority(&self) -> u16;

    /// Observes one batch. Must not emit packets.
    fn process_batch(&self, batch: &PacketBatch);
}

/// Counters shared between a [`Track`] hook and the control plane.
#[derive(Debug, Default)]
pub struct TrackCounters {
    /// Observed batches.
    pub batches: AtomicU64,
    /// Observed packets.
    pub packets: AtomicU64,
    /// Observed bytes.
    pub bytes: AtomicU64,
}

/// Batch/packet/byte counting hook.
pub struct Track {
    counters: Arc<TrackCounters>,
}

impl Track {
    /// Hook name used on gates.
    pub const NAME: &'static str = "track";

    /// Creates a tracking hook; the returned counters handle stays valid
    /// after the hook is installed.
    #[must_use]
    pub fn create() -> (Self, Arc<TrackCounters>) {
        let counters = Arc::new(TrackCounters::default());
        (
            Track {
                counters: counters.clone(),
            },
            counters,
        )
    }
}

impl GateHook for Track {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u16 {
        0
    }

    fn process_batch(&self, batch: &PacketBatch) {
        let _ = self.counters.batches.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .counters
            .packets
            .fetch_add(batch.cnt() as u64, Ordering::Relaxed);
        let _ = self
            .counters
            .bytes
            .fetch_add(batch.total_bytes() as u64, Ordering::Relaxed);
    }
}

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 0xffff;
const PCAP_NETWORK_ETHERNET: u32 = 1;

/// Streams packets as a pcap file into a fifo.
///
/// The fifo must already exist and have a reader (e.g. `tcpdump -r <fifo>`);
/// the hook opens it non-blocking and disables itself when the reader goes
/// away (EPIPE).
pub struct Tcpdump {
    fifo: File,
    active: AtomicBool,
}

impl Tcpdump {
    /// Hook name used on gates.
    pub const NAME: &'static str = "tcpdump";

    /// Opens the fifo and writes the pcap file header.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let fifo = OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(path)?;

        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&PCAP_SNAPLEN.to_le_bytes());
        header.extend_from_slice(&PCAP_NETWORK_ETHERNET.to_le_bytes());
        (&fifo).write_all(&header)?;

        Ok(Tcpdump {
            fifo,
            active: AtomicBool::new(true),
        })
    }

    /// Whether the hook is still streaming (false after the reader left).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

impl GateHook for Tcpdump {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u16 {
        // After counters, before user hooks.
        1
    }

    fn process_batch(&self, batch: &PacketBatch) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        for pkt in batch.iter() {
            let data = pkt.data();
            let incl = (data.len() as u32).min(PCAP_SNAPLEN);
            let mut rec = Vec::with_capacity(16 + incl as usize);
            rec.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
            rec.extend_from_slice(&now.subsec_micros().to_le_bytes());
            rec.extend_from_slice(&incl.to_le_bytes());
            rec.extend_from_slice(&(data.len() as u32).to_le_bytes());
            rec.extend_from_slice(&data[..incl as usize]);
            if let Err(e) = (&self.fifo).write_all(&rec) {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    // Reader went away; stop dumping.
                    self.active.store(false, Ordering::Relaxed);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktflow_packet::{Packet, PoolId};
    use std::io::Read;

    #[test]
    fn track_counts_batches_packets_and_bytes() {
        let (track, counters) = Track::create();
        let mut batch = PacketBatch::new();
        for _ in 0..4 {
            let mut p = Box::new(Packet::new(PoolId(0)));
            p.set_data(&[0u8; 60]).expect("set_data");
            batch.add(p);
        }
        track.process_batch(&batch);
        track.process_batch(&batch);
        assert_eq!(counters.batches.load(Ordering::Relaxed), 2);
        assert_eq!(counters.packets.load(Ordering::Relaxed), 8);
        assert_eq!(counters.bytes.load(Ordering::Relaxed), 480);
    }

    #[test]
    fn tcpdump_streams_pcap_records_into_a_fifo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fifo_path = dir.path().join("dump.fifo");
        nix::unistd::mkfifo(&fifo_path, nix::sys::stat::Mode::S_IRWXU).expect("mkfifo");

        // The reader must exist before the hook opens the fifo
        // non-blocking for writing.
        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&fifo_path)
            .expect("open reader");

        let hook = Tcpdump::open(&fifo_path).expect("open hook");
        assert!(hook.is_active());

        let mut batch = PacketBatch::new();
        let mut p = Box::new(Packet::new(PoolId(0)));
        p.set_data(&[0xaa; 60]).expect("set_data");
        batch.add(p);
        hook.process_batch(&batch);

        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        // File header (24 bytes) + one record header (16) + 60 data bytes.
        assert_eq!(buf.len(), 24 + 16 + 60);
        assert_eq!(&buf[..4], &PCAP_MAGIC.to_le_bytes());
        let incl = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]);
        assert_eq!(incl, 60);
        assert_eq!(&buf[40..], &[0xaa; 60]);
    }
}
