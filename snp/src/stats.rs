//! Driver statistics
//!
//! Counters live in atomics so the receive thread and the update thread can
//! record without taking the state lock; [`DriverStats`] is a plain snapshot
//! for callers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Packets rejected by the validation funnel (malformed, wrong app,
    /// bad CRC, bad header HMAC, unknown session)
    pub dropped_packets: u64,
    /// Packets rejected by the anti-replay buffers
    pub dropped_duplicates: u64,
    pub retransmits: u64,
    pub connections_accepted: u64,
}

/// Shared atomic counters behind a driver.
#[derive(Default)]
pub(crate) struct StatsInner {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dropped_packets: AtomicU64,
    dropped_duplicates: AtomicU64,
    retransmits: AtomicU64,
    connections_accepted: AtomicU64,
}

impl StatsInner {
    pub fn record_send(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_recv(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn drop_packet(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_duplicate(&self) {
        self.dropped_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DriverStats {
        DriverStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            dropped_duplicates: self.dropped_duplicates.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = StatsInner::default();
        stats.record_send(100);
        stats.record_send(50);
        stats.record_recv(83);
        stats.drop_packet();
        stats.drop_duplicate();
        stats.record_retransmit();

        let snap = stats.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_received, 83);
        assert_eq!(snap.dropped_packets, 1);
        assert_eq!(snap.dropped_duplicates, 1);
        assert_eq!(snap.retransmits, 1);
        assert_eq!(snap.connections_accepted, 0);
    }
}
