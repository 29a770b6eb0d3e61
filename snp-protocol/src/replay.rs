//! Duplicate / Replay Suppression
//!
//! A [`TransmitBuffer`] is a fixed-size array of transmit-id slots indexed by
//! `uid % capacity`. Re-receiving an identical `(uid, crc)` pair is rejected
//! as a duplicate; a different id landing in an occupied slot overwrites it
//! and is accepted. The overwrite is a deliberate bounded-memory trade-off:
//! an old, unrelated id reusing a slot resets detection for the id it
//! evicted, but memory stays constant per connection regardless of traffic.
//!
//! Each connection owns one buffer per packet type so, for example, repeated
//! REQUEST retransmissions are deduplicated independently of heartbeats.

use crate::packet::{PacketType, TransmitId};

/// Default slot count per packet type per connection
pub const DEFAULT_REPLAY_WINDOW: usize = 64;

/// Fixed-size anti-replay slot buffer.
pub struct TransmitBuffer {
    slots: Vec<TransmitId>,
}

impl TransmitBuffer {
    pub fn new(capacity: usize) -> Self {
        TransmitBuffer {
            slots: vec![TransmitId::EMPTY; capacity],
        }
    }

    /// Record a received transmit id.
    ///
    /// Returns `false` ("already seen, drop") when the id is empty, the
    /// buffer has no slots, or the slot already holds this exact id.
    /// Otherwise stores the id (evicting any previous occupant) and returns
    /// `true`.
    pub fn update(&mut self, id: TransmitId) -> bool {
        if id.is_empty() || self.slots.is_empty() {
            return false;
        }
        let idx = id.uid() as usize % self.slots.len();
        if self.slots[idx] == id {
            return false;
        }
        self.slots[idx] = id;
        true
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for TransmitBuffer {
    fn default() -> Self {
        TransmitBuffer::new(DEFAULT_REPLAY_WINDOW)
    }
}

/// One [`TransmitBuffer`] per packet type, as each connection keeps.
pub struct ReplaySet {
    buffers: Vec<TransmitBuffer>,
}

impl ReplaySet {
    pub fn new(window: usize) -> Self {
        // Packet type bytes run 1..=8; index directly by the type byte.
        ReplaySet {
            buffers: (0..=PacketType::ServerHello.as_u8())
                .map(|_| TransmitBuffer::new(window))
                .collect(),
        }
    }

    /// Record a received id for its packet type; `false` means duplicate.
    pub fn update(&mut self, packet_type: PacketType, id: TransmitId) -> bool {
        self.buffers[packet_type.as_u8() as usize].update(id)
    }
}

impl Default for ReplaySet {
    fn default() -> Self {
        ReplaySet::new(DEFAULT_REPLAY_WINDOW)
    }
}
