//! Per-space packet number accounting.

use std::time::Instant;

use std::{cmp, mem};

/// State of one packet number space
pub struct PacketNumberSpace {
    /// Next packet number this endpoint will send
    pub send_sequence: u64,
    /// Highest of our packets the peer has acknowledged
    pub highest_acknowledged: u64,
    /// An acknowledgement is owed to the peer
    pub ack_needed: bool,
    /// Received packet numbers, for duplicate suppression
    pub received: Dedup,
    /// Oldest in-flight packet awaiting retransmission, if any
    pub retransmit_oldest: Option<SentMarker>,
    /// Retransmission rounds already performed for the oldest packet
    pub nb_retransmit: u32,
}

/// Whatever the loss-recovery machinery needs to remember about a sent
/// packet; only the send time matters to the receive path
#[derive(Debug, Copy, Clone)]
pub struct SentMarker {
    pub send_time: Instant,
}

impl PacketNumberSpace {
    pub fn new() -> Self {
        Self {
            send_sequence: 0,
            highest_acknowledged: 0,
            ack_needed: false,
            received: Dedup::new(),
            retransmit_oldest: None,
            nb_retransmit: 0,
        }
    }

    /// Largest packet number received so far; the end of the first SACK range
    pub fn highest_received(&self) -> u64 {
        self.received.highest()
    }
}

impl Default for PacketNumberSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Inner bitfield type.
///
/// Because QUIC never reuses packet numbers, this only needs to be large
/// enough to deal with packets that are reordered but still delivered in a
/// timely manner.
type Window = u128;

/// Number of packets tracked by `Dedup`.
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

/// Sliding window over received packet numbers
pub struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet received
    next: u64,
}

impl Dedup {
    pub fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number recorded
    pub fn highest(&self) -> u64 {
        self.next.saturating_sub(1)
    }

    /// Whether `packet` was already recorded. Numbers that fell off the left
    /// edge of the window are presumed received.
    pub fn contains(&self, packet: u64) -> bool {
        if packet >= self.next {
            return false;
        }
        let diff = self.highest() - packet;
        if diff == 0 {
            return true;
        }
        if diff >= WINDOW_SIZE {
            return true;
        }
        self.window & (1 << (diff - 1)) != 0
    }

    /// Record a received packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    pub fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of window
            self.window = (self.window << 1 | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}

impl Default for Dedup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanity() {
        let mut dedup = Dedup::new();
        assert!(!dedup.contains(0));
        assert!(!dedup.insert(0));
        assert_eq!(dedup.highest(), 0);
        assert!(dedup.contains(0));
        assert!(dedup.insert(0));
        assert!(!dedup.contains(1));
        assert!(!dedup.insert(1));
        assert_eq!(dedup.highest(), 1);
        assert!(!dedup.insert(2));
        assert_eq!(dedup.highest(), 2);
    }

    #[test]
    fn happypath() {
        let mut dedup = Dedup::new();
        for i in 0..(2 * WINDOW_SIZE) {
            assert!(!dedup.insert(i));
            for j in 0..=i {
                assert!(dedup.contains(j));
                assert!(dedup.insert(j));
            }
        }
    }

    #[test]
    fn jump() {
        let mut dedup = Dedup::new();
        dedup.insert(2 * WINDOW_SIZE);
        assert!(dedup.contains(2 * WINDOW_SIZE));
        assert!(dedup.insert(2 * WINDOW_SIZE));
        // older numbers outside the window are presumed received
        assert!(dedup.contains(0));
        assert!(dedup.insert(0));
        // within the window, nothing else was seen
        assert!(!dedup.contains(2 * WINDOW_SIZE - 1));
        assert!(!dedup.insert(2 * WINDOW_SIZE - 1));
        assert!(dedup.contains(2 * WINDOW_SIZE - 1));
    }

    #[test]
    fn reordered_within_window() {
        let mut dedup = Dedup::new();
        dedup.insert(10);
        assert!(!dedup.contains(5));
        assert!(!dedup.insert(5));
        assert!(dedup.contains(5));
        assert!(!dedup.contains(6));
    }
}
