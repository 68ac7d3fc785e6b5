//! # Congestion Control Hook (RFC 9002 Section 7)
//!
//! Only the seam exists. [`Unlimited`] never restricts sending; it keeps
//! counters so the hook stays observable.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::PacketNumber;

pub trait CongestionController: Send + Sync {
    fn can_send(&self) -> bool;

    fn on_packet_sent(&self, packet_number: PacketNumber);

    fn on_packet_acked(&self, packet_number: PacketNumber);

    fn on_packet_lost(&self, packet_number: PacketNumber);

    /// Packets sent and not yet acknowledged or declared lost.
    fn in_flight(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct Unlimited {
    sent: AtomicU64,
    acked: AtomicU64,
    lost: AtomicU64,
}

impl CongestionController for Unlimited {
    fn can_send(&self) -> bool {
        true
    }

    fn on_packet_sent(&self, _packet_number: PacketNumber) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn on_packet_acked(&self, _packet_number: PacketNumber) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    fn on_packet_lost(&self, _packet_number: PacketNumber) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    fn in_flight(&self) -> u64 {
        let sent = self.sent.load(Ordering::Relaxed);
        let done = self.acked.load(Ordering::Relaxed) + self.lost.load(Ordering::Relaxed);
        sent.saturating_sub(done)
    }
}
