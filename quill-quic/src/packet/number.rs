//! Packet number allocation.
//!
//! Initial, Handshake and 1-RTT packets share one sequence per connection.
//! Numbers strictly increase; each is handed out once even when the send
//! and receive paths allocate concurrently.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::PacketNumber;

#[derive(Debug, Default)]
pub struct PacketNumberAllocator {
    next: AtomicU64,
}

impl PacketNumberAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next packet number.
    pub fn next(&self) -> PacketNumber {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Largest number handed out so far.
    pub fn largest_sent(&self) -> Option<PacketNumber> {
        self.next.load(Ordering::Acquire).checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_numbers_strictly_increase() {
        let alloc = PacketNumberAllocator::new();
        assert_eq!(alloc.largest_sent(), None);
        assert_eq!(alloc.next(), 0);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.largest_sent(), Some(1));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let alloc = Arc::new(PacketNumberAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || (0..250).map(|_| alloc.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for pn in handle.join().unwrap() {
                assert!(seen.insert(pn));
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
