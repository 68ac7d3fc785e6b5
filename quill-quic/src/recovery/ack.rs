//! Building ACK ranges from received packet numbers (RFC 9000 Section 19.3).

use crate::frames::{AckFrame, AckRange};
use crate::types::PacketNumber;

/// Minimal set of inclusive ranges covering `numbers`.
///
/// Input order and duplicates do not matter. Ranges come back ascending,
/// disjoint and non-adjacent.
pub fn coalesce<I>(numbers: I) -> Vec<AckRange>
where
    I: IntoIterator<Item = PacketNumber>,
{
    let mut sorted: Vec<PacketNumber> = numbers.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<AckRange> = Vec::new();
    for pn in sorted {
        match ranges.last_mut() {
            Some(range) if range.largest + 1 == pn => range.largest = pn,
            _ => ranges.push(AckRange::single(pn)),
        }
    }
    ranges
}

/// ACK frame for `numbers`, ranges ordered largest first as sent on the wire.
pub fn ack_frame<I>(numbers: I, ack_delay: u64) -> Option<AckFrame>
where
    I: IntoIterator<Item = PacketNumber>,
{
    let mut ranges = coalesce(numbers);
    if ranges.is_empty() {
        return None;
    }
    ranges.reverse();
    Some(AckFrame { ack_delay, ranges })
}
