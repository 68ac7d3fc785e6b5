//! # Stream Data Reassembly Buffer (RFC 9000 Section 2.2)
//!
//! STREAM and CRYPTO frames may arrive out of order, duplicated, or with
//! overlapping ranges. The buffer keeps every not-yet-delivered byte range
//! keyed by offset and hands data to the reader strictly in order.
//!
//! ## Storage
//!
//! Chunks are `Bytes` slices of the received frames, so storing them is
//! reference counting, not copying. Stored chunks never overlap: on insert,
//! bytes already held or already read are trimmed off.
//!
//! ```text
//! read_offset = 10
//!
//! insert(20, "xyz")   -> chunks {20: "xyz"}
//! read()              -> None (gap at 10..20)
//! insert(10, "a..j")  -> chunks {10: "a..j", 20: "xyz"}
//! read()              -> "a..j"
//! read()              -> "xyz"
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{Error, Result, TransportError};
use crate::frames::FRAME_TYPE_STREAM_BASE;

#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    chunks: BTreeMap<u64, Bytes>,
    /// Next byte the reader expects
    read_offset: u64,
    /// One past the highest byte received
    highest: u64,
    final_size: Option<u64>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a range against the known final size without storing it.
    pub fn validate(&self, offset: u64, len: usize, fin: bool) -> Result<()> {
        let end = offset + len as u64;
        match (self.final_size, fin) {
            (Some(size), true) if size != end => Err(final_size_error(format!(
                "final size changed from {size} to {end}"
            ))),
            (Some(size), false) if end > size => Err(final_size_error(format!(
                "data to offset {end} beyond final size {size}"
            ))),
            (None, true) if end < self.highest => Err(final_size_error(format!(
                "final size {end} below received offset {}",
                self.highest
            ))),
            _ => Ok(()),
        }
    }

    /// Store `data` at `offset`.
    pub fn insert(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<()> {
        self.validate(offset, data.len(), fin)?;
        let end = offset + data.len() as u64;
        if fin {
            self.final_size = Some(end);
        }
        self.highest = self.highest.max(end);

        let mut pos = offset.max(self.read_offset);
        while pos < end {
            // skip bytes an existing chunk already covers
            if let Some((&start, chunk)) = self.chunks.range(..=pos).next_back() {
                let chunk_end = start + chunk.len() as u64;
                if chunk_end > pos {
                    pos = chunk_end;
                    continue;
                }
            }
            let next = self
                .chunks
                .range(pos + 1..)
                .next()
                .map_or(end, |(&start, _)| start)
                .min(end);
            let slice = data.slice((pos - offset) as usize..(next - offset) as usize);
            self.chunks.insert(pos, slice);
            pos = next;
        }
        Ok(())
    }

    /// Next in-order chunk, if the byte at the read offset has arrived.
    pub fn read(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.remove(&self.read_offset)?;
        self.read_offset += chunk.len() as u64;
        Some(chunk)
    }

    /// Whether `read` would return data.
    pub fn is_readable(&self) -> bool {
        self.chunks.contains_key(&self.read_offset)
    }

    /// One past the last byte deliverable without a gap.
    pub fn contiguous_end(&self) -> u64 {
        let mut end = self.read_offset;
        for (&start, chunk) in self.chunks.range(self.read_offset..) {
            if start != end {
                break;
            }
            end += chunk.len() as u64;
        }
        end
    }

    /// Final size is known and every byte up to it has arrived.
    pub fn is_complete(&self) -> bool {
        self.final_size == Some(self.contiguous_end())
    }

    pub fn is_fully_read(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Bytes held but not yet read.
    pub fn buffered(&self) -> usize {
        self.chunks.values().map(Bytes::len).sum()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

fn final_size_error(reason: String) -> Error {
    Error::frame(TransportError::FinalSizeError, FRAME_TYPE_STREAM_BASE, reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &'static [u8]) -> Bytes {
        Bytes::from_static(s)
    }

    #[test]
    fn test_in_order_chunks_are_read_separately() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"abc"), false).unwrap();
        buf.insert(3, bytes(b"def"), true).unwrap();
        assert!(buf.is_complete());
        assert_eq!(buf.read().unwrap(), bytes(b"abc"));
        assert_eq!(buf.read().unwrap(), bytes(b"def"));
        assert!(buf.read().is_none());
        assert!(buf.is_fully_read());
    }

    #[test]
    fn test_gap_holds_later_data() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(5, bytes(b"world"), false).unwrap();
        assert!(!buf.is_readable());
        assert!(buf.read().is_none());
        buf.insert(0, bytes(b"hello"), false).unwrap();
        assert_eq!(buf.contiguous_end(), 10);
        assert_eq!(buf.read().unwrap(), bytes(b"hello"));
        assert_eq!(buf.read().unwrap(), bytes(b"world"));
    }

    #[test]
    fn test_overlap_is_trimmed() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(2, bytes(b"cd"), false).unwrap();
        buf.insert(0, bytes(b"abcdef"), false).unwrap();
        assert_eq!(buf.buffered(), 6);
        let mut out = Vec::new();
        while let Some(chunk) = buf.read() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_duplicate_of_read_data_is_dropped() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"abc"), false).unwrap();
        buf.read().unwrap();
        buf.insert(0, bytes(b"abc"), false).unwrap();
        assert!(buf.read().is_none());
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_final_size_violations() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"abcdef"), false).unwrap();
        // fin below data already received
        assert!(buf.insert(0, bytes(b"abc"), true).is_err());
        buf.insert(6, bytes(b"g"), true).unwrap();
        // data past the final size
        let err = buf.insert(7, bytes(b"h"), false).unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportError::FinalSizeError.code())
        );
        // a different final size
        assert!(buf.insert(0, bytes(b"ab"), true).is_err());
        // same final size again is fine
        buf.insert(6, bytes(b"g"), true).unwrap();
    }

    #[test]
    fn test_empty_fin_completes_stream() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"xy"), false).unwrap();
        buf.insert(2, Bytes::new(), true).unwrap();
        assert!(buf.is_complete());
    }
}
