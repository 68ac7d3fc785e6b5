//! # Variable-Length Integer Encoding (RFC 9000 Section 16)
//!
//! The two most significant bits of the first byte select the length class:
//!
//! | Prefix | Length | Usable bits | Range                 |
//! |--------|--------|-------------|-----------------------|
//! | 00     | 1      | 6           | 0-63                  |
//! | 01     | 2      | 14          | 0-16383               |
//! | 10     | 4      | 30          | 0-1073741823          |
//! | 11     | 8      | 62          | 0-4611686018427387903 |
//!
//! Encoders always choose the shortest class. Decoders reject input whose
//! declared class disagrees with the bytes supplied; such input surfaces as a
//! FRAME_ENCODING_ERROR.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result, TransportError};

/// Maximum value for a VarInt (2^62 - 1)
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// Encoded size for `value`, or `None` when it exceeds [`VARINT_MAX`].
pub fn size(value: u64) -> Option<usize> {
    match value {
        0..=0x3f => Some(1),
        0x40..=0x3fff => Some(2),
        0x4000..=0x3fff_ffff => Some(4),
        0x4000_0000..=VARINT_MAX => Some(8),
        _ => None,
    }
}

/// Length declared by the two-bit prefix of `first`.
pub fn declared_len(first: u8) -> usize {
    1 << (first >> 6)
}

/// Append `value` in its minimal encoding, returning the bytes written.
pub fn encode<B: BufMut>(value: u64, buf: &mut B) -> Result<usize> {
    let len = size(value).ok_or(Error::IllegalState("varint exceeds 2^62-1"))?;
    if buf.remaining_mut() < len {
        return Err(Error::IllegalState("varint output buffer too small"));
    }
    match len {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
    Ok(len)
}

/// Encode into a fresh vector.
pub fn to_vec(value: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(8);
    encode(value, &mut out)?;
    Ok(out)
}

/// Read one varint from the front of `buf`, advancing past it.
pub fn decode<B: Buf>(buf: &mut B) -> Result<u64> {
    if !buf.has_remaining() {
        return Err(truncated());
    }
    let len = declared_len(buf.chunk()[0]);
    if buf.remaining() < len {
        return Err(truncated());
    }
    let value = match len {
        1 => (buf.get_u8() & 0x3f) as u64,
        2 => (buf.get_u16() & 0x3fff) as u64,
        4 => (buf.get_u32() & 0x3fff_ffff) as u64,
        _ => buf.get_u64() & VARINT_MAX,
    };
    Ok(value)
}

/// Decode a buffer that must hold exactly one varint.
///
/// Fails when the declared length class does not match `bytes.len()`.
pub fn decode_exact(bytes: &[u8]) -> Result<u64> {
    let first = *bytes.first().ok_or_else(truncated)?;
    if declared_len(first) != bytes.len() {
        return Err(Error::transport(
            TransportError::FrameEncodingError,
            format!(
                "varint declares {} bytes, {} supplied",
                declared_len(first),
                bytes.len()
            ),
        ));
    }
    let mut cursor = bytes;
    decode(&mut cursor)
}

fn truncated() -> Error {
    Error::transport(TransportError::FrameEncodingError, "truncated varint")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    mod varint_tests {
        use super::*;

        #[test]
        fn test_varint_rfc_examples() {
            // RFC 9000 Appendix A.1 sample encodings
            let cases: [(&[u8], u64); 4] = [
                (&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c], 151_288_809_941_952_652),
                (&[0x9d, 0x7f, 0x3e, 0x7d], 494_878_333),
                (&[0x7b, 0xbd], 15_293),
                (&[0x25], 37),
            ];
            for (bytes, value) in cases {
                assert_eq!(decode_exact(bytes).unwrap(), value);
                assert_eq!(to_vec(value).unwrap(), bytes);
            }
        }

        #[test]
        fn test_varint_non_minimal_decodes() {
            // RFC 9000 Appendix A.1: 0x4025 also decodes to 37
            assert_eq!(decode_exact(&[0x40, 0x25]).unwrap(), 37);
        }

        #[test]
        fn test_varint_boundaries_pick_minimal_class() {
            assert_eq!(size(63), Some(1));
            assert_eq!(size(64), Some(2));
            assert_eq!(size(16_383), Some(2));
            assert_eq!(size(16_384), Some(4));
            assert_eq!(size(1_073_741_823), Some(4));
            assert_eq!(size(1_073_741_824), Some(8));
            assert_eq!(size(VARINT_MAX), Some(8));
            assert_eq!(size(VARINT_MAX + 1), None);
        }

        #[test]
        fn test_varint_encode_out_of_range() {
            assert!(matches!(
                to_vec(VARINT_MAX + 1),
                Err(Error::IllegalState(_))
            ));
        }

        #[test]
        fn test_varint_length_mismatch_rejected() {
            // 2-byte prefix with 3 bytes supplied
            let err = decode_exact(&[0x40, 0x25, 0x00]).unwrap_err();
            assert_eq!(
                err.transport_code(),
                Some(TransportError::FrameEncodingError.code())
            );
            // 4-byte prefix with 2 bytes supplied
            assert!(decode_exact(&[0x80, 0x01]).is_err());
            assert!(decode_exact(&[]).is_err());
        }

        #[test]
        fn test_varint_truncated_stream() {
            let mut buf: &[u8] = &[0xc0, 0x00, 0x00];
            assert!(decode(&mut buf).is_err());
        }

        #[test]
        fn test_varint_decode_advances_cursor() {
            let mut buf: &[u8] = &[0x25, 0x7b, 0xbd, 0x01];
            assert_eq!(decode(&mut buf).unwrap(), 37);
            assert_eq!(decode(&mut buf).unwrap(), 15_293);
            assert_eq!(buf, &[0x01]);
        }
    }

    proptest! {
        #[test]
        fn prop_varint_round_trip_is_minimal(value in 0u64..=VARINT_MAX) {
            let bytes = to_vec(value).unwrap();
            prop_assert_eq!(Some(bytes.len()), size(value));
            prop_assert_eq!(decode_exact(&bytes).unwrap(), value);
        }

        #[test]
        fn prop_varint_rejects_trailing_byte(value in 0u64..=VARINT_MAX, extra in any::<u8>()) {
            let mut bytes = to_vec(value).unwrap();
            bytes.push(extra);
            prop_assert!(decode_exact(&bytes).is_err());
        }
    }
}
