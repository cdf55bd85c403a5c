//! QUIC variable-length integer encoding
//!
//! Two high bits of the first byte select a 1, 2, 4 or 8 byte encoding.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Largest value representable as a varint (2^62 - 1)
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Varint errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarIntError {
    #[error("Value {0} exceeds the varint range")]
    OutOfRange(u64),

    #[error("Truncated varint: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

/// Number of bytes needed to encode `value`
pub fn encoded_len(value: u64) -> Result<usize, VarIntError> {
    match value {
        0..=0x3F => Ok(1),
        0x40..=0x3FFF => Ok(2),
        0x4000..=0x3FFF_FFFF => Ok(4),
        0x4000_0000..=MAX_VARINT => Ok(8),
        _ => Err(VarIntError::OutOfRange(value)),
    }
}

/// Append `value` to `buf`
pub fn encode<B: BufMut>(buf: &mut B, value: u64) -> Result<(), VarIntError> {
    match encoded_len(value)? {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xC000_0000_0000_0000 | value),
    }
    Ok(())
}

/// Read one varint from the front of `buf`
pub fn decode<B: Buf>(buf: &mut B) -> Result<u64, VarIntError> {
    if !buf.has_remaining() {
        return Err(VarIntError::Truncated {
            needed: 1,
            available: 0,
        });
    }

    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(VarIntError::Truncated {
            needed: len,
            available: buf.remaining(),
        });
    }

    let value = match len {
        1 => u64::from(buf.get_u8() & 0x3F),
        2 => u64::from(buf.get_u16() & 0x3FFF),
        4 => u64::from(buf.get_u32() & 0x3FFF_FFFF),
        _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_rfc9000_vectors() {
        // Examples from RFC 9000 appendix A.1
        let cases: [(&[u8], u64); 4] = [
            (&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c], 151_288_809_941_952_652),
            (&[0x9d, 0x7f, 0x3e, 0x7d], 494_878_333),
            (&[0x7b, 0xbd], 15_293),
            (&[0x25], 37),
        ];

        for (wire, value) in cases {
            let mut slice = wire;
            assert_eq!(decode(&mut slice).unwrap(), value);

            let mut buf = BytesMut::new();
            encode(&mut buf, value).unwrap();
            assert_eq!(&buf[..], wire);
        }
    }

    #[test]
    fn test_out_of_range() {
        let mut buf = BytesMut::new();
        assert_eq!(
            encode(&mut buf, MAX_VARINT + 1),
            Err(VarIntError::OutOfRange(MAX_VARINT + 1))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated() {
        let mut slice: &[u8] = &[0x9d, 0x7f];
        assert_eq!(
            decode(&mut slice),
            Err(VarIntError::Truncated {
                needed: 4,
                available: 2
            })
        );

        let mut empty: &[u8] = &[];
        assert!(decode(&mut empty).is_err());
    }
}
