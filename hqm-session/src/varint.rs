//! Variable-length integer encoding per the QUIC wire format.
//!
//! The top two bits of the first byte select a 1, 2, 4 or 8 byte encoding;
//! the remaining bits carry the value. Frame types, frame lengths, push ids
//! and stream preambles all use this encoding.

use bytes::BufMut;

/// Largest encodable value (2^62 - 1).
pub const MAX: u64 = (1 << 62) - 1;

/// Encoded length of `value` without encoding it.
pub fn encoded_len(value: u64) -> usize {
    if value < 64 {
        1
    } else if value < 16384 {
        2
    } else if value < 1073741824 {
        4
    } else {
        8
    }
}

/// Encoded length implied by the first byte of an encoding.
pub fn peek_len(first: u8) -> usize {
    match first >> 6 {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 8,
    }
}

/// Append the encoding of `value` to `buf`, returning the bytes written.
pub fn put(value: u64, buf: &mut impl BufMut) -> usize {
    debug_assert!(value <= MAX);
    match encoded_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16((value as u16) | 0x4000),
        4 => buf.put_u32((value as u32) | 0x8000_0000),
        _ => buf.put_u64(value | 0xC000_0000_0000_0000),
    }
    encoded_len(value)
}

/// Decode a varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` when `buf`
/// does not hold a complete encoding.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = peek_len(first);
    if buf.len() < len {
        return None;
    }
    let value = match len {
        1 => u64::from(first),
        2 => u64::from(u16::from_be_bytes([buf[0], buf[1]]) & 0x3FFF),
        4 => u64::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & 0x3FFF_FFFF),
        _ => {
            u64::from_be_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]) & 0x3FFF_FFFF_FFFF_FFFF
        }
    };
    Some((value, len))
}
