//! Variable-length encoding of value lengths.
//!
//! Lengths are written least-significant group first. Each byte uses:
//! - 7 bits for the value
//! - 1 "continuation" bit to indicate if more bytes follow
//!
//! Only `u32` is supported, so an encoding never spans more than [MAX_SIZE] bytes. Any
//! encoding that would need a sixth byte, or that sets bits beyond the 32nd, is rejected rather
//! than truncated.

use bytes::{Buf, BufMut};
use thiserror::Error;

const BITS_PER_BYTE: usize = 8;
const DATA_BITS_PER_BYTE: usize = 7;
const DATA_BITS_MASK: u8 = 0x7F;
const CONTINUATION_BIT_MASK: u8 = 0x80;

/// The maximum number of bytes a `u32` occupies once encoded.
pub const MAX_SIZE: usize = 5;

/// Errors that can occur when decoding a varint.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("invalid varint")]
    InvalidVarint,
}

/// Returns true if `byte` signals that another byte follows.
#[inline]
pub fn continues(byte: u8) -> bool {
    byte & CONTINUATION_BIT_MASK != 0
}

/// Encodes a `u32` as a varint.
pub fn write(value: u32, buf: &mut impl BufMut) {
    if value < CONTINUATION_BIT_MASK as u32 {
        // Fast path for small values (common case for lengths)
        buf.put_u8(value as u8);
        return;
    }

    let mut val = value;
    while val >= CONTINUATION_BIT_MASK as u32 {
        buf.put_u8((val as u8) | CONTINUATION_BIT_MASK);
        val >>= DATA_BITS_PER_BYTE;
    }
    buf.put_u8(val as u8);
}

/// Decodes a `u32` from a varint.
pub fn read(buf: &mut impl Buf) -> Result<u32, Error> {
    let max_bits = u32::BITS as usize;
    let mut result = 0u32;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(Error::EndOfBuffer);
        }
        let byte = buf.get_u8();

        // If this must be the last byte, reject set bits beyond the size of `u32`. Because the
        // continuation bit is the most-significant bit, this also rejects a sixth group.
        let remaining_bits = max_bits - shift;
        if remaining_bits <= DATA_BITS_PER_BYTE {
            let relevant_bits = BITS_PER_BYTE - byte.leading_zeros() as usize;
            if relevant_bits > remaining_bits {
                return Err(Error::InvalidVarint);
            }
        }

        result |= ((byte & DATA_BITS_MASK) as u32) << shift;
        if !continues(byte) {
            return Ok(result);
        }
        shift += DATA_BITS_PER_BYTE;
    }
}

/// Calculates the number of bytes needed to encode `value`.
pub fn size(value: u32) -> usize {
    let data_bits = (u32::BITS - value.leading_zeros()) as usize;
    usize::max(1, data_bits.div_ceil(DATA_BITS_PER_BYTE))
}
