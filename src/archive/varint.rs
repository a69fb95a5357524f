// Archive variable-length integers.
//
// Base-128, big-endian: most-significant group first. Every byte except
// the last has bit 7 set. Used for lengths, counts and clone indices.

use std::io::{self, Read, Write};

/// Maximum encoded length for a 64-bit value (ceil(64/7) = 10).
pub const MAX_VARINT_LEN: usize = 10;

/// If any of these bits are set before a shift, the next `<< 7` overflows.
const U64_OVERFLOW_MASK: u64 = 0xFE00_0000_0000_0000;

/// Encode `num` into the tail of `buf`. Returns the number of bytes used.
#[inline]
pub fn encode_u64(mut num: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = MAX_VARINT_LEN;
    loop {
        i -= 1;
        buf[i] = (num as u8 & 0x7F) | 0x80;
        num >>= 7;
        if num == 0 {
            break;
        }
    }
    buf[MAX_VARINT_LEN - 1] &= 0x7F;
    MAX_VARINT_LEN - i
}

pub fn write_u64<W: Write + ?Sized>(w: &mut W, num: u64) -> io::Result<()> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = encode_u64(num, &mut buf);
    w.write_all(&buf[MAX_VARINT_LEN - len..])
}

pub fn write_usize<W: Write + ?Sized>(w: &mut W, num: usize) -> io::Result<()> {
    write_u64(w, num as u64)
}

/// Read one varint. A value wider than 64 bits is `InvalidData`; a stream
/// ending mid-value is `UnexpectedEof`.
pub fn read_u64<R: Read + ?Sized>(r: &mut R) -> io::Result<u64> {
    let mut val: u64 = 0;
    let mut buf = [0u8; 1];
    loop {
        r.read_exact(&mut buf)?;
        let byte = buf[0];
        if val & U64_OVERFLOW_MASK != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"));
        }
        val = (val << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok(val);
        }
    }
}

/// Encoded byte-length of `num`.
#[inline]
pub fn sizeof_u64(num: u64) -> usize {
    let bits = 64 - num.leading_zeros();
    (bits.max(1).div_ceil(7) as usize).min(MAX_VARINT_LEN)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_sizes() {
        for val in [0, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            write_u64(&mut out, val).unwrap();
            assert_eq!(out.len(), sizeof_u64(val), "size mismatch for {val}");
            assert_eq!(read_u64(&mut &out[..]).unwrap(), val);
        }
    }

    #[test]
    fn encoding_is_big_endian() {
        // 300 = (10) (0101100) = 0x82 0x2C
        let mut out = Vec::new();
        write_u64(&mut out, 300).unwrap();
        assert_eq!(out, [0x82, 0x2C]);
    }

    #[test]
    fn truncated_input_is_eof() {
        let err = read_u64(&mut &[0x80u8, 0x80][..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn overlong_input_is_invalid() {
        let data = [0xFFu8; 11];
        let err = read_u64(&mut &data[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
