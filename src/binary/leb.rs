//! LEB128 decoding.
//!
//! Over-long encodings (more bytes than the declared width needs, or
//! non-canonical unused bits in the final byte) are rejected, as required
//! for a conforming decoder.

use super::{Cursor, DecodeError};

pub fn read_u32(cur: &mut Cursor) -> Result<u32, DecodeError> {
    read_unsigned(cur, 32).map(|v| v as u32)
}

pub fn read_u64(cur: &mut Cursor) -> Result<u64, DecodeError> {
    read_unsigned(cur, 64)
}

pub fn read_i32(cur: &mut Cursor) -> Result<i32, DecodeError> {
    read_signed(cur, 32).map(|v| v as i32)
}

pub fn read_i64(cur: &mut Cursor) -> Result<i64, DecodeError> {
    read_signed(cur, 64)
}

/// Block types use a 33-bit signed encoding so that negative one-byte
/// values encode shorthand types while non-negative values are type
/// indices.
pub fn read_i33(cur: &mut Cursor) -> Result<i64, DecodeError> {
    read_signed(cur, 33)
}

fn read_unsigned(cur: &mut Cursor, bits: u32) -> Result<u64, DecodeError> {
    let start = cur.offset();
    let max_bytes = bits.div_ceil(7);
    let mut result: u64 = 0;
    for i in 0..max_bytes {
        let byte = cur.read_u8()?;
        result |= ((byte & 0x7f) as u64) << (i * 7);
        if byte & 0x80 == 0 {
            // Bits in the final byte beyond the declared width must be zero.
            let used = bits.saturating_sub(i * 7);
            if used < 7 && (byte & 0x7f) >> used != 0 {
                return Err(DecodeError::LebOverflow { bits: bits as u8, offset: start });
            }
            return Ok(result);
        }
    }
    Err(DecodeError::LebOverlong { offset: start })
}

fn read_signed(cur: &mut Cursor, bits: u32) -> Result<i64, DecodeError> {
    let start = cur.offset();
    let max_bytes = bits.div_ceil(7);
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    for i in 0..max_bytes {
        let byte = cur.read_u8()?;
        result |= ((byte & 0x7f) as i64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            // The final byte's padding bits must all match the sign bit.
            let used = bits.saturating_sub(i * 7);
            if used < 7 {
                let pad = (byte as i8) << 1 >> (used + 1);
                if pad != 0 && pad != -1 {
                    return Err(DecodeError::LebOverflow { bits: bits as u8, offset: start });
                }
            }
            return Ok(result);
        }
    }
    Err(DecodeError::LebOverlong { offset: start })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cur(bytes: &[u8]) -> Cursor<'_> {
        Cursor::new(bytes)
    }

    #[test]
    fn unsigned_values() {
        assert_eq!(read_u32(&mut cur(&[0x00])).unwrap(), 0);
        assert_eq!(read_u32(&mut cur(&[0xe5, 0x8e, 0x26])).unwrap(), 624_485);
        assert_eq!(
            read_u32(&mut cur(&[0xff, 0xff, 0xff, 0xff, 0x0f])).unwrap(),
            u32::MAX
        );
        assert_eq!(
            read_u64(&mut cur(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01])).unwrap(),
            u64::MAX
        );
    }

    #[test]
    fn signed_values() {
        assert_eq!(read_i32(&mut cur(&[0x7f])).unwrap(), -1);
        assert_eq!(read_i32(&mut cur(&[0x9b, 0xf1, 0x59])).unwrap(), -624_485);
        assert_eq!(read_i32(&mut cur(&[0x80, 0x80, 0x80, 0x80, 0x78])).unwrap(), i32::MIN);
        assert_eq!(read_i64(&mut cur(&[0x3f])).unwrap(), 63);
    }

    #[test]
    fn overlong_encodings_rejected() {
        // Six continuation bytes for a 32-bit value.
        assert!(matches!(
            read_u32(&mut cur(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00])),
            Err(DecodeError::LebOverlong { .. })
        ));
        // Five bytes but the final byte carries bits beyond bit 31.
        assert!(matches!(
            read_u32(&mut cur(&[0xff, 0xff, 0xff, 0xff, 0x1f])),
            Err(DecodeError::LebOverflow { .. })
        ));
        // Signed: padding bits disagree with the sign.
        assert!(matches!(
            read_i32(&mut cur(&[0xff, 0xff, 0xff, 0xff, 0x4f])),
            Err(DecodeError::LebOverflow { .. })
        ));
    }

    #[test]
    fn truncated_encoding_is_eof() {
        assert!(matches!(
            read_u32(&mut cur(&[0x80])),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }
}
