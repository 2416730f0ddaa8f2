//! Variable-length integer coding.

use crate::error::{DecodeError, DecodeResult};

/// Read a variable-length integer from a byte slice.
///
/// Each byte contributes 7 bits to the value, least significant group
/// first, with the MSB indicating whether more bytes follow.
///
/// # Errors
///
/// Returns an error if the buffer ends before the varint is complete, or if
/// the encoded value does not fit into 32 bits.
pub fn read_varint(data: &[u8], offset: &mut usize) -> DecodeResult<u32> {
    let mut result: u32 = 0;
    let mut shift: u32 = 0;

    loop {
        let Some(&byte) = data.get(*offset) else {
            return Err(DecodeError::UnexpectedEof { context: "varint" });
        };
        *offset += 1;

        let bits = u32::from(byte & 0x7F);
        if shift >= 32 || (shift > 0 && bits >> (32 - shift) != 0) {
            return Err(DecodeError::InvalidFormat {
                context: "varint",
                detail: "value does not fit into 32 bits".to_string(),
            });
        }
        result |= bits << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            break;
        }
    }

    Ok(result)
}

/// Append `value` to `out` as a variable-length integer.
pub fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let low = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(low);
            return;
        }
        out.push(low | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_varint() {
        let data = [0x00];
        let mut offset = 0;
        assert_eq!(read_varint(&data, &mut offset).unwrap(), 0);
        assert_eq!(offset, 1);

        let data = [0x7F];
        let mut offset = 0;
        assert_eq!(read_varint(&data, &mut offset).unwrap(), 127);
        assert_eq!(offset, 1);
    }

    #[test]
    fn test_two_byte_varint() {
        // 300 = 0x12C, encoded as [0xAC, 0x02]
        let data = [0xAC, 0x02];
        let mut offset = 0;
        assert_eq!(read_varint(&data, &mut offset).unwrap(), 300);
        assert_eq!(offset, 2);
    }

    #[test]
    fn test_unexpected_eof() {
        let data = [0x80];
        let mut offset = 0;
        assert!(matches!(
            read_varint(&data, &mut offset),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_overlong_varint_is_rejected() {
        let data = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        let mut offset = 0;
        assert!(matches!(
            read_varint(&data, &mut offset),
            Err(DecodeError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_write_matches_known_encoding() {
        let mut out = Vec::new();
        write_varint(&mut out, 300);
        write_varint(&mut out, 1);
        assert_eq!(out, vec![0xAC, 0x02, 0x01]);
    }

    proptest::proptest! {
        #[test]
        fn test_write_then_read(value in proptest::num::u32::ANY) {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            let mut offset = 0;
            proptest::prop_assert_eq!(read_varint(&out, &mut offset).unwrap(), value);
            proptest::prop_assert_eq!(offset, out.len());
        }
    }
}
