//! Tileset mapping (de)serialization.
//!
//! A tileset mapping describes which surfaces compose each entry of a
//! virtual surface's stack. The binary layout is:
//!
//! - magic `b"TM"`
//! - `u8` version (currently 1)
//! - varint entry count
//! - per entry: varint source count, then that many varint source indices
//!
//! Source indices are one-based references into the virtual surface's id
//! list. Zero is reserved and rejected.

use crate::error::{DecodeError, DecodeResult};
use crate::varint::{read_varint, write_varint};

const MAGIC: &[u8; 2] = b"TM";
const VERSION: u8 = 1;

/// Deserialize the raw adjacency table of a tileset mapping.
///
/// # Errors
///
/// Returns an error on a bad header, truncated data, empty entries, zero
/// indices, or indices that do not fit into `u16`.
pub fn deserialize_tileset_mapping(data: &[u8]) -> DecodeResult<Vec<Vec<u16>>> {
    if data.len() < 3 {
        return Err(DecodeError::BufferTooSmall {
            expected: 3,
            actual: data.len(),
        });
    }
    if &data[..2] != MAGIC {
        return Err(DecodeError::InvalidFormat {
            context: "tileset mapping",
            detail: "missing TM magic".to_string(),
        });
    }
    if data[2] != VERSION {
        return Err(DecodeError::InvalidFormat {
            context: "tileset mapping",
            detail: format!("unsupported version {}", data[2]),
        });
    }

    let mut offset = 3;
    let count = read_varint(data, &mut offset)? as usize;
    // Each entry needs at least two bytes, so a huge count is garbage.
    if count > data.len() {
        return Err(DecodeError::InvalidFormat {
            context: "tileset mapping",
            detail: format!("entry count {count} exceeds data length"),
        });
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_varint(data, &mut offset)? as usize;
        if len == 0 {
            return Err(DecodeError::InvalidFormat {
                context: "tileset mapping",
                detail: "empty entry".to_string(),
            });
        }
        if len > data.len() - offset.min(data.len()) {
            return Err(DecodeError::UnexpectedEof {
                context: "tileset mapping",
            });
        }

        let mut entry = Vec::with_capacity(len);
        for _ in 0..len {
            let index = read_varint(data, &mut offset)?;
            let index = u16::try_from(index)
                .ok()
                .filter(|&i| i != 0)
                .ok_or_else(|| DecodeError::InvalidFormat {
                    context: "tileset mapping",
                    detail: format!("invalid source index {index}"),
                })?;
            entry.push(index);
        }
        entries.push(entry);
    }

    if offset != data.len() {
        return Err(DecodeError::InvalidFormat {
            context: "tileset mapping",
            detail: format!("{} trailing bytes", data.len() - offset),
        });
    }

    Ok(entries)
}

/// Serialize a raw adjacency table in the layout read by
/// [`deserialize_tileset_mapping`].
#[must_use]
pub fn serialize_tileset_mapping(entries: &[Vec<u16>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + entries.len() * 3);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    #[allow(clippy::cast_possible_truncation)]
    write_varint(&mut out, entries.len() as u32);
    for entry in entries {
        #[allow(clippy::cast_possible_truncation)]
        write_varint(&mut out, entry.len() as u32);
        for &index in entry {
            write_varint(&mut out, u32::from(index));
        }
    }
    out
}
