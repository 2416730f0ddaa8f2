//! Bound-layer meta tiles.
//!
//! A meta tile is a 256x256 single-channel image. Each pixel holds the flags
//! of one tile in the covered block: pixel `(x & 255, y & 255)` describes the
//! tile at `(x, y)` of the meta tile's level of detail.

use crate::error::{DecodeError, DecodeResult};
use crate::texture::decode_image;

/// Edge length of the tile block covered by one meta tile.
pub const META_TILE_SIZE: usize = 256;

/// Per-tile flag bits stored in a meta tile.
pub struct MetaFlags;

impl MetaFlags {
    /// The bound layer has imagery for the tile.
    pub const AVAILABLE: u8 = 0x80;
    /// The imagery covers the whole tile.
    pub const WATERTIGHT: u8 = 0x40;
}

/// Decode a meta tile image into its `256 * 256` flag bytes, row-major.
///
/// Multi-channel images contribute their first channel.
///
/// # Errors
///
/// Returns an error if the image cannot be decoded or is not 256x256.
pub fn decode_bound_meta_tile(data: &[u8]) -> DecodeResult<Vec<u8>> {
    let image = decode_image(data)?;

    if image.width as usize != META_TILE_SIZE || image.height as usize != META_TILE_SIZE {
        return Err(DecodeError::InvalidFormat {
            context: "bound meta tile",
            detail: format!(
                "expected {META_TILE_SIZE}x{META_TILE_SIZE} pixels, got {}x{}",
                image.width, image.height
            ),
        });
    }

    let components = usize::from(image.components);
    if components == 1 {
        return Ok(image.data);
    }

    Ok(image.data.chunks_exact(components).map(|px| px[0]).collect())
}
