//! Image decoding for textures and meta tiles.
//!
//! Bound layers serve JPEG or PNG imagery. Both are decoded into tightly
//! packed 8-bit pixel rows, keeping the native channel count so that
//! single-channel masks and meta tiles do not get inflated to RGBA.

use std::io::Cursor;

use image::{DynamicImage, ImageReader};

use crate::error::{DecodeError, DecodeResult};

/// Image container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// JPEG-compressed data.
    Jpeg,
    /// PNG data.
    Png,
}

/// Decoded image data.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Pixel rows, `components` bytes per pixel, top row first.
    pub data: Vec<u8>,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Channels per pixel (1 gray, 2 gray+alpha, 3 RGB, 4 RGBA).
    pub components: u8,
}

impl DecodedImage {
    /// Create a new decoded image.
    #[must_use]
    pub fn new(data: Vec<u8>, width: u32, height: u32, components: u8) -> Self {
        Self {
            data,
            width,
            height,
            components,
        }
    }

    /// Check if the pixel buffer matches the declared dimensions.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.data.len()
            == (self.width as usize) * (self.height as usize) * usize::from(self.components)
    }
}

/// Detect the image format from its signature.
///
/// # Errors
///
/// Returns an error if the data is too short or the signature is unknown.
pub fn detect_format(data: &[u8]) -> DecodeResult<ImageFormat> {
    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    if data.len() < 2 {
        return Err(DecodeError::BufferTooSmall {
            expected: 2,
            actual: data.len(),
        });
    }

    if data[0] == 0xFF && data[1] == 0xD8 {
        return Ok(ImageFormat::Jpeg);
    }

    if data.starts_with(&PNG_MAGIC) {
        return Ok(ImageFormat::Png);
    }

    Err(DecodeError::InvalidFormat {
        context: "image",
        detail: "unknown image format signature".to_string(),
    })
}

/// Decode a JPEG or PNG image.
///
/// # Errors
///
/// Returns an error if the format is unknown or the codec fails.
pub fn decode_image(data: &[u8]) -> DecodeResult<DecodedImage> {
    let format = match detect_format(data)? {
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Png => image::ImageFormat::Png,
    };

    let mut reader = ImageReader::new(Cursor::new(data));
    reader.set_format(format);
    let decoded = reader.decode()?;

    let width = decoded.width();
    let height = decoded.height();
    let (data, components) = match decoded {
        DynamicImage::ImageLuma8(img) => (img.into_raw(), 1),
        DynamicImage::ImageLumaA8(img) => (img.into_raw(), 2),
        DynamicImage::ImageRgb8(img) => (img.into_raw(), 3),
        DynamicImage::ImageRgba8(img) => (img.into_raw(), 4),
        // Wider sample types are narrowed to 8 bits per channel.
        other if other.color().has_alpha() => (other.into_rgba8().into_raw(), 4),
        other => (other.into_rgb8().into_raw(), 3),
    };

    Ok(DecodedImage::new(data, width, height, components))
}
