//! Image decoding and input validation.
//!
//! The pipeline itself works on decoded [`DynamicImage`]s. This module
//! is the entry point for callers that hold raw bytes (the bench CLI,
//! or an adapter that received a screenshot over the wire).

use image::DynamicImage;

use crate::types::{Dimensions, PipelineError, RgbaImage};

/// Decode raw image bytes.
///
/// Supports PNG, JPEG, BMP, and WebP (whatever the `image` crate was
/// built with).
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipelineError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    Ok(image::load_from_memory(bytes)?)
}

/// Convert a decoded image to RGBA8, rejecting zero-sized input.
///
/// Grayscale inputs are expanded to RGB; inputs without alpha get an
/// opaque alpha channel.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidImage`] if either dimension is zero.
pub fn to_rgba(image: &DynamicImage) -> Result<RgbaImage, PipelineError> {
    let dimensions = Dimensions {
        width: image.width(),
        height: image.height(),
    };
    if dimensions.is_empty() {
        return Err(PipelineError::InvalidImage(format!(
            "image has zero area ({}x{})",
            dimensions.width, dimensions.height,
        )));
    }
    Ok(image.to_rgba8())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn encode_png(img: &RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgba8,
        )
        .unwrap();
        buf
    }

    #[test]
    fn empty_input_returns_error() {
        assert!(matches!(decode(&[]), Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn corrupt_bytes_returns_image_decode_error() {
        let result = decode(&[0xFF, 0xFE, 0x00, 0x01]);
        assert!(matches!(result, Err(PipelineError::ImageDecode(_))));
    }

    #[test]
    fn valid_png_decodes_with_dimensions() {
        let img = RgbaImage::from_pixel(17, 31, image::Rgba([128, 64, 32, 255]));
        let decoded = decode(&encode_png(&img)).unwrap();
        assert_eq!(decoded.width(), 17);
        assert_eq!(decoded.height(), 31);
        assert_eq!(to_rgba(&decoded).unwrap(), img);
    }

    #[test]
    fn rgb_input_gains_opaque_alpha() {
        let rgb = image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        let rgba = to_rgba(&DynamicImage::ImageRgb8(rgb)).unwrap();
        assert_eq!(rgba.get_pixel(1, 1).0, [1, 2, 3, 255]);
    }

    #[test]
    fn zero_area_image_is_invalid() {
        let empty = DynamicImage::ImageRgba8(RgbaImage::new(0, 5));
        assert!(matches!(
            to_rgba(&empty),
            Err(PipelineError::InvalidImage(_))
        ));
    }
}
