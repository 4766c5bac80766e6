//! Image decoding and color-space conversion.
//!
//! Accepts raw image bytes (PNG, JPEG, BMP, WebP) and produces the RGB
//! source image, plus the grayscale and HSV views the measurement
//! stages work on.
//!
//! This is the first step in the pipeline: raw bytes in, `RgbImage` out.

use image::{GrayImage, Rgb, RgbImage};

use crate::types::PipelineError;

/// Decode raw image bytes into an RGB image.
///
/// Supports PNG, JPEG, BMP, and WebP formats (whatever the `image` crate
/// can decode). Alpha is discarded.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipelineError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt.
#[must_use = "returns the decoded image"]
pub fn decode(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgb8())
}

/// Convert to grayscale with the standard luminance weights
/// (`0.299*R + 0.587*G + 0.114*B`).
#[must_use = "returns the grayscale image"]
pub fn to_gray(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

/// An image in 8-bit HSV.
///
/// Follows the common 8-bit convention: hue is halved to fit a byte
/// (`0..=179`, so 2 degrees per step), saturation and value span
/// `0..=255`. Threshold bounds in [`crate::range`] use the same scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsvImage(RgbImage);

impl HsvImage {
    /// Largest hue value.
    pub const MAX_HUE: u8 = 179;

    /// Convert every pixel of an RGB image.
    #[must_use]
    pub fn from_rgb(image: &RgbImage) -> Self {
        Self(RgbImage::from_fn(image.width(), image.height(), |x, y| {
            Rgb(rgb_to_hsv(image.get_pixel(x, y).0))
        }))
    }

    /// `[h, s, v]` at `(x, y)`.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> [u8; 3] {
        self.0.get_pixel(x, y).0
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.0.height()
    }
}

/// Convert one RGB pixel to 8-bit `[h, s, v]`.
///
/// Gray pixels (no chroma) get hue 0. Saturation is zero for black.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::many_single_char_names
)]
pub fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = f32::from(max - min);
    let v = max;

    let s = if max == 0 {
        0
    } else {
        (255.0 * delta / f32::from(max)).round() as u8
    };

    if delta == 0.0 {
        return [0, s, v];
    }

    let (rf, gf, bf) = (f32::from(r), f32::from(g), f32::from(b));
    let degrees = if max == r {
        60.0 * (gf - bf) / delta
    } else if max == g {
        60.0f32.mul_add((bf - rf) / delta, 120.0)
    } else {
        60.0f32.mul_add((rf - gf) / delta, 240.0)
    };
    let degrees = if degrees < 0.0 { degrees + 360.0 } else { degrees };

    let h = (degrees / 2.0).round() as u16;
    // 359.x degrees rounds up to 180, which wraps to red.
    let h = if h > u16::from(HsvImage::MAX_HUE) { 0 } else { h };
    [h as u8, s, v]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Helper: encode an RGBA image as a PNG byte buffer.
    fn encode_png(img: &image::RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgba8,
        )
        .ok();
        buf
    }

    #[test]
    fn empty_input_returns_error() {
        let result = decode(&[]);
        assert!(matches!(result, Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn corrupt_bytes_returns_image_decode_error() {
        let result = decode(&[0xFF, 0xFE, 0x00, 0x01]);
        assert!(matches!(result, Err(PipelineError::ImageDecode(_))));
    }

    #[test]
    fn valid_png_decodes_to_rgb() {
        let img = image::RgbaImage::from_fn(17, 31, |_, _| image::Rgba([128, 64, 32, 255]));
        let rgb = decode(&encode_png(&img)).unwrap();
        assert_eq!(rgb.width(), 17);
        assert_eq!(rgb.height(), 31);
        assert_eq!(rgb.get_pixel(3, 3).0, [128, 64, 32]);
    }

    #[test]
    fn grayscale_uses_weighted_luminance() {
        let img = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        });
        let gray = to_gray(&img);
        let (r, g, b) = (
            gray.get_pixel(0, 0).0[0],
            gray.get_pixel(1, 0).0[0],
            gray.get_pixel(2, 0).0[0],
        );
        assert!(
            g > r && r > b,
            "expected green > red > blue luminance, got R={r} G={g} B={b}",
        );
    }

    // --- HSV tests ---

    #[test]
    fn primary_hues() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 255, 0]), [60, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 255]), [120, 255, 255]);
    }

    #[test]
    fn gray_has_no_hue_or_saturation() {
        assert_eq!(rgb_to_hsv([128, 128, 128]), [0, 0, 128]);
        assert_eq!(rgb_to_hsv([0, 0, 0]), [0, 0, 0]);
    }

    #[test]
    fn leaf_green_lands_in_leaf_hue_band() {
        // 130 degrees -> 65 on the halved scale.
        assert_eq!(rgb_to_hsv([40, 160, 60]), [65, 191, 160]);
    }

    #[test]
    fn brown_damage_hue() {
        let [h, s, v] = rgb_to_hsv([200, 150, 40]);
        assert_eq!(h, 21);
        assert_eq!(s, 204);
        assert_eq!(v, 200);
    }

    #[test]
    fn near_red_magenta_wraps_to_zero() {
        // 359 degrees rounds to 180, which is red again.
        let [h, _, _] = rgb_to_hsv([255, 0, 4]);
        assert_eq!(h, 0);
    }

    #[test]
    fn hsv_image_preserves_dimensions() {
        let img = RgbImage::from_pixel(9, 4, Rgb([40, 160, 60]));
        let hsv = HsvImage::from_rgb(&img);
        assert_eq!((hsv.width(), hsv.height()), (9, 4));
        assert_eq!(hsv.get(8, 3), [65, 191, 160]);
    }
}
