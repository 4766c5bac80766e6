//! Gaussian blur for noise reduction before segmentation.
//!
//! [`gaussian_blur_rgb`] smooths sensor noise and paper texture so that
//! per-pixel classifiers see fewer isolated outliers. The blurred image
//! only feeds segmentation; overlays are drawn on the unblurred source.

use image::{GrayImage, RgbImage};

/// Apply Gaussian blur to an RGB image by blurring each channel
/// independently.
///
/// `imageproc::filter::gaussian_blur_f32` works on single-channel
/// images, so the image is split into R/G/B planes, each plane is
/// blurred, and the planes are reassembled. Gaussian blur is linear and
/// per-channel, so the result equals blurring in color space.
///
/// Non-positive sigma values return the image unchanged, since
/// `imageproc` panics on `sigma <= 0.0`.
#[must_use = "returns the blurred image"]
pub fn gaussian_blur_rgb(image: &RgbImage, sigma: f32) -> RgbImage {
    if sigma <= 0.0 {
        return image.clone();
    }

    let (w, h) = (image.width(), image.height());

    let planes: [GrayImage; 3] = std::array::from_fn(|c| {
        let plane = GrayImage::from_fn(w, h, |x, y| image::Luma([image.get_pixel(x, y).0[c]]));
        imageproc::filter::gaussian_blur_f32(&plane, sigma)
    });

    RgbImage::from_fn(w, h, |x, y| {
        image::Rgb([
            planes[0].get_pixel(x, y).0[0],
            planes[1].get_pixel(x, y).0[0],
            planes[2].get_pixel(x, y).0[0],
        ])
    })
}
