//! Gradient-magnitude edge thresholding.
//!
//! Computes 3x3 Sobel derivatives in x and y and combines them by
//! vector magnitude. A single threshold keeps every pixel above `low`;
//! with a `high` threshold the map is traced by hysteresis instead, so
//! weak edges survive only when connected to a strong one.

use image::Luma;
use imageproc::definitions::Image;
use serde::{Deserialize, Serialize};

use crate::grayscale::to_gray;
use crate::segment::{SegmentDetails, SegmentMethod, Segmentation, Segmenter};
use crate::types::{ClassTag, Dimensions, GrayImage, Mask, PipelineError, RgbImage};

/// Minimum allowed edge threshold.
///
/// A threshold of zero marks every pixel with any gradient, which for a
/// photograph is effectively the whole image.
pub const MIN_THRESHOLD: f32 = 1.0;
const _: () = assert!(MIN_THRESHOLD > 0.0);

/// Parameters for [`SegmentMethod::EdgeThreshold`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeParams {
    /// Magnitude threshold. Without `high`, pixels strictly above it are
    /// edges; with `high`, pixels at or above it may join an edge.
    pub low: f32,
    /// Hysteresis seed threshold. `None` selects a single threshold.
    pub high: Option<f32>,
}

impl EdgeParams {
    /// Default weak-edge threshold.
    pub const DEFAULT_LOW: f32 = 100.0;

    /// Default strong-edge threshold.
    pub const DEFAULT_HIGH: f32 = 200.0;
}

impl Default for EdgeParams {
    fn default() -> Self {
        Self {
            low: Self::DEFAULT_LOW,
            high: Some(Self::DEFAULT_HIGH),
        }
    }
}

/// Sobel gradient magnitude of a grayscale image.
///
/// For a full black-to-white step the magnitude is `4 * 255 = 1020`.
#[must_use = "returns the gradient magnitude"]
pub fn sobel_magnitude(gray: &GrayImage) -> Image<Luma<f32>> {
    let gx = imageproc::gradients::horizontal_sobel(gray);
    let gy = imageproc::gradients::vertical_sobel(gray);
    Image::from_fn(gray.width(), gray.height(), |x, y| {
        let h = f32::from(gx.get_pixel(x, y).0[0]);
        let v = f32::from(gy.get_pixel(x, y).0[0]);
        Luma([h.hypot(v)])
    })
}

/// Keep pixels connected to a strong edge.
///
/// Pixels with magnitude `>= high` seed a flood over 8-connected
/// neighbours with magnitude `>= low`. Neighbour coordinates are
/// bounds-checked, so seeds on the image border are handled.
#[must_use = "returns the edge mask"]
pub fn hysteresis(magnitude: &Image<Luma<f32>>, low: f32, high: f32) -> Mask {
    let (w, h) = (magnitude.width(), magnitude.height());
    let mut out = GrayImage::new(w, h);
    let mut stack = Vec::new();

    for y in 0..h {
        for x in 0..w {
            if magnitude.get_pixel(x, y).0[0] < high || out.get_pixel(x, y).0[0] != 0 {
                continue;
            }
            out.put_pixel(x, y, Luma([Mask::ON]));
            stack.push((x, y));

            while let Some((nx, ny)) = stack.pop() {
                let neighbors = [
                    (nx + 1, ny),
                    (nx + 1, ny + 1),
                    (nx, ny + 1),
                    (nx.wrapping_sub(1), ny + 1),
                    (nx.wrapping_sub(1), ny),
                    (nx.wrapping_sub(1), ny.wrapping_sub(1)),
                    (nx, ny.wrapping_sub(1)),
                    (nx + 1, ny.wrapping_sub(1)),
                ];
                for (px, py) in neighbors {
                    if px >= w || py >= h {
                        continue;
                    }
                    if magnitude.get_pixel(px, py).0[0] >= low && out.get_pixel(px, py).0[0] == 0 {
                        out.put_pixel(px, py, Luma([Mask::ON]));
                        stack.push((px, py));
                    }
                }
            }
        }
    }

    Mask::from_gray(&out)
}

impl Segmenter for EdgeParams {
    fn validate(&self) -> Result<(), PipelineError> {
        if !self.low.is_finite() || self.low < MIN_THRESHOLD {
            return Err(PipelineError::invalid(
                "edge.low",
                format!("must be finite and >= {MIN_THRESHOLD}, got {}", self.low),
            ));
        }
        if let Some(high) = self.high
            && (!high.is_finite() || high < self.low)
        {
            return Err(PipelineError::invalid(
                "edge.high",
                format!("must be finite and >= low ({}), got {high}", self.low),
            ));
        }
        Ok(())
    }

    fn segment(&self, image: &RgbImage) -> Segmentation {
        let magnitude = sobel_magnitude(&to_gray(image));
        let max_magnitude = magnitude.pixels().map(|p| p.0[0]).fold(0.0, f32::max);

        let mask = match self.high {
            Some(high) => hysteresis(&magnitude, self.low, high),
            None => Mask::from_fn(image.width(), image.height(), |x, y| {
                magnitude.get_pixel(x, y).0[0] > self.low
            }),
        };
        log::debug!(
            "peak gradient {max_magnitude:.1}, {} edge pixels",
            mask.count()
        );

        Segmentation::new(
            SegmentMethod::EdgeThreshold(*self),
            Dimensions {
                width: image.width(),
                height: image.height(),
            },
            [(ClassTag::Edge, mask)],
            SegmentDetails::Edge { max_magnitude },
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// 20x20 image with a sharp vertical boundary at x = 10.
    fn sharp_edge_image() -> RgbImage {
        RgbImage::from_fn(20, 20, |x, _y| {
            if x < 10 {
                image::Rgb([0, 0, 0])
            } else {
                image::Rgb([255, 255, 255])
            }
        })
    }

    fn edge_mask(params: EdgeParams, img: &RgbImage) -> Mask {
        params.segment(img).get(ClassTag::Edge).unwrap().clone()
    }

    #[test]
    fn blank_image_produces_no_edges() {
        let img = RgbImage::from_pixel(20, 20, image::Rgb([128, 128, 128]));
        assert!(edge_mask(EdgeParams::default(), &img).is_blank());
    }

    #[test]
    fn step_magnitude_is_four_times_contrast() {
        let gray = to_gray(&sharp_edge_image());
        let magnitude = sobel_magnitude(&gray);
        assert!((magnitude.get_pixel(9, 10).0[0] - 1020.0).abs() < 1e-3);
        assert!(magnitude.get_pixel(2, 10).0[0].abs() < 1e-3);
    }

    #[test]
    fn single_threshold_marks_both_sides_of_step() {
        let params = EdgeParams {
            low: 100.0,
            high: None,
        };
        let mask = edge_mask(params, &sharp_edge_image());
        // Columns 9 and 10 straddle the step.
        assert_eq!(mask.count(), 40);
        assert!(mask.get(9, 0));
        assert!(mask.get(10, 19));
    }

    #[test]
    fn hysteresis_drops_weak_isolated_edges() {
        let mut magnitude = Image::new(10, 10);
        magnitude.put_pixel(2, 2, Luma([50.0f32]));
        magnitude.put_pixel(7, 7, Luma([250.0f32]));
        magnitude.put_pixel(8, 8, Luma([50.0f32]));
        let mask = hysteresis(&magnitude, 40.0, 200.0);
        assert!(!mask.get(2, 2), "weak pixel without a strong neighbour");
        assert!(mask.get(7, 7));
        assert!(mask.get(8, 8), "weak pixel connected to a strong one");
        assert_eq!(mask.count(), 2);
    }

    #[test]
    fn hysteresis_seed_on_border_does_not_panic() {
        let mut magnitude = Image::new(5, 5);
        magnitude.put_pixel(0, 0, Luma([300.0f32]));
        magnitude.put_pixel(0, 1, Luma([60.0f32]));
        magnitude.put_pixel(4, 4, Luma([300.0f32]));
        let mask = hysteresis(&magnitude, 50.0, 200.0);
        assert_eq!(mask.count(), 3);
    }

    #[test]
    fn output_dimensions_match_input() {
        let img = RgbImage::new(17, 31);
        let mask = edge_mask(EdgeParams::default(), &img);
        assert_eq!((mask.width(), mask.height()), (17, 31));
    }

    #[test]
    fn low_below_minimum_is_rejected() {
        let params = EdgeParams {
            low: 0.0,
            high: None,
        };
        assert!(matches!(
            params.validate(),
            Err(PipelineError::InvalidParameter { ref field, .. }) if field == "edge.low"
        ));
    }

    #[test]
    fn high_below_low_is_rejected() {
        let params = EdgeParams {
            low: 200.0,
            high: Some(100.0),
        };
        assert!(matches!(
            params.validate(),
            Err(PipelineError::InvalidParameter { ref field, .. }) if field == "edge.high"
        ));
    }
}
