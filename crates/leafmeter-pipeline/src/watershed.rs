//! Marker-controlled watershed segmentation.
//!
//! Separates touching objects (overlapping leaves, leaflets) that a
//! single threshold merges into one blob:
//!
//! 1. Otsu threshold, dark side as foreground.
//! 2. Opening with a 3x3 square removes speckle.
//! 3. Dilating the opening bounds the *sure background*: anything
//!    outside it is background.
//! 4. Pixels far from any background (distance transform above a
//!    fraction of its maximum) are *sure foreground*; each connected
//!    blob of them seeds one region.
//! 5. The band between the two is flooded from the seeds in order of
//!    Sobel gradient. Where two floods meet the pixel becomes a
//!    boundary.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use image::Luma;
use imageproc::distance_transform::{Norm, euclidean_squared_distance_transform};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::grayscale::to_gray;
use crate::segment::{SegmentDetails, SegmentMethod, Segmentation, Segmenter};
use crate::threshold::{Polarity, binarize};
use crate::types::{ClassTag, Dimensions, GrayImage, Mask, PipelineError, RgbImage};

/// Parameters for [`SegmentMethod::Watershed`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatershedParams {
    /// Radius (in 3x3 steps) of the speckle-removing opening.
    pub opening_iterations: u8,
    /// Radius (in 3x3 steps) of the sure-background dilation.
    pub dilate_iterations: u8,
    /// Fraction of the peak distance a pixel must exceed to seed a
    /// region, in `(0, 1)`.
    pub foreground_ratio: f64,
}

impl WatershedParams {
    /// Default opening radius.
    pub const DEFAULT_OPENING_ITERATIONS: u8 = 2;

    /// Default dilation radius.
    pub const DEFAULT_DILATE_ITERATIONS: u8 = 3;

    /// Default seed fraction.
    pub const DEFAULT_FOREGROUND_RATIO: f64 = 0.7;
}

impl Default for WatershedParams {
    fn default() -> Self {
        Self {
            opening_iterations: Self::DEFAULT_OPENING_ITERATIONS,
            dilate_iterations: Self::DEFAULT_DILATE_ITERATIONS,
            foreground_ratio: Self::DEFAULT_FOREGROUND_RATIO,
        }
    }
}

/// Pixel label during flooding.
const UNKNOWN: i32 = 0;
const BACKGROUND: i32 = 1;
const BOUNDARY: i32 = -1;

/// Flood `labels` outward from every labelled pixel, lowest gradient
/// first. Pixels adjacent to two different labels become [`BOUNDARY`]
/// and do not spread.
fn flood(labels: &mut [i32], gradient: &[u16], width: usize, height: usize) {
    let neighbors = |i: usize| {
        let (x, y) = (i % width, i / width);
        [
            (x > 0).then(|| i - 1),
            (x + 1 < width).then(|| i + 1),
            (y > 0).then(|| i - width),
            (y + 1 < height).then(|| i + width),
        ]
        .into_iter()
        .flatten()
    };

    let mut queued = vec![false; labels.len()];
    let mut heap: BinaryHeap<Reverse<(u16, u64, usize)>> = BinaryHeap::new();
    let mut seq = 0u64;
    let mut enqueue = |heap: &mut BinaryHeap<Reverse<(u16, u64, usize)>>,
                       queued: &mut [bool],
                       i: usize| {
        if !queued[i] {
            queued[i] = true;
            heap.push(Reverse((gradient[i], seq, i)));
            seq += 1;
        }
    };

    for i in 0..labels.len() {
        if labels[i] > UNKNOWN {
            queued[i] = true;
            for n in neighbors(i) {
                if labels[n] == UNKNOWN {
                    enqueue(&mut heap, &mut queued, n);
                }
            }
        }
    }

    while let Some(Reverse((_, _, i))) = heap.pop() {
        let mut found = None;
        let mut conflict = false;
        for n in neighbors(i) {
            let l = labels[n];
            if l > UNKNOWN {
                match found {
                    None => found = Some(l),
                    Some(f) if f != l => conflict = true,
                    Some(_) => {}
                }
            }
        }
        match (found, conflict) {
            (Some(_), true) => labels[i] = BOUNDARY,
            (Some(label), false) => {
                labels[i] = label;
                for n in neighbors(i) {
                    if labels[n] == UNKNOWN {
                        enqueue(&mut heap, &mut queued, n);
                    }
                }
            }
            (None, _) => {}
        }
    }
}

impl Segmenter for WatershedParams {
    fn validate(&self) -> Result<(), PipelineError> {
        if !(self.foreground_ratio > 0.0 && self.foreground_ratio < 1.0) {
            return Err(PipelineError::invalid(
                "watershed.foreground_ratio",
                format!("must be in (0, 1), got {}", self.foreground_ratio),
            ));
        }
        if self.dilate_iterations == 0 {
            return Err(PipelineError::invalid(
                "watershed.dilate_iterations",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    fn segment(&self, image: &RgbImage) -> Segmentation {
        let (w, h) = (image.width(), image.height());
        let gray = to_gray(image);
        let (thresh, level) = binarize(&gray, Polarity::Dark);

        let opening =
            imageproc::morphology::open(thresh.as_gray(), Norm::LInf, self.opening_iterations);
        let sure_bg = imageproc::morphology::dilate(&opening, Norm::LInf, self.dilate_iterations);

        // Distance from each foreground pixel to the nearest background.
        let background = Mask::from_gray(&opening).invert();
        let distance = euclidean_squared_distance_transform(background.as_gray());
        let distance: Vec<f64> = distance
            .pixels()
            .zip(opening.pixels())
            .map(|(d, o)| if o.0[0] == 0 { 0.0 } else { d.0[0].sqrt() })
            .collect();
        let peak = distance.iter().copied().fold(0.0, f64::max);
        let cutoff = self.foreground_ratio * peak;

        let sure_fg = GrayImage::from_fn(w, h, |x, y| {
            let d = distance[y as usize * w as usize + x as usize];
            Luma([if peak > 0.0 && d > cutoff { Mask::ON } else { 0 }])
        });
        let seeds = connected_components(&sure_fg, Connectivity::Eight, Luma([0]));
        let regions = seeds.pixels().map(|p| p.0[0]).max().unwrap_or(0);

        let mut labels: Vec<i32> = seeds
            .pixels()
            .zip(sure_bg.pixels())
            .map(|(seed, bg)| match (seed.0[0], bg.0[0]) {
                (0, 0) => BACKGROUND,
                (0, _) => UNKNOWN,
                (component, _) => component as i32 + 1,
            })
            .collect();

        let gradient = imageproc::gradients::sobel_gradients(&gray);
        flood(&mut labels, gradient.as_raw(), w as usize, h as usize);

        let label_at = |x: u32, y: u32| labels[y as usize * w as usize + x as usize];
        let mut masks = vec![
            (ClassTag::Background, Mask::from_fn(w, h, |x, y| label_at(x, y) == BACKGROUND)),
            (ClassTag::Foreground, Mask::from_fn(w, h, |x, y| label_at(x, y) > BACKGROUND)),
            (ClassTag::Boundary, Mask::from_fn(w, h, |x, y| label_at(x, y) == BOUNDARY)),
            (ClassTag::Unknown, Mask::from_fn(w, h, |x, y| label_at(x, y) == UNKNOWN)),
        ];
        masks.extend((1..=regions).map(|n| {
            let label = n as i32 + 1;
            (ClassTag::Region(n), Mask::from_fn(w, h, |x, y| label_at(x, y) == label))
        }));

        log::debug!("watershed: otsu level {level:?}, {regions} seeded regions");

        Segmentation::new(
            SegmentMethod::Watershed(*self),
            Dimensions {
                width: w,
                height: h,
            },
            masks,
            SegmentDetails::Watershed { level, regions },
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PAPER: image::Rgb<u8> = image::Rgb([240, 240, 235]);
    const LEAF: image::Rgb<u8> = image::Rgb([30, 110, 40]);

    /// Two dark discs of radius 10 whose edges are 4 px apart.
    fn two_discs() -> RgbImage {
        RgbImage::from_fn(64, 60, |x, y| {
            let (x, y) = (f64::from(x), f64::from(y));
            let in_disc = |cx: f64, cy: f64| (x - cx).hypot(y - cy) <= 10.0;
            if in_disc(18.0, 30.0) || in_disc(42.0, 30.0) {
                LEAF
            } else {
                PAPER
            }
        })
    }

    fn region_at(seg: &Segmentation, x: u32, y: u32) -> Option<ClassTag> {
        seg.iter()
            .find(|(tag, m)| matches!(tag, ClassTag::Region(_)) && m.get(x, y))
            .map(|(tag, _)| tag)
    }

    #[test]
    fn separate_discs_get_separate_regions() {
        let seg = WatershedParams::default().segment(&two_discs());
        assert!(matches!(
            seg.details(),
            SegmentDetails::Watershed { regions: 2, .. }
        ));
        let left = region_at(&seg, 18, 30).unwrap();
        let right = region_at(&seg, 42, 30).unwrap();
        assert_ne!(left, right);
        assert!(seg.get(ClassTag::Background).unwrap().get(0, 0));
    }

    #[test]
    fn foreground_is_union_of_regions() {
        let seg = WatershedParams::default().segment(&two_discs());
        let regions: u64 = seg
            .iter()
            .filter(|(tag, _)| matches!(tag, ClassTag::Region(_)))
            .map(|(_, m)| m.count())
            .sum();
        assert_eq!(seg.get(ClassTag::Foreground).unwrap().count(), regions);
        assert!(regions > 0);
    }

    #[test]
    fn labels_partition_the_image() {
        let seg = WatershedParams::default().segment(&two_discs());
        let total: u64 = [
            ClassTag::Background,
            ClassTag::Foreground,
            ClassTag::Boundary,
            ClassTag::Unknown,
        ]
        .iter()
        .map(|&t| seg.get(t).unwrap().count())
        .sum();
        assert_eq!(total, 64 * 60);
    }

    #[test]
    fn meeting_floods_leave_a_boundary() {
        let seg = WatershedParams::default().segment(&two_discs());
        assert!(!seg.get(ClassTag::Boundary).unwrap().is_blank());
    }

    #[test]
    fn uniform_image_has_no_regions() {
        let img = RgbImage::from_pixel(20, 20, PAPER);
        let seg = WatershedParams::default().segment(&img);
        assert!(seg.get(ClassTag::Foreground).unwrap().is_blank());
        assert_eq!(seg.get(ClassTag::Background).unwrap().count(), 400);
        assert!(matches!(
            seg.details(),
            SegmentDetails::Watershed {
                level: None,
                regions: 0
            }
        ));
    }

    #[test]
    fn flood_marks_contested_pixel_as_boundary() {
        // 3x1 strip: region 2 | unknown | region 3.
        let mut labels = vec![2, UNKNOWN, 3];
        flood(&mut labels, &[0, 5, 0], 3, 1);
        assert_eq!(labels, vec![2, BOUNDARY, 3]);
    }

    #[test]
    fn flood_follows_lowest_gradient_first() {
        // Seeds at both ends; the left seed reaches the low-gradient
        // pixels before the right seed crosses the ridge.
        let mut labels = vec![2, UNKNOWN, UNKNOWN, UNKNOWN, 3];
        flood(&mut labels, &[0, 1, 1, 9, 0], 5, 1);
        assert_eq!(labels, vec![2, 2, 2, BOUNDARY, 3]);
    }

    #[test]
    fn ratio_out_of_range_is_rejected() {
        for ratio in [0.0, 1.0, -0.5, f64::NAN] {
            let params = WatershedParams {
                foreground_ratio: ratio,
                ..WatershedParams::default()
            };
            assert!(matches!(
                params.validate(),
                Err(PipelineError::InvalidParameter { ref field, .. })
                    if field == "watershed.foreground_ratio"
            ));
        }
    }

    #[test]
    fn zero_dilation_is_rejected() {
        let params = WatershedParams {
            dilate_iterations: 0,
            ..WatershedParams::default()
        };
        assert!(params.validate().is_err());
    }
}
