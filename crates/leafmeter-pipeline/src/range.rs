//! Fixed color-range thresholding.
//!
//! Each configured class selects the pixels whose HSV (or grayscale)
//! value falls inside an inclusive box. Classes are evaluated
//! independently, so ranges may overlap: a yellow-green pixel can be
//! both `vein` and `damage`. Resolving such overlaps is the refiner's
//! job, not this module's.
//!
//! Hue uses the 8-bit half-degree scale (`0..=179`). Hue bands do not
//! wrap around red; split a red band into two classes if needed.

use serde::{Deserialize, Serialize};

use crate::grayscale::{HsvImage, to_gray};
use crate::segment::{SegmentDetails, SegmentMethod, Segmentation, Segmenter};
use crate::types::{ClassTag, Dimensions, Mask, PipelineError, RgbImage};

/// Inclusive bounds for one class, before clamping.
///
/// Values outside a channel's range are clamped rather than rejected,
/// so `[0, 0, 0]..=[255, 255, 255]` is a valid "everything" box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "space", rename_all = "kebab-case")]
pub enum ClassBounds {
    /// Explicit `[h, s, v]` corners.
    Hsv {
        /// Lower corner.
        lower: [i32; 3],
        /// Upper corner.
        upper: [i32; 3],
    },
    /// Hue `center ± tolerance` with saturation and value intervals.
    HueBand {
        /// Hue at the middle of the band.
        center: i32,
        /// Half-width of the band.
        tolerance: i32,
        /// `[min, max]` saturation.
        saturation: [i32; 2],
        /// `[min, max]` value.
        value: [i32; 2],
    },
    /// Luminance interval on the grayscale image.
    Gray {
        /// Lowest accepted gray level.
        lower: i32,
        /// Highest accepted gray level.
        upper: i32,
    },
}

/// Clamped, validated bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolved {
    Hsv { lower: [u8; 3], upper: [u8; 3] },
    Gray { lower: u8, upper: u8 },
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_channel(value: i32, max: u8) -> u8 {
    value.clamp(0, i32::from(max)) as u8
}

impl ClassBounds {
    /// Clamp to the channel ranges. `None` if any lower bound ends up
    /// above its upper bound.
    fn resolve(&self) -> Option<Resolved> {
        let maxima = [HsvImage::MAX_HUE, u8::MAX, u8::MAX];
        let resolved = match *self {
            Self::Hsv { lower, upper } => Resolved::Hsv {
                lower: std::array::from_fn(|c| clamp_channel(lower[c], maxima[c])),
                upper: std::array::from_fn(|c| clamp_channel(upper[c], maxima[c])),
            },
            Self::HueBand {
                center,
                tolerance,
                saturation,
                value,
            } => {
                if tolerance < 0 {
                    return None;
                }
                let lower = [
                    center.saturating_sub(tolerance),
                    saturation[0],
                    value[0],
                ];
                let upper = [
                    center.saturating_add(tolerance),
                    saturation[1],
                    value[1],
                ];
                Resolved::Hsv {
                    lower: std::array::from_fn(|c| clamp_channel(lower[c], maxima[c])),
                    upper: std::array::from_fn(|c| clamp_channel(upper[c], maxima[c])),
                }
            }
            Self::Gray { lower, upper } => Resolved::Gray {
                lower: clamp_channel(lower, u8::MAX),
                upper: clamp_channel(upper, u8::MAX),
            },
        };
        let ordered = match resolved {
            Resolved::Hsv { lower, upper } => lower.iter().zip(&upper).all(|(l, u)| l <= u),
            Resolved::Gray { lower, upper } => lower <= upper,
        };
        ordered.then_some(resolved)
    }
}

/// One class: a tag and the box that selects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRange {
    /// Tag of the resulting mask.
    pub tag: ClassTag,
    /// Pixel selection.
    pub bounds: ClassBounds,
}

impl ClassRange {
    /// An explicit HSV box.
    #[must_use]
    pub const fn hsv(tag: ClassTag, lower: [i32; 3], upper: [i32; 3]) -> Self {
        Self {
            tag,
            bounds: ClassBounds::Hsv { lower, upper },
        }
    }
}

/// Parameters for [`SegmentMethod::RangeThreshold`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeParams {
    /// Classes to extract; tags must be unique.
    pub classes: Vec<ClassRange>,
}

impl RangeParams {
    /// Healthy tissue: green hues.
    pub const DEFAULT_LEAF: ClassRange =
        ClassRange::hsv(ClassTag::Leaf, [35, 40, 40], [85, 255, 255]);

    /// Damage: yellow to brown hues.
    pub const DEFAULT_DAMAGE: ClassRange =
        ClassRange::hsv(ClassTag::Damage, [10, 50, 50], [35, 255, 255]);

    /// Veins: yellow-green hues, overlapping both neighbours.
    pub const DEFAULT_VEIN: ClassRange =
        ClassRange::hsv(ClassTag::Vein, [30, 40, 40], [60, 255, 255]);
}

impl Default for RangeParams {
    fn default() -> Self {
        Self {
            classes: vec![Self::DEFAULT_LEAF, Self::DEFAULT_DAMAGE, Self::DEFAULT_VEIN],
        }
    }
}

impl Segmenter for RangeParams {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.classes.is_empty() {
            return Err(PipelineError::invalid(
                "range.classes",
                "at least one class is required",
            ));
        }
        for (i, class) in self.classes.iter().enumerate() {
            if self.classes[..i].iter().any(|c| c.tag == class.tag) {
                return Err(PipelineError::invalid(
                    format!("range.classes[{i}].tag"),
                    format!("duplicate class `{}`", class.tag),
                ));
            }
            if class.bounds.resolve().is_none() {
                return Err(PipelineError::invalid(
                    format!("range.classes[{i}].bounds"),
                    format!(
                        "lower bound exceeds upper bound for class `{}` after clamping",
                        class.tag
                    ),
                ));
            }
        }
        Ok(())
    }

    fn segment(&self, image: &RgbImage) -> Segmentation {
        let (w, h) = (image.width(), image.height());
        let is_gray = |c: &ClassRange| matches!(c.bounds, ClassBounds::Gray { .. });
        let hsv = self
            .classes
            .iter()
            .any(|c| !is_gray(c))
            .then(|| HsvImage::from_rgb(image));
        let gray = self.classes.iter().any(is_gray).then(|| to_gray(image));

        let masks = self.classes.iter().map(|class| {
            let mask = match (class.bounds.resolve(), &hsv, &gray) {
                (Some(Resolved::Hsv { lower, upper }), Some(hsv), _) => {
                    Mask::from_fn(w, h, |x, y| {
                        let px = hsv.get(x, y);
                        (0..3).all(|c| (lower[c]..=upper[c]).contains(&px[c]))
                    })
                }
                (Some(Resolved::Gray { lower, upper }), _, Some(gray)) => {
                    Mask::from_fn(w, h, |x, y| {
                        (lower..=upper).contains(&gray.get_pixel(x, y).0[0])
                    })
                }
                _ => Mask::new(w, h),
            };
            log::debug!("class {} matched {} pixels", class.tag, mask.count());
            (class.tag, mask)
        });

        Segmentation::new(
            SegmentMethod::RangeThreshold(self.clone()),
            Dimensions {
                width: w,
                height: h,
            },
            masks.collect::<Vec<_>>(),
            SegmentDetails::Range,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LEAF_GREEN: [u8; 3] = [40, 160, 60];
    const BROWN: [u8; 3] = [200, 150, 40];
    const VEIN_GREEN: [u8; 3] = [170, 200, 60];
    const YELLOW_GREEN: [u8; 3] = [200, 210, 50];
    const PAPER: [u8; 3] = [245, 245, 240];

    /// A 5x1 strip: one pixel of each test color.
    fn swatches() -> RgbImage {
        let colors = [LEAF_GREEN, BROWN, VEIN_GREEN, YELLOW_GREEN, PAPER];
        RgbImage::from_fn(5, 1, |x, _| image::Rgb(colors[x as usize]))
    }

    fn classes_at(seg: &Segmentation, x: u32) -> Vec<ClassTag> {
        seg.iter().filter(|(_, m)| m.get(x, 0)).map(|(t, _)| t).collect()
    }

    #[test]
    fn default_ranges_classify_swatches() {
        let seg = RangeParams::default().segment(&swatches());
        assert_eq!(classes_at(&seg, 0), vec![ClassTag::Leaf]);
        assert_eq!(classes_at(&seg, 1), vec![ClassTag::Damage]);
        assert_eq!(classes_at(&seg, 2), vec![ClassTag::Leaf, ClassTag::Vein]);
        assert!(classes_at(&seg, 4).is_empty());
    }

    #[test]
    fn overlapping_ranges_are_reported_independently() {
        let seg = RangeParams::default().segment(&swatches());
        assert_eq!(classes_at(&seg, 3), vec![ClassTag::Damage, ClassTag::Vein]);
    }

    #[test]
    fn default_params_are_valid() {
        RangeParams::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_bounds_are_clamped() {
        let params = RangeParams {
            classes: vec![ClassRange::hsv(
                ClassTag::Foreground,
                [-10, 0, 0],
                [400, 300, 300],
            )],
        };
        params.validate().unwrap();
        let seg = params.segment(&swatches());
        assert_eq!(seg.get(ClassTag::Foreground).unwrap().count(), 5);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let params = RangeParams {
            classes: vec![ClassRange::hsv(ClassTag::Leaf, [85, 40, 40], [35, 255, 255])],
        };
        let err = params.validate().unwrap_err();
        assert!(
            matches!(err, PipelineError::InvalidParameter { ref field, .. } if field == "range.classes[0].bounds"),
            "unexpected error: {err}",
        );
    }

    #[test]
    fn bounds_inverted_only_after_clamping_are_rejected() {
        // Hue lower 200 clamps to 179, above the upper of 170.
        let params = RangeParams {
            classes: vec![ClassRange::hsv(ClassTag::Leaf, [200, 0, 0], [170, 255, 255])],
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let params = RangeParams {
            classes: vec![RangeParams::DEFAULT_LEAF, RangeParams::DEFAULT_LEAF],
        };
        assert!(matches!(
            params.validate(),
            Err(PipelineError::InvalidParameter { ref field, .. }) if field == "range.classes[1].tag"
        ));
    }

    #[test]
    fn empty_class_list_is_rejected() {
        let params = RangeParams { classes: vec![] };
        assert!(params.validate().is_err());
    }

    #[test]
    fn hue_band_matches_like_equivalent_box() {
        let band = RangeParams {
            classes: vec![ClassRange {
                tag: ClassTag::Leaf,
                bounds: ClassBounds::HueBand {
                    center: 60,
                    tolerance: 25,
                    saturation: [40, 255],
                    value: [40, 255],
                },
            }],
        };
        let boxed = RangeParams {
            classes: vec![RangeParams::DEFAULT_LEAF],
        };
        let img = swatches();
        assert_eq!(
            band.segment(&img).get(ClassTag::Leaf),
            boxed.segment(&img).get(ClassTag::Leaf),
        );
    }

    #[test]
    fn gray_interval_selects_by_luminance() {
        let params = RangeParams {
            classes: vec![ClassRange {
                tag: ClassTag::Background,
                bounds: ClassBounds::Gray {
                    lower: 230,
                    upper: 255,
                },
            }],
        };
        let seg = params.segment(&swatches());
        assert_eq!(classes_at(&seg, 4), vec![ClassTag::Background]);
        assert_eq!(seg.get(ClassTag::Background).unwrap().count(), 1);
    }

    #[test]
    fn bounds_json_is_tagged_by_space() {
        let bounds: ClassBounds =
            serde_json::from_str(r#"{"space": "gray", "lower": 0, "upper": 60}"#).unwrap();
        assert_eq!(bounds, ClassBounds::Gray { lower: 0, upper: 60 });
    }
}
