//! Automatic global thresholding with Otsu's method.

use serde::{Deserialize, Serialize};

use crate::grayscale::to_gray;
use crate::segment::{SegmentDetails, SegmentMethod, Segmentation, Segmenter};
use crate::types::{ClassTag, Dimensions, GrayImage, Mask, PipelineError, RgbImage};

/// Which side of the Otsu level counts as foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    /// Pixels at or below the level (a leaf on white paper).
    #[default]
    Dark,
    /// Pixels above the level (a pale leaf on a dark board).
    Bright,
}

/// Parameters for [`SegmentMethod::AutoThreshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoThresholdParams {
    /// Foreground side of the threshold.
    pub polarity: Polarity,
}

/// Otsu level of `gray`, or `None` if every pixel has the same value.
///
/// A uniform image has no between-class variance; callers treat it as
/// having no foreground.
#[must_use]
pub fn otsu_cut(gray: &GrayImage) -> Option<u8> {
    let mut values = gray.as_raw().iter();
    let first = *values.next()?;
    if values.all(|&v| v == first) {
        return None;
    }
    Some(imageproc::contrast::otsu_level(gray))
}

/// Split `gray` at its Otsu level.
///
/// Returns the foreground mask and the level used. A uniform image
/// yields an all-false mask.
#[must_use]
pub fn binarize(gray: &GrayImage, polarity: Polarity) -> (Mask, Option<u8>) {
    let Some(level) = otsu_cut(gray) else {
        return (Mask::new(gray.width(), gray.height()), None);
    };
    let mask = Mask::from_fn(gray.width(), gray.height(), |x, y| {
        let p = gray.get_pixel(x, y).0[0];
        match polarity {
            Polarity::Dark => p <= level,
            Polarity::Bright => p > level,
        }
    });
    (mask, Some(level))
}

impl Segmenter for AutoThresholdParams {
    fn validate(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn segment(&self, image: &RgbImage) -> Segmentation {
        let (mask, level) = binarize(&to_gray(image), self.polarity);
        log::debug!("otsu level {level:?}, {} foreground pixels", mask.count());
        Segmentation::new(
            SegmentMethod::AutoThreshold(*self),
            Dimensions {
                width: image.width(),
                height: image.height(),
            },
            [(ClassTag::Foreground, mask)],
            SegmentDetails::Threshold { level },
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Dark 10x10 square on a light 30x30 background.
    fn dark_square() -> RgbImage {
        RgbImage::from_fn(30, 30, |x, y| {
            if (10..20).contains(&x) && (10..20).contains(&y) {
                image::Rgb([30, 90, 40])
            } else {
                image::Rgb([240, 240, 235])
            }
        })
    }

    #[test]
    fn uniform_image_has_no_level() {
        let gray = GrayImage::from_pixel(8, 8, image::Luma([77]));
        assert_eq!(otsu_cut(&gray), None);
    }

    #[test]
    fn empty_image_has_no_level() {
        assert_eq!(otsu_cut(&GrayImage::new(0, 0)), None);
    }

    #[test]
    fn dark_polarity_selects_the_square() {
        let seg = AutoThresholdParams::default().segment(&dark_square());
        let mask = seg.get(ClassTag::Foreground).unwrap();
        assert_eq!(mask.count(), 100);
        assert!(mask.get(15, 15));
        assert!(!mask.get(0, 0));
    }

    #[test]
    fn bright_polarity_selects_the_background() {
        let params = AutoThresholdParams {
            polarity: Polarity::Bright,
        };
        let seg = params.segment(&dark_square());
        let mask = seg.get(ClassTag::Foreground).unwrap();
        assert_eq!(mask.count(), 800);
    }

    #[test]
    fn uniform_image_yields_empty_foreground() {
        let img = RgbImage::from_pixel(12, 12, image::Rgb([250, 250, 250]));
        let seg = AutoThresholdParams::default().segment(&img);
        assert!(seg.get(ClassTag::Foreground).is_some_and(Mask::is_blank));
        assert_eq!(seg.details(), &SegmentDetails::Threshold { level: None });
    }
}
