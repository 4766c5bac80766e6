//! Visual overlays for checking a measurement by eye.
//!
//! Every function returns a new image; the source is never modified.

use image::Rgb;

use crate::segment::{SegmentDetails, Segmentation};
use crate::types::{ClassTag, Dimensions, Mask, PipelineError, RgbImage, ensure_same_dimensions};

/// Blend weight of the overlay color on masked pixels.
pub const OVERLAY_OPACITY: f32 = 0.5;

/// Suggested overlay color for a class.
#[must_use]
pub const fn class_color(tag: ClassTag) -> Rgb<u8> {
    match tag {
        ClassTag::Leaf | ClassTag::Foreground => Rgb([0, 200, 0]),
        ClassTag::Damage => Rgb([255, 0, 0]),
        ClassTag::Vein => Rgb([255, 220, 0]),
        ClassTag::Edge | ClassTag::Boundary => Rgb([255, 0, 255]),
        ClassTag::Background | ClassTag::Unknown | ClassTag::Cluster(_) | ClassTag::Region(_) => {
            Rgb([0, 120, 255])
        }
    }
}

fn image_dimensions(image: &RgbImage) -> Dimensions {
    Dimensions {
        width: image.width(),
        height: image.height(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn blend(base: Rgb<u8>, color: Rgb<u8>) -> Rgb<u8> {
    Rgb(std::array::from_fn(|c| {
        let mixed = f32::from(base.0[c])
            .mul_add(1.0 - OVERLAY_OPACITY, f32::from(color.0[c]) * OVERLAY_OPACITY);
        mixed.round().clamp(0.0, 255.0) as u8
    }))
}

/// Tint the masked pixels of `image` with `color`.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if the mask does not
/// match the image.
#[must_use = "returns the overlay image"]
pub fn render_overlay(
    image: &RgbImage,
    mask: &Mask,
    color: Rgb<u8>,
) -> Result<RgbImage, PipelineError> {
    ensure_same_dimensions(image_dimensions(image), mask.dimensions())?;
    Ok(RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let base = *image.get_pixel(x, y);
        if mask.get(x, y) { blend(base, color) } else { base }
    }))
}

/// Keep masked pixels as they are and black out everything else.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if the mask does not
/// match the image.
#[must_use = "returns the highlighted image"]
pub fn highlight(image: &RgbImage, mask: &Mask) -> Result<RgbImage, PipelineError> {
    ensure_same_dimensions(image_dimensions(image), mask.dimensions())?;
    Ok(RgbImage::from_fn(image.width(), image.height(), |x, y| {
        if mask.get(x, y) {
            *image.get_pixel(x, y)
        } else {
            Rgb([0, 0, 0])
        }
    }))
}

/// Paint every pixel with the center color of its k-means cluster.
///
/// Returns `None` unless `segmentation` came from the cluster method.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn render_clusters(segmentation: &Segmentation) -> Option<RgbImage> {
    let SegmentDetails::Cluster { centers, .. } = segmentation.details() else {
        return None;
    };
    let Dimensions { width, height } = segmentation.dimensions();
    let palette: Vec<(&Mask, Rgb<u8>)> = segmentation
        .iter()
        .filter_map(|(tag, mask)| match tag {
            ClassTag::Cluster(k) => centers
                .get(usize::from(k))
                .map(|c| (mask, Rgb(c.map(|v| v.round().clamp(0.0, 255.0) as u8)))),
            _ => None,
        })
        .collect();

    Some(RgbImage::from_fn(width, height, |x, y| {
        palette
            .iter()
            .find(|(mask, _)| mask.get(x, y))
            .map_or(Rgb([0, 0, 0]), |&(_, color)| color)
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::ClusterParams;
    use crate::segment::Segmenter;

    fn gray_image() -> RgbImage {
        RgbImage::from_pixel(6, 4, Rgb([100, 100, 100]))
    }

    #[test]
    fn overlay_tints_only_masked_pixels() {
        let mask = Mask::from_fn(6, 4, |x, _| x < 2);
        let out = render_overlay(&gray_image(), &mask, Rgb([200, 0, 0])).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [150, 50, 50]);
        assert_eq!(out.get_pixel(5, 3).0, [100, 100, 100]);
    }

    #[test]
    fn overlay_leaves_source_untouched() {
        let img = gray_image();
        let before = img.clone();
        let _ = render_overlay(&img, &Mask::from_fn(6, 4, |_, _| true), Rgb([0, 0, 0])).unwrap();
        assert_eq!(img, before);
    }

    #[test]
    fn overlay_rejects_mismatched_mask() {
        let result = render_overlay(&gray_image(), &Mask::new(4, 6), Rgb([0, 0, 0]));
        assert!(matches!(
            result,
            Err(PipelineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn highlight_blacks_out_unmasked_pixels() {
        let mask = Mask::from_fn(6, 4, |_, y| y == 1);
        let out = highlight(&gray_image(), &mask).unwrap();
        assert_eq!(out.get_pixel(3, 1).0, [100, 100, 100]);
        assert_eq!(out.get_pixel(3, 0).0, [0, 0, 0]);
    }

    #[test]
    fn clusters_render_as_their_centers() {
        let img = RgbImage::from_fn(20, 10, |x, _| {
            if x < 12 {
                Rgb([240, 240, 240])
            } else {
                Rgb([40, 160, 60])
            }
        });
        let params = ClusterParams {
            k: 2,
            ..ClusterParams::default()
        };
        let rendered = render_clusters(&params.segment(&img)).unwrap();
        assert_eq!(rendered, img);
    }

    #[test]
    fn non_cluster_segmentation_has_no_cluster_rendering() {
        let seg = crate::threshold::AutoThresholdParams::default().segment(&gray_image());
        assert!(render_clusters(&seg).is_none());
    }
}
