//! Pixel counts to physical areas and percentages.

use serde::{Deserialize, Serialize};

use crate::types::Mask;

/// Size of one mask, in pixels and (when calibrated) physical units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaMeasurement {
    /// Number of set pixels.
    pub pixel_count: u64,
    /// `pixel_count * scale^2` in the marker's unit squared; `None`
    /// without calibration.
    pub area: Option<f64>,
}

/// Measure a mask.
///
/// `scale` is the physical length of one pixel side. Without a scale
/// the physical area stays undefined rather than defaulting to pixels.
#[must_use = "returns the measurement"]
#[allow(clippy::cast_precision_loss)]
pub fn measure(mask: &Mask, scale: Option<f64>) -> AreaMeasurement {
    let pixel_count = mask.count();
    AreaMeasurement {
        pixel_count,
        area: scale.map(|s| pixel_count as f64 * s * s),
    }
}

/// `a` as a percentage of `b`.
///
/// Returns `0.0` when `b` has no pixels. Physical areas are used when
/// both are defined; otherwise pixel counts, which give the same ratio
/// for a shared scale.
#[must_use = "returns the percentage"]
#[allow(clippy::cast_precision_loss)]
pub fn ratio(a: &AreaMeasurement, b: &AreaMeasurement) -> f64 {
    if b.pixel_count == 0 {
        return 0.0;
    }
    match (a.area, b.area) {
        (Some(area_a), Some(area_b)) if area_b > 0.0 => 100.0 * area_a / area_b,
        _ => 100.0 * a.pixel_count as f64 / b.pixel_count as f64,
    }
}
