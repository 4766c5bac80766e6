//! Mask combination and morphological cleanup.
//!
//! Color ranges overlap, so raw segmentation masks contain pixels that
//! belong to a neighbouring class (veins read as damage) and isolated
//! specks of sensor noise. This module removes both without ever
//! modifying its inputs.

use image::Luma;
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::types::{Mask, PipelineError};

/// Pixel-wise set operation on two masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaskOp {
    /// `a AND NOT b`.
    Subtract,
    /// `a AND b`.
    Intersect,
    /// `a OR b`.
    Union,
}

/// One morphological pass with a square structuring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Morph {
    /// Dilate then erode: fills pinholes and thin gaps.
    Close,
    /// Erode then dilate: removes specks and thin spurs.
    Open,
}

/// Smallest structuring element side.
pub const MIN_KERNEL_SIZE: u32 = 3;

/// Largest structuring element side (`imageproc` morphology takes a
/// `u8` radius).
pub const MAX_KERNEL_SIZE: u32 = 255;

/// Refinement policy applied by the pipeline after segmentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    /// Remove vein pixels from the damage mask.
    pub exclude_veins: bool,
    /// Side of the square structuring element (odd, `3..=255`).
    pub kernel_size: u32,
    /// Cleanup passes, applied in order.
    pub passes: Vec<Morph>,
    /// Keep only the largest connected leaf region.
    pub keep_largest_leaf: bool,
}

impl RefineConfig {
    /// Default structuring element side.
    pub const DEFAULT_KERNEL_SIZE: u32 = 5;

    /// Check the kernel size.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `kernel_size` is
    /// even or outside `3..=255`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        kernel_radius(self.kernel_size).map(|_| ())
    }
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            exclude_veins: true,
            kernel_size: Self::DEFAULT_KERNEL_SIZE,
            passes: vec![Morph::Close, Morph::Open],
            keep_largest_leaf: false,
        }
    }
}

/// Radius of a square element of side `kernel_size`.
fn kernel_radius(kernel_size: u32) -> Result<u8, PipelineError> {
    let valid = (MIN_KERNEL_SIZE..=MAX_KERNEL_SIZE).contains(&kernel_size) && kernel_size % 2 == 1;
    if !valid {
        return Err(PipelineError::invalid(
            "kernel_size",
            format!(
                "must be odd and in {MIN_KERNEL_SIZE}..={MAX_KERNEL_SIZE}, got {kernel_size}"
            ),
        ));
    }
    u8::try_from(kernel_size / 2).map_err(|e| PipelineError::invalid("kernel_size", e.to_string()))
}

/// Combine two masks pixel by pixel.
///
/// `Subtract` and `Intersect` never set more pixels than `a` has.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if the masks differ in
/// size.
#[must_use = "returns the combined mask"]
pub fn refine(a: &Mask, b: &Mask, op: MaskOp) -> Result<Mask, PipelineError> {
    match op {
        MaskOp::Subtract => a.zip_with(b, |a, b| a && !b),
        MaskOp::Intersect => a.zip_with(b, |a, b| a && b),
        MaskOp::Union => a.zip_with(b, |a, b| a || b),
    }
}

/// Apply `passes` in order with a `kernel_size` square element.
///
/// Opening and closing are each idempotent, so applying the same
/// sequence to its own output changes nothing.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] if `kernel_size` is even
/// or outside `3..=255`.
#[must_use = "returns the cleaned mask"]
pub fn cleanup(mask: &Mask, kernel_size: u32, passes: &[Morph]) -> Result<Mask, PipelineError> {
    let radius = kernel_radius(kernel_size)?;
    let cleaned = passes.iter().fold(mask.as_gray().clone(), |image, pass| match pass {
        Morph::Close => imageproc::morphology::close(&image, Norm::LInf, radius),
        Morph::Open => imageproc::morphology::open(&image, Norm::LInf, radius),
    });
    Ok(Mask::from_gray(&cleaned))
}

/// Keep only the largest 8-connected region of `mask`.
///
/// Equal-sized regions resolve to the one found first in raster order.
/// A blank mask is returned unchanged.
#[must_use = "returns the filtered mask"]
pub fn largest_component(mask: &Mask) -> Mask {
    let labels = connected_components(mask.as_gray(), Connectivity::Eight, Luma([0]));
    let regions = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    if regions <= 1 {
        return mask.clone();
    }

    let mut sizes = vec![0u64; regions as usize + 1];
    for p in labels.pixels() {
        sizes[p.0[0] as usize] += 1;
    }
    let largest = sizes
        .iter()
        .enumerate()
        .skip(1)
        .fold((0, 0), |best, (label, &size)| {
            if size > best.1 { (label, size) } else { best }
        })
        .0;

    Mask::from_fn(mask.width(), mask.height(), |x, y| {
        labels.get_pixel(x, y).0[0] as usize == largest
    })
}
