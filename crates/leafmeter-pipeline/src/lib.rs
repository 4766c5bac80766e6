//! leafmeter-pipeline: Pure leaf area measurement pipeline (sans-IO).
//!
//! Measures the physical area of a photographed leaf and the share of
//! it that is damaged, using a printed ArUco marker of known size as the
//! scale reference:
//!
//! decode -> marker calibration -> segmentation -> mask refinement ->
//! area aggregation -> optional overlays.
//!
//! This crate has **no I/O dependencies**: it operates on in-memory
//! byte slices and images and returns structured data. Reading files,
//! parsing flags and writing overlays lives in the `leafmeter` binary.
//!
//! The free functions re-exported here are the individual building
//! blocks; [`analyze`] and the staged [`Pipeline`] chain them.

pub mod area;
pub mod blur;
pub mod cluster;
pub mod diagnostics;
pub mod edge;
pub mod grayscale;
pub mod marker;
pub mod overlay;
pub mod pipeline;
pub mod range;
pub mod refine;
pub mod segment;
pub mod threshold;
pub mod types;
pub mod watershed;

pub use area::{AreaMeasurement, measure, ratio};
pub use marker::{MarkerDetection, MarkerFamily, calibrate};
pub use overlay::render_overlay;
pub use pipeline::{Analysis, AnalysisReport, ClassMeasurement, Pipeline};
pub use refine::{MaskOp, Morph, RefineConfig, cleanup, refine};
pub use segment::{SegmentMethod, Segmentation, Segmenter, segment};
pub use types::{
    ClassTag, Dimensions, GrayImage, Mask, PipelineConfig, PipelineError, Point, RgbImage, Warning,
};

/// Run the full measurement pipeline.
///
/// Takes raw image bytes (PNG, JPEG, BMP, WebP) and a configuration and
/// returns the refined masks together with an [`AnalysisReport`].
///
/// # Pipeline steps
///
/// 1. Validate the config and decode the image
/// 2. Locate the marker and derive the pixel scale
/// 3. Optional Gaussian blur, then segmentation
/// 4. Vein exclusion and morphological cleanup
/// 5. Pixel counts to physical areas and the damage percentage
///
/// A missing marker or an empty class is reported as a [`Warning`],
/// not an error.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] if the config is out of
/// range, [`PipelineError::EmptyInput`] if `image_bytes` is empty, or
/// [`PipelineError::ImageDecode`] if the image format is unrecognized.
pub fn analyze(image_bytes: &[u8], config: &PipelineConfig) -> Result<Analysis, PipelineError> {
    Ok(Pipeline::new(image_bytes.to_vec(), config.clone())
        .decode()?
        .calibrate()?
        .segment()?
        .refine()?
        .measure()
        .into_result())
}
