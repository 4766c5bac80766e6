//! Region segmentation: turn a photograph into labelled binary masks.
//!
//! This module defines the [`Segmenter`] trait for pluggable
//! segmentation strategies and the [`SegmentMethod`] enum for selecting
//! which strategy to use at runtime.
//!
//! # Strategy pattern
//!
//! Each method yields a fixed set of class tags:
//!
//! | method | tags |
//! |---|---|
//! | [`RangeThreshold`](SegmentMethod::RangeThreshold) | one per configured class (default `leaf`, `damage`, `vein`) |
//! | [`AutoThreshold`](SegmentMethod::AutoThreshold) | `foreground` |
//! | [`EdgeThreshold`](SegmentMethod::EdgeThreshold) | `edge` |
//! | [`Cluster`](SegmentMethod::Cluster) | `cluster_0` .. `cluster_{k-1}` |
//! | [`Watershed`](SegmentMethod::Watershed) | `background`, `foreground`, `region_1..n`, `boundary`, `unknown` |
//!
//! All implementations live in the core layer with no I/O dependencies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterParams;
use crate::edge::EdgeParams;
use crate::range::RangeParams;
use crate::threshold::AutoThresholdParams;
use crate::types::{ClassTag, Dimensions, Mask, PipelineError, RgbImage};
use crate::watershed::WatershedParams;

/// Selects which segmentation strategy to use, with its parameters.
///
/// Serialized with a `method` tag, e.g.
/// `{"method": "cluster", "k": 3}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum SegmentMethod {
    /// Per-class HSV or grayscale intervals.
    RangeThreshold(RangeParams),
    /// Global Otsu threshold on the grayscale image.
    AutoThreshold(AutoThresholdParams),
    /// Sobel gradient magnitude, single or hysteresis threshold.
    EdgeThreshold(EdgeParams),
    /// k-means over RGB vectors.
    Cluster(ClusterParams),
    /// Marker-controlled watershed.
    Watershed(WatershedParams),
}

impl Default for SegmentMethod {
    fn default() -> Self {
        Self::RangeThreshold(RangeParams::default())
    }
}

impl SegmentMethod {
    /// Short name used in logs and reports.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RangeThreshold(_) => "range-threshold",
            Self::AutoThreshold(_) => "auto-threshold",
            Self::EdgeThreshold(_) => "edge-threshold",
            Self::Cluster(_) => "cluster",
            Self::Watershed(_) => "watershed",
        }
    }
}

/// Trait for segmentation strategies.
///
/// Input: an RGB image. Output: a [`Segmentation`] whose masks all share
/// the image's dimensions.
pub trait Segmenter {
    /// Reject out-of-range parameters before any pixel is processed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] naming the field.
    fn validate(&self) -> Result<(), PipelineError>;

    /// Segment the image. Parameters must already be validated.
    fn segment(&self, image: &RgbImage) -> Segmentation;
}

impl Segmenter for SegmentMethod {
    fn validate(&self) -> Result<(), PipelineError> {
        match self {
            Self::RangeThreshold(p) => p.validate(),
            Self::AutoThreshold(p) => p.validate(),
            Self::EdgeThreshold(p) => p.validate(),
            Self::Cluster(p) => p.validate(),
            Self::Watershed(p) => p.validate(),
        }
    }

    fn segment(&self, image: &RgbImage) -> Segmentation {
        match self {
            Self::RangeThreshold(p) => p.segment(image),
            Self::AutoThreshold(p) => p.segment(image),
            Self::EdgeThreshold(p) => p.segment(image),
            Self::Cluster(p) => p.segment(image),
            Self::Watershed(p) => p.segment(image),
        }
    }
}

/// Validate `method` and segment `image` with it.
///
/// An image with no foreground yields all-false masks, never an error.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] if the method's
/// parameters are out of range.
#[must_use = "returns the segmentation"]
pub fn segment(image: &RgbImage, method: &SegmentMethod) -> Result<Segmentation, PipelineError> {
    method.validate()?;
    let segmentation = method.segment(image);
    log::debug!(
        "{} produced {} masks on {}x{} image",
        method.name(),
        segmentation.len(),
        image.width(),
        image.height(),
    );
    Ok(segmentation)
}

/// Method-specific values derived while segmenting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SegmentDetails {
    /// Range thresholds derive nothing beyond the masks.
    Range,
    /// Otsu level; `None` for a uniform image.
    Threshold {
        /// Grayscale cut between the two classes.
        level: Option<u8>,
    },
    /// Largest gradient magnitude in the image.
    Edge {
        /// Peak Sobel magnitude.
        max_magnitude: f32,
    },
    /// Final k-means state, in label order.
    Cluster {
        /// RGB center of each cluster.
        centers: Vec<[f32; 3]>,
        /// Pixel count of each cluster.
        counts: Vec<u64>,
        /// Iterations run by the winning attempt.
        iterations: usize,
        /// Sum of squared distances to the assigned centers.
        compactness: f64,
    },
    /// Watershed labelling summary.
    Watershed {
        /// Otsu level of the initial threshold.
        level: Option<u8>,
        /// Number of seeded regions.
        regions: u32,
    },
}

/// The output of a segmentation: class tag → mask, plus the method
/// used and what it derived.
#[derive(Debug, Clone)]
pub struct Segmentation {
    method: SegmentMethod,
    dimensions: Dimensions,
    masks: BTreeMap<ClassTag, Mask>,
    details: SegmentDetails,
}

impl Segmentation {
    /// Assemble a segmentation. Every mask must match `dimensions`.
    pub(crate) fn new(
        method: SegmentMethod,
        dimensions: Dimensions,
        masks: impl IntoIterator<Item = (ClassTag, Mask)>,
        details: SegmentDetails,
    ) -> Self {
        let masks: BTreeMap<ClassTag, Mask> = masks.into_iter().collect();
        debug_assert!(masks.values().all(|m| m.dimensions() == dimensions));
        Self {
            method,
            dimensions,
            masks,
            details,
        }
    }

    /// The method and parameters that produced this result.
    #[must_use]
    pub const fn method(&self) -> &SegmentMethod {
        &self.method
    }

    /// Shared dimensions of every mask.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Method-specific derived values.
    #[must_use]
    pub const fn details(&self) -> &SegmentDetails {
        &self.details
    }

    /// The mask for `tag`, if the method produced one.
    #[must_use]
    pub fn get(&self, tag: ClassTag) -> Option<&Mask> {
        self.masks.get(&tag)
    }

    /// All masks in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (ClassTag, &Mask)> {
        self.masks.iter().map(|(&tag, mask)| (tag, mask))
    }

    /// All tags in order.
    pub fn tags(&self) -> impl Iterator<Item = ClassTag> + '_ {
        self.masks.keys().copied()
    }

    /// Number of masks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Returns `true` if the method produced no masks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Consume the segmentation and return its mask map.
    #[must_use]
    pub fn into_masks(self) -> BTreeMap<ClassTag, Mask> {
        self.masks
    }
}
