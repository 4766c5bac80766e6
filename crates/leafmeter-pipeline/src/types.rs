//! Shared types for the leafmeter measurement pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::marker::MarkerFamily;
use crate::refine::RefineConfig;
use crate::segment::{SegmentMethod, Segmenter};

/// Re-export `GrayImage` so downstream crates can reference
/// intermediate raster data without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbImage` so downstream crates can reference the
/// decoded source image without depending on `image` directly.
pub use image::RgbImage;

/// A 2D point in image coordinates.
///
/// Pixel centres sit on integer coordinates, so the outer edge of the
/// pixel at `(0, 0)` is the line `x = -0.5`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Total pixel count (`width * height`).
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Semantic class attached to a [`Mask`] inside a segmentation result.
///
/// Each segmentation method emits a fixed, documented set of tags (see
/// [`SegmentMethod`]). Tags order deterministically, so iteration over a
/// segmentation is stable between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassTag {
    /// Healthy leaf tissue.
    Leaf,
    /// Damaged (chewed, necrotic, discoloured) tissue.
    Damage,
    /// Vein structures.
    Vein,
    /// Paper or table behind the leaf.
    Background,
    /// Generic foreground from a two-class method.
    Foreground,
    /// Gradient-magnitude edge pixels.
    Edge,
    /// Watershed lines where two flooded regions meet.
    Boundary,
    /// Pixels no flood front reached.
    Unknown,
    /// One k-means cluster; `0` is the most populous.
    Cluster(u8),
    /// One watershed region, numbered from 1.
    Region(u32),
}

impl ClassTag {
    /// Whether this class marks something measured on the leaf rather
    /// than the scene around it.
    ///
    /// `cluster_0` is the dominant cluster, which in a marker-and-leaf
    /// photograph is the paper background.
    #[must_use]
    pub const fn is_foreground(self) -> bool {
        !matches!(
            self,
            Self::Background | Self::Boundary | Self::Unknown | Self::Cluster(0)
        )
    }
}

impl fmt::Display for ClassTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf => f.write_str("leaf"),
            Self::Damage => f.write_str("damage"),
            Self::Vein => f.write_str("vein"),
            Self::Background => f.write_str("background"),
            Self::Foreground => f.write_str("foreground"),
            Self::Edge => f.write_str("edge"),
            Self::Boundary => f.write_str("boundary"),
            Self::Unknown => f.write_str("unknown"),
            Self::Cluster(k) => write!(f, "cluster_{k}"),
            Self::Region(n) => write!(f, "region_{n}"),
        }
    }
}

/// A binary per-pixel classification grid.
///
/// Stored as a `GrayImage` holding only `0` (false) and `255` (true) so
/// that `imageproc` morphology and labelling operate on it directly.
/// Masks are never edited in place by the pipeline; every operation
/// returns a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask(GrayImage);

impl Mask {
    /// Pixel value used for set pixels.
    pub const ON: u8 = 255;

    /// An all-false mask.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self(GrayImage::new(width, height))
    }

    /// Build a mask by evaluating `f` at every pixel.
    #[must_use]
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> bool) -> Self {
        Self(GrayImage::from_fn(width, height, |x, y| {
            image::Luma([if f(x, y) { Self::ON } else { 0 }])
        }))
    }

    /// Interpret a grayscale image as a mask: any non-zero pixel is set.
    #[must_use]
    pub fn from_gray(gray: &GrayImage) -> Self {
        Self::from_fn(gray.width(), gray.height(), |x, y| {
            gray.get_pixel(x, y).0[0] != 0
        })
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Mask dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.0.width(),
            height: self.0.height(),
        }
    }

    /// Whether the pixel at `(x, y)` is set.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is outside the mask, like
    /// [`image::ImageBuffer::get_pixel`].
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.0.get_pixel(x, y).0[0] != 0
    }

    /// Number of set pixels.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.0.as_raw().iter().map(|&v| u64::from(v != 0)).sum()
    }

    /// Returns `true` if no pixel is set.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.as_raw().iter().all(|&v| v == 0)
    }

    /// Pixel-wise complement.
    #[must_use]
    pub fn invert(&self) -> Self {
        Self::from_fn(self.width(), self.height(), |x, y| !self.get(x, y))
    }

    /// Borrow the underlying 0/255 raster.
    #[must_use]
    pub const fn as_gray(&self) -> &GrayImage {
        &self.0
    }

    /// Consume the mask and return the underlying 0/255 raster.
    #[must_use]
    pub fn into_gray(self) -> GrayImage {
        self.0
    }

    /// Combine two equally sized masks pixel by pixel.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if the masks differ
    /// in size.
    pub(crate) fn zip_with(
        &self,
        other: &Self,
        f: impl Fn(bool, bool) -> bool,
    ) -> Result<Self, PipelineError> {
        ensure_same_dimensions(self.dimensions(), other.dimensions())?;
        let raw = self
            .0
            .as_raw()
            .iter()
            .zip(other.0.as_raw())
            .map(|(&a, &b)| if f(a != 0, b != 0) { Self::ON } else { 0 })
            .collect();
        GrayImage::from_raw(self.width(), self.height(), raw)
            .map(Self)
            .ok_or(PipelineError::DimensionMismatch {
                expected: self.dimensions(),
                actual: other.dimensions(),
            })
    }
}

/// Check that a raster matches the dimensions it is combined with.
pub(crate) fn ensure_same_dimensions(
    expected: Dimensions,
    actual: Dimensions,
) -> Result<(), PipelineError> {
    if expected == actual {
        Ok(())
    } else {
        Err(PipelineError::DimensionMismatch { expected, actual })
    }
}

/// Non-fatal conditions reported alongside a measurement.
///
/// A photograph without a marker, or a leaf without damage, is a normal
/// input. These are surfaced to the user rather than raised as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Warning {
    /// No fiducial marker was decoded; physical areas are undefined.
    CalibrationNotFound,
    /// A foreground class ended up with zero pixels.
    EmptyRegion(ClassTag),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CalibrationNotFound => f.write_str(
                "no calibration marker detected; areas are reported in pixels only",
            ),
            Self::EmptyRegion(tag) => write!(f, "class `{tag}` is empty"),
        }
    }
}

/// Configuration for the measurement pipeline.
///
/// Passed explicitly into every pipeline call; the core never reads
/// ambient state. Missing JSON fields fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Physical side length of the printed marker (any length unit;
    /// areas come out in that unit squared).
    pub marker_size: f64,

    /// Fiducial encoding printed on the marker.
    pub marker_family: MarkerFamily,

    /// Gaussian blur sigma applied to the segmentation input only.
    /// Zero disables the blur.
    pub blur_sigma: f32,

    /// Segmentation strategy and its parameters.
    pub method: SegmentMethod,

    /// Mask combination and morphological cleanup.
    pub refine: RefineConfig,
}

impl PipelineConfig {
    /// Default marker side length (centimetres in the usual print).
    pub const DEFAULT_MARKER_SIZE: f64 = 5.0;

    /// Default segmentation blur (disabled).
    pub const DEFAULT_BLUR_SIGMA: f32 = 0.0;

    /// Check every parameter before any pixel is touched.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        crate::marker::validate_marker_size(self.marker_size)?;
        if !self.blur_sigma.is_finite() || self.blur_sigma < 0.0 {
            return Err(PipelineError::invalid(
                "blur_sigma",
                format!("must be finite and >= 0, got {}", self.blur_sigma),
            ));
        }
        self.method.validate()?;
        self.refine.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            marker_size: Self::DEFAULT_MARKER_SIZE,
            marker_family: MarkerFamily::default(),
            blur_sigma: Self::DEFAULT_BLUR_SIGMA,
            method: SegmentMethod::default(),
            refine: RefineConfig::default(),
        }
    }
}

/// Errors that can occur during pipeline processing.
///
/// Missing markers and empty regions are not errors; they are reported
/// as [`Warning`]s in the result.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// A configuration value is out of range.
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter {
        /// Name of the offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Two rasters that must align have different sizes.
    #[error(
        "dimension mismatch: expected {}x{}, got {}x{}",
        expected.width,
        expected.height,
        actual.width,
        actual.height
    )]
    DimensionMismatch {
        /// Dimensions of the primary input.
        expected: Dimensions,
        /// Dimensions of the secondary input.
        actual: Dimensions,
    },
}

impl PipelineError {
    /// Shorthand for [`PipelineError::InvalidParameter`].
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
