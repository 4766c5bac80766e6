//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::analyze`] which runs the entire measurement in one
//! call, [`Pipeline`] lets the caller drive execution one step at a time:
//!
//! ```rust
//! # use leafmeter_pipeline::{Pipeline, PipelineConfig, PipelineError};
//! # fn run(png: Vec<u8>) -> Result<(), PipelineError> {
//! let analysis = Pipeline::new(png, PipelineConfig::default())
//!     .decode()?
//!     .calibrate()?
//!     .segment()?
//!     .refine()?
//!     .measure()
//!     .into_result();
//!
//! println!("{}", analysis.report);
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state,
//! carrying all previously computed intermediates. The configuration is
//! validated once, before the first pixel is decoded, so later stages
//! only fail on genuinely inconsistent data.
//!
//! # Refinement policy
//!
//! [`Segmented::refine`] turns raw segmentation masks into the masks
//! that are measured:
//!
//! 1. When a marker was found, its footprint (plus a small margin) is
//!    removed from every foreground class.
//! 2. With [`RefineConfig::exclude_veins`](crate::refine::RefineConfig::exclude_veins),
//!    `vein` pixels are subtracted from `damage`.
//! 3. `leaf`, `damage` and `foreground` are cleaned with the configured
//!    kernel and passes. Other classes are measured as segmented.
//! 4. The whole-leaf reference is the cleaned union of the segmented
//!    `leaf`, `damage` and `vein` masks when the method produces a
//!    `leaf` class, otherwise `foreground` when present. Veins are leaf
//!    tissue, so excluding them from damage never shrinks the leaf.
//! 5. With `keep_largest_leaf`, the reference shrinks to its largest
//!    connected region and `damage` is clipped to it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::area::{AreaMeasurement, measure, ratio};
use crate::marker::MarkerDetection;
use crate::refine::{MaskOp, cleanup, largest_component, refine};
use crate::segment::Segmentation;
use crate::types::{ClassTag, Dimensions, Mask, PipelineConfig, PipelineError, RgbImage, Warning};

/// Classes whose masks go through morphological cleanup.
const CLEANED_CLASSES: [ClassTag; 3] = [ClassTag::Leaf, ClassTag::Damage, ClassTag::Foreground];

/// Classes that together make up the whole leaf.
const TISSUE_CLASSES: [ClassTag; 3] = [ClassTag::Leaf, ClassTag::Damage, ClassTag::Vein];

/// Extra pixels cut around the marker to catch its anti-aliased rim.
const MARKER_MARGIN_PX: u8 = 2;

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// The source image bytes and config are stored but not yet touched.
/// Call [`decode`](Self::decode) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .decode() to continue"]
pub struct Pending {
    config: PipelineConfig,
    source: Vec<u8>,
}

impl Pending {
    /// The raw source image bytes.
    #[must_use]
    pub fn source(&self) -> &[u8] {
        &self.source
    }

    /// Validate the config, decode the source image and advance to the
    /// [`Decoded`] stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the config is out
    /// of range. Returns [`PipelineError::EmptyInput`] if the source
    /// bytes are empty, or [`PipelineError::ImageDecode`] if the format
    /// is unrecognized or the data is corrupt.
    pub fn decode(self) -> Result<Decoded, PipelineError> {
        self.config.validate()?;
        let image = crate::grayscale::decode(&self.source)?;
        log::debug!(
            "decoded {} bytes into {}x{} image",
            self.source.len(),
            image.width(),
            image.height(),
        );
        Ok(Decoded {
            config: self.config,
            image,
            source_len: self.source.len(),
        })
    }
}

// ───────────────────────── Stage 1: Decoded ──────────────────────────

/// Pipeline state after decoding the source image.
///
/// Call [`calibrate`](Self::calibrate) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .calibrate() to continue"]
pub struct Decoded {
    config: PipelineConfig,
    image: RgbImage,
    source_len: usize,
}

impl Decoded {
    /// The decoded RGB image.
    #[must_use]
    pub const fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Size of the encoded source in bytes (zero when the pipeline
    /// started from an already decoded image).
    #[must_use]
    pub const fn source_len(&self) -> usize {
        self.source_len
    }

    /// Image dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.image.width(),
            height: self.image.height(),
        }
    }

    /// Locate the calibration marker and advance to the [`Calibrated`]
    /// stage.
    ///
    /// A missing marker is recorded as
    /// [`Warning::CalibrationNotFound`], not an error.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the marker size is
    /// not a positive finite number.
    pub fn calibrate(self) -> Result<Calibrated, PipelineError> {
        let detection = crate::marker::calibrate(
            &self.image,
            self.config.marker_size,
            self.config.marker_family,
        )?;
        let mut warnings = Vec::new();
        if !detection.is_found() {
            log::warn!("{}", Warning::CalibrationNotFound);
            warnings.push(Warning::CalibrationNotFound);
        }
        Ok(Calibrated {
            config: self.config,
            image: self.image,
            detection,
            warnings,
        })
    }
}

// ───────────────────────── Stage 2: Calibrated ───────────────────────

/// Pipeline state after marker calibration.
///
/// Call [`segment`](Self::segment) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .segment() to continue"]
pub struct Calibrated {
    config: PipelineConfig,
    image: RgbImage,
    detection: MarkerDetection,
    warnings: Vec<Warning>,
}

impl Calibrated {
    /// The calibration outcome.
    #[must_use]
    pub const fn detection(&self) -> &MarkerDetection {
        &self.detection
    }

    /// Physical length per pixel, if a marker was found.
    #[must_use]
    pub const fn scale(&self) -> Option<f64> {
        self.detection.scale()
    }

    /// Blur the image (when `blur_sigma > 0`), segment it and advance to
    /// the [`Segmented`] stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the method's
    /// parameters are out of range.
    pub fn segment(self) -> Result<Segmented, PipelineError> {
        let smooth = crate::blur::gaussian_blur_rgb(&self.image, self.config.blur_sigma);
        let segmentation = crate::segment::segment(&smooth, &self.config.method)?;
        Ok(Segmented {
            config: self.config,
            image: self.image,
            detection: self.detection,
            warnings: self.warnings,
            segmentation,
        })
    }
}

// ───────────────────────── Stage 3: Segmented ────────────────────────

/// Pipeline state after segmentation.
///
/// Call [`refine`](Self::refine) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .refine() to continue"]
pub struct Segmented {
    config: PipelineConfig,
    image: RgbImage,
    detection: MarkerDetection,
    warnings: Vec<Warning>,
    segmentation: Segmentation,
}

impl Segmented {
    /// The raw segmentation masks.
    #[must_use]
    pub const fn segmentation(&self) -> &Segmentation {
        &self.segmentation
    }

    /// Apply the refinement policy (see the [module docs](crate::pipeline)) and
    /// advance to the [`Refined`] stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] for an invalid kernel
    /// size, or [`PipelineError::DimensionMismatch`] if two masks
    /// disagree in size.
    pub fn refine(self) -> Result<Refined, PipelineError> {
        let policy = &self.config.refine;
        let mut masks: BTreeMap<ClassTag, Mask> = self
            .segmentation
            .iter()
            .map(|(tag, mask)| (tag, mask.clone()))
            .collect();

        if let Some(marker) = self.detection.marker() {
            let footprint = marker.footprint(self.segmentation.dimensions(), MARKER_MARGIN_PX);
            for (tag, mask) in &mut masks {
                if tag.is_foreground() {
                    *mask = refine(mask, &footprint, MaskOp::Subtract)?;
                }
            }
        }

        let damage_raw = masks.get(&ClassTag::Damage).cloned();
        let tissue = if masks.contains_key(&ClassTag::Leaf) {
            let mut union: Option<Mask> = None;
            for mask in TISSUE_CLASSES.iter().filter_map(|tag| masks.get(tag)) {
                union = Some(match union {
                    Some(acc) => refine(&acc, mask, MaskOp::Union)?,
                    None => mask.clone(),
                });
            }
            union
        } else {
            None
        };

        if policy.exclude_veins
            && let (Some(damage), Some(vein)) =
                (masks.get(&ClassTag::Damage), masks.get(&ClassTag::Vein))
        {
            let without_veins = refine(damage, vein, MaskOp::Subtract)?;
            log::debug!(
                "vein exclusion removed {} damage pixels",
                damage.count() - without_veins.count(),
            );
            masks.insert(ClassTag::Damage, without_veins);
        }

        for tag in CLEANED_CLASSES {
            if let Some(mask) = masks.get_mut(&tag) {
                *mask = cleanup(mask, policy.kernel_size, &policy.passes)?;
            }
        }

        let mut leaf = match tissue {
            Some(tissue) => Some(cleanup(&tissue, policy.kernel_size, &policy.passes)?),
            None => masks.get(&ClassTag::Foreground).cloned(),
        };

        if policy.keep_largest_leaf
            && let Some(reference) = leaf.take()
        {
            let kept = largest_component(&reference);
            if let Some(damage) = masks.get(&ClassTag::Damage) {
                let clipped = refine(damage, &kept, MaskOp::Intersect)?;
                masks.insert(ClassTag::Damage, clipped);
            }
            leaf = Some(kept);
        }

        Ok(Refined {
            image: self.image,
            detection: self.detection,
            warnings: self.warnings,
            segmentation: self.segmentation,
            masks,
            leaf,
            damage_raw,
        })
    }
}

// ───────────────────────── Stage 4: Refined ──────────────────────────

/// Pipeline state after mask refinement.
///
/// Call [`measure`](Self::measure) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .measure() to continue"]
pub struct Refined {
    image: RgbImage,
    detection: MarkerDetection,
    warnings: Vec<Warning>,
    segmentation: Segmentation,
    masks: BTreeMap<ClassTag, Mask>,
    leaf: Option<Mask>,
    damage_raw: Option<Mask>,
}

impl Refined {
    /// Refined masks, one per segmented class.
    #[must_use]
    pub const fn masks(&self) -> &BTreeMap<ClassTag, Mask> {
        &self.masks
    }

    /// Whole-leaf reference mask, when the method defines one.
    #[must_use]
    pub const fn leaf(&self) -> Option<&Mask> {
        self.leaf.as_ref()
    }

    /// Convert every mask to an [`AreaMeasurement`] and advance to the
    /// [`Measured`] stage.
    ///
    /// Each foreground class with no pixels adds a
    /// [`Warning::EmptyRegion`].
    pub fn measure(self) -> Measured {
        let scale = self.detection.scale();
        let classes: Vec<ClassMeasurement> = self
            .masks
            .iter()
            .map(|(&tag, mask)| ClassMeasurement {
                tag,
                measurement: measure(mask, scale),
            })
            .collect();

        let mut warnings = self.warnings;
        for class in &classes {
            if class.tag.is_foreground() && class.measurement.pixel_count == 0 {
                let warning = Warning::EmptyRegion(class.tag);
                log::warn!("{warning}");
                warnings.push(warning);
            }
        }

        let leaf = self.leaf.as_ref().map(|mask| measure(mask, scale));
        let damage = self
            .masks
            .get(&ClassTag::Damage)
            .map(|mask| measure(mask, scale));
        let damage_raw = self.damage_raw.as_ref().map(|mask| measure(mask, scale));
        let damage_percent = leaf.zip(damage).map(|(leaf, damage)| ratio(&damage, &leaf));

        let report = AnalysisReport {
            dimensions: self.segmentation.dimensions(),
            method: self.segmentation.method().name().to_owned(),
            detection: self.detection.clone(),
            scale,
            classes,
            leaf,
            damage,
            damage_raw,
            damage_percent,
            warnings,
        };
        log::debug!(
            "measured {} classes, damage {:?}%",
            report.classes.len(),
            report.damage_percent,
        );

        Measured {
            analysis: Analysis {
                image: self.image,
                detection: self.detection,
                segmentation: self.segmentation,
                masks: self.masks,
                leaf: self.leaf,
                report,
            },
        }
    }
}

// ───────────────────────── Stage 5: Measured ─────────────────────────

/// Pipeline state after measurement. This is the final stage.
///
/// Call [`into_result`](Self::into_result) to extract the [`Analysis`].
#[must_use = "call .into_result() to extract the Analysis"]
pub struct Measured {
    analysis: Analysis,
}

impl Measured {
    /// The measurement report.
    #[must_use]
    pub const fn report(&self) -> &AnalysisReport {
        &self.analysis.report
    }

    /// Consume the pipeline and return every intermediate.
    #[must_use]
    pub fn into_result(self) -> Analysis {
        self.analysis
    }
}

// ───────────────────────── Results ───────────────────────────────────

/// Everything a pipeline run produced, for overlays and export.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// The decoded source image (unblurred).
    pub image: RgbImage,
    /// Calibration outcome.
    pub detection: MarkerDetection,
    /// Raw segmentation masks.
    pub segmentation: Segmentation,
    /// Refined masks that were measured.
    pub masks: BTreeMap<ClassTag, Mask>,
    /// Whole-leaf reference mask, when the method defines one.
    pub leaf: Option<Mask>,
    /// Numeric results.
    pub report: AnalysisReport,
}

/// Area of one class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMeasurement {
    /// Class the mask belongs to.
    pub tag: ClassTag,
    /// Its pixel count and physical area.
    #[serde(flatten)]
    pub measurement: AreaMeasurement,
}

/// Numeric outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Source image dimensions.
    pub dimensions: Dimensions,
    /// Segmentation method name.
    pub method: String,
    /// Calibration outcome.
    pub detection: MarkerDetection,
    /// Physical length per pixel; `None` without a marker.
    pub scale: Option<f64>,
    /// One entry per refined mask, in class order.
    pub classes: Vec<ClassMeasurement>,
    /// Whole-leaf reference area.
    pub leaf: Option<AreaMeasurement>,
    /// Damage area after refinement.
    pub damage: Option<AreaMeasurement>,
    /// Damage area as segmented, before vein exclusion and cleanup.
    pub damage_raw: Option<AreaMeasurement>,
    /// Damage as a percentage of the whole leaf.
    pub damage_percent: Option<f64>,
    /// Non-fatal conditions, in the order they were found.
    pub warnings: Vec<Warning>,
}

impl AnalysisReport {
    /// Measurement for `tag`, if the method produced that class.
    #[must_use]
    pub fn class(&self, tag: ClassTag) -> Option<&AreaMeasurement> {
        self.classes
            .iter()
            .find(|c| c.tag == tag)
            .map(|c| &c.measurement)
    }
}

impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Leaf Measurement Report\n{}", "=".repeat(60))?;
        writeln!(
            f,
            "Image: {}x{}  |  Method: {}",
            self.dimensions.width, self.dimensions.height, self.method,
        )?;
        match self.detection.marker() {
            Some(marker) => writeln!(
                f,
                "Marker: id {} edge {:.2}px  |  Scale: {:.6} units/px",
                marker.id, marker.edge_px, marker.units_per_pixel,
            )?,
            None => writeln!(f, "Marker: not found  |  Scale: undefined")?,
        }
        writeln!(f)?;

        writeln!(f, "{:<16} {:>12} {:>14}", "Class", "Pixels", "Area")?;
        writeln!(f, "{}", "-".repeat(44))?;
        let rows = self
            .classes
            .iter()
            .map(|c| (c.tag.to_string(), &c.measurement))
            .chain(self.leaf.as_ref().map(|m| ("leaf (total)".to_owned(), m)))
            .chain(self.damage_raw.as_ref().map(|m| ("damage (raw)".to_owned(), m)));
        for (name, m) in rows {
            let area = m.area.map_or_else(|| "-".to_owned(), |a| format!("{a:.4}"));
            writeln!(f, "{name:<16} {:>12} {area:>14}", m.pixel_count)?;
        }

        if let Some(pct) = self.damage_percent {
            writeln!(f)?;
            writeln!(f, "Damage: {pct:.2}% of leaf")?;
        }
        for warning in &self.warnings {
            writeln!(f, "warning: {warning}")?;
        }
        Ok(())
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental leaf measurement pipeline.
///
/// Created via [`Pipeline::new`] (encoded bytes) or
/// [`Pipeline::from_image`] (already decoded pixels). Each stage method
/// consumes the current state and returns the next, making it a
/// compile-time error to skip stages or call them out of order.
pub struct Pipeline;

impl Pipeline {
    /// Create a new pipeline from source image bytes and config.
    ///
    /// No processing is performed; call
    /// [`.decode()`](Pending::decode) to begin.
    #[allow(clippy::new_ret_no_self)]
    pub const fn new(image_bytes: Vec<u8>, config: PipelineConfig) -> Pending {
        Pending {
            config,
            source: image_bytes,
        }
    }

    /// Start from an already decoded image, skipping the decode stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the config is out
    /// of range, or [`PipelineError::EmptyInput`] for a zero-sized
    /// image.
    pub fn from_image(image: RgbImage, config: PipelineConfig) -> Result<Decoded, PipelineError> {
        config.validate()?;
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::EmptyInput);
        }
        Ok(Decoded {
            config,
            image,
            source_len: 0,
        })
    }
}
