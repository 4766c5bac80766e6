//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! [`analyze_with_diagnostics`] drives the staged [`Pipeline`] and
//! records how long each stage took and what it produced. Useful for
//! tuning segmentation ranges, kernel sizes and cluster counts against
//! a set of photographs.
//!
//! Timestamps come from a caller-supplied [`Clock`], keeping this crate
//! free of any platform time source. Durations are serialized as
//! fractional seconds (`f64`) for JSON compatibility, since
//! `std::time::Duration` does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::{Analysis, Pipeline};
use crate::types::{ClassTag, Mask, PipelineConfig, PipelineError};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of timestamps for stage timing.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current time.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 0: config validation and image decoding.
    pub decode: StageDiagnostics,
    /// Stage 1: marker calibration.
    pub calibrate: StageDiagnostics,
    /// Stage 2: optional blur and segmentation.
    pub segment: StageDiagnostics,
    /// Stage 3: mask combination and cleanup.
    pub refine: StageDiagnostics,
    /// Stage 4: area aggregation.
    pub measure: StageDiagnostics,
    /// Total wall-clock duration of the entire pipeline (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Image decoding metrics.
    Decode {
        /// Size of the input image bytes (zero for a pre-decoded image).
        input_bytes: usize,
        /// Decoded image width in pixels.
        width: u32,
        /// Decoded image height in pixels.
        height: u32,
        /// Total pixel count (`width * height`).
        pixel_count: u64,
    },
    /// Marker calibration metrics.
    Calibrate {
        /// Decoded marker ID, if any.
        marker_id: Option<u16>,
        /// Marker edge length in pixels, if any.
        edge_px: Option<f64>,
        /// Physical length per pixel, if any.
        scale: Option<f64>,
    },
    /// Segmentation metrics.
    Segment {
        /// Method name.
        method: String,
        /// Blur sigma applied before segmentation (zero when disabled).
        blur_sigma: f32,
        /// Number of masks produced.
        mask_count: usize,
        /// Set pixels across foreground classes.
        foreground_pixels: u64,
    },
    /// Refinement metrics.
    Refine {
        /// Structuring element side.
        kernel_size: u32,
        /// Number of cleanup passes.
        pass_count: usize,
        /// Foreground pixels before refinement.
        pixels_before: u64,
        /// Foreground pixels after refinement.
        pixels_after: u64,
    },
    /// Aggregation metrics.
    Measure {
        /// Number of measured classes.
        class_count: usize,
        /// Number of warnings raised so far.
        warning_count: usize,
        /// Damage percentage, when defined.
        damage_percent: Option<f64>,
    },
}

/// High-level summary for the entire pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Source image width in pixels.
    pub image_width: u32,
    /// Source image height in pixels.
    pub image_height: u32,
    /// Total pixel count.
    pub pixel_count: u64,
    /// Physical length per pixel, if calibrated.
    pub scale: Option<f64>,
    /// Whole-leaf pixel count, when the method defines a leaf.
    pub leaf_pixels: Option<u64>,
    /// Damage percentage, when defined.
    pub damage_percent: Option<f64>,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.summary.image_width, self.summary.image_height, self.summary.pixel_count,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let stages = [
            ("Decode", &self.decode),
            ("Calibrate", &self.calibrate),
            ("Segment", &self.segment),
            ("Refine", &self.refine),
            ("Measure", &self.measure),
        ];
        for (name, diag) in stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Scale: {}  |  Leaf pixels: {}  |  Damage: {}",
            self.summary
                .scale
                .map_or_else(|| "undefined".to_owned(), |s| format!("{s:.6}")),
            self.summary
                .leaf_pixels
                .map_or_else(|| "-".to_owned(), |n| n.to_string()),
            self.summary
                .damage_percent
                .map_or_else(|| "-".to_owned(), |p| format!("{p:.2}%")),
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Decode {
            input_bytes,
            width,
            height,
            ..
        } => format!("{input_bytes} bytes -> {width}x{height}"),
        StageMetrics::Calibrate {
            marker_id: Some(id),
            edge_px,
            scale,
        } => format!(
            "marker {id} edge={:.2}px scale={:.6}",
            edge_px.unwrap_or_default(),
            scale.unwrap_or_default(),
        ),
        StageMetrics::Calibrate { .. } => "no marker".to_owned(),
        StageMetrics::Segment {
            method,
            blur_sigma,
            mask_count,
            foreground_pixels,
        } => format!("{method} sigma={blur_sigma:.2} masks={mask_count} fg={foreground_pixels}"),
        StageMetrics::Refine {
            kernel_size,
            pass_count,
            pixels_before,
            pixels_after,
        } => format!("k={kernel_size} passes={pass_count} fg={pixels_before}->{pixels_after}"),
        StageMetrics::Measure {
            class_count,
            warning_count,
            damage_percent,
        } => {
            let damage = damage_percent.map_or_else(|| "-".to_owned(), |p| format!("{p:.2}%"));
            format!("{class_count} classes, {warning_count} warnings, damage={damage}")
        }
    }
}

/// Set pixels across the foreground classes of a mask collection.
pub(crate) fn foreground_pixels<'a>(masks: impl IntoIterator<Item = (ClassTag, &'a Mask)>) -> u64 {
    masks
        .into_iter()
        .filter(|(tag, _)| tag.is_foreground())
        .map(|(_, mask)| mask.count())
        .sum()
}

/// Run the whole pipeline and time each stage with `clock`.
///
/// # Errors
///
/// Returns the same errors as [`crate::analyze`].
pub fn analyze_with_diagnostics<C: Clock>(
    image_bytes: &[u8],
    config: &PipelineConfig,
    clock: &C,
) -> Result<(Analysis, PipelineDiagnostics), PipelineError> {
    let total_start = clock.now();

    let start = clock.now();
    let decoded = Pipeline::new(image_bytes.to_vec(), config.clone()).decode()?;
    let dimensions = decoded.dimensions();
    let decode = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Decode {
            input_bytes: decoded.source_len(),
            width: dimensions.width,
            height: dimensions.height,
            pixel_count: dimensions.pixel_count(),
        },
    };

    let start = clock.now();
    let calibrated = decoded.calibrate()?;
    let marker = calibrated.detection().marker();
    let calibrate = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Calibrate {
            marker_id: marker.map(|m| m.id),
            edge_px: marker.map(|m| m.edge_px),
            scale: calibrated.scale(),
        },
    };

    let start = clock.now();
    let segmented = calibrated.segment()?;
    let pixels_before = foreground_pixels(segmented.segmentation().iter());
    let segment = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Segment {
            method: config.method.name().to_owned(),
            blur_sigma: config.blur_sigma,
            mask_count: segmented.segmentation().len(),
            foreground_pixels: pixels_before,
        },
    };

    let start = clock.now();
    let refined = segmented.refine()?;
    let refine = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Refine {
            kernel_size: config.refine.kernel_size,
            pass_count: config.refine.passes.len(),
            pixels_before,
            pixels_after: foreground_pixels(refined.masks().iter().map(|(&t, m)| (t, m))),
        },
    };

    let start = clock.now();
    let analysis = refined.measure().into_result();
    let report = &analysis.report;
    let measure = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Measure {
            class_count: report.classes.len(),
            warning_count: report.warnings.len(),
            damage_percent: report.damage_percent,
        },
    };

    let summary = PipelineSummary {
        image_width: dimensions.width,
        image_height: dimensions.height,
        pixel_count: dimensions.pixel_count(),
        scale: report.scale,
        leaf_pixels: report.leaf.map(|m| m.pixel_count),
        damage_percent: report.damage_percent,
    };
    let diagnostics = PipelineDiagnostics {
        decode,
        calibrate,
        segment,
        refine,
        measure,
        total_duration: clock.elapsed(&total_start),
        summary,
    };
    Ok((analysis, diagnostics))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// Clock that advances one millisecond per reading.
    struct TickClock(Cell<u64>);

    impl Clock for TickClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.now() - since)
        }
    }

    fn leaf_png() -> Vec<u8> {
        let img = image::RgbImage::from_fn(40, 40, |x, y| {
            if (10..30).contains(&x) && (10..30).contains(&y) {
                image::Rgb([40, 160, 60])
            } else {
                image::Rgb([240, 240, 240])
            }
        });
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgb8,
        )
        .unwrap();
        buf
    }

    fn stage(ms: u64, metrics: StageMetrics) -> StageDiagnostics {
        StageDiagnostics {
            duration: Duration::from_millis(ms),
            metrics,
        }
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        let ms = duration_ms(d);
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn foreground_pixels_skips_scene_classes() {
        let full = Mask::from_fn(4, 4, |_, _| true);
        let masks = [
            (ClassTag::Leaf, &full),
            (ClassTag::Background, &full),
            (ClassTag::Cluster(0), &full),
        ];
        assert_eq!(foreground_pixels(masks), 16);
    }

    #[test]
    fn diagnostics_follow_the_run() {
        let clock = TickClock(Cell::new(0));
        let (analysis, diag) =
            analyze_with_diagnostics(&leaf_png(), &PipelineConfig::default(), &clock).unwrap();

        assert_eq!(diag.summary.pixel_count, 1600);
        assert_eq!(diag.summary.leaf_pixels, Some(400));
        assert_eq!(diag.summary.scale, None);
        assert!(matches!(
            diag.calibrate.metrics,
            StageMetrics::Calibrate {
                marker_id: None,
                ..
            }
        ));
        assert_eq!(analysis.report.leaf.unwrap().pixel_count, 400);

        let stages = [
            &diag.decode,
            &diag.calibrate,
            &diag.segment,
            &diag.refine,
            &diag.measure,
        ];
        let sum: Duration = stages.iter().map(|s| s.duration).sum();
        assert!(diag.total_duration >= sum);
    }

    #[test]
    fn diagnostics_propagate_errors() {
        let clock = TickClock(Cell::new(0));
        let result = analyze_with_diagnostics(&[], &PipelineConfig::default(), &clock);
        assert!(matches!(result, Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn report_produces_table() {
        let diag = PipelineDiagnostics {
            decode: stage(
                10,
                StageMetrics::Decode {
                    input_bytes: 1000,
                    width: 100,
                    height: 100,
                    pixel_count: 10_000,
                },
            ),
            calibrate: stage(
                20,
                StageMetrics::Calibrate {
                    marker_id: Some(42),
                    edge_px: Some(40.0),
                    scale: Some(0.125),
                },
            ),
            segment: stage(
                30,
                StageMetrics::Segment {
                    method: "range-threshold".to_owned(),
                    blur_sigma: 0.0,
                    mask_count: 3,
                    foreground_pixels: 900,
                },
            ),
            refine: stage(
                15,
                StageMetrics::Refine {
                    kernel_size: 5,
                    pass_count: 2,
                    pixels_before: 900,
                    pixels_after: 850,
                },
            ),
            measure: stage(
                1,
                StageMetrics::Measure {
                    class_count: 3,
                    warning_count: 0,
                    damage_percent: Some(12.5),
                },
            ),
            total_duration: Duration::from_millis(76),
            summary: PipelineSummary {
                image_width: 100,
                image_height: 100,
                pixel_count: 10_000,
                scale: Some(0.125),
                leaf_pixels: Some(800),
                damage_percent: Some(12.5),
            },
        };

        let report = diag.report();
        assert!(report.contains("Pipeline Diagnostics Report"));
        assert!(report.contains("marker 42 edge=40.00px"));
        assert!(report.contains("fg=900->850"));
        assert!(report.contains("Damage: 12.50%"));

        let json = serde_json::to_string(&diag).unwrap();
        let back: PipelineDiagnostics = serde_json::from_str(&json).unwrap();
        assert!((back.refine.duration.as_secs_f64() - 0.015).abs() < 1e-9);
    }
}
