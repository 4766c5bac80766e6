//! leafmeter: measure leaf area and damage from a photograph.
//!
//! Reads an image containing a leaf and a printed ArUco marker, runs the
//! measurement pipeline and prints the areas. Optionally writes overlay
//! images for checking the segmentation by eye, and renders printable
//! markers.
//!
//! # Usage
//!
//! ```text
//! leafmeter analyze [OPTIONS] <IMAGE_PATH>
//! leafmeter marker --id 42 --size-px 700 --out marker.png
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use leafmeter_pipeline::cluster::ClusterParams;
use leafmeter_pipeline::diagnostics::{Clock, PipelineDiagnostics, analyze_with_diagnostics};
use leafmeter_pipeline::edge::EdgeParams;
use leafmeter_pipeline::overlay::{class_color, highlight, render_clusters};
use leafmeter_pipeline::threshold::{AutoThresholdParams, Polarity};
use leafmeter_pipeline::watershed::WatershedParams;
use leafmeter_pipeline::{
    Analysis, AnalysisReport, MarkerFamily, PipelineConfig, RefineConfig, RgbImage, SegmentMethod,
};
use serde::Serialize;

/// Leaf area and damage measurement calibrated by a printed marker.
#[derive(Parser)]
#[command(name = "leafmeter", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure the leaf in a photograph.
    Analyze(AnalyzeArgs),
    /// Render a printable calibration marker.
    Marker(MarkerArgs),
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Physical side length of the printed marker.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MARKER_SIZE)]
    marker_size: f64,

    /// Gaussian blur sigma applied before segmentation (0 disables).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_BLUR_SIGMA)]
    blur_sigma: f32,

    /// Segmentation method.
    #[arg(long, value_enum, default_value_t = Method::Range)]
    method: Method,

    /// Which side of the Otsu level is foreground (auto-threshold).
    #[arg(long, value_enum, default_value_t = Side::Dark)]
    polarity: Side,

    /// Gradient threshold (edge-threshold).
    #[arg(long, default_value_t = EdgeParams::DEFAULT_LOW)]
    edge_low: f32,

    /// Hysteresis seed threshold (edge-threshold).
    #[arg(long, default_value_t = EdgeParams::DEFAULT_HIGH)]
    edge_high: f32,

    /// Keep every pixel above --edge-low instead of using hysteresis.
    #[arg(long)]
    single_threshold: bool,

    /// Number of clusters (cluster).
    #[arg(long, default_value_t = ClusterParams::DEFAULT_K)]
    k: u8,

    /// Seed for cluster initialisation (cluster).
    #[arg(long, default_value_t = ClusterParams::DEFAULT_SEED)]
    seed: u64,

    /// Side of the square cleanup kernel (odd, 3-255).
    #[arg(long, default_value_t = RefineConfig::DEFAULT_KERNEL_SIZE)]
    kernel_size: u32,

    /// Keep vein pixels in the damage mask.
    #[arg(long)]
    keep_veins: bool,

    /// Measure only the largest connected leaf region.
    #[arg(long)]
    largest_leaf: bool,

    /// Pipeline config as a JSON file.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    #[arg(long, conflicts_with = "config_json")]
    config: Option<PathBuf>,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,

    /// Output the report as JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// Print per-stage timing diagnostics.
    #[arg(long)]
    diagnostics: bool,

    /// Write the image with every measured class tinted.
    #[arg(long)]
    overlay: Option<PathBuf>,

    /// Write the image with everything outside the leaf blacked out.
    #[arg(long)]
    highlight: Option<PathBuf>,

    /// Write the cluster-center rendering (cluster method only).
    #[arg(long)]
    clusters: Option<PathBuf>,
}

#[derive(Args)]
struct MarkerArgs {
    /// Marker ID (0-1023).
    #[arg(long, default_value_t = 0)]
    id: u16,

    /// Marker side in pixels, black border included.
    #[arg(long, default_value_t = 700)]
    size_px: u32,

    /// White margin around the marker in pixels.
    #[arg(long, default_value_t = 70)]
    margin: u32,

    /// Output image path.
    #[arg(long)]
    out: PathBuf,
}

/// Segmentation method selection.
#[derive(Clone, Copy, ValueEnum)]
enum Method {
    /// Per-class HSV ranges (leaf, damage, vein).
    Range,
    /// Global Otsu threshold.
    Auto,
    /// Sobel gradient magnitude.
    Edge,
    /// k-means over RGB.
    Cluster,
    /// Marker-controlled watershed.
    Watershed,
}

/// Auto-threshold polarity selection.
#[derive(Clone, Copy, ValueEnum)]
enum Side {
    /// Pixels at or below the level.
    Dark,
    /// Pixels above the level.
    Bright,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// A JSON config (string or file) replaces the individual flags
/// entirely; otherwise a config is assembled from them.
fn config_from_cli(args: &AnalyzeArgs) -> Result<PipelineConfig, String> {
    if let Some(ref json) = args.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }
    if let Some(ref path) = args.config {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        return serde_json::from_str(&text)
            .map_err(|e| format!("Error parsing {}: {e}", path.display()));
    }

    let method = match args.method {
        Method::Range => SegmentMethod::default(),
        Method::Auto => SegmentMethod::AutoThreshold(AutoThresholdParams {
            polarity: match args.polarity {
                Side::Dark => Polarity::Dark,
                Side::Bright => Polarity::Bright,
            },
        }),
        Method::Edge => SegmentMethod::EdgeThreshold(EdgeParams {
            low: args.edge_low,
            high: (!args.single_threshold).then_some(args.edge_high),
        }),
        Method::Cluster => SegmentMethod::Cluster(ClusterParams {
            k: args.k,
            seed: args.seed,
            ..ClusterParams::default()
        }),
        Method::Watershed => SegmentMethod::Watershed(WatershedParams::default()),
    };

    Ok(PipelineConfig {
        marker_size: args.marker_size,
        marker_family: MarkerFamily::default(),
        blur_sigma: args.blur_sigma,
        method,
        refine: RefineConfig {
            exclude_veins: !args.keep_veins,
            kernel_size: args.kernel_size,
            keep_largest_leaf: args.largest_leaf,
            ..RefineConfig::default()
        },
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Analyze(ref args) => run_analyze(args),
        Command::Marker(ref args) => run_marker(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            log::error!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn run_analyze(args: &AnalyzeArgs) -> Result<(), String> {
    let config = config_from_cli(args)?;
    let image_bytes = std::fs::read(&args.image_path)
        .map_err(|e| format!("Error reading {}: {e}", args.image_path.display()))?;
    log::info!(
        "Image: {} ({} bytes), method {}",
        args.image_path.display(),
        image_bytes.len(),
        config.method.name(),
    );
    log::debug!("Config: {config:#?}");

    let (analysis, diagnostics) = analyze_with_diagnostics(&image_bytes, &config, &StdClock)
        .map_err(|e| format!("Pipeline error: {e}"))?;

    if args.json {
        let output = JsonOutput {
            report: &analysis.report,
            diagnostics: args.diagnostics.then_some(&diagnostics),
        };
        let json = serde_json::to_string_pretty(&output)
            .map_err(|e| format!("Error serializing report: {e}"))?;
        println!("{json}");
    } else {
        println!("{}", analysis.report);
        if args.diagnostics {
            eprintln!("{}", diagnostics.report());
        }
    }

    if let Some(ref path) = args.overlay {
        save(&overlay_all(&analysis)?, path)?;
    }
    if let Some(ref path) = args.highlight {
        let Some(ref leaf) = analysis.leaf else {
            return Err(format!(
                "--highlight needs a leaf mask, which {} does not produce",
                config.method.name(),
            ));
        };
        let highlighted = highlight(&analysis.image, leaf).map_err(|e| e.to_string())?;
        save(&highlighted, path)?;
    }
    if let Some(ref path) = args.clusters {
        let Some(rendered) = render_clusters(&analysis.segmentation) else {
            return Err("--clusters needs --method cluster".to_owned());
        };
        save(&rendered, path)?;
    }
    Ok(())
}

/// Shape of `--json` output.
#[derive(Serialize)]
struct JsonOutput<'a> {
    report: &'a AnalysisReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<&'a PipelineDiagnostics>,
}

/// Tint every measured foreground class and outline the marker.
fn overlay_all(analysis: &Analysis) -> Result<RgbImage, String> {
    let mut out = analysis.image.clone();
    for (&tag, mask) in analysis.masks.iter().filter(|(t, _)| t.is_foreground()) {
        out = leafmeter_pipeline::render_overlay(&out, mask, class_color(tag))
            .map_err(|e| e.to_string())?;
    }
    if let Some(marker) = analysis.detection.marker() {
        out = leafmeter_pipeline::marker::draw_marker(&out, marker, image::Rgb([0, 120, 255]));
    }
    Ok(out)
}

fn run_marker(args: &MarkerArgs) -> Result<(), String> {
    let marker = leafmeter_pipeline::marker::render_marker(
        MarkerFamily::ArucoOriginal,
        args.id,
        args.size_px,
    )
    .map_err(|e| e.to_string())?;

    let side = args.size_px + 2 * args.margin;
    let mut page = image::GrayImage::from_pixel(side, side, image::Luma([255]));
    image::imageops::overlay(
        &mut page,
        &marker,
        i64::from(args.margin),
        i64::from(args.margin),
    );
    page.save(&args.out)
        .map_err(|e| format!("Error writing {}: {e}", args.out.display()))?;
    log::info!(
        "Marker {} written to {} ({side}x{side} px)",
        args.id,
        args.out.display(),
    );
    Ok(())
}

fn save(image: &RgbImage, path: &Path) -> Result<(), String> {
    image
        .save(path)
        .map_err(|e| format!("Error writing {}: {e}", path.display()))?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}
