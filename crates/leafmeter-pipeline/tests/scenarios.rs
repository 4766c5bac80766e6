//! Integration tests: end-to-end measurement scenarios on synthetic photographs.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use image::Rgb;
use leafmeter_pipeline::cluster::ClusterParams;
use leafmeter_pipeline::edge::EdgeParams;
use leafmeter_pipeline::marker::render_marker;
use leafmeter_pipeline::threshold::AutoThresholdParams;
use leafmeter_pipeline::watershed::WatershedParams;
use leafmeter_pipeline::{
    ClassTag, MarkerFamily, PipelineConfig, RgbImage, SegmentMethod, Warning, analyze,
    calibrate, measure, ratio, segment,
};

const PAPER: Rgb<u8> = Rgb([240, 240, 240]);

/// Paste a rendered marker onto `canvas` with its top-left at `(x0, y0)`.
fn paste_marker(canvas: &mut RgbImage, id: u16, side: u32, x0: u32, y0: u32) {
    let marker = render_marker(MarkerFamily::ArucoOriginal, id, side).unwrap();
    for (x, y, p) in marker.enumerate_pixels() {
        let v = p.0[0];
        canvas.put_pixel(x0 + x, y0 + y, Rgb([v, v, v]));
    }
}

fn encode_png(img: &RgbImage) -> Vec<u8> {
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

fn all_methods() -> Vec<SegmentMethod> {
    vec![
        SegmentMethod::default(),
        SegmentMethod::AutoThreshold(AutoThresholdParams::default()),
        SegmentMethod::EdgeThreshold(EdgeParams::default()),
        SegmentMethod::Cluster(ClusterParams::default()),
        SegmentMethod::Watershed(WatershedParams::default()),
    ]
}

#[test]
fn forty_pixel_marker_gives_eighth_unit_scale() {
    // A 100-pixel leaf-colored patch well away from the marker.
    let mut img = RgbImage::from_fn(200, 200, |x, y| {
        if (140..150).contains(&x) && (130..140).contains(&y) {
            Rgb([40, 160, 60])
        } else {
            PAPER
        }
    });
    paste_marker(&mut img, 42, 40, 30, 40);

    let detection = calibrate(&img, 5.0, MarkerFamily::ArucoOriginal).unwrap();
    let marker = detection.marker().expect("marker should be found");
    assert_eq!(marker.id, 42);
    let scale = detection.scale().unwrap();
    assert!((scale - 0.125).abs() < 1e-9, "scale {scale}");

    let seg = segment(&img, &SegmentMethod::default()).unwrap();
    let leaf = seg.get(ClassTag::Leaf).unwrap();
    assert_eq!(leaf.count(), 100);
    let area = measure(leaf, Some(scale)).area.unwrap();
    assert!((area - 1.5625).abs() < 1e-6, "area {area}");

    let report = analyze(&encode_png(&img), &PipelineConfig::default())
        .unwrap()
        .report;
    let total = report.leaf.unwrap();
    assert_eq!(total.pixel_count, 100);
    assert!((total.area.unwrap() - 1.5625).abs() < 1e-6);
}

#[test]
fn scale_is_invariant_to_translation_and_quarter_turns() {
    let mut a = RgbImage::from_pixel(200, 200, PAPER);
    paste_marker(&mut a, 42, 40, 20, 30);
    let mut b = RgbImage::from_pixel(200, 200, PAPER);
    paste_marker(&mut b, 42, 40, 130, 110);
    let c = image::imageops::rotate90(&b);

    let scales: Vec<f64> = [a, b, c]
        .iter()
        .map(|img| {
            calibrate(img, 5.0, MarkerFamily::ArucoOriginal)
                .unwrap()
                .scale()
                .unwrap()
        })
        .collect();
    for s in &scales {
        assert!((s - scales[0]).abs() < 1e-9, "scales {scales:?}");
    }
}

#[test]
fn uniform_image_yields_empty_foreground_for_every_method() {
    let img = RgbImage::from_pixel(48, 48, PAPER);
    for method in all_methods() {
        let seg = segment(&img, &method).unwrap();
        for (tag, mask) in seg.iter() {
            assert_eq!(mask.dimensions(), seg.dimensions());
            if tag.is_foreground() {
                assert!(mask.is_blank(), "{} produced pixels in `{tag}`", method.name());
                let m = measure(mask, None);
                assert!(ratio(&m, &m).abs() < f64::EPSILON);
            }
        }
    }
}

#[test]
fn three_flat_regions_are_three_clusters() {
    let colors = [Rgb([240, 240, 240]), Rgb([40, 160, 60]), Rgb([200, 150, 40])];
    // Bands of 30, 20 and 10 columns on a 60x20 image.
    let img = RgbImage::from_fn(60, 20, |x, _| match x {
        0..30 => colors[0],
        30..50 => colors[1],
        _ => colors[2],
    });
    let method = SegmentMethod::Cluster(ClusterParams {
        k: 3,
        ..ClusterParams::default()
    });
    let seg = segment(&img, &method).unwrap();

    let counts: Vec<u64> = (0..3)
        .map(|k| seg.get(ClassTag::Cluster(k)).unwrap().count())
        .collect();
    assert_eq!(counts, vec![600, 400, 200]);
    assert_eq!(counts.iter().sum::<u64>(), 1200);
    assert!(seg.get(ClassTag::Cluster(1)).unwrap().get(40, 5));
}

#[test]
fn leaf_with_damage_is_measured_end_to_end() {
    let mut img = RgbImage::from_fn(300, 240, |x, y| {
        let leaf = (100..260).contains(&x) && (40..200).contains(&y);
        let damage = (150..190).contains(&x) && (90..120).contains(&y);
        match (leaf, damage) {
            (true, true) => Rgb([200, 150, 40]),
            (true, false) => Rgb([40, 160, 60]),
            _ => PAPER,
        }
    });
    paste_marker(&mut img, 3, 56, 20, 20);

    let config = PipelineConfig {
        marker_size: 7.0,
        ..PipelineConfig::default()
    };
    let analysis = analyze(&encode_png(&img), &config).unwrap();
    let report = &analysis.report;

    let scale = report.scale.unwrap();
    assert!((scale - 0.125).abs() < 1e-9, "scale {scale}");

    let leaf = report.leaf.unwrap();
    assert_eq!(leaf.pixel_count, 160 * 160);
    assert!((leaf.area.unwrap() - 400.0).abs() < 1e-6);

    let damage = report.damage.unwrap();
    assert_eq!(damage.pixel_count, 40 * 30);
    let pct = report.damage_percent.unwrap();
    assert!((pct - 100.0 * 1200.0 / 25_600.0).abs() < 1e-9, "pct {pct}");

    // No vein-colored pixels in this scene.
    assert_eq!(report.warnings, vec![Warning::EmptyRegion(ClassTag::Vein)]);
}

#[test]
fn photograph_without_marker_still_reports_percentages() {
    let img = RgbImage::from_fn(120, 120, |x, y| {
        let leaf = (20..100).contains(&x) && (20..100).contains(&y);
        let damage = (40..60).contains(&x) && (40..60).contains(&y);
        match (leaf, damage) {
            (true, true) => Rgb([200, 150, 40]),
            (true, false) => Rgb([40, 160, 60]),
            _ => PAPER,
        }
    });
    let analysis = analyze(&encode_png(&img), &PipelineConfig::default()).unwrap();
    let report = &analysis.report;

    assert!(report.warnings.contains(&Warning::CalibrationNotFound));
    assert_eq!(report.leaf.unwrap().area, None);
    let pct = report.damage_percent.unwrap();
    assert!((pct - 100.0 * 400.0 / 6400.0).abs() < 1e-9, "pct {pct}");
}
