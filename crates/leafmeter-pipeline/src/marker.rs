//! Fiducial marker detection and scale calibration.
//!
//! A square ArUco marker of known printed size lies next to the leaf.
//! Finding it gives the physical length of one pixel, which turns pixel
//! counts into areas.
//!
//! Detection works on the grayscale image:
//!
//! 1. Binarize at the Otsu level; dark pixels are candidates.
//! 2. Trace the outer border of every dark blob.
//! 3. Fit a quadrilateral to each border and reject borders that are
//!    not close to one.
//! 4. Push the quad out by half a pixel so its corners sit on pixel
//!    edges rather than on the centres of the outermost pixels.
//! 5. Sample the 7x7 cell grid by bilinear interpolation between the
//!    corners. The outer ring must be dark; the inner 5x5 bits are
//!    decoded in each of the four rotations.
//!
//! The rotation that decodes fixes which corner is the marker's own
//! top-left, so corners are reported in marker order no matter how the
//! sheet was photographed.

use image::{GrayImage, Luma, Rgb};
use imageproc::contours::{BorderType, find_contours};
use imageproc::distance_transform::Norm;
use serde::{Deserialize, Serialize};

use crate::grayscale::to_gray;
use crate::threshold::otsu_cut;
use crate::types::{Dimensions, Mask, PipelineError, Point, RgbImage};

/// Cells per marker side, including the one-cell black border.
pub const GRID_CELLS: usize = 7;

const DATA_CELLS: usize = GRID_CELLS - 2;

/// Smallest marker side, in pixels, that can still be sampled.
pub const MIN_MARKER_SIDE_PX: f64 = 14.0;

/// Row code words of the original ArUco encoding. Each data row holds
/// one word; the word's index is two bits of the marker ID.
const ARUCO_ORIGINAL_WORDS: [u8; 4] = [0b10000, 0b10111, 0b01001, 0b01110];

type Bits = [[bool; DATA_CELLS]; DATA_CELLS];
type Cells = [[bool; GRID_CELLS]; GRID_CELLS];

/// Marker encoding printed on the calibration sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerFamily {
    /// Original ArUco 5x5 encoding, IDs `0..1024`.
    #[default]
    ArucoOriginal,
}

impl MarkerFamily {
    /// Number of distinct IDs.
    #[must_use]
    pub const fn id_count(self) -> u16 {
        match self {
            Self::ArucoOriginal => 1024,
        }
    }

    const fn words(self) -> &'static [u8; 4] {
        match self {
            Self::ArucoOriginal => &ARUCO_ORIGINAL_WORDS,
        }
    }

    /// Inner 5x5 bit grid for `id`, `true` meaning a white cell.
    fn encode(self, id: u16) -> Option<Bits> {
        if id >= self.id_count() {
            return None;
        }
        let words = self.words();
        Some(std::array::from_fn(|r| {
            let symbol = usize::from((id >> (2 * (DATA_CELLS - 1 - r))) & 0b11);
            let word = words[symbol];
            std::array::from_fn(|c| (word >> (DATA_CELLS - 1 - c)) & 1 == 1)
        }))
    }

    /// ID encoded by an upright bit grid, if every row is a code word.
    #[allow(clippy::cast_possible_truncation)]
    fn decode(self, bits: &Bits) -> Option<u16> {
        bits.iter().try_fold(0u16, |id, row| {
            let word = row.iter().fold(0u8, |w, &bit| (w << 1) | u8::from(bit));
            let symbol = self.words().iter().position(|&w| w == word)?;
            Some((id << 2) | symbol as u16)
        })
    }
}

/// A decoded marker and the scale it implies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedMarker {
    /// Decoded marker ID.
    pub id: u16,
    /// Corners clockwise from the marker's own top-left, on pixel
    /// edges.
    pub corners: [Point; 4],
    /// Length of the top edge (corner 0 to corner 1) in pixels.
    pub edge_px: f64,
    /// Physical length of one pixel side: `marker_size / edge_px`.
    pub units_per_pixel: f64,
}

impl DetectedMarker {
    /// Pixels covered by the printed marker, grown by `margin` pixels on
    /// every side.
    ///
    /// The marker's dark cells pass any "darker than paper" test, so
    /// this area is cut out of the measured classes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn footprint(&self, dimensions: Dimensions, margin: u8) -> Mask {
        let poly: Vec<imageproc::point::Point<i32>> = self
            .corners
            .iter()
            .map(|c| imageproc::point::Point::new(c.x.round() as i32, c.y.round() as i32))
            .collect();
        let mut canvas = GrayImage::new(dimensions.width, dimensions.height);
        // `draw_polygon_mut` rejects an explicitly closed ring.
        if poly.first() != poly.last() {
            imageproc::drawing::draw_polygon_mut(&mut canvas, &poly, Luma([Mask::ON]));
        }
        if margin > 0 {
            canvas = imageproc::morphology::dilate(&canvas, Norm::LInf, margin);
        }
        Mask::from_gray(&canvas)
    }
}

/// Outcome of calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum MarkerDetection {
    /// No marker decoded; physical areas are undefined.
    NotFound,
    /// A marker was decoded.
    Found(DetectedMarker),
}

impl MarkerDetection {
    /// Returns `true` if a marker was decoded.
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// The decoded marker, if any.
    #[must_use]
    pub const fn marker(&self) -> Option<&DetectedMarker> {
        match self {
            Self::Found(m) => Some(m),
            Self::NotFound => None,
        }
    }

    /// Physical length per pixel, if calibrated.
    #[must_use]
    pub const fn scale(&self) -> Option<f64> {
        match self {
            Self::Found(m) => Some(m.units_per_pixel),
            Self::NotFound => None,
        }
    }
}

/// A marker found in an image, before scale is attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerCandidate {
    /// Decoded ID.
    pub id: u16,
    /// Corners clockwise from the marker's own top-left.
    pub corners: [Point; 4],
}

/// Reject marker sizes that cannot produce a positive finite scale.
pub(crate) fn validate_marker_size(marker_size: f64) -> Result<(), PipelineError> {
    if marker_size.is_finite() && marker_size > 0.0 {
        Ok(())
    } else {
        Err(PipelineError::invalid(
            "marker_size",
            format!("must be finite and > 0, got {marker_size}"),
        ))
    }
}

/// Locate a marker and derive the pixel scale.
///
/// When several markers are visible the lowest ID wins; equal IDs are
/// resolved by detection order. A missing marker is not an error.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] if `marker_size` is not
/// a positive finite number.
#[must_use = "returns the calibration result"]
pub fn calibrate(
    image: &RgbImage,
    marker_size: f64,
    family: MarkerFamily,
) -> Result<MarkerDetection, PipelineError> {
    validate_marker_size(marker_size)?;

    let candidates = detect_markers(image, family);
    log::debug!("{} marker(s) decoded", candidates.len());

    let Some(best) = candidates.into_iter().min_by_key(|c| c.id) else {
        return Ok(MarkerDetection::NotFound);
    };
    let edge_px = best.corners[0].distance(best.corners[1]);
    if !edge_px.is_finite() || edge_px <= 0.0 {
        return Ok(MarkerDetection::NotFound);
    }

    log::debug!("marker {} edge {edge_px:.2}px", best.id);
    Ok(MarkerDetection::Found(DetectedMarker {
        id: best.id,
        corners: best.corners,
        edge_px,
        units_per_pixel: marker_size / edge_px,
    }))
}

/// Every decodable marker in the image, in contour scan order.
#[must_use = "returns the decoded markers"]
pub fn detect_markers(image: &RgbImage, family: MarkerFamily) -> Vec<MarkerCandidate> {
    let gray = to_gray(image);
    let Some(level) = otsu_cut(&gray) else {
        return Vec::new();
    };
    let binary = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([if gray.get_pixel(x, y).0[0] <= level { 255 } else { 0 }])
    });

    find_contours::<i32>(&binary)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .filter_map(|contour| {
            let points: Vec<Point> = contour
                .points
                .iter()
                .map(|p| Point::new(f64::from(p.x), f64::from(p.y)))
                .collect();
            let quad = fit_quad(&points)?;
            let corners = expand_half_pixel(&quad);
            let cells = sample_cells(&gray, &corners, level)?;
            let (id, rotation) = decode_rotations(family, &cells)?;
            Some(MarkerCandidate {
                id,
                corners: std::array::from_fn(|i| corners[(i + rotation) % 4]),
            })
        })
        .collect()
}

/// `(a - o) x (b - o)`; positive when `b` is clockwise of `a` around
/// `o` in image coordinates.
fn cross(o: Point, a: Point, b: Point) -> f64 {
    (a.x - o.x).mul_add(b.y - o.y, -((a.y - o.y) * (b.x - o.x)))
}

fn farthest(points: &[Point], key: impl Fn(Point) -> f64) -> Option<Point> {
    points
        .iter()
        .copied()
        .max_by(|&a, &b| key(a).total_cmp(&key(b)))
}

fn segment_distance(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len2 = dx.mul_add(dx, dy * dy);
    if len2 == 0.0 {
        return p.distance(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    p.distance(Point::new(t.mul_add(dx, a.x), t.mul_add(dy, a.y)))
}

fn side_lengths(quad: &[Point; 4]) -> [f64; 4] {
    std::array::from_fn(|i| quad[i].distance(quad[(i + 1) % 4]))
}

/// Fit a quadrilateral to a closed border by farthest-point search.
///
/// Returns the corners clockwise, starting at the corner nearest the
/// image origin, or `None` if the border is too small or strays from
/// the fitted edges.
#[allow(clippy::cast_precision_loss)]
fn fit_quad(points: &[Point]) -> Option<[Point; 4]> {
    if points.len() < 4 {
        return None;
    }
    let n = points.len() as f64;
    let centroid = Point::new(
        points.iter().map(|p| p.x).sum::<f64>() / n,
        points.iter().map(|p| p.y).sum::<f64>() / n,
    );

    let a = farthest(points, |p| p.distance_squared(centroid))?;
    let c = farthest(points, |p| p.distance_squared(a))?;
    let b = farthest(points, |p| cross(a, c, p))?;
    let d = farthest(points, |p| -cross(a, c, p))?;
    if cross(a, c, b) <= 0.0 || cross(a, c, d) >= 0.0 {
        return None;
    }

    let mut quad = [a, b, c, d];
    let shoelace: f64 = (0..4)
        .map(|i| {
            let (p, q) = (quad[i], quad[(i + 1) % 4]);
            p.x.mul_add(q.y, -(q.x * p.y))
        })
        .sum();
    if shoelace < 0.0 {
        quad = [quad[0], quad[3], quad[2], quad[1]];
    }
    let start = (0..4)
        .min_by(|&i, &j| (quad[i].x + quad[i].y).total_cmp(&(quad[j].x + quad[j].y)))
        .unwrap_or(0);
    let quad: [Point; 4] = std::array::from_fn(|i| quad[(i + start) % 4]);

    // Border points sit on pixel centres, one pixel short of the side.
    let sides = side_lengths(&quad);
    if sides.iter().any(|&s| s + 1.0 < MIN_MARKER_SIDE_PX) {
        return None;
    }
    let mean_side = sides.iter().sum::<f64>() / 4.0;
    let tolerance = (0.06 * mean_side).max(1.5);
    let on_edges = points.iter().all(|&p| {
        (0..4)
            .map(|i| segment_distance(p, quad[i], quad[(i + 1) % 4]))
            .fold(f64::INFINITY, f64::min)
            <= tolerance
    });
    on_edges.then_some(quad)
}

/// Offset every edge outward by half a pixel and re-intersect.
fn expand_half_pixel(quad: &[Point; 4]) -> [Point; 4] {
    let direction = |i: usize| {
        let (a, b) = (quad[i], quad[(i + 1) % 4]);
        (b.x - a.x, b.y - a.y)
    };
    // Outward normal of a clockwise edge in image coordinates.
    let normal = |i: usize| {
        let (dx, dy) = direction(i);
        let len = dx.hypot(dy);
        (dy / len, -dx / len)
    };

    std::array::from_fn(|i| {
        let prev = (i + 3) % 4;
        let (np, ni) = (normal(prev), normal(i));
        let p1 = Point::new(0.5f64.mul_add(np.0, quad[prev].x), 0.5f64.mul_add(np.1, quad[prev].y));
        let p2 = Point::new(0.5f64.mul_add(ni.0, quad[i].x), 0.5f64.mul_add(ni.1, quad[i].y));
        let (d1, d2) = (direction(prev), direction(i));
        let denom = d1.0.mul_add(d2.1, -(d1.1 * d2.0));
        if denom.abs() < 1e-9 {
            return Point::new(
                0.5f64.mul_add(np.0 + ni.0, quad[i].x),
                0.5f64.mul_add(np.1 + ni.1, quad[i].y),
            );
        }
        let (ex, ey) = (p2.x - p1.x, p2.y - p1.y);
        let t = ex.mul_add(d2.1, -(ey * d2.0)) / denom;
        Point::new(t.mul_add(d1.0, p1.x), t.mul_add(d1.1, p1.y))
    })
}

/// Point at normalized `(u, v)` inside the quad.
fn bilinear(corners: &[Point; 4], u: f64, v: f64) -> Point {
    let [tl, tr, br, bl] = *corners;
    let weights = [(1.0 - u) * (1.0 - v), u * (1.0 - v), u * v, (1.0 - u) * v];
    let x = weights[0] * tl.x + weights[1] * tr.x + weights[2] * br.x + weights[3] * bl.x;
    let y = weights[0] * tl.y + weights[1] * tr.y + weights[2] * br.y + weights[3] * bl.y;
    Point::new(x, y)
}

/// Read the 7x7 grid; `true` is a white cell. `None` if the outer ring
/// is not entirely dark.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn sample_cells(gray: &GrayImage, corners: &[Point; 4], level: u8) -> Option<Cells> {
    let mean_side = side_lengths(corners).iter().sum::<f64>() / 4.0;
    let radius = (mean_side / GRID_CELLS as f64 / 4.0).floor() as i64;
    let (w, h) = (i64::from(gray.width()), i64::from(gray.height()));

    let mut cells: Cells = [[false; GRID_CELLS]; GRID_CELLS];
    for (r, row) in cells.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            let u = (c as f64 + 0.5) / GRID_CELLS as f64;
            let v = (r as f64 + 0.5) / GRID_CELLS as f64;
            let centre = bilinear(corners, u, v);
            let (cx, cy) = (centre.x.round() as i64, centre.y.round() as i64);

            let (mut sum, mut count) = (0u64, 0u64);
            for y in (cy - radius).max(0)..=(cy + radius).min(h - 1) {
                for x in (cx - radius).max(0)..=(cx + radius).min(w - 1) {
                    sum += u64::from(gray.get_pixel(x as u32, y as u32).0[0]);
                    count += 1;
                }
            }
            if count == 0 {
                return None;
            }
            *cell = sum > u64::from(level) * count;
        }
    }

    let last = GRID_CELLS - 1;
    let ring_dark =
        (0..GRID_CELLS).all(|i| !cells[0][i] && !cells[last][i] && !cells[i][0] && !cells[i][last]);
    ring_dark.then_some(cells)
}

/// Rotate a bit grid 90 degrees counter-clockwise.
fn rotate_ccw(bits: &Bits) -> Bits {
    std::array::from_fn(|r| std::array::from_fn(|c| bits[c][DATA_CELLS - 1 - r]))
}

/// Try the four orientations. Returns the ID and how many corner
/// positions the marker's top-left is from the sampled top-left.
fn decode_rotations(family: MarkerFamily, cells: &Cells) -> Option<(u16, usize)> {
    let mut bits: Bits = std::array::from_fn(|r| std::array::from_fn(|c| cells[r + 1][c + 1]));
    for rotation in 0..4 {
        if let Some(id) = family.decode(&bits) {
            return Some((id, rotation));
        }
        bits = rotate_ccw(&bits);
    }
    None
}

/// Render a printable marker, `side_px` square, black border included.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] if `id` is outside the
/// family or `side_px` is smaller than the 7-cell grid.
#[must_use = "returns the marker image"]
#[allow(clippy::cast_possible_truncation)]
pub fn render_marker(
    family: MarkerFamily,
    id: u16,
    side_px: u32,
) -> Result<GrayImage, PipelineError> {
    let Some(bits) = family.encode(id) else {
        return Err(PipelineError::invalid(
            "marker_id",
            format!("must be below {}, got {id}", family.id_count()),
        ));
    };
    if side_px < GRID_CELLS as u32 {
        return Err(PipelineError::invalid(
            "side_px",
            format!("must be at least {GRID_CELLS}, got {side_px}"),
        ));
    }

    let cell_of = |p: u32| (u64::from(p) * GRID_CELLS as u64 / u64::from(side_px)) as usize;
    Ok(GrayImage::from_fn(side_px, side_px, |x, y| {
        let (r, c) = (cell_of(y), cell_of(x));
        let inner = (1..=DATA_CELLS).contains(&r) && (1..=DATA_CELLS).contains(&c);
        let white = inner && bits[r - 1][c - 1];
        Luma([if white { 255 } else { 0 }])
    }))
}

/// Draw the marker outline on a copy of `image`, with a dot on the
/// marker's top-left corner.
#[must_use = "returns the annotated image"]
#[allow(clippy::cast_possible_truncation)]
pub fn draw_marker(image: &RgbImage, marker: &DetectedMarker, color: Rgb<u8>) -> RgbImage {
    let mut out = image.clone();
    let corners = marker.corners;
    for i in 0..4 {
        let (a, b) = (corners[i], corners[(i + 1) % 4]);
        imageproc::drawing::draw_line_segment_mut(
            &mut out,
            (a.x as f32, a.y as f32),
            (b.x as f32, b.y as f32),
            color,
        );
    }
    let radius = (marker.edge_px / 20.0).max(2.0) as i32;
    imageproc::drawing::draw_filled_circle_mut(
        &mut out,
        (corners[0].x.round() as i32, corners[0].y.round() as i32),
        radius,
        color,
    );
    out
}
