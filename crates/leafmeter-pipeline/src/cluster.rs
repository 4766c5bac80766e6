//! k-means color clustering.
//!
//! Groups pixels by RGB similarity without any prior knowledge of leaf
//! or damage colors. Initial centers are chosen with k-means++ from a
//! seeded generator, so a given seed always yields the same masks.
//!
//! Clusters are relabelled by descending population: `cluster_0` is the
//! largest, which for a leaf photographed on paper is the paper.

use std::cmp::Ordering;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::segment::{SegmentDetails, SegmentMethod, Segmentation, Segmenter};
use crate::types::{ClassTag, Dimensions, Mask, PipelineError, RgbImage};

/// Upper bound on `k`; more clusters than this stop being meaningful
/// tissue classes.
pub const MAX_CLUSTERS: u8 = 16;

/// Parameters for [`SegmentMethod::Cluster`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    /// Number of clusters, `2..=16`.
    pub k: u8,
    /// Hard cap on Lloyd iterations per attempt.
    pub max_iterations: usize,
    /// Stop once no center moves further than this (RGB units).
    pub epsilon: f32,
    /// Independent restarts; the most compact result wins.
    pub attempts: u32,
    /// Seed for center initialisation.
    pub seed: u64,
}

impl ClusterParams {
    /// Default cluster count: background, healthy tissue, damage.
    pub const DEFAULT_K: u8 = 3;

    /// Default iteration cap.
    pub const DEFAULT_MAX_ITERATIONS: usize = 100;

    /// Default convergence threshold.
    pub const DEFAULT_EPSILON: f32 = 0.2;

    /// Default restart count.
    pub const DEFAULT_ATTEMPTS: u32 = 3;

    /// Default seed.
    pub const DEFAULT_SEED: u64 = 0x1eaf;
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            k: Self::DEFAULT_K,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            epsilon: Self::DEFAULT_EPSILON,
            attempts: Self::DEFAULT_ATTEMPTS,
            seed: Self::DEFAULT_SEED,
        }
    }
}

type Rgb = [f32; 3];

fn distance_squared(a: &Rgb, b: &Rgb) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(x - y);
            d * d
        })
        .sum()
}

/// Index of the nearest center; ties go to the lower index.
fn nearest(point: &Rgb, centers: &[Rgb]) -> (usize, f64) {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| (i, distance_squared(point, c)))
        .fold((0, f64::INFINITY), |best, cur| {
            if cur.1 < best.1 { cur } else { best }
        })
}

/// Result of one k-means run.
#[derive(Debug, Clone)]
struct KMeans {
    labels: Vec<usize>,
    centers: Vec<Rgb>,
    iterations: usize,
    compactness: f64,
}

/// k-means++ seeding: each further center is drawn with probability
/// proportional to its squared distance from the nearest chosen one.
fn seed_centers(points: &[Rgb], k: usize, rng: &mut StdRng) -> Vec<Rgb> {
    let mut centers = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())]);
    let mut d2: Vec<f64> = points
        .iter()
        .map(|p| distance_squared(p, &centers[0]))
        .collect();

    while centers.len() < k {
        let index = match WeightedIndex::new(&d2) {
            Ok(dist) => dist.sample(rng),
            // Every point coincides with a chosen center.
            Err(_) => rng.gen_range(0..points.len()),
        };
        let center = points[index];
        for (d, p) in d2.iter_mut().zip(points) {
            *d = d.min(distance_squared(p, &center));
        }
        centers.push(center);
    }
    centers
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn lloyd(points: &[Rgb], mut centers: Vec<Rgb>, params: &ClusterParams) -> KMeans {
    let k = centers.len();
    let mut labels = vec![0usize; points.len()];
    let mut iterations = 0;

    for iteration in 1..=params.max_iterations {
        for (label, p) in labels.iter_mut().zip(points) {
            *label = nearest(p, &centers).0;
        }

        let mut sums = vec![[0f64; 3]; k];
        let mut counts = vec![0usize; k];
        for (&label, p) in labels.iter().zip(points) {
            counts[label] += 1;
            for c in 0..3 {
                sums[label][c] += f64::from(p[c]);
            }
        }

        let mut shift = 0f64;
        for ((center, sum), &count) in centers.iter_mut().zip(&sums).zip(&counts) {
            // An empty cluster keeps its previous center.
            if count == 0 {
                continue;
            }
            let updated: Rgb = std::array::from_fn(|c| (sum[c] / count as f64) as f32);
            shift = shift.max(distance_squared(center, &updated).sqrt());
            *center = updated;
        }

        iterations = iteration;
        if shift <= f64::from(params.epsilon) {
            break;
        }
    }

    let mut compactness = 0.0;
    for (label, p) in labels.iter_mut().zip(points) {
        let (index, d2) = nearest(p, &centers);
        *label = index;
        compactness += d2;
    }

    KMeans {
        labels,
        centers,
        iterations,
        compactness,
    }
}

/// Run `attempts` seeded k-means restarts and keep the most compact.
fn best_of_attempts(points: &[Rgb], params: &ClusterParams) -> KMeans {
    let k = usize::from(params.k);
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<KMeans> = None;

    for attempt in 0..params.attempts {
        let run = lloyd(points, seed_centers(points, k, &mut rng), params);
        log::debug!(
            "k-means attempt {attempt}: {} iterations, compactness {:.1}",
            run.iterations,
            run.compactness
        );
        if best.as_ref().is_none_or(|b| run.compactness < b.compactness) {
            best = Some(run);
        }
    }

    best.unwrap_or_else(|| KMeans {
        labels: vec![0; points.len()],
        centers: vec![[0.0; 3]; k],
        iterations: 0,
        compactness: 0.0,
    })
}

fn compare_centers(a: &Rgb, b: &Rgb) -> Ordering {
    a[0].total_cmp(&b[0])
        .then(a[1].total_cmp(&b[1]))
        .then(a[2].total_cmp(&b[2]))
}

impl Segmenter for ClusterParams {
    fn validate(&self) -> Result<(), PipelineError> {
        if !(2..=MAX_CLUSTERS).contains(&self.k) {
            return Err(PipelineError::invalid(
                "cluster.k",
                format!("must be in 2..={MAX_CLUSTERS}, got {}", self.k),
            ));
        }
        if self.max_iterations == 0 {
            return Err(PipelineError::invalid(
                "cluster.max_iterations",
                "must be at least 1",
            ));
        }
        if self.attempts == 0 {
            return Err(PipelineError::invalid("cluster.attempts", "must be at least 1"));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(PipelineError::invalid(
                "cluster.epsilon",
                format!("must be finite and >= 0, got {}", self.epsilon),
            ));
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn segment(&self, image: &RgbImage) -> Segmentation {
        let (w, h) = (image.width(), image.height());
        let k = usize::from(self.k);
        let points: Vec<Rgb> = image
            .pixels()
            .map(|p| p.0.map(f32::from))
            .collect();

        let run = if points.is_empty() {
            KMeans {
                labels: Vec::new(),
                centers: vec![[0.0; 3]; k],
                iterations: 0,
                compactness: 0.0,
            }
        } else {
            best_of_attempts(&points, self)
        };

        let mut counts = vec![0u64; k];
        for &label in &run.labels {
            counts[label] += 1;
        }

        // Order by population, largest first; equal populations fall
        // back to center color so the labelling is total.
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| {
            counts[b]
                .cmp(&counts[a])
                .then_with(|| compare_centers(&run.centers[a], &run.centers[b]))
        });
        let masks: Vec<_> = order
            .iter()
            .enumerate()
            .map(|(new, &old)| {
                let mask = Mask::from_fn(w, h, |x, y| {
                    run.labels[y as usize * w as usize + x as usize] == old
                });
                (ClassTag::Cluster(new as u8), mask)
            })
            .collect();

        log::debug!(
            "k-means converged after {} iterations, counts {:?}",
            run.iterations,
            order.iter().map(|&i| counts[i]).collect::<Vec<_>>()
        );

        Segmentation::new(
            SegmentMethod::Cluster(*self),
            Dimensions {
                width: w,
                height: h,
            },
            masks,
            SegmentDetails::Cluster {
                centers: order.iter().map(|&i| run.centers[i]).collect(),
                counts: order.iter().map(|&i| counts[i]).collect(),
                iterations: run.iterations,
                compactness: run.compactness,
            },
        )
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::cast_possible_truncation
)]
mod tests {
    use super::*;

    /// Three flat vertical bands: 600, 400 and 200 pixels.
    fn three_bands() -> RgbImage {
        RgbImage::from_fn(60, 20, |x, _| match x {
            0..30 => image::Rgb([240, 240, 235]),
            30..50 => image::Rgb([40, 160, 60]),
            _ => image::Rgb([200, 150, 40]),
        })
    }

    fn counts(seg: &Segmentation) -> Vec<u64> {
        seg.iter().map(|(_, m)| m.count()).collect()
    }

    #[test]
    fn flat_regions_are_recovered_exactly() {
        let seg = ClusterParams::default().segment(&three_bands());
        assert_eq!(counts(&seg), vec![600, 400, 200]);
        let background = seg.get(ClassTag::Cluster(0)).unwrap();
        assert!(background.get(0, 0));
        assert!(seg.get(ClassTag::Cluster(1)).unwrap().get(35, 5));
        assert!(seg.get(ClassTag::Cluster(2)).unwrap().get(59, 19));
    }

    #[test]
    fn centers_follow_label_order() {
        let seg = ClusterParams::default().segment(&three_bands());
        let SegmentDetails::Cluster {
            centers, counts, ..
        } = seg.details()
        else {
            panic!("expected cluster details");
        };
        assert_eq!(counts, &vec![600, 400, 200]);
        assert_eq!(centers[1], [40.0, 160.0, 60.0]);
    }

    #[test]
    fn counts_sum_to_pixel_total() {
        let img = RgbImage::from_fn(23, 17, |x, y| {
            image::Rgb([(x * 11) as u8, (y * 13) as u8, ((x + y) * 5) as u8])
        });
        let params = ClusterParams {
            k: 5,
            ..ClusterParams::default()
        };
        let seg = params.segment(&img);
        assert_eq!(seg.len(), 5);
        assert_eq!(counts(&seg).iter().sum::<u64>(), 23 * 17);
    }

    #[test]
    fn same_seed_gives_same_masks() {
        let img = RgbImage::from_fn(30, 30, |x, y| {
            image::Rgb([(x * 8) as u8, (y * 8) as u8, 90])
        });
        let params = ClusterParams {
            k: 4,
            ..ClusterParams::default()
        };
        let a = params.segment(&img).into_masks();
        let b = params.segment(&img).into_masks();
        assert_eq!(a, b);
    }

    #[test]
    fn uniform_image_puts_everything_in_cluster_zero() {
        let img = RgbImage::from_pixel(10, 10, image::Rgb([250, 250, 250]));
        let seg = ClusterParams::default().segment(&img);
        assert_eq!(counts(&seg), vec![100, 0, 0]);
        assert!(
            seg.iter()
                .filter(|(tag, _)| tag.is_foreground())
                .all(|(_, m)| m.is_blank())
        );
    }

    #[test]
    fn iteration_cap_is_honored() {
        let img = RgbImage::from_fn(40, 40, |x, y| {
            image::Rgb([(x * 6) as u8, (y * 6) as u8, ((x * y) % 256) as u8])
        });
        let params = ClusterParams {
            k: 6,
            max_iterations: 2,
            epsilon: 0.0,
            ..ClusterParams::default()
        };
        let seg = params.segment(&img);
        let SegmentDetails::Cluster { iterations, .. } = seg.details() else {
            panic!("expected cluster details");
        };
        assert!(*iterations <= 2);
    }

    #[test]
    fn k_out_of_range_is_rejected() {
        for k in [0, 1, 17] {
            let params = ClusterParams {
                k,
                ..ClusterParams::default()
            };
            assert!(matches!(
                params.validate(),
                Err(PipelineError::InvalidParameter { ref field, .. }) if field == "cluster.k"
            ));
        }
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let params = ClusterParams {
            attempts: 0,
            ..ClusterParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn negative_epsilon_is_rejected() {
        let params = ClusterParams {
            epsilon: -0.1,
            ..ClusterParams::default()
        };
        assert!(params.validate().is_err());
    }
}
