//! Seeded Lloyd's k-means with k-means++ initialization.
//!
//! Shared by the IVF families for coarse quantization and by IVF_PQ for its
//! sub-space codebooks. Cluster assignment is always squared L2, independent
//! of the search metric.

use crate::distance::l2_squared;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) const DEFAULT_ITERATIONS: usize = 10;

/// Trains `k` centroids over `rows` vectors of `dim` floats. `k` is clamped
/// to the number of rows; the returned buffer is `k_eff * dim` floats.
pub(crate) fn train(vectors: &[f32], dim: usize, k: usize, iterations: usize, seed: u64) -> Vec<f32> {
    let rows = vectors.len() / dim;
    let k = k.min(rows).max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = init_plus_plus(vectors, dim, rows, k, &mut rng);

    let mut assignment = vec![0usize; rows];
    for _ in 0..iterations.max(1) {
        for (row, slot) in assignment.iter_mut().enumerate() {
            *slot = nearest(&centroids, dim, &vectors[row * dim..(row + 1) * dim]);
        }

        let mut sums = vec![0.0f64; k * dim];
        let mut counts = vec![0usize; k];
        for (row, &cluster) in assignment.iter().enumerate() {
            counts[cluster] += 1;
            let src = &vectors[row * dim..(row + 1) * dim];
            let dst = &mut sums[cluster * dim..(cluster + 1) * dim];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s as f64;
            }
        }
        for cluster in 0..k {
            if counts[cluster] == 0 {
                // Empty cluster: re-seed from a random row.
                let row = rng.gen_range(0..rows);
                centroids[cluster * dim..(cluster + 1) * dim]
                    .copy_from_slice(&vectors[row * dim..(row + 1) * dim]);
                continue;
            }
            let inv = 1.0 / counts[cluster] as f64;
            for d in 0..dim {
                centroids[cluster * dim + d] = (sums[cluster * dim + d] * inv) as f32;
            }
        }
    }
    centroids
}

/// Index of the centroid closest (squared L2) to `vector`.
pub(crate) fn nearest(centroids: &[f32], dim: usize, vector: &[f32]) -> usize {
    let k = centroids.len() / dim;
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for c in 0..k {
        let dist = l2_squared(vector, &centroids[c * dim..(c + 1) * dim]);
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}

/// Centroid indices ordered by proximity to `vector`, closest first.
pub(crate) fn rank(centroids: &[f32], dim: usize, vector: &[f32]) -> Vec<usize> {
    let k = centroids.len() / dim;
    let mut scored: Vec<(usize, f32)> = (0..k)
        .map(|c| (c, l2_squared(vector, &centroids[c * dim..(c + 1) * dim])))
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    scored.into_iter().map(|(c, _)| c).collect()
}

fn init_plus_plus(
    vectors: &[f32],
    dim: usize,
    rows: usize,
    k: usize,
    rng: &mut StdRng,
) -> Vec<f32> {
    let mut centroids = Vec::with_capacity(k * dim);
    let first = rng.gen_range(0..rows);
    centroids.extend_from_slice(&vectors[first * dim..(first + 1) * dim]);

    let mut weights = vec![0.0f32; rows];
    while centroids.len() < k * dim {
        let chosen = centroids.len() / dim;
        let mut total = 0.0f32;
        for row in 0..rows {
            let v = &vectors[row * dim..(row + 1) * dim];
            let mut best = f32::MAX;
            for c in 0..chosen {
                best = best.min(l2_squared(v, &centroids[c * dim..(c + 1) * dim]));
            }
            weights[row] = best;
            total += best;
        }
        let row = if total <= f32::EPSILON {
            rng.gen_range(0..rows)
        } else {
            let mut target = rng.gen::<f32>() * total;
            let mut picked = rows - 1;
            for (row, w) in weights.iter().enumerate() {
                target -= w;
                if target <= 0.0 {
                    picked = row;
                    break;
                }
            }
            picked
        };
        centroids.extend_from_slice(&vectors[row * dim..(row + 1) * dim]);
    }
    centroids
}
