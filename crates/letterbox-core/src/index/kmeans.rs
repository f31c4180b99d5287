//! Deterministic k-means used to train the clustered index.
//!
//! Assignment uses inner product, matching the search metric. Centroids are
//! seeded from evenly spaced vectors so the same input always produces the
//! same clustering, which keeps rebuilt indexes comparable.

use crate::embedding::dot;

const MAX_ITERATIONS: usize = 20;

pub(crate) struct Clustering {
    pub centroids: Vec<Vec<f32>>,
    /// Vector positions per centroid.
    pub lists: Vec<Vec<u32>>,
}

/// Cluster count for a corpus of `n` vectors: one list per ten vectors,
/// capped at 4096, at least one.
pub(crate) fn cluster_count(n: usize) -> usize {
    (n / 10).clamp(1, 4096)
}

/// Index of the centroid with the highest inner product against `v`.
pub(crate) fn nearest(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let s = dot(c, v);
        if s > best_score {
            best = i;
            best_score = s;
        }
    }
    best
}

/// Train `k` clusters over `vectors` (all of length `dim`).
pub(crate) fn train(vectors: &[Vec<f32>], k: usize, dim: usize) -> Clustering {
    let n = vectors.len();
    let k = k.clamp(1, n.max(1));

    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| vectors.get(i * n / k).cloned().unwrap_or_else(|| vec![0.0; dim]))
        .collect();
    let mut assignment = vec![usize::MAX; n];

    for iteration in 0..MAX_ITERATIONS {
        let mut changed = 0usize;
        for (i, v) in vectors.iter().enumerate() {
            let c = nearest(&centroids, v);
            if assignment[i] != c {
                assignment[i] = c;
                changed += 1;
            }
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (v, &c) in vectors.iter().zip(assignment.iter()) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(v.iter()) {
                *s += x;
            }
        }
        for (c, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
            // Empty clusters keep their previous centroid.
            if count > 0 {
                centroids[c] = sum.into_iter().map(|s| s / count as f32).collect();
            }
        }

        if changed == 0 {
            tracing::debug!(iteration, clusters = k, "k-means converged");
            break;
        }
    }

    // Final assignment against the final centroids.
    let mut lists = vec![Vec::new(); k];
    for (i, v) in vectors.iter().enumerate() {
        lists[nearest(&centroids, v)].push(i as u32);
    }

    Clustering { centroids, lists }
}
