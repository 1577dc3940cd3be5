#![allow(dead_code)]

use faer::Mat;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Create a synthetic dataset with well-separated clusters
///
/// Cluster `c` is centred at `20 * e_c` (cluster 0 at the origin), every
/// coordinate gets uniform noise in `[-0.25, 0.25)`.
pub fn create_diagnostic_data(
    n_per_cluster: usize,
    n_dim: usize,
    n_clusters: usize,
    seed: u64,
) -> (Mat<f64>, Vec<i32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_total = n_per_cluster * n_clusters;

    let mut data_vec = Vec::with_capacity(n_total * n_dim);
    let mut labels = Vec::with_capacity(n_total);

    for cluster_id in 0..n_clusters {
        for _ in 0..n_per_cluster {
            for dim in 0..n_dim {
                let centre = if cluster_id > 0 && dim == cluster_id - 1 { 20.0 } else { 0.0 };
                let noise: f64 = rng.random::<f64>() * 0.5 - 0.25;
                data_vec.push(centre + noise);
            }
            labels.push(cluster_id as i32);
        }
    }

    let data = Mat::from_fn(n_total, n_dim, |i, j| data_vec[i * n_dim + j]);
    (data, labels)
}

/// Mean pairwise euclidean distance within and between labels
///
/// ### Returns
///
/// `(within, between)`
pub fn mean_distances(embedding: &[Vec<f64>], labels: &[i32]) -> (f64, f64) {
    let n = labels.len();
    let (mut within, mut n_within) = (0.0, 0usize);
    let (mut between, mut n_between) = (0.0, 0usize);

    for i in 0..n {
        for j in (i + 1)..n {
            let d = embedding
                .iter()
                .map(|axis| (axis[i] - axis[j]).powi(2))
                .sum::<f64>()
                .sqrt();
            if labels[i] == labels[j] {
                within += d;
                n_within += 1;
            } else {
                between += d;
                n_between += 1;
            }
        }
    }

    (within / n_within as f64, between / n_between as f64)
}

/// Transpose a row-major `n x d` buffer into one vector per dimension
pub fn columns(flat: &[f64], d: usize) -> Vec<Vec<f64>> {
    (0..d)
        .map(|k| flat.iter().skip(k).step_by(d).copied().collect())
        .collect()
}
