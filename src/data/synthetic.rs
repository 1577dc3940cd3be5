use faer::Mat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Generate well separated Gaussian clusters
///
/// Cluster centres are placed on the coordinate axes at distance
/// `separation` from the origin (cluster `c` on axis `c % dim`, alternating
/// sign), so every pair of centres is at least `separation` apart.
///
/// ### Params
///
/// * `n_per_cluster` - Number of samples per cluster
/// * `dim` - Dimensionality of the data
/// * `n_clusters` - Number of clusters (at most `2 * dim`)
/// * `cluster_std` - Standard deviation within the clusters
/// * `separation` - Distance of each centre from the origin
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape `(n_per_cluster * n_clusters, dim)` and the cluster label
/// of every row. Rows are shuffled.
pub fn generate_gaussian_clusters(
    n_per_cluster: usize,
    dim: usize,
    n_clusters: usize,
    cluster_std: f64,
    separation: f64,
    seed: u64,
) -> (Mat<f64>, Vec<i32>) {
    assert!(n_clusters <= 2 * dim, "Not enough axes for {} clusters", n_clusters);

    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, cluster_std).unwrap();

    let mut labels: Vec<i32> = (0..n_clusters)
        .flat_map(|c| std::iter::repeat(c as i32).take(n_per_cluster))
        .collect();
    labels.shuffle(&mut rng);

    let data = Mat::from_fn(labels.len(), dim, |i, j| {
        let c = labels[i] as usize;
        let sign = if (c / dim) % 2 == 0 { 1.0 } else { -1.0 };
        let centre = if j == c % dim { sign * separation } else { 0.0 };
        centre + noise.sample(&mut rng)
    });

    (data, labels)
}

/// Generate points scattered uniformly in a hypercube
///
/// ### Params
///
/// * `n_samples` - Number of samples
/// * `dim` - Dimensionality
/// * `scale` - Edge length of the cube
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape `(n_samples, dim)`
pub fn generate_uniform(n_samples: usize, dim: usize, scale: f64, seed: u64) -> Mat<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Mat::from_fn(n_samples, dim, |_, _| rng.random::<f64>() * scale)
}

#[cfg(test)]
mod test_synthetic {
    use super::*;

    #[test]
    fn test_gaussian_clusters_shape_and_labels() {
        let (data, labels) = generate_gaussian_clusters(50, 4, 3, 0.5, 10.0, 1);
        assert_eq!(data.nrows(), 150);
        assert_eq!(data.ncols(), 4);
        for c in 0..3 {
            assert_eq!(labels.iter().filter(|&&l| l == c).count(), 50);
        }

        // rows sit near their centre
        for i in 0..150 {
            let c = labels[i] as usize;
            assert!((data[(i, c)] - 10.0).abs() < 5.0);
        }
    }

    #[test]
    fn test_uniform_in_cube_and_seeded() {
        let a = generate_uniform(200, 3, 4.0, 9);
        let b = generate_uniform(200, 3, 4.0, 9);
        assert_eq!((a.nrows(), a.ncols()), (200, 3));
        for i in 0..200 {
            for j in 0..3 {
                assert!((0.0..4.0).contains(&a[(i, j)]));
                assert_eq!(a[(i, j)], b[(i, j)]);
            }
        }
        let c = generate_uniform(200, 3, 4.0, 10);
        assert_ne!(a[(0, 0)], c[(0, 0)]);
    }
}
