use rand::{
    rngs::StdRng,
    {Rng, SeedableRng},
};

use crate::utils::math::*;

/// Default half-width of the initial embedding
pub const RANDOM_RANGE: f64 = 0.1;

////////////
// Random //
////////////

/// Random initialisation of the embedding
///
/// Uniform in `[-range, range]` on every axis, tiny compared to the final
/// layout so that early exaggeration can form the clusters.
///
/// ### Params
///
/// * `n_samples` - Number of samples to initialise
/// * `n_comp` - Dimensionality of the embedding
/// * `seed` - Random seed
/// * `range` - Half-width of the interval. Defaults to [`RANDOM_RANGE`].
///
/// ### Returns
///
/// Row-major `n_samples x n_comp` coordinates
pub fn random_layout<T: SneFloat>(n_samples: usize, n_comp: usize, seed: u64, range: Option<T>) -> Vec<T> {
    let range = range
        .unwrap_or(cast(RANDOM_RANGE))
        .to_f64()
        .unwrap()
        .abs()
        .max(f64::MIN_POSITIVE);
    let mut rng = StdRng::seed_from_u64(seed);

    (0..n_samples * n_comp)
        .map(|_| cast(rng.random_range(-range..range)))
        .collect()
}
