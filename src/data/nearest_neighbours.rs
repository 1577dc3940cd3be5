use ann_search_rs::cpu::nndescent::{NNDescent, NNDescentQuery};
use ann_search_rs::prelude::{AnnSearchFloat, KnnOptionResult};
use ann_search_rs::utils::nndescent_utils::ApplySortedUpdates;
use ann_search_rs::{build_exhaustive_index, build_nndescent_index, query_exhaustive_self, query_nndescent_self};
use rayon::prelude::*;

use crate::error::SneError;
use crate::utils::context::ComputeContext;
use crate::utils::math::*;

/// Below this number of points `"auto"` resolves to the exact search
const AUTO_EXACT_THRESHOLD: usize = 10_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KnnMethod {
    /// Exact below `AUTO_EXACT_THRESHOLD` points, NNDescent above
    #[default]
    Auto,
    /// Exhaustive search
    Exact,
    /// Approximate search via NNDescent
    NnDescent,
}

impl KnnMethod {
    /// Resolve `Auto` for a dataset of `n` points
    pub fn resolve(self, n: usize) -> Self {
        match self {
            KnnMethod::Auto if n <= AUTO_EXACT_THRESHOLD => KnnMethod::Exact,
            KnnMethod::Auto => KnnMethod::NnDescent,
            m => m,
        }
    }
}

/// Parse the nearest neighbour search to use
///
/// ### Params
///
/// * `s` - String defining the search. One of `"auto"`, `"exact"` or
///   `"nndescent"`.
///
/// ### Return
///
/// Option of KnnMethod
pub fn parse_knn_method(s: &str) -> Option<KnnMethod> {
    match s.to_lowercase().as_str() {
        "auto" => Some(KnnMethod::Auto),
        "exact" | "exhaustive" | "brute force" | "bf" => Some(KnnMethod::Exact),
        "nndescent" | "nn descent" => Some(KnnMethod::NnDescent),
        _ => None,
    }
}

/// Parameters for the nearest neighbour search
///
/// ### Fields
///
/// **General parameters:**
///
/// * `dist_metric` - Distance metric passed to the index. The similarity
///   graph expects squared euclidean distances, so keep `"euclidean"`
///   unless you know what you are doing.
///
/// **NNDescent**-specific parameters:
///
/// * `max_iter` - Maximum number of local join rounds
/// * `delta` - Early termination criterium of the local joins
/// * `max_candidates` - Maximum number of candidates per point and round
/// * `n_tree` - Number of random projection trees for the initial graph.
///   `None` lets the index decide.
/// * `diversify_prob` - Probability of pruning redundant edges
/// * `ef_budget` - Optional query budget for the self-query
#[derive(Debug, Clone)]
pub struct NearestNeighbourParams<T> {
    pub dist_metric: String,
    pub max_iter: usize,
    pub delta: T,
    pub max_candidates: usize,
    pub n_tree: Option<usize>,
    pub diversify_prob: T,
    pub ef_budget: Option<usize>,
}

impl<T: SneFloat> Default for NearestNeighbourParams<T> {
    /// Returns sensible defaults for the nearest neighbour search
    fn default() -> Self {
        Self {
            dist_metric: "euclidean".to_string(),
            max_iter: 12,
            delta: cast(0.001),
            max_candidates: 30,
            n_tree: None,
            diversify_prob: T::zero(),
            ef_budget: None,
        }
    }
}

/// Float types the NNDescent index is available for
///
/// The index implements its query trait for `f32` and `f64` only; the
/// build/query pair is instantiated for both below.
pub trait NnDescentFloat: AnnSearchFloat {
    /// Build an NNDescent index over `data` and query every point against it
    ///
    /// ### Params
    ///
    /// * `data` - Row-major data
    /// * `n` - Number of rows
    /// * `n_dims` - Number of columns
    /// * `k` - Number of neighbours to return, self included
    /// * `params` - NNDescent parameters
    /// * `seed` - Seed for reproducibility
    fn nndescent_self_knn(
        data: &[Self],
        n: usize,
        n_dims: usize,
        k: usize,
        params: &NearestNeighbourParams<Self>,
        seed: usize,
    ) -> KnnOptionResult<Self>;
}

fn nndescent_self_knn<T>(
    data: &[T],
    n: usize,
    n_dims: usize,
    k: usize,
    params: &NearestNeighbourParams<T>,
    seed: usize,
) -> KnnOptionResult<T>
where
    T: AnnSearchFloat,
    NNDescent<T>: ApplySortedUpdates<T> + NNDescentQuery<T>,
{
    let index = build_nndescent_index(
        (data, n, n_dims),
        &params.dist_metric,
        params.delta,
        params.diversify_prob,
        Some(k),
        Some(params.max_iter),
        Some(params.max_candidates),
        params.n_tree,
        seed,
        false,
    )?;
    query_nndescent_self(&index, k, params.ef_budget, true, false)
}

macro_rules! impl_nndescent_float {
    ($float:ty) => {
        impl NnDescentFloat for $float {
            fn nndescent_self_knn(
                data: &[Self],
                n: usize,
                n_dims: usize,
                k: usize,
                params: &NearestNeighbourParams<Self>,
                seed: usize,
            ) -> KnnOptionResult<Self> {
                nndescent_self_knn(data, n, n_dims, k, params, seed)
            }
        }
    };
}

impl_nndescent_float!(f32);
impl_nndescent_float!(f64);

/// Run the nearest neighbour search
///
/// ### Params
///
/// * `ctx` - Compute context; the index is built and queried on its pool
/// * `data` - Row-major data
/// * `n_dims` - Number of columns of `data`
/// * `k` - Number of neighbours to return; clamped to `n - 1`
/// * `method` - Which search to run
/// * `params` - Parameters of the search
/// * `seed` - Seed for reproducibility
///
/// ### Returns
///
/// `(knn_indices, knn_dist)` excluding self, with squared euclidean distances
/// in ascending order.
pub fn run_knn<T: SneFloat>(
    ctx: &ComputeContext,
    data: &[T],
    n_dims: usize,
    k: usize,
    method: KnnMethod,
    params: &NearestNeighbourParams<T>,
    seed: u64,
) -> Result<(Vec<Vec<usize>>, Vec<Vec<T>>), SneError> {
    let n = data.len() / n_dims;
    let k = k.min(n.saturating_sub(1));

    if k == 0 {
        return Ok((vec![Vec::new(); n], vec![Vec::new(); n]));
    }

    let (knn_indices, knn_dist) = ctx.dispatch(|| match method.resolve(n) {
        KnnMethod::NnDescent => T::nndescent_self_knn(data, n, n_dims, k + 1, params, seed as usize),
        _ => {
            let index = build_exhaustive_index((data, n, n_dims), &params.dist_metric);
            query_exhaustive_self(&index, k + 1, true, false)
        }
    })?;
    let knn_dist = knn_dist.unwrap_or_else(|| vec![Vec::new(); n]);

    // remove self; duplicates of a point may sort ahead of it
    let res = ctx.dispatch(|| {
        knn_indices
            .into_par_iter()
            .zip(knn_dist.into_par_iter())
            .enumerate()
            .map(|(i, (idx, dist))| {
                let (mut idx, mut dist): (Vec<usize>, Vec<T>) = idx
                    .into_iter()
                    .zip(dist)
                    .filter(|&(j, _)| j != i)
                    .map(|(j, d)| (j, d.max(T::zero())))
                    .unzip();
                idx.truncate(k);
                dist.truncate(k);
                (idx, dist)
            })
            .unzip()
    });

    Ok(res)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_nearest_neighbours {
    use super::*;
    use crate::data::synthetic::generate_uniform;

    /// Uniform points in the unit cube, row-major
    fn random_data(n: usize, d: usize, seed: u64) -> Vec<f64> {
        let mat = generate_uniform(n, d, 1.0, seed);
        (0..n).flat_map(|i| (0..d).map(move |j| (i, j))).map(|(i, j)| mat[(i, j)]).collect()
    }

    #[test]
    fn test_parse_knn_method() {
        assert_eq!(parse_knn_method("Exact"), Some(KnnMethod::Exact));
        assert_eq!(parse_knn_method("exhaustive"), Some(KnnMethod::Exact));
        assert_eq!(parse_knn_method("nndescent"), Some(KnnMethod::NnDescent));
        assert_eq!(parse_knn_method("auto"), Some(KnnMethod::Auto));
        assert_eq!(parse_knn_method("faiss"), None);
        assert_eq!(KnnMethod::Auto.resolve(100), KnnMethod::Exact);
        assert_eq!(KnnMethod::Auto.resolve(1_000_000), KnnMethod::NnDescent);
    }

    #[test]
    fn test_exact_knn_line() {
        let ctx = ComputeContext::new(Some(2)).unwrap();
        let data: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let params = NearestNeighbourParams::default();
        let (idx, dist) = run_knn(&ctx, &data, 1, 2, KnnMethod::Exact, &params, 1).unwrap();
        assert_eq!(idx[0], vec![1, 2]);
        assert!((dist[0][0] - 1.0).abs() < 1e-9);
        assert!((dist[0][1] - 4.0).abs() < 1e-9);
        assert_eq!(idx[5].len(), 2);
        assert!(idx[5].contains(&4) && idx[5].contains(&6));
        for (i, nb) in idx.iter().enumerate() {
            assert!(!nb.contains(&i));
        }
    }

    #[test]
    fn test_duplicate_points_exclude_self() {
        let ctx = ComputeContext::new(Some(2)).unwrap();
        let data: Vec<f64> = vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 3.0, 3.0];
        let params = NearestNeighbourParams::default();
        let (idx, dist) = run_knn(&ctx, &data, 2, 2, KnnMethod::Exact, &params, 1).unwrap();
        assert_eq!(idx[0][0], 1);
        assert_eq!(idx[1][0], 0);
        assert!(dist[0][0].abs() < 1e-9);
        for (i, nb) in idx.iter().enumerate() {
            assert_eq!(nb.len(), 2);
            assert!(!nb.contains(&i));
        }
    }

    #[test]
    fn test_run_knn_clamps_k() {
        let ctx = ComputeContext::new(Some(2)).unwrap();
        let data = random_data(5, 3, 1);
        let params = NearestNeighbourParams::default();
        let (idx, _) = run_knn(&ctx, &data, 3, 50, KnnMethod::Exact, &params, 1).unwrap();
        assert!(idx.iter().all(|nb| nb.len() == 4));

        let (idx, _) = run_knn(&ctx, &data[..3], 3, 5, KnnMethod::Exact, &params, 1).unwrap();
        assert_eq!(idx, vec![Vec::<usize>::new()]);
    }

    #[test]
    fn test_nndescent_recall() {
        let ctx = ComputeContext::new(Some(4)).unwrap();
        let (n, d, k) = (600, 8, 10);
        let data = random_data(n, d, 42);
        let params = NearestNeighbourParams::default();

        let (exact, exact_dist) = run_knn(&ctx, &data, d, k, KnnMethod::Exact, &params, 42).unwrap();
        let (approx, approx_dist) = run_knn(&ctx, &data, d, k, KnnMethod::NnDescent, &params, 42).unwrap();

        let hits: usize = exact
            .iter()
            .zip(&approx)
            .map(|(e, a)| a.iter().filter(|j| e.contains(j)).count())
            .sum();
        let recall = hits as f64 / (n * k) as f64;
        assert!(recall > 0.9, "NNDescent recall too low: {:.3}", recall);

        for (i, (nb, ds)) in approx.iter().zip(&approx_dist).enumerate() {
            assert_eq!(nb.len(), k);
            assert!(!nb.contains(&i), "self found in neighbours of {}", i);
            assert!(ds.windows(2).all(|w| w[0] <= w[1]));
            let mut sorted = nb.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), k, "duplicate neighbours for {}", i);
        }
        // exact distances are squared euclidean
        let row = |i: usize| &data[i * d..(i + 1) * d];
        let j = exact[3][0];
        assert!((exact_dist[3][0] - squared_euclidean(row(3), row(j))).abs() < 1e-9);
    }
}
