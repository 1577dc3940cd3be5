use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::data::structures::*;
use crate::error::SneError;
use crate::utils::context::ComputeContext;
use crate::utils::math::*;

/// Convergence tolerance on the entropy (in bits) of the calibration
pub const PERPLEXITY_TOL: f64 = 1e-4;

/// Maximum number of binary search steps per point
pub const PERPLEXITY_MAX_ITER: usize = 200;

/////////////////
// Calibration //
/////////////////

/// Compute Gaussian conditional probabilities with perplexity calibration
///
/// For each point, binary searches the precision `beta = 1 / (2 sigma^2)`
/// such that the entropy (base 2) of `p_{.|i}` matches `log2(perplexity)`.
/// Points that do not converge within `max_iter` steps silently keep the last
/// `beta`.
///
/// ### Params
///
/// * `ctx` - Compute context
/// * `knn_dists` - Squared distances to the k nearest neighbours of each point
/// * `perplexity` - Target perplexity
/// * `tol` - Tolerance on the entropy difference
/// * `max_iter` - Maximum number of binary search steps
///
/// ### Returns
///
/// Conditional probabilities `p_{j|i}`, aligned with `knn_dists`. Every
/// non-empty row sums to 1.
pub fn gaussian_conditional_probabilities<T: SneFloat>(
    ctx: &ComputeContext,
    knn_dists: &[Vec<T>],
    perplexity: T,
    tol: T,
    max_iter: usize,
) -> Vec<Vec<T>> {
    let target_entropy = perplexity.log2();
    let machine_epsilon = T::epsilon();
    let two = T::one() + T::one();

    ctx.dispatch(|| {
        knn_dists
            .par_iter()
            .map(|dists| {
                if dists.is_empty() {
                    return Vec::new();
                }

                // shifting by the smallest distance leaves the normalised
                // distribution unchanged and keeps exp() away from underflow
                let d_min = dists.iter().fold(T::infinity(), |acc, &d| acc.min(d));

                let mut beta = T::one();
                let mut min_beta = T::neg_infinity();
                let mut max_beta = T::infinity();
                let mut current_probs = vec![T::zero(); dists.len()];

                for _ in 0..max_iter {
                    let mut sum_p = T::zero();
                    for (p, &d) in current_probs.iter_mut().zip(dists) {
                        *p = (-beta * (d - d_min)).exp();
                        sum_p += *p;
                    }
                    let sum_p = sum_p.max(machine_epsilon);

                    let mut entropy = T::zero();
                    for p in current_probs.iter_mut() {
                        *p /= sum_p;
                        if *p > machine_epsilon {
                            entropy -= *p * p.log2();
                        }
                    }

                    let entropy_diff = entropy - target_entropy;
                    if entropy_diff.abs() < tol {
                        break;
                    }

                    if entropy_diff > T::zero() {
                        // too flat -> narrow the kernel
                        min_beta = beta;
                        beta = if max_beta.is_infinite() {
                            beta * two
                        } else {
                            (beta + max_beta) / two
                        };
                    } else {
                        max_beta = beta;
                        beta = if min_beta.is_infinite() {
                            beta / two
                        } else {
                            (beta + min_beta) / two
                        };
                    }
                }

                current_probs
            })
            .collect()
    })
}

///////////////
// Expansion //
///////////////

/// The symmetric similarity graph in its sparse arena layout
///
/// ### Fields
///
/// * `layout` - Per-point `(offset, size)` into the arena
/// * `neighbours` - Neighbour indices, sorted ascending per point
/// * `similarities` - Symmetric similarity per arena entry
/// * `distances` - L1 distance in data space per arena entry
#[derive(Clone, Debug, Default)]
pub struct SymmetricGraph<T> {
    pub layout: Vec<Layout>,
    pub neighbours: Vec<usize>,
    pub similarities: Vec<T>,
    pub distances: Vec<T>,
}

impl<T> SymmetricGraph<T> {
    /// Total number of arena entries
    pub fn symmetric_size(&self) -> usize {
        self.neighbours.len()
    }
}

/// Look up `p_{j|i}` in a sorted `(index, probability)` row
#[inline]
fn lookup<T: SneFloat>(row: &[(usize, T)], j: usize) -> Option<T> {
    row.binary_search_by_key(&j, |&(idx, _)| idx)
        .ok()
        .map(|pos| row[pos].1)
}

/// Allocate a zero-initialised arena buffer without aborting on failure
fn try_alloc<V: Clone + Default>(len: usize) -> Result<Vec<V>, SneError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, V::default());
    Ok(v)
}

/// Expand a directed kNN graph into the symmetric similarity graph
///
/// Counts, per point, the neighbours that list it without being listed back,
/// sizes every neighbour set as `k_i + count_i`, lays the sets out with an
/// exclusive scan and fills them in parallel. Each set is sorted ascending by
/// index. The similarity of an edge is `(p_{j|i} + p_{i|j}) / (2 * n_active)`,
/// which is identical in both directions.
///
/// ### Params
///
/// * `ctx` - Compute context
/// * `knn_indices` - Directed neighbour lists (global indices; empty for
///   inactive points)
/// * `probs` - Conditional probabilities aligned with `knn_indices`
/// * `n_active` - Number of points that took part in the kNN search
/// * `dataset` - The data (used for the per-edge L1 distances)
///
/// ### Returns
///
/// The symmetric graph, or an allocation error
pub fn expand_symmetric<T: SneFloat>(
    ctx: &ComputeContext,
    knn_indices: &[Vec<usize>],
    probs: &[Vec<T>],
    n_active: usize,
    dataset: &Dataset<T>,
) -> Result<SymmetricGraph<T>, SneError> {
    let n = knn_indices.len();
    let norm = cast::<T>(2.0) * T::from_usize(n_active.max(1)).unwrap();

    // sorted directed rows for reciprocal lookups
    let directed: Vec<Vec<(usize, T)>> = ctx.dispatch(|| {
        knn_indices
            .par_iter()
            .zip(probs.par_iter())
            .map(|(idx, p)| {
                let mut row: Vec<(usize, T)> = idx.iter().copied().zip(p.iter().copied()).collect();
                row.sort_unstable_by_key(|&(j, _)| j);
                row.dedup_by_key(|&mut (j, _)| j);
                row
            })
            .collect()
    });

    // unregistered reciprocal neighbours
    let counts: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
    ctx.dispatch(|| {
        directed.par_iter().enumerate().for_each(|(i, row)| {
            for &(j, _) in row {
                if j != i && lookup(&directed[j], i).is_none() {
                    counts[j].fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    });

    let sizes: Vec<usize> = directed
        .iter()
        .enumerate()
        .zip(&counts)
        .map(|((i, row), c)| row.iter().filter(|&&(j, _)| j != i).count() + c.load(Ordering::Relaxed))
        .collect();
    let (offsets, symmetric_size) = ctx.exclusive_scan(&sizes);
    let layout: Vec<Layout> = offsets
        .iter()
        .zip(&sizes)
        .map(|(&offset, &size)| Layout { offset, size })
        .collect();

    // (target, source) for every edge missing its reverse, grouped by target
    let directed_ref = &directed;
    let mut missing: Vec<(usize, usize)> = ctx.dispatch(|| {
        directed_ref
            .par_iter()
            .enumerate()
            .flat_map_iter(move |(i, row)| {
                let directed = directed_ref;
                row.iter()
                    .filter(move |&&(j, _)| j != i && lookup(&directed[j], i).is_none())
                    .map(move |&(j, _)| (j, i))
            })
            .collect()
    });
    ctx.dispatch(|| missing.par_sort_unstable());

    let mut neighbours: Vec<usize> = try_alloc(symmetric_size)?;
    let mut similarities: Vec<T> = try_alloc(symmetric_size)?;
    let mut distances: Vec<T> = try_alloc(symmetric_size)?;

    {
        let nb_slices = split_by_layout(&mut neighbours, &layout);
        let sim_slices = split_by_layout(&mut similarities, &layout);
        let dist_slices = split_by_layout(&mut distances, &layout);

        ctx.dispatch(|| {
            nb_slices
                .into_par_iter()
                .zip(sim_slices)
                .zip(dist_slices)
                .enumerate()
                .for_each(|(i, ((nb, sim), dist))| {
                    let start = missing.partition_point(|&(t, _)| t < i);
                    let end = missing.partition_point(|&(t, _)| t <= i);

                    let mut slot = 0;
                    for &(j, _) in directed[i].iter().filter(|&&(j, _)| j != i) {
                        nb[slot] = j;
                        slot += 1;
                    }
                    for &(_, j) in &missing[start..end] {
                        nb[slot] = j;
                        slot += 1;
                    }
                    debug_assert_eq!(slot, nb.len());
                    nb.sort_unstable();

                    let row_i = dataset.row(i);
                    for ((s, d), &j) in sim.iter_mut().zip(dist.iter_mut()).zip(nb.iter()) {
                        let p_ji = lookup(&directed[i], j).unwrap_or_else(T::zero);
                        let p_ij = lookup(&directed[j], i).unwrap_or_else(T::zero);
                        *s = (p_ji + p_ij) / norm;
                        *d = manhattan(row_i, dataset.row(j));
                    }
                })
        });
    }

    Ok(SymmetricGraph {
        layout,
        neighbours,
        similarities,
        distances,
    })
}

////////////////
// Invariants //
////////////////

/// First broken invariant found in a similarity graph
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphViolation {
    /// Layouts are not contiguous or do not cover the arena
    Layout { point: usize },
    /// A point lists itself
    SelfNeighbour { point: usize },
    /// Neighbour set not strictly ascending (unsorted or duplicated)
    Unsorted { point: usize },
    /// `j` in N(i) but `i` not in N(j)
    MissingReciprocal { point: usize, neighbour: usize },
    /// Weights of `(i, j)` and `(j, i)` differ
    AsymmetricWeight { point: usize, neighbour: usize },
}

/// Search a similarity graph for the first broken invariant
///
/// ### Params
///
/// * `layout` - Per-point layout
/// * `neighbours` - Neighbour arena
/// * `similarities` - Similarity arena
///
/// ### Returns
///
/// `None` if the graph is consistent
pub fn find_violation<T: SneFloat>(
    layout: &[Layout],
    neighbours: &[usize],
    similarities: &[T],
) -> Option<GraphViolation> {
    let mut expected_offset = 0;
    for (i, l) in layout.iter().enumerate() {
        if l.offset != expected_offset {
            return Some(GraphViolation::Layout { point: i });
        }
        expected_offset += l.size;
    }
    if expected_offset != neighbours.len() || neighbours.len() != similarities.len() {
        return Some(GraphViolation::Layout { point: layout.len() });
    }

    for (i, l) in layout.iter().enumerate() {
        let nb = &neighbours[l.range()];
        if nb.contains(&i) {
            return Some(GraphViolation::SelfNeighbour { point: i });
        }
        if nb.windows(2).any(|w| w[0] >= w[1]) {
            return Some(GraphViolation::Unsorted { point: i });
        }
        for (e, &j) in l.range().zip(nb) {
            if j >= layout.len() {
                return Some(GraphViolation::MissingReciprocal { point: i, neighbour: j });
            }
            let back = layout[j];
            match neighbours[back.range()].binary_search(&i) {
                Err(_) => {
                    return Some(GraphViolation::MissingReciprocal { point: i, neighbour: j })
                }
                Ok(pos) => {
                    if similarities[back.offset + pos] != similarities[e] {
                        return Some(GraphViolation::AsymmetricWeight { point: i, neighbour: j });
                    }
                }
            }
        }
    }

    None
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_graph {
    use super::*;
    use crate::data::nearest_neighbours::{run_knn, KnnMethod, NearestNeighbourParams};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_dataset(n: usize, d: usize, seed: u64) -> Dataset<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..n * d).map(|_| rng.random::<f64>() * 10.0).collect();
        Dataset::from_rows(data, d, None).unwrap()
    }

    fn entropy_bits(p: &[f64]) -> f64 {
        p.iter().filter(|&&x| x > 0.0).map(|&x| -x * x.log2()).sum()
    }

    #[test]
    fn test_calibration_hits_perplexity() {
        let ctx = ComputeContext::new(Some(2)).unwrap();
        let ds = random_dataset(300, 5, 42);
        let (_, dists) = run_knn(
            &ctx,
            &ds.data,
            5,
            31,
            KnnMethod::Exact,
            &NearestNeighbourParams::default(),
            1,
        )
        .unwrap();
        let probs = gaussian_conditional_probabilities(&ctx, &dists, 10.0, PERPLEXITY_TOL, PERPLEXITY_MAX_ITER);

        for p in &probs {
            assert_relative_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
            assert!((entropy_bits(p) - 10f64.log2()).abs() < 1e-4);
        }
    }

    #[test]
    fn test_calibration_empty_row() {
        let ctx = ComputeContext::new(Some(1)).unwrap();
        let probs = gaussian_conditional_probabilities::<f64>(&ctx, &[vec![]], 5.0, 1e-4, 200);
        assert!(probs[0].is_empty());
    }

    #[test]
    fn test_calibration_large_distances() {
        // would underflow to all zeros without the shift
        let ctx = ComputeContext::new(Some(1)).unwrap();
        let dists = vec![vec![1e4, 1e4 + 1.0, 1e4 + 2.0, 1e4 + 3.0]];
        let probs = gaussian_conditional_probabilities(&ctx, &dists, 2.0, 1e-4, 200);
        assert_relative_eq!(probs[0].iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(probs[0].iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_expansion_symmetric_and_consistent() {
        let ctx = ComputeContext::new(Some(4)).unwrap().with_group_size(16);
        let ds = random_dataset(400, 6, 7);
        let (idx, dists) = run_knn(
            &ctx,
            &ds.data,
            6,
            16,
            KnnMethod::Exact,
            &NearestNeighbourParams::default(),
            1,
        )
        .unwrap();
        let probs = gaussian_conditional_probabilities(&ctx, &dists, 5.0, PERPLEXITY_TOL, PERPLEXITY_MAX_ITER);
        let graph = expand_symmetric(&ctx, &idx, &probs, 400, &ds).unwrap();

        assert_eq!(find_violation(&graph.layout, &graph.neighbours, &graph.similarities), None);

        let total: usize = graph.layout.iter().map(|l| l.size).sum();
        assert_eq!(total, graph.symmetric_size());
        for l in &graph.layout {
            assert!(l.size >= 16);
        }

        // P is a joint distribution
        let mass: f64 = graph.similarities.iter().sum();
        assert_relative_eq!(mass, 1.0, epsilon = 1e-9);

        // stored L1 distances
        let l0 = graph.layout[0];
        let j = graph.neighbours[l0.offset];
        assert_relative_eq!(graph.distances[l0.offset], manhattan(ds.row(0), ds.row(j)));
    }

    #[test]
    fn test_expansion_adds_reverse_edges() {
        // 0 -> 1, 1 -> 2, 2 -> 1: point 0 is nobody's neighbour
        let ctx = ComputeContext::new(Some(1)).unwrap();
        let ds = Dataset::from_rows(vec![0.0, 1.0, 2.0], 1, None).unwrap();
        let idx = vec![vec![1], vec![2], vec![1]];
        let probs = vec![vec![1.0], vec![1.0], vec![1.0]];
        let graph = expand_symmetric(&ctx, &idx, &probs, 3, &ds).unwrap();

        assert_eq!(graph.layout[0], Layout { offset: 0, size: 1 });
        assert_eq!(graph.layout[1], Layout { offset: 1, size: 2 });
        assert_eq!(graph.layout[2], Layout { offset: 3, size: 1 });
        assert_eq!(graph.neighbours, vec![1, 0, 2, 1]);
        // (1 + 0) / 6 for 0-1, (1 + 1) / 6 for 1-2
        assert_relative_eq!(graph.similarities[0], 1.0 / 6.0);
        assert_relative_eq!(graph.similarities[1], 1.0 / 6.0);
        assert_relative_eq!(graph.similarities[2], 2.0 / 6.0);
        assert_relative_eq!(graph.similarities[3], 2.0 / 6.0);
    }

    #[test]
    fn test_find_violation_detects_asymmetry() {
        let layout = vec![Layout { offset: 0, size: 1 }, Layout { offset: 1, size: 1 }];
        let neighbours = vec![1, 0];
        assert_eq!(find_violation(&layout, &neighbours, &[0.5, 0.5]), None);
        assert_eq!(
            find_violation(&layout, &neighbours, &[0.5, 0.25]),
            Some(GraphViolation::AsymmetricWeight { point: 0, neighbour: 1 })
        );
        assert_eq!(
            find_violation(&layout, &[1, 1], &[0.5, 0.5]),
            Some(GraphViolation::MissingReciprocal { point: 0, neighbour: 1 })
        );
        assert_eq!(
            find_violation(&layout, &[0, 0], &[0.5, 0.5]),
            Some(GraphViolation::SelfNeighbour { point: 0 })
        );
    }
}
