use log::{debug, info, warn};
use rayon::prelude::*;
use std::borrow::Cow;
use std::time::Instant;
use thousands::*;

use crate::data::graph::*;
use crate::data::nearest_neighbours::*;
use crate::data::structures::*;
use crate::error::SneError;
use crate::utils::context::ComputeContext;
use crate::utils::math::*;
use crate::SneParams;

/// Read-only view of the similarity component for external collaborators
#[derive(Clone, Copy, Debug)]
pub struct SimilaritiesBuffers<'a, T> {
    pub dataset: &'a [T],
    pub n_high_dims: usize,
    pub labels: Option<&'a [i32]>,
    pub layout: &'a [Layout],
    pub neighbours: &'a [usize],
    pub similarities: &'a [T],
    pub distances: &'a [T],
    pub attribute_weights: &'a [T],
}

/// Check that a per-point buffer matches the number of points
fn check_selection(selection: &[bool], n: usize) -> Result<(), SneError> {
    if selection.len() != n {
        return Err(SneError::SelectionMismatch {
            got: selection.len(),
            expected: n,
        });
    }
    Ok(())
}

/// Relative per-point mass error at which the symmetric rebalance stops
const MASS_TOL: f64 = 1e-9;

/// Maximum number of symmetric rebalance sweeps
const MASS_MAX_ITER: usize = 500;

/// Symmetrically rescale the arena until every row sums to its target mass
///
/// Each sweep multiplies edge `(i, j)` by `sqrt(m_i / r_i) * sqrt(m_j / r_j)`
/// where `r` are the current row sums. Both directions of an edge get the
/// same factor, so a symmetric arena stays symmetric.
///
/// ### Params
///
/// * `ctx` - Compute context
/// * `layout` - Per-point layout of the arena
/// * `neighbours` - Neighbour indices of the arena
/// * `similarities` - Symmetric similarity arena, rescaled in place
/// * `target` - Per-point mass to restore
///
/// ### Returns
///
/// Number of sweeps run
fn rebalance_mass<T: SneFloat>(
    ctx: &ComputeContext,
    layout: &[Layout],
    neighbours: &[usize],
    similarities: &mut [T],
    target: &[T],
) -> usize {
    let tol: T = cast(MASS_TOL);

    for sweep in 0..MASS_MAX_ITER {
        let sims = &*similarities;
        let (factors, worst): (Vec<T>, T) = ctx.dispatch(|| {
            let factors: Vec<(T, T)> = layout
                .par_iter()
                .zip(target.par_iter())
                .map(|(l, &m)| {
                    let r: T = sims[l.range()].iter().copied().sum();
                    if r > T::zero() && m > T::zero() {
                        ((m / r).sqrt(), (r / m - T::one()).abs())
                    } else {
                        (T::one(), T::zero())
                    }
                })
                .collect();
            let worst = factors.iter().fold(T::zero(), |acc, &(_, err)| acc.max(err));
            (factors.into_iter().map(|(f, _)| f).collect(), worst)
        });

        if worst < tol {
            return sweep;
        }

        let factors = &factors;
        let slices = split_by_layout(similarities, layout);
        ctx.dispatch(|| {
            slices.into_par_iter().enumerate().for_each(|(i, row)| {
                let nb = &neighbours[layout[i].range()];
                for (s, &j) in row.iter_mut().zip(nb) {
                    *s *= factors[i] * factors[j];
                }
            })
        });
    }

    warn!("Similarity mass did not settle within {} sweeps", MASS_MAX_ITER);
    MASS_MAX_ITER
}

/// Compacted dataset and rebuilt graph of a pending point removal
pub struct SimilaritiesRemoval<T> {
    dataset: Dataset<T>,
    graph: SymmetricGraph<T>,
    knn_indices: Vec<Vec<usize>>,
}

//////////////////
// Similarities //
//////////////////

/// The symmetric kNN similarity graph over the high-dimensional data
///
/// Owns the dataset, the current similarity arena, a snapshot of the
/// similarities as built (for `reset`), the per-edge L1 distances, the raw
/// kNN lists of the last build and the per-attribute weights.
pub struct Similarities<T> {
    dataset: Dataset<T>,
    graph: SymmetricGraph<T>,
    original: Vec<T>,
    knn_indices: Vec<Vec<usize>>,
    attribute_weights: Vec<T>,
    perplexity: T,
    k: usize,
    params: SneParams<T>,
}

impl<T: SneFloat> Similarities<T> {
    /// Build the similarity graph over all points
    ///
    /// ### Params
    ///
    /// * `ctx` - Compute context
    /// * `dataset` - The high-dimensional data
    /// * `params` - Solver parameters (perplexity, k, kNN method, weights)
    ///
    /// ### Returns
    ///
    /// The component or an error if a buffer could not be allocated
    pub fn new(ctx: &ComputeContext, dataset: Dataset<T>, params: &SneParams<T>) -> Result<Self, SneError> {
        let k = params.k();
        let perplexity = params.perplexity;
        let (graph, knn_indices) = Self::build(ctx, &dataset, None, perplexity, k, params)?;

        let out = Self {
            attribute_weights: vec![T::one(); dataset.n_dims],
            original: graph.similarities.clone(),
            dataset,
            graph,
            knn_indices,
            perplexity,
            k,
            params: params.clone(),
        };
        if params.check_invariants {
            out.check_invariants();
        }

        Ok(out)
    }

    /// kNN, calibration and symmetric expansion over the (optional) subset
    fn build(
        ctx: &ComputeContext,
        dataset: &Dataset<T>,
        subset: Option<&[bool]>,
        perplexity: T,
        k: usize,
        params: &SneParams<T>,
    ) -> Result<(SymmetricGraph<T>, Vec<Vec<usize>>), SneError> {
        let n = dataset.n;
        let h = dataset.n_dims;
        let start = Instant::now();

        let subset = subset.filter(|s| s.iter().any(|&x| x));
        let (global, data): (Vec<usize>, Cow<[T]>) = match subset {
            Some(sel) => {
                let all: Vec<usize> = (0..n).collect();
                (
                    ctx.remove(&all, 1, sel, true)?,
                    Cow::Owned(ctx.remove(&dataset.data, h, sel, true)?),
                )
            }
            None => ((0..n).collect(), Cow::Borrowed(&dataset.data[..])),
        };
        let n_active = global.len();

        let (local_idx, local_dist) = run_knn(
            ctx,
            &data,
            h,
            k,
            params.knn_method(),
            &params.knn_params,
            params.seed,
        )?;
        info!(
            "kNN search for {} points (k = {}) done in {:.2?}",
            n_active.separate_with_underscores(),
            k,
            start.elapsed()
        );

        let local_probs = gaussian_conditional_probabilities(
            ctx,
            &local_dist,
            perplexity,
            cast(PERPLEXITY_TOL),
            PERPLEXITY_MAX_ITER,
        );

        // back to global indices; points outside the subset keep empty lists
        let mut knn_indices = vec![Vec::new(); n];
        let mut probs = vec![Vec::new(); n];
        for ((row, p), &g) in local_idx.into_iter().zip(local_probs).zip(&global) {
            knn_indices[g] = row.into_iter().map(|j| global[j]).collect();
            probs[g] = p;
        }

        let graph = expand_symmetric(ctx, &knn_indices, &probs, n_active, dataset)?;
        info!(
            "Similarity graph built: {} points, {} entries in {:.2?}",
            n_active.separate_with_underscores(),
            graph.symmetric_size().separate_with_underscores(),
            start.elapsed()
        );

        Ok((graph, knn_indices))
    }

    ///////////////
    // Mutations //
    ///////////////

    /// Rebuild the graph, restricted to the selected points
    ///
    /// An all-false selection rebuilds over every point. Unselected points
    /// end up with empty neighbour sets. The new arena is only swapped in
    /// once it is fully populated.
    ///
    /// ### Params
    ///
    /// * `ctx` - Compute context
    /// * `selection` - Points to include
    /// * `perplexity` - New perplexity
    /// * `k` - New number of neighbours (at most `k_max`)
    pub fn recompute(
        &mut self,
        ctx: &ComputeContext,
        selection: &[bool],
        perplexity: T,
        k: usize,
    ) -> Result<(), SneError> {
        check_selection(selection, self.dataset.n)?;
        if k > self.params.k_max {
            return Err(SneError::KnnTooLarge {
                k,
                k_max: self.params.k_max,
            });
        }
        if perplexity <= T::zero() {
            return Err(SneError::InvalidParams(format!(
                "perplexity must be positive, got {}",
                perplexity
            )));
        }

        let (graph, knn_indices) =
            Self::build(ctx, &self.dataset, Some(selection), perplexity, k, &self.params)?;
        self.original = graph.similarities.clone();
        self.graph = graph;
        self.knn_indices = knn_indices;
        self.perplexity = perplexity;
        self.k = k;

        if self.params.check_invariants {
            self.check_invariants();
        }
        Ok(())
    }

    /// Multiply the similarity of edges touching the selection
    ///
    /// ### Params
    ///
    /// * `ctx` - Compute context
    /// * `weight` - Factor, clamped to `[0, max_similarity_weight]`
    /// * `selection` - Selected points
    /// * `inter_only` - Only edges with exactly one selected endpoint;
    ///   otherwise every edge with at least one
    pub fn weigh_similarities(
        &mut self,
        ctx: &ComputeContext,
        weight: T,
        selection: &[bool],
        inter_only: bool,
    ) -> Result<(), SneError> {
        check_selection(selection, self.dataset.n)?;
        let max_weight = self.params.max_similarity_weight;
        let w = weight.max(T::zero()).min(max_weight);
        if w != weight {
            warn!("Similarity weight {} clamped to {}", weight, w);
        }

        let layout = &self.graph.layout;
        let neighbours = &self.graph.neighbours;
        let slices = split_by_layout(&mut self.graph.similarities, layout);

        ctx.dispatch(|| {
            slices.into_par_iter().enumerate().for_each(|(i, sims)| {
                for (s, &j) in sims.iter_mut().zip(&neighbours[layout[i].range()]) {
                    let hit = if inter_only {
                        selection[i] != selection[j]
                    } else {
                        selection[i] || selection[j]
                    };
                    if hit {
                        *s *= w;
                    }
                }
            })
        });

        Ok(())
    }

    /// Restore the similarities of the last build
    pub fn reset(&mut self, ctx: &ComputeContext) {
        let original = &self.original;
        ctx.dispatch(|| {
            self.graph
                .similarities
                .par_iter_mut()
                .zip(original.par_iter())
                .for_each(|(s, &o)| *s = o)
        });
    }

    /// Reweigh the edges touching the selection by the attribute weights
    ///
    /// The weighted L1 distance `d_w` of every edge with a selected endpoint
    /// is compared with its unweighted distance `d`; the original similarity
    /// is scaled by `exp(-(d_w - d) / d_mean_i)` where `d_mean_i` is the mean
    /// neighbour distance of the point. Both directions of an edge are then
    /// averaged and the arena is rescaled symmetrically until every point
    /// carries its similarity mass from before the edit again.
    ///
    /// ### Params
    ///
    /// * `ctx` - Compute context
    /// * `selection` - Selected points
    pub fn weigh_attributes(&mut self, ctx: &ComputeContext, selection: &[bool]) -> Result<(), SneError> {
        check_selection(selection, self.dataset.n)?;
        let max_weight = self.params.max_attribute_weight;
        let weights: Vec<T> = self
            .attribute_weights
            .iter()
            .map(|&w| w.max(T::zero()).min(max_weight))
            .collect();

        let dataset = &self.dataset;
        let layout = &self.graph.layout;
        let neighbours = &self.graph.neighbours;
        let distances = &self.graph.distances;
        let original = &self.original;
        let current = &self.graph.similarities;

        let mass: Vec<T> = ctx.dispatch(|| {
            layout
                .par_iter()
                .map(|l| current[l.range()].iter().copied().sum())
                .collect()
        });

        // rescale + renormalise per point
        let mut rescaled = current.clone();
        {
            let slices = split_by_layout(&mut rescaled, layout);
            let weights = &weights;
            ctx.dispatch(|| {
                slices.into_par_iter().enumerate().for_each(|(i, row)| {
                    let range = layout[i].range();
                    let nb = &neighbours[range.clone()];
                    if row.is_empty() || !(selection[i] || nb.iter().any(|&j| selection[j])) {
                        return;
                    }

                    let dists = &distances[range.clone()];
                    let n_nb = T::from_usize(dists.len()).unwrap();
                    let d_mean = (dists.iter().copied().sum::<T>() / n_nb).max(T::epsilon());

                    let x_i = dataset.row(i);
                    for (e, (s, &j)) in range.zip(row.iter_mut().zip(nb)) {
                        if !(selection[i] || selection[j]) {
                            continue;
                        }
                        let d_w = x_i
                            .iter()
                            .zip(dataset.row(j))
                            .zip(weights)
                            .map(|((&a, &b), &w)| w * (a - b).abs())
                            .sum::<T>();
                        *s = original[e] * (-(d_w - distances[e]) / d_mean).exp();
                    }

                    let mass_after: T = row.iter().copied().sum();
                    if mass_after > T::zero() {
                        let c = mass[i] / mass_after;
                        row.iter_mut().for_each(|s| *s *= c);
                    }
                })
            });
        }

        // re-symmetrise
        let rescaled = &rescaled;
        let slices = split_by_layout(&mut self.graph.similarities, layout);
        ctx.dispatch(|| {
            slices.into_par_iter().enumerate().for_each(|(i, row)| {
                let l = layout[i];
                for ((s, &j), e) in row.iter_mut().zip(&neighbours[l.range()]).zip(l.range()) {
                    let back = layout[j];
                    if let Ok(pos) = neighbours[back.range()].binary_search(&i) {
                        *s = (rescaled[e] + rescaled[back.offset + pos]) / (T::one() + T::one());
                    }
                }
            })
        });

        let sweeps = rebalance_mass(ctx, layout, neighbours, &mut self.graph.similarities, &mass);
        debug!("Attribute weighting settled after {} sweeps", sweeps);

        if self.params.check_invariants {
            self.check_invariants();
        }
        Ok(())
    }

    /// Mean and variance per attribute over the selected points
    pub fn attribute_statistics(&self, ctx: &ComputeContext, selection: &[bool]) -> Result<(Vec<T>, Vec<T>), SneError> {
        check_selection(selection, self.dataset.n)?;
        let (means, variances) =
            ctx.average_per_datapoint(&self.dataset.data, self.dataset.n_dims, Some(selection), true);
        Ok((means, variances.unwrap_or_default()))
    }

    /// Remove the selected points from the dataset and rebuild the graph
    ///
    /// ### Returns
    ///
    /// The new number of points
    pub fn remove_points(&mut self, ctx: &ComputeContext, selection: &[bool]) -> Result<usize, SneError> {
        let removal = self.prepare_removal(ctx, selection)?;
        Ok(self.apply_removal(removal))
    }

    /// Compact the dataset and rebuild the graph without touching `self`
    ///
    /// Pair with [`Self::apply_removal`]; fails if the selection does not
    /// match or would remove every point.
    pub fn prepare_removal(&self, ctx: &ComputeContext, selection: &[bool]) -> Result<SimilaritiesRemoval<T>, SneError> {
        check_selection(selection, self.dataset.n)?;
        let mut dataset = self.dataset.clone();
        let n = dataset.remove(ctx, selection)?;
        if n == 0 {
            return Err(SneError::EmptyDataset);
        }

        let (graph, knn_indices) = Self::build(ctx, &dataset, None, self.perplexity, self.k, &self.params)?;
        Ok(SimilaritiesRemoval {
            dataset,
            graph,
            knn_indices,
        })
    }

    /// Swap in a prepared removal
    ///
    /// ### Returns
    ///
    /// The new number of points
    pub fn apply_removal(&mut self, removal: SimilaritiesRemoval<T>) -> usize {
        self.dataset = removal.dataset;
        self.original = removal.graph.similarities.clone();
        self.graph = removal.graph;
        self.knn_indices = removal.knn_indices;

        if self.params.check_invariants {
            self.check_invariants();
        }
        self.dataset.n
    }

    ////////////////
    // Invariants //
    ////////////////

    /// First broken graph invariant, if any
    pub fn find_violation(&self) -> Option<GraphViolation> {
        find_violation(&self.graph.layout, &self.graph.neighbours, &self.graph.similarities)
    }

    /// Panic if a graph invariant is broken
    pub fn check_invariants(&self) {
        if let Some(v) = self.find_violation() {
            panic!("Similarity graph invariant violated: {:?}", v);
        }
    }

    ///////////////
    // Accessors //
    ///////////////

    pub fn n(&self) -> usize {
        self.dataset.n
    }

    pub fn n_high_dims(&self) -> usize {
        self.dataset.n_dims
    }

    pub fn dataset(&self) -> &Dataset<T> {
        &self.dataset
    }

    pub fn layout(&self) -> &[Layout] {
        &self.graph.layout
    }

    pub fn neighbours(&self) -> &[usize] {
        &self.graph.neighbours
    }

    pub fn similarities(&self) -> &[T] {
        &self.graph.similarities
    }

    pub fn original_similarities(&self) -> &[T] {
        &self.original
    }

    pub fn distances(&self) -> &[T] {
        &self.graph.distances
    }

    /// Directed kNN lists of the last build
    pub fn knn_indices(&self) -> &[Vec<usize>] {
        &self.knn_indices
    }

    pub fn symmetric_size(&self) -> usize {
        self.graph.symmetric_size()
    }

    pub fn perplexity(&self) -> T {
        self.perplexity
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn attribute_weights(&self) -> &[T] {
        &self.attribute_weights
    }

    /// Per-attribute weights used by [`Self::weigh_attributes`]
    pub fn attribute_weights_mut(&mut self) -> &mut [T] {
        &mut self.attribute_weights
    }

    /// Read-only buffer bundle
    pub fn buffers(&self) -> SimilaritiesBuffers<'_, T> {
        SimilaritiesBuffers {
            dataset: &self.dataset.data,
            n_high_dims: self.dataset.n_dims,
            labels: self.dataset.labels.as_deref(),
            layout: &self.graph.layout,
            neighbours: &self.graph.neighbours,
            similarities: &self.graph.similarities,
            distances: &self.graph.distances,
            attribute_weights: &self.attribute_weights,
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_similarities {
    use super::*;
    use crate::data::synthetic::generate_gaussian_clusters;
    use approx::assert_relative_eq;

    fn setup(perplexity: f64) -> (ComputeContext, Similarities<f64>) {
        let ctx = ComputeContext::new(Some(4)).unwrap();
        let (data, labels) = generate_gaussian_clusters(100, 10, 2, 1.0, 10.0, 42);
        let ds = Dataset::from_mat(data.as_ref(), Some(&labels)).unwrap();
        let params = SneParams {
            perplexity,
            check_invariants: true,
            ..SneParams::default()
        };
        let sims = Similarities::new(&ctx, ds, &params).unwrap();
        (ctx, sims)
    }

    fn total(sims: &Similarities<f64>) -> f64 {
        sims.similarities().iter().sum()
    }

    #[test]
    fn test_build() {
        let (_, sims) = setup(10.0);
        assert_eq!(sims.n(), 200);
        assert_eq!(sims.k(), 31);
        assert!(sims.find_violation().is_none());
        assert_relative_eq!(total(&sims), 1.0, epsilon = 1e-9);
        assert_eq!(sims.knn_indices().len(), 200);
        assert!(sims.knn_indices().iter().all(|r| r.len() == 31));
    }

    #[test]
    fn test_weigh_similarities_and_reset() {
        let (ctx, mut sims) = setup(10.0);
        let before = sims.similarities().to_vec();
        let mut selection = vec![false; 200];
        selection[..20].iter_mut().for_each(|s| *s = true);

        sims.weigh_similarities(&ctx, 2.0, &selection, false).unwrap();
        assert!(sims.find_violation().is_none());

        for (i, l) in sims.layout().iter().enumerate() {
            for e in l.range() {
                let j = sims.neighbours()[e];
                let expected = if selection[i] || selection[j] { 2.0 } else { 1.0 };
                assert_relative_eq!(sims.similarities()[e], before[e] * expected);
            }
        }

        sims.reset(&ctx);
        assert_eq!(sims.similarities(), &before[..]);
    }

    #[test]
    fn test_weigh_similarities_inter_only_and_clamp() {
        let (ctx, mut sims) = setup(10.0);
        let before = sims.similarities().to_vec();
        let selection: Vec<bool> = (0..200).map(|i| i % 2 == 0).collect();

        // clamped to max_similarity_weight = 10
        sims.weigh_similarities(&ctx, 100.0, &selection, true).unwrap();
        assert!(sims.find_violation().is_none());
        for (i, l) in sims.layout().iter().enumerate() {
            for e in l.range() {
                let j = sims.neighbours()[e];
                let expected = if selection[i] != selection[j] { 10.0 } else { 1.0 };
                assert_relative_eq!(sims.similarities()[e], before[e] * expected);
            }
        }

        assert!(sims.weigh_similarities(&ctx, 1.0, &[true], true).is_err());
    }

    #[test]
    fn test_weigh_attributes_keeps_symmetry_and_mass() {
        let (ctx, mut sims) = setup(10.0);
        let selection: Vec<bool> = (0..200).map(|i| i < 50).collect();
        sims.attribute_weights_mut()[0] = 0.0;
        sims.attribute_weights_mut()[1] = 5.0; // clamped to 2

        let row_mass = |s: &Similarities<f64>| -> Vec<f64> {
            s.layout()
                .iter()
                .map(|l| s.similarities()[l.range()].iter().sum())
                .collect()
        };
        let mass_before = row_mass(&sims);
        let before = sims.similarities().to_vec();

        sims.weigh_attributes(&ctx, &selection).unwrap();
        assert!(sims.find_violation().is_none());
        assert_relative_eq!(total(&sims), 1.0, epsilon = 1e-9);

        // every point keeps its mass, not only the graph as a whole
        for (i, (&a, &b)) in row_mass(&sims).iter().zip(&mass_before).enumerate() {
            assert!(((a - b) / b).abs() < 1e-6, "mass of point {} moved: {} -> {}", i, b, a);
        }

        // edges at the selection change, edges far from it barely move
        let touched = |p: usize| {
            selection[p]
                || sims.neighbours()[sims.layout()[p].range()]
                    .iter()
                    .any(|&q| selection[q])
        };
        let mut changed = 0;
        for (i, l) in sims.layout().iter().enumerate() {
            let nb = &sims.neighbours()[l.range()];
            for (e, &j) in l.range().zip(nb) {
                if before[e] == 0.0 {
                    continue;
                }
                let rel = ((sims.similarities()[e] - before[e]) / before[e]).abs();
                if selection[i] && rel > 1e-3 {
                    changed += 1;
                }
                if !touched(i) && !touched(j) {
                    assert!(rel < 0.05, "edge ({}, {}) far from the selection moved by {}", i, j, rel);
                }
            }
        }
        assert!(changed > 0);
    }

    #[test]
    fn test_weigh_attributes_unit_weights_is_identity() {
        let (ctx, mut sims) = setup(10.0);
        let before = sims.similarities().to_vec();
        let selection = vec![true; 200];
        sims.weigh_attributes(&ctx, &selection).unwrap();
        for (a, b) in sims.similarities().iter().zip(&before) {
            assert_relative_eq!(*a, *b, epsilon = 1e-15);
        }
    }

    #[test]
    fn test_recompute_subset() {
        let (ctx, mut sims) = setup(10.0);
        let selection: Vec<bool> = (0..200).map(|i| i >= 100).collect();
        sims.recompute(&ctx, &selection, 5.0, 16).unwrap();

        assert!(sims.find_violation().is_none());
        assert_eq!(sims.k(), 16);
        for (i, l) in sims.layout().iter().enumerate() {
            if i < 100 {
                assert_eq!(l.size, 0);
            } else {
                assert!(l.size >= 16);
                assert!(sims.neighbours()[l.range()].iter().all(|&j| j >= 100));
            }
        }
        assert_relative_eq!(total(&sims), 1.0, epsilon = 1e-9);

        assert!(matches!(
            sims.recompute(&ctx, &selection, 5.0, 500),
            Err(SneError::KnnTooLarge { .. })
        ));
    }

    #[test]
    fn test_attribute_statistics() {
        let (ctx, sims) = setup(10.0);
        let labels = sims.dataset().labels.clone().unwrap();
        let selection: Vec<bool> = labels.iter().map(|&l| l == 0).collect();
        let (means, vars) = sims.attribute_statistics(&ctx, &selection).unwrap();
        assert_eq!(means.len(), 10);
        // cluster 0 is centred at +10 on axis 0
        assert!((means[0] - 10.0).abs() < 0.5);
        assert!((vars[0] - 1.0).abs() < 0.5);
    }

    #[test]
    fn test_remove_points() {
        let (ctx, mut sims) = setup(10.0);
        let selection: Vec<bool> = (0..200).map(|i| i % 4 == 0).collect();
        let n = sims.remove_points(&ctx, &selection).unwrap();
        assert_eq!(n, 150);
        assert_eq!(sims.n(), 150);
        assert_eq!(sims.layout().len(), 150);
        assert_eq!(sims.dataset().labels.as_ref().unwrap().len(), 150);
        assert!(sims.find_violation().is_none());

        assert!(matches!(
            sims.remove_points(&ctx, &vec![true; 150]),
            Err(SneError::EmptyDataset)
        ));
    }
}
