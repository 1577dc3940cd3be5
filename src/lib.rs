#![allow(clippy::needless_range_loop)] // I like loops ... !

pub mod data;
pub mod error;
pub mod field;
pub mod prelude;
pub mod training;
pub mod utils;

use faer::MatRef;
use log::{info, warn};
use std::time::Instant;
use thousands::*;

use crate::data::nearest_neighbours::*;
use crate::data::similarities::*;
use crate::data::structures::*;
use crate::error::SneError;
use crate::field::hierarchy::FieldHierarchyBuffers;
use crate::training::minimization::*;
use crate::utils::context::ComputeContext;
use crate::utils::math::*;

////////////
// Params //
////////////

/// Main config structure of the solver
///
/// ### Fields
///
/// * `n_low_dims` - Output dimensionality, `2` or `3`.
/// * `perplexity` - Target perplexity of the conditional distributions.
/// * `k` - Number of neighbours. `None` means `3 * perplexity + 1`.
/// * `k_max` - Upper limit for `k`.
/// * `iterations` - Iteration budget of [`Sne::comp`].
/// * `single_hierarchy_theta` - Barnes-Hut parameter in single hierarchy mode.
/// * `dual_hierarchy_theta` - Approximation parameter in dual hierarchy mode.
/// * `dual_hierarchy` - Use the dual hierarchy field evaluation.
/// * `field_scaling_2d` / `field_scaling_3d` - Field resolution per unit of
///   embedding extent.
/// * `seed` - Random seed (initial layout and NN-descent).
/// * `rng_range` - Half-width of the random initial layout.
/// * `momentum_switch_iter` - Iteration at which `final_momentum` kicks in.
/// * `n_exaggeration_iters` - Length of the early exaggeration phase.
/// * `n_exponential_decay_iters` - Length of the decay back to 1 afterwards.
/// * `minimum_gain` - Floor of the adaptive gains.
/// * `eta` - Learning rate.
/// * `momentum` / `final_momentum` - Momentum before / after the switch.
/// * `exaggeration_factor` - Early exaggeration.
/// * `max_attribute_weight` - Upper clamp of the per-attribute weights.
/// * `max_similarity_weight` - Upper clamp of the similarity reweighing.
/// * `weight_falloff` - How strongly the neighbour's force weight enters the
///   pair multiplier.
/// * `knn_method` - `"auto"`, `"exact"` or `"nndescent"`.
/// * `knn_params` - Parameters of the nearest neighbour index (metric and
///   NN-descent settings).
/// * `n_threads` - Size of the thread pool. `None` lets rayon decide.
/// * `check_invariants` - Verify the graph after every (re)build.
#[derive(Debug, Clone)]
pub struct SneParams<T> {
    pub n_low_dims: usize,
    pub perplexity: T,
    pub k: Option<usize>,
    pub k_max: usize,
    pub iterations: usize,
    pub single_hierarchy_theta: T,
    pub dual_hierarchy_theta: T,
    pub dual_hierarchy: bool,
    pub field_scaling_2d: T,
    pub field_scaling_3d: T,
    pub seed: u64,
    pub rng_range: T,
    pub momentum_switch_iter: usize,
    pub n_exaggeration_iters: usize,
    pub n_exponential_decay_iters: usize,
    pub minimum_gain: T,
    pub eta: T,
    pub momentum: T,
    pub final_momentum: T,
    pub exaggeration_factor: T,
    pub max_attribute_weight: T,
    pub max_similarity_weight: T,
    pub weight_falloff: T,
    pub knn_method: String,
    pub knn_params: NearestNeighbourParams<T>,
    pub n_threads: Option<usize>,
    pub check_invariants: bool,
}

impl<T: SneFloat> Default for SneParams<T> {
    fn default() -> Self {
        Self {
            n_low_dims: 2,
            perplexity: cast(30.0),
            k: None,
            k_max: 192,
            iterations: 1000,
            single_hierarchy_theta: cast(0.5),
            dual_hierarchy_theta: cast(0.25),
            dual_hierarchy: true,
            field_scaling_2d: cast(2.0),
            field_scaling_3d: cast(1.2),
            seed: 1,
            rng_range: cast(0.1),
            momentum_switch_iter: 250,
            n_exaggeration_iters: 250,
            n_exponential_decay_iters: 150,
            minimum_gain: cast(0.1),
            eta: cast(200.0),
            momentum: cast(0.2),
            final_momentum: cast(0.5),
            exaggeration_factor: cast(12.0),
            max_attribute_weight: cast(2.0),
            max_similarity_weight: cast(10.0),
            weight_falloff: T::zero(),
            knn_method: "auto".into(),
            knn_params: NearestNeighbourParams::default(),
            n_threads: None,
            check_invariants: false,
        }
    }
}

impl<T: SneFloat> SneParams<T> {
    /// Default 2D parameters
    ///
    /// ### Params
    ///
    /// * `perplexity` - Target perplexity. Defaults to `30.0`.
    /// * `iterations` - Iteration budget. Defaults to `1000`.
    ///
    /// ### Returns
    ///
    /// Hopefully sensible standard parameters for 2D visualisation.
    pub fn new_2d(perplexity: Option<T>, iterations: Option<usize>) -> Self {
        Self {
            perplexity: perplexity.unwrap_or(cast(30.0)),
            iterations: iterations.unwrap_or(1000),
            ..Self::default()
        }
    }

    /// Default 3D parameters
    ///
    /// ### Params
    ///
    /// * `perplexity` - Target perplexity. Defaults to `30.0`.
    /// * `iterations` - Iteration budget. Defaults to `1000`.
    ///
    /// ### Returns
    ///
    /// Standard parameters with a three dimensional output.
    pub fn new_3d(perplexity: Option<T>, iterations: Option<usize>) -> Self {
        Self {
            n_low_dims: 3,
            ..Self::new_2d(perplexity, iterations)
        }
    }

    /// Number of neighbours actually used
    pub fn k(&self) -> usize {
        let default_k = (self.perplexity * cast::<T>(3.0) + T::one())
            .to_usize()
            .unwrap_or(self.k_max);
        self.k.unwrap_or(default_k).min(self.k_max)
    }

    /// Parsed kNN method; unknown names fall back to [`KnnMethod::Auto`]
    pub fn knn_method(&self) -> KnnMethod {
        parse_knn_method(&self.knn_method).unwrap_or_else(|| {
            warn!(
                "Unknown kNN method '{}', falling back to {:?}",
                self.knn_method,
                KnnMethod::default()
            );
            KnnMethod::default()
        })
    }

    /// Field scaling of the configured output dimensionality
    pub fn field_scaling(&self) -> T {
        if self.n_low_dims == 3 {
            self.field_scaling_3d
        } else {
            self.field_scaling_2d
        }
    }

    /// Approximation parameter of the configured field evaluation
    pub fn theta(&self) -> T {
        if self.dual_hierarchy {
            self.dual_hierarchy_theta
        } else {
            self.single_hierarchy_theta
        }
    }

    /// Check the parameters against a dataset of `n` points
    ///
    /// ### Params
    ///
    /// * `n` - Number of points
    ///
    /// ### Returns
    ///
    /// The first problem found, if any
    pub fn validate(&self, n: usize) -> Result<(), SneError> {
        if !(2..=3).contains(&self.n_low_dims) {
            return Err(SneError::Dimensionality(self.n_low_dims));
        }
        if n == 0 {
            return Err(SneError::EmptyDataset);
        }
        if self.perplexity <= T::zero() {
            return Err(SneError::InvalidParams(format!(
                "perplexity must be positive, got {}",
                self.perplexity
            )));
        }
        if let Some(k) = self.k {
            if k > self.k_max {
                return Err(SneError::KnnTooLarge { k, k_max: self.k_max });
            }
            if k == 0 {
                return Err(SneError::InvalidParams("k must be at least 1".into()));
            }
        }
        // self-interaction is only guaranteed to stay exact below 2/3
        if self.dual_hierarchy_theta <= T::zero() || self.dual_hierarchy_theta > cast(0.5) {
            return Err(SneError::InvalidParams(format!(
                "dual_hierarchy_theta must be in (0, 0.5], got {}",
                self.dual_hierarchy_theta
            )));
        }
        if self.single_hierarchy_theta <= T::zero() || self.single_hierarchy_theta >= T::one() {
            return Err(SneError::InvalidParams(format!(
                "single_hierarchy_theta must be in (0, 1), got {}",
                self.single_hierarchy_theta
            )));
        }
        if self.eta <= T::zero() {
            return Err(SneError::InvalidParams(format!("eta must be positive, got {}", self.eta)));
        }
        if self.exaggeration_factor < T::one() {
            return Err(SneError::InvalidParams(format!(
                "exaggeration_factor must be at least 1, got {}",
                self.exaggeration_factor
            )));
        }

        let k = self.k();
        if k + 1 > n {
            warn!(
                "Perplexity {} asks for {} neighbours but there are only {} points",
                self.perplexity,
                k,
                n.separate_with_underscores()
            );
        }
        Ok(())
    }
}

/////////
// Sne //
/////////

/// The interactive solver
///
/// Owns the compute context, the similarity graph and the minimization.
/// Selection tags and per-attribute weights are written by the caller through
/// [`Self::selection_mut`] and [`Self::attribute_weights_mut`]; the
/// interactive commands act on the current selection.
pub struct Sne<T> {
    ctx: ComputeContext,
    params: SneParams<T>,
    similarities: Similarities<T>,
    minimization: Minimization<T>,
}

impl<T: SneFloat> Sne<T> {
    /// Build the similarity graph and a random initial embedding
    ///
    /// ### Params
    ///
    /// * `data` - Input data matrix (samples × features)
    /// * `labels` - Optional per-sample labels (negative = unlabeled)
    /// * `params` - Solver parameters
    ///
    /// ### Returns
    ///
    /// The solver, ready to iterate
    pub fn new(data: MatRef<T>, labels: Option<&[i32]>, params: SneParams<T>) -> Result<Self, SneError> {
        params.validate(data.nrows())?;
        let ctx = ComputeContext::new(params.n_threads)?;
        info!(
            "Setting up dual hierarchy SNE for {} points with {} features on {} threads",
            data.nrows().separate_with_underscores(),
            data.ncols(),
            ctx.n_threads()
        );

        let dataset = Dataset::from_mat(data, labels)?;
        let similarities = Similarities::new(&ctx, dataset, &params)?;
        let minimization = Minimization::new(similarities.n(), &params)?;

        Ok(Self {
            ctx,
            params,
            similarities,
            minimization,
        })
    }

    ///////////////
    // Iteration //
    ///////////////

    /// Run the configured number of iterations
    pub fn comp(&mut self) -> Result<(), SneError> {
        let start = Instant::now();
        for _ in 0..self.params.iterations {
            self.comp_iteration()?;
        }
        info!(
            "Finished {} iterations in {:.2?}",
            self.params.iterations.separate_with_underscores(),
            start.elapsed()
        );
        Ok(())
    }

    /// Advance by one iteration, reconstructing the minimization first when
    /// the output dimensionality was changed
    pub fn comp_iteration(&mut self) -> Result<(), SneError> {
        if self.minimization.comp_iteration(&self.ctx, &self.similarities) {
            self.reconstruct_minimization()?;
            self.minimization.comp_iteration(&self.ctx, &self.similarities);
        }
        Ok(())
    }

    fn reconstruct_minimization(&mut self) -> Result<(), SneError> {
        if let Some(d) = self.minimization.pending_n_low_dims() {
            self.params.n_low_dims = d;
        }
        let mut minimization = Minimization::new(self.similarities.n(), &self.params)?;
        minimization
            .selection_mut()
            .copy_from_slice(self.minimization.selection());
        self.minimization = minimization;
        info!("Restarted with {} output dimensions", self.params.n_low_dims);
        Ok(())
    }

    /////////////////
    // Interaction //
    /////////////////

    /// Mask of the currently selected points
    fn selected(&self) -> Vec<bool> {
        selection_mask(self.minimization.selection())
    }

    pub fn restart(&mut self) {
        self.minimization.restart();
    }

    pub fn reexaggerate(&mut self) {
        self.minimization.reexaggerate();
    }

    pub fn set_fixed(&mut self) {
        self.minimization.set_fixed();
    }

    pub fn unfix_all(&mut self) {
        self.minimization.unfix_all();
    }

    pub fn translate_selected(&mut self, screen_delta: &[T]) {
        self.minimization.translate_selected(screen_delta);
    }

    pub fn set_disabled(&mut self) {
        self.minimization.set_disabled();
    }

    pub fn enable_all(&mut self) {
        self.minimization.enable_all();
    }

    pub fn set_weights(&mut self, weight: T) {
        self.minimization.set_weights(weight);
    }

    /// Switch the output dimensionality; takes effect with the next
    /// iteration and restarts the embedding
    pub fn set_n_low_dims(&mut self, n_low_dims: usize) -> Result<(), SneError> {
        self.minimization.set_n_low_dims(n_low_dims)
    }

    /// Rebuild the graph over the selected points (all points if nothing is
    /// selected)
    pub fn recompute(&mut self, perplexity: T, k: usize) -> Result<(), SneError> {
        let mut selection = self.selected();
        if !selection.iter().any(|&s| s) {
            selection.iter_mut().for_each(|s| *s = true);
        }
        self.similarities.recompute(&self.ctx, &selection, perplexity, k)
    }

    /// Scale the similarities of edges touching the selection
    pub fn weigh_similarities(&mut self, weight: T, inter_only: bool) -> Result<(), SneError> {
        let selection = self.selected();
        self.similarities
            .weigh_similarities(&self.ctx, weight, &selection, inter_only)
    }

    pub fn reset_similarities(&mut self) {
        self.similarities.reset(&self.ctx);
    }

    /// Reweigh the edges of the selection by the attribute weights
    pub fn weigh_attributes(&mut self) -> Result<(), SneError> {
        let selection = self.selected();
        self.similarities.weigh_attributes(&self.ctx, &selection)
    }

    /// Mean and variance per attribute over the selection
    pub fn attribute_statistics(&self) -> Result<(Vec<T>, Vec<T>), SneError> {
        self.similarities
            .attribute_statistics(&self.ctx, &self.selected())
    }

    /// Drop the selected points, rebuild the graph and restart
    ///
    /// ### Returns
    ///
    /// The new number of points
    pub fn remove_selected(&mut self) -> Result<usize, SneError> {
        let selection = self.selected();
        // both components stay untouched unless both removals succeed
        let sims = self.similarities.prepare_removal(&self.ctx, &selection)?;
        let min = self.minimization.prepare_removal(&self.ctx, &selection)?;
        let n = self.similarities.apply_removal(sims);
        self.minimization.apply_removal(min);
        self.minimization.restart();
        info!("Removed points, {} remain", n.separate_with_underscores());
        Ok(n)
    }

    pub fn selection_mut(&mut self) -> &mut [Selection] {
        self.minimization.selection_mut()
    }

    pub fn attribute_weights_mut(&mut self) -> &mut [T] {
        self.similarities.attribute_weights_mut()
    }

    /////////////////
    // Diagnostics //
    /////////////////

    pub fn kl_divergence(&self) -> T {
        self.minimization
            .kl_divergence(&self.ctx, &self.similarities)
    }

    /// Mean neighbourhood preservation for `k` neighbours; the per-point
    /// values end up in [`MinimizationBuffers::neighbourhood_preservation`]
    pub fn neighborhood_preservation(&mut self, k: usize) -> Result<T, SneError> {
        self.minimization
            .neighborhood_preservation(&self.ctx, &self.similarities, k)
    }

    ///////////////
    // Accessors //
    ///////////////

    pub fn n(&self) -> usize {
        self.similarities.n()
    }

    pub fn params(&self) -> &SneParams<T> {
        &self.params
    }

    pub fn ctx(&self) -> &ComputeContext {
        &self.ctx
    }

    pub fn similarities(&self) -> &Similarities<T> {
        &self.similarities
    }

    pub fn minimization(&self) -> &Minimization<T> {
        &self.minimization
    }

    /// Row-major `n x n_low_dims` embedding
    pub fn embedding(&self) -> &[T] {
        self.minimization.embedding()
    }

    pub fn similarities_buffers(&self) -> SimilaritiesBuffers<'_, T> {
        self.similarities.buffers()
    }

    pub fn minimization_buffers(&self) -> MinimizationBuffers<'_, T> {
        self.minimization.buffers()
    }

    pub fn field_hierarchy_buffers(&self) -> FieldHierarchyBuffers<'_, T> {
        self.minimization.field_hierarchy_buffers()
    }
}

//////////
// Main //
//////////

/// Run dual hierarchy t-SNE
///
/// 1. Find the k nearest neighbours (exact or NN-descent)
/// 2. Calibrate the Gaussian conditionals to the perplexity
/// 3. Symmetrise into the sparse similarity graph
/// 4. Initialise a small random embedding
/// 5. Minimise the KL divergence with the approximated repulsive field
///
/// ### Params
///
/// * `data` - Input data matrix (samples × features)
/// * `labels` - Optional per-sample labels
/// * `params` - The solver parameters.
///
/// ### Returns
///
/// Embedding coordinates as `Vec<Vec<T>>` where outer vector has length
/// `n_low_dims` and inner vectors have length `n_samples`.
///
/// ### Example
///
/// ```ignore
/// use faer::Mat;
/// let data = Mat::from_fn(1000, 128, |_, _| rand::random::<f32>());
/// let embedding = run_dhsne(data.as_ref(), None, SneParams::default())?;
/// // embedding[0] contains x-coordinates for all points
/// // embedding[1] contains y-coordinates for all points
/// ```
pub fn run_dhsne<T: SneFloat>(
    data: MatRef<T>,
    labels: Option<&[i32]>,
    params: SneParams<T>,
) -> Result<Vec<Vec<T>>, SneError> {
    let mut sne = Sne::new(data, labels, params)?;
    sne.comp()?;
    Ok(sne.minimization().embedding_columns())
}

///////////
// Tests //
///////////
