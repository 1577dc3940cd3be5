use log::{debug, info};
use rayon::prelude::*;
use std::time::Instant;
use thousands::*;

use crate::data::init::random_layout;
use crate::data::nearest_neighbours::run_knn;
use crate::data::similarities::Similarities;
use crate::data::structures::*;
use crate::error::SneError;
use crate::field::evaluator::*;
use crate::field::hierarchy::*;
use crate::utils::bh_tree::EmbeddingHierarchy;
use crate::utils::context::ComputeContext;
use crate::utils::math::*;
use crate::utils::primitives::ReduceOp;
use crate::{assert_rows, SneParams};

/////////////
// Globals //
/////////////

/// Both hierarchies are rebuilt (instead of refit) every this many iterations
pub const HIERARCHY_REBUILD_INTERVAL: usize = 4;

/// Smallest embedding extent tolerated during exaggeration before the
/// embedding is blown up again
pub const COLLAPSE_THRESHOLD: f64 = 0.1;

/// Fraction of the range the bounds are padded by on every side
const BOUNDS_PADDING: f64 = 0.1;

const GAIN_INCREASE: f64 = 0.2;
const GAIN_DECAY: f64 = 0.8;
const MIN_Z: f64 = 1e-12;
const LOG_INTERVAL: usize = 100;

/////////////
// Buffers //
/////////////

/// Read-only view of the minimization state for external collaborators
///
/// All per-point buffers are row-major; `embedding`, `gradients`,
/// `updates` and `gains` are `n x n_low_dims`, `field` is
/// `n x (n_low_dims + 1)`.
#[derive(Clone, Copy, Debug)]
pub struct MinimizationBuffers<'a, T> {
    pub n_low_dims: usize,
    pub embedding: &'a [T],
    pub bounds: Bounds<T>,
    pub field: &'a [T],
    pub gradients: &'a [T],
    pub updates: &'a [T],
    pub gains: &'a [T],
    pub selection: &'a [Selection],
    pub fixed: &'a [bool],
    pub disabled: &'a [bool],
    pub translating: &'a [bool],
    pub weights: &'a [T],
    pub neighbourhood_preservation: &'a [T],
}

/// Compacted per-point buffers of a pending point removal
pub struct MinimizationRemoval<T> {
    n: usize,
    embedding: Vec<T>,
    gradients: Vec<T>,
    updates: Vec<T>,
    gains: Vec<T>,
    field: Vec<T>,
    selection: Vec<Selection>,
    fixed: Vec<bool>,
    disabled: Vec<bool>,
    translating: Vec<bool>,
    weights: Vec<T>,
    neighbourhood_preservation: Vec<T>,
}

/////////////
// Helpers //
/////////////

/// Step sizes of one momentum / gain update
#[derive(Clone, Copy, Debug)]
struct GainStep<T> {
    eta: T,
    momentum: T,
    min_gain: T,
    increase: T,
    decay: T,
}

impl<T: SneFloat> GainStep<T> {
    fn new(eta: T, momentum: T, min_gain: T) -> Self {
        Self {
            eta,
            momentum,
            min_gain,
            increase: cast(GAIN_INCREASE),
            decay: cast(GAIN_DECAY),
        }
    }

    /// Move one point along its negative gradient
    ///
    /// A coordinate whose gradient keeps pushing in the direction of the
    /// previous update gets a larger gain; one that flips is damped.
    /// All slices are the `n_low_dims` coordinates of the same point.
    #[inline]
    fn apply(&self, pos: &mut [T], update: &mut [T], gain: &mut [T], grad: &[T]) {
        for (((y, u), g), &dy) in pos.iter_mut().zip(update.iter_mut()).zip(gain.iter_mut()).zip(grad) {
            let descending = (dy > T::zero()) != (*u > T::zero());
            let g_new = if descending { *g + self.increase } else { *g * self.decay };
            *g = g_new.max(self.min_gain);
            *u = self.momentum * *u - self.eta * *g * dy;
            *y += *u;
        }
    }
}

//////////////////
// Minimization //
//////////////////

/// Gradient descent over the embedding
///
/// Runs one t-SNE iteration per [`Self::comp_iteration`]: bounds, hierarchy
/// maintenance, field evaluation, attractive forces, gradient and the
/// momentum / gain update. Holds the interactive per-point state
/// (selection, fixed, disabled, translating, weights).
pub struct Minimization<T> {
    params: SneParams<T>,
    n: usize,
    n_dims: usize,
    pending_n_dims: Option<usize>,
    iteration: usize,
    exaggeration_end: usize,
    force_rebuild: bool,
    restarts: u64,
    embedding: Vec<T>,
    gradients: Vec<T>,
    updates: Vec<T>,
    gains: Vec<T>,
    field: Vec<T>,
    bounds: Bounds<T>,
    z: T,
    selection: Vec<Selection>,
    fixed: Vec<bool>,
    disabled: Vec<bool>,
    translating: Vec<bool>,
    weights: Vec<T>,
    pending_translation: [T; 3],
    neighbourhood_preservation: Vec<T>,
    tree: EmbeddingHierarchy<T>,
    field_hierarchy: FieldHierarchy<T>,
}

impl<T: SneFloat> Minimization<T> {
    /// Generate a new minimization with a random initial embedding
    ///
    /// ### Params
    ///
    /// * `n` - Number of points
    /// * `params` - Solver parameters
    ///
    /// ### Returns
    ///
    /// Initialised self or an error for an unsupported dimensionality
    pub fn new(n: usize, params: &SneParams<T>) -> Result<Self, SneError> {
        let n_dims = params.n_low_dims;
        if !(2..=3).contains(&n_dims) {
            return Err(SneError::Dimensionality(n_dims));
        }
        if n == 0 {
            return Err(SneError::EmptyDataset);
        }

        let embedding = random_layout(n, n_dims, params.seed, Some(params.rng_range));

        Ok(Self {
            params: params.clone(),
            n,
            n_dims,
            pending_n_dims: None,
            iteration: 0,
            exaggeration_end: params.n_exaggeration_iters,
            force_rebuild: true,
            restarts: 0,
            tree: EmbeddingHierarchy::new(&embedding, n_dims, None),
            embedding,
            gradients: vec![T::zero(); n * n_dims],
            updates: vec![T::zero(); n * n_dims],
            gains: vec![T::one(); n * n_dims],
            field: vec![T::zero(); n * (n_dims + 1)],
            bounds: Bounds::empty(n_dims),
            z: T::zero(),
            selection: vec![Selection::None; n],
            fixed: vec![false; n],
            disabled: vec![false; n],
            translating: vec![false; n],
            weights: vec![T::one(); n],
            pending_translation: [T::zero(); 3],
            neighbourhood_preservation: vec![T::zero(); n],
            field_hierarchy: FieldHierarchy::new(n_dims),
        })
    }

    ///////////////
    // Iteration //
    ///////////////

    /// Run the full iteration budget
    ///
    /// ### Returns
    ///
    /// `true` if the run stopped early because the component has to be
    /// reconstructed (see [`Self::comp_iteration`])
    pub fn comp(&mut self, ctx: &ComputeContext, sims: &Similarities<T>) -> bool {
        let start = Instant::now();
        for _ in 0..self.params.iterations {
            if self.comp_iteration(ctx, sims) {
                return true;
            }
        }
        info!(
            "Minimization of {} points finished after {} iterations in {:.2?}",
            self.n.separate_with_underscores(),
            self.iteration.separate_with_underscores(),
            start.elapsed()
        );
        false
    }

    /// Advance the minimization by one iteration
    ///
    /// ### Returns
    ///
    /// `true` if the output dimensionality was changed through
    /// [`Self::set_n_low_dims`]; the caller then has to construct a new
    /// minimization. No iteration is performed in that case.
    pub fn comp_iteration(&mut self, ctx: &ComputeContext, sims: &Similarities<T>) -> bool {
        if self.pending_n_dims.is_some_and(|d| d != self.n_dims) {
            return true;
        }
        debug_assert_eq!(sims.n(), self.n);

        let t0 = Instant::now();
        self.comp_bounds(ctx);

        let t1 = Instant::now();
        self.comp_hierarchies(ctx);

        let t2 = Instant::now();
        self.comp_field(ctx);

        let t3 = Instant::now();
        let exaggeration = self.exaggeration();
        self.comp_gradients(ctx, sims, exaggeration);
        self.comp_update(ctx);
        self.comp_center_and_scale(ctx, exaggeration);

        if self.iteration % LOG_INTERVAL == 0 {
            info!(
                "Iteration {} | Z = {} | exaggeration = {:.2}",
                self.iteration.separate_with_underscores(),
                self.z.to_f64().unwrap_or(f64::NAN),
                exaggeration.to_f64().unwrap_or(f64::NAN)
            );
            debug!(
                "Iteration timing: bounds {:.2?}, hierarchies {:.2?}, field {:.2?}, gradient {:.2?}",
                t1 - t0,
                t2 - t1,
                t3 - t2,
                t3.elapsed()
            );
        }

        self.iteration += 1;
        false
    }

    /// Mask of points that take part in the field
    fn active_mask(&self) -> Vec<bool> {
        self.disabled.iter().map(|&d| !d).collect()
    }

    /// Bounds over the enabled, non-translating points
    fn comp_bounds(&mut self, ctx: &ComputeContext) {
        let mask: Vec<bool> = self
            .disabled
            .iter()
            .zip(&self.translating)
            .map(|(&d, &t)| !d && !t)
            .collect();
        let mask = if mask.iter().any(|&m| m) { Some(&mask[..]) } else { None };

        let min = ctx.reduce_columns(&self.embedding, self.n_dims, ReduceOp::Min, mask);
        let max = ctx.reduce_columns(&self.embedding, self.n_dims, ReduceOp::Max, mask);
        self.bounds = Bounds::from_min_max(&min, &max).padded(cast(BOUNDS_PADDING));
    }

    /// Resize and rebuild / refit the hierarchies
    fn comp_hierarchies(&mut self, ctx: &ComputeContext) {
        let active = self.active_mask();
        let layout = FieldLayout::from_bounds(&self.bounds, self.params.field_scaling());

        let rebuild = self.force_rebuild
            || self.iteration % HIERARCHY_REBUILD_INTERVAL == 0
            || layout.resolution != self.field_hierarchy.layout().resolution;
        self.force_rebuild = false;

        if rebuild {
            self.tree.rebuild(&self.embedding, Some(&active));
        } else {
            self.tree.refit(&self.embedding);
        }

        if self.params.dual_hierarchy {
            self.field_hierarchy
                .comp(ctx, &self.embedding, Some(&active), &self.bounds, layout, rebuild);
        }
    }

    /// Evaluate the field and Z
    fn comp_field(&mut self, ctx: &ComputeContext) {
        let active = self.active_mask();
        if self.params.dual_hierarchy {
            evaluate_dual_hierarchy(
                ctx,
                &self.tree,
                &mut self.field_hierarchy,
                &self.embedding,
                self.params.theta(),
                &mut self.field,
            );
        } else {
            evaluate_single_hierarchy(
                ctx,
                &self.tree,
                &self.embedding,
                Some(&active),
                self.params.theta(),
                &mut self.field,
            );
        }
        self.z = partition_function(ctx, &self.field, self.n_dims, Some(&active));
    }

    /// Attractive forces and the full gradient
    fn comp_gradients(&mut self, ctx: &ComputeContext, sims: &Similarities<T>, exaggeration: T) {
        let n_dims = self.n_dims;
        let width = n_dims + 1;
        let z_inv = if self.z > cast(MIN_Z) {
            T::one() / self.z
        } else {
            T::zero()
        };
        let four = cast::<T>(4.0);
        let falloff = self.params.weight_falloff;

        let layout = sims.layout();
        let neighbours = sims.neighbours();
        let similarities = sims.similarities();
        let embedding = &self.embedding;
        let field = &self.field;
        let disabled = &self.disabled;
        let weights = &self.weights;

        ctx.dispatch(|| {
            self.gradients
                .par_chunks_mut(n_dims)
                .enumerate()
                .for_each(|(i, grad)| {
                    if disabled[i] {
                        grad.iter_mut().for_each(|g| *g = T::zero());
                        return;
                    }
                    let y_i = &embedding[i * n_dims..(i + 1) * n_dims];
                    let w_i = weights[i];

                    let mut attr = [T::zero(); 3];
                    for e in layout[i].range() {
                        let j = neighbours[e];
                        if disabled[j] {
                            continue;
                        }
                        let y_j = &embedding[j * n_dims..(j + 1) * n_dims];
                        let mut diff = [T::zero(); 3];
                        let mut dist_sq = T::zero();
                        for d in 0..n_dims {
                            diff[d] = y_i[d] - y_j[d];
                            dist_sq += diff[d] * diff[d];
                        }
                        let q = T::one() / (T::one() + dist_sq);
                        let mult = w_i * (T::one() + falloff * (weights[j] - T::one()));
                        let force = similarities[e] * q * mult;
                        for d in 0..n_dims {
                            attr[d] += force * diff[d];
                        }
                    }

                    let rep = &field[i * width + 1..(i + 1) * width];
                    for d in 0..n_dims {
                        grad[d] = four * (exaggeration * attr[d] - rep[d] * z_inv);
                    }
                })
        });
    }

    /// Momentum / gain step; fixed and disabled points stay, translating
    /// points take the pending offset
    fn comp_update(&mut self, ctx: &ComputeContext) {
        let n_dims = self.n_dims;
        let momentum = if self.iteration < self.params.momentum_switch_iter {
            self.params.momentum
        } else {
            self.params.final_momentum
        };
        let step = GainStep::new(self.params.eta, momentum, self.params.minimum_gain);
        let offset = self.pending_translation;
        let fixed = &self.fixed;
        let disabled = &self.disabled;
        let translating = &self.translating;
        let gradients = &self.gradients;

        ctx.dispatch(|| {
            self.embedding
                .par_chunks_mut(n_dims)
                .zip(self.updates.par_chunks_mut(n_dims))
                .zip(self.gains.par_chunks_mut(n_dims))
                .enumerate()
                .for_each(|(i, ((pos, update), gain))| {
                    if translating[i] {
                        for d in 0..n_dims {
                            pos[d] += offset[d];
                        }
                        return;
                    }
                    if fixed[i] || disabled[i] {
                        return;
                    }
                    step.apply(pos, update, gain, &gradients[i * n_dims..(i + 1) * n_dims]);
                })
        });

        if self.translating.iter().any(|&t| t) {
            ctx.set(&mut self.translating, false);
            self.pending_translation = [T::zero(); 3];
            self.force_rebuild = true;
        }
    }

    /// Re-center on the bounds and undo a collapse during exaggeration
    fn comp_center_and_scale(&mut self, ctx: &ComputeContext, exaggeration: T) {
        let n_dims = self.n_dims;
        let center = self.bounds.center;
        let min_range = self.bounds.min_range();
        let threshold = cast::<T>(COLLAPSE_THRESHOLD);

        let scale = if exaggeration > T::one() && min_range < threshold {
            threshold / min_range.max(T::epsilon())
        } else {
            T::one()
        };

        ctx.dispatch(|| {
            self.embedding.par_chunks_mut(n_dims).for_each(|pos| {
                for d in 0..n_dims {
                    pos[d] = (pos[d] - center[d]) * scale;
                }
            })
        });
    }

    /// Exaggeration factor of the current iteration
    ///
    /// `exaggeration_factor` until the exaggeration phase ends, then a linear
    /// decay to 1 over `n_exponential_decay_iters`, then exactly 1.
    pub fn exaggeration(&self) -> T {
        let factor = self.params.exaggeration_factor;
        let n_decay = self.params.n_exponential_decay_iters;
        let it = self.iteration;

        if it < self.exaggeration_end {
            factor
        } else if it < self.exaggeration_end + n_decay {
            let t = T::from_usize(it - self.exaggeration_end).unwrap() / T::from_usize(n_decay).unwrap();
            T::one() + (factor - T::one()) * (T::one() - t)
        } else {
            T::one()
        }
    }

    /////////////////
    // Diagnostics //
    /////////////////

    /// KL divergence between the similarities and the current embedding
    ///
    /// Z is recomputed at the current positions; edges with a disabled
    /// endpoint are left out.
    pub fn kl_divergence(&self, ctx: &ComputeContext, sims: &Similarities<T>) -> T {
        let n_dims = self.n_dims;
        let active = self.active_mask();
        let tree = EmbeddingHierarchy::new(&self.embedding, n_dims, Some(&active));
        let mut field = vec![T::zero(); self.n * (n_dims + 1)];
        evaluate_single_hierarchy(
            ctx,
            &tree,
            &self.embedding,
            Some(&active),
            self.params.single_hierarchy_theta,
            &mut field,
        );
        let z = partition_function(ctx, &field, n_dims, Some(&active)).max(cast(MIN_Z));

        let layout = sims.layout();
        let neighbours = sims.neighbours();
        let similarities = sims.similarities();
        let embedding = &self.embedding;
        let disabled = &self.disabled;
        let eps = T::epsilon();

        ctx.dispatch(|| {
            (0..self.n)
                .into_par_iter()
                .filter(|&i| !disabled[i])
                .map(|i| {
                    let y_i = &embedding[i * n_dims..(i + 1) * n_dims];
                    layout[i]
                        .range()
                        .filter(|&e| !disabled[neighbours[e]] && similarities[e] > eps)
                        .map(|e| {
                            let y_j = &embedding[neighbours[e] * n_dims..(neighbours[e] + 1) * n_dims];
                            let dist_sq = squared_euclidean(y_i, y_j);
                            let q = T::one() / ((T::one() + dist_sq) * z);
                            similarities[e] * (similarities[e] / q.max(eps)).ln()
                        })
                        .fold(T::zero(), |acc, x| acc + x)
                })
                .sum()
        })
    }

    /// Fraction of each point's high-dimensional neighbours that are also
    /// among its `k` nearest neighbours in the embedding
    ///
    /// Stores the per-point values (see [`Self::buffers`]) and returns their
    /// mean over points that have neighbours.
    pub fn neighborhood_preservation(
        &mut self,
        ctx: &ComputeContext,
        sims: &Similarities<T>,
        k: usize,
    ) -> Result<T, SneError> {
        let k = k.min(sims.k()).max(1);
        let (low_idx, _) = run_knn(
            ctx,
            &self.embedding,
            self.n_dims,
            k,
            self.params.knn_method(),
            &self.params.knn_params,
            self.params.seed,
        )?;
        let high_idx = sims.knn_indices();
        let k_t = T::from_usize(k).unwrap();

        self.neighbourhood_preservation = ctx.dispatch(|| {
            high_idx
                .par_iter()
                .zip(low_idx.par_iter())
                .map(|(high, low)| {
                    if high.is_empty() {
                        return T::zero();
                    }
                    let high = &high[..k.min(high.len())];
                    let hits = low.iter().filter(|&j| high.contains(j)).count();
                    T::from_usize(hits).unwrap() / k_t
                })
                .collect()
        });

        let counted = high_idx.iter().filter(|h| !h.is_empty()).count();
        if counted == 0 {
            return Ok(T::zero());
        }
        let sum = ctx.reduce(&self.neighbourhood_preservation, ReduceOp::Sum, None);
        Ok(sum / T::from_usize(counted).unwrap())
    }

    /////////////////
    // Interaction //
    /////////////////

    /// Start over from a fresh random embedding
    ///
    /// Every restart draws a different layout; the sequence of layouts is
    /// still reproducible from `params.seed`.
    pub fn restart(&mut self) {
        self.restarts += 1;
        let seed = self
            .params
            .seed
            .wrapping_add(self.restarts.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        self.embedding = random_layout(self.n, self.n_dims, seed, Some(self.params.rng_range));
        self.gradients.iter_mut().for_each(|g| *g = T::zero());
        self.updates.iter_mut().for_each(|u| *u = T::zero());
        self.gains.iter_mut().for_each(|g| *g = T::one());
        self.iteration = 0;
        self.exaggeration_end = self.params.n_exaggeration_iters;
        self.pending_translation = [T::zero(); 3];
        self.force_rebuild = true;
    }

    /// Restart the exaggeration phase at the current iteration
    pub fn reexaggerate(&mut self) {
        self.exaggeration_end = self.iteration + self.params.n_exaggeration_iters;
    }

    /// Fix the selected points in place
    pub fn set_fixed(&mut self) {
        for (f, s) in self.fixed.iter_mut().zip(&self.selection) {
            *f |= s.is_selected();
        }
    }

    pub fn unfix_all(&mut self) {
        self.fixed.iter_mut().for_each(|f| *f = false);
    }

    /// Move the selected points by a screen-space offset
    ///
    /// ### Params
    ///
    /// * `screen_delta` - Offset in units of the embedding bounds (one value
    ///   per embedding axis); applied during the next iteration
    pub fn translate_selected(&mut self, screen_delta: &[T]) {
        for d in 0..self.n_dims.min(screen_delta.len()) {
            self.pending_translation[d] += screen_delta[d] * self.bounds.range[d];
        }
        for (t, s) in self.translating.iter_mut().zip(&self.selection) {
            *t = s.is_selected();
        }
    }

    /// Disable the selected points: they neither move nor exert forces
    pub fn set_disabled(&mut self) {
        for (d, s) in self.disabled.iter_mut().zip(&self.selection) {
            *d |= s.is_selected();
        }
        self.force_rebuild = true;
    }

    pub fn enable_all(&mut self) {
        self.disabled.iter_mut().for_each(|d| *d = false);
        self.force_rebuild = true;
    }

    /// Set the force weight of the selected points
    pub fn set_weights(&mut self, weight: T) {
        let weight = weight.max(T::zero());
        for (w, s) in self.weights.iter_mut().zip(&self.selection) {
            if s.is_selected() {
                *w = weight;
            }
        }
    }

    /// Request a different output dimensionality
    ///
    /// The next [`Self::comp_iteration`] returns `true` instead of
    /// iterating.
    pub fn set_n_low_dims(&mut self, n_low_dims: usize) -> Result<(), SneError> {
        if !(2..=3).contains(&n_low_dims) {
            return Err(SneError::Dimensionality(n_low_dims));
        }
        self.pending_n_dims = Some(n_low_dims);
        Ok(())
    }

    /// Drop the selected points from every per-point buffer
    ///
    /// ### Returns
    ///
    /// The new number of points
    pub fn remove_points(&mut self, ctx: &ComputeContext, selection: &[bool]) -> Result<usize, SneError> {
        let removal = self.prepare_removal(ctx, selection)?;
        Ok(self.apply_removal(removal))
    }

    /// Compact every per-point buffer without touching `self`
    ///
    /// Pair with [`Self::apply_removal`]; fails if the selection does not
    /// match or would remove every point.
    pub fn prepare_removal(&self, ctx: &ComputeContext, selection: &[bool]) -> Result<MinimizationRemoval<T>, SneError> {
        if selection.len() != self.n {
            return Err(SneError::SelectionMismatch {
                got: selection.len(),
                expected: self.n,
            });
        }
        let d = self.n_dims;

        let embedding = ctx.remove(&self.embedding, d, selection, false)?;
        let n = embedding.len() / d;
        if n == 0 {
            return Err(SneError::EmptyDataset);
        }

        Ok(MinimizationRemoval {
            n,
            embedding,
            gradients: ctx.remove(&self.gradients, d, selection, false)?,
            updates: ctx.remove(&self.updates, d, selection, false)?,
            gains: ctx.remove(&self.gains, d, selection, false)?,
            field: ctx.remove(&self.field, d + 1, selection, false)?,
            selection: ctx.remove(&self.selection, 1, selection, false)?,
            fixed: ctx.remove(&self.fixed, 1, selection, false)?,
            disabled: ctx.remove(&self.disabled, 1, selection, false)?,
            translating: ctx.remove(&self.translating, 1, selection, false)?,
            weights: ctx.remove(&self.weights, 1, selection, false)?,
            neighbourhood_preservation: ctx.remove(&self.neighbourhood_preservation, 1, selection, false)?,
        })
    }

    /// Swap in prepared buffers
    ///
    /// ### Returns
    ///
    /// The new number of points
    pub fn apply_removal(&mut self, removal: MinimizationRemoval<T>) -> usize {
        let d = self.n_dims;
        assert_rows!(
            removal.n;
            (removal.embedding, d),
            (removal.gradients, d),
            (removal.updates, d),
            (removal.gains, d),
            (removal.field, d + 1),
            (removal.selection, 1),
            (removal.fixed, 1),
            (removal.disabled, 1),
            (removal.translating, 1),
            (removal.weights, 1),
            (removal.neighbourhood_preservation, 1),
        );
        self.n = removal.n;
        self.embedding = removal.embedding;
        self.gradients = removal.gradients;
        self.updates = removal.updates;
        self.gains = removal.gains;
        self.field = removal.field;
        self.selection = removal.selection;
        self.fixed = removal.fixed;
        self.disabled = removal.disabled;
        self.translating = removal.translating;
        self.weights = removal.weights;
        self.neighbourhood_preservation = removal.neighbourhood_preservation;
        self.force_rebuild = true;
        self.n
    }

    ///////////////
    // Accessors //
    ///////////////

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn n_low_dims(&self) -> usize {
        self.n_dims
    }

    /// Dimensionality requested through [`Self::set_n_low_dims`], if any
    pub fn pending_n_low_dims(&self) -> Option<usize> {
        self.pending_n_dims
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn z(&self) -> T {
        self.z
    }

    pub fn bounds(&self) -> &Bounds<T> {
        &self.bounds
    }

    /// Row-major `n x n_low_dims` embedding
    pub fn embedding(&self) -> &[T] {
        &self.embedding
    }

    /// The embedding as one vector per dimension
    pub fn embedding_columns(&self) -> Vec<Vec<T>> {
        (0..self.n_dims)
            .map(|d| self.embedding.iter().skip(d).step_by(self.n_dims).copied().collect())
            .collect()
    }

    pub fn selection(&self) -> &[Selection] {
        &self.selection
    }

    /// Selection tags, written by the interactive layer
    pub fn selection_mut(&mut self) -> &mut [Selection] {
        &mut self.selection
    }

    /// Read-only buffer bundle
    pub fn buffers(&self) -> MinimizationBuffers<'_, T> {
        MinimizationBuffers {
            n_low_dims: self.n_dims,
            embedding: &self.embedding,
            bounds: self.bounds,
            field: &self.field,
            gradients: &self.gradients,
            updates: &self.updates,
            gains: &self.gains,
            selection: &self.selection,
            fixed: &self.fixed,
            disabled: &self.disabled,
            translating: &self.translating,
            weights: &self.weights,
            neighbourhood_preservation: &self.neighbourhood_preservation,
        }
    }

    /// Read-only view of the field hierarchy (empty in single hierarchy
    /// mode)
    pub fn field_hierarchy_buffers(&self) -> FieldHierarchyBuffers<'_, T> {
        self.field_hierarchy.buffers()
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_minimization {
    use super::*;
    use crate::data::synthetic::generate_gaussian_clusters;
    use approx::assert_relative_eq;

    fn setup(params: &SneParams<f64>) -> (ComputeContext, Similarities<f64>, Minimization<f64>) {
        let ctx = ComputeContext::new(Some(4)).unwrap();
        let (data, labels) = generate_gaussian_clusters(60, 8, 2, 1.0, 10.0, 7);
        let ds = Dataset::from_mat(data.as_ref(), Some(&labels)).unwrap();
        let sims = Similarities::new(&ctx, ds, params).unwrap();
        let min = Minimization::new(sims.n(), params).unwrap();
        (ctx, sims, min)
    }

    fn small_params() -> SneParams<f64> {
        SneParams {
            perplexity: 10.0,
            iterations: 50,
            ..SneParams::default()
        }
    }

    #[test]
    fn test_gain_step() {
        let step = GainStep::new(10.0, 0.5, 0.1);
        let (mut pos, mut update, mut gain) = ([1.0, 0.0], [0.0, -1.0], [1.0, 0.1]);
        // zero update counts as not positive, so a positive gradient descends;
        // the second coordinate flips against its negative update
        step.apply(&mut pos, &mut update, &mut gain, &[0.5, -1.0]);
        assert_relative_eq!(gain[0], 1.2);
        assert_relative_eq!(update[0], -6.0);
        assert_relative_eq!(pos[0], -5.0);
        assert_relative_eq!(gain[1], 0.1);
        assert_relative_eq!(update[1], -0.5 + 1.0);
        assert_relative_eq!(pos[1], 0.5);

        step.apply(&mut pos, &mut update, &mut gain, &[-0.5, 0.0]);
        assert_relative_eq!(gain[0], 0.96);
        assert_relative_eq!(update[0], -3.0 + 4.8);
    }

    #[test]
    fn test_exaggeration_schedule() {
        let params = SneParams {
            n_exaggeration_iters: 10,
            n_exponential_decay_iters: 4,
            exaggeration_factor: 5.0,
            ..small_params()
        };
        let mut min = Minimization::<f64>::new(10, &params).unwrap();
        let mut seen = Vec::new();
        for it in 0..20 {
            min.iteration = it;
            seen.push(min.exaggeration());
        }
        assert_eq!(seen[0], 5.0);
        assert_eq!(seen[9], 5.0);
        assert_relative_eq!(seen[10], 5.0);
        assert_relative_eq!(seen[11], 4.0);
        assert_relative_eq!(seen[12], 3.0);
        assert_relative_eq!(seen[13], 2.0);
        assert_eq!(seen[14], 1.0);
        assert_eq!(seen[19], 1.0);

        min.iteration = 15;
        min.reexaggerate();
        assert_eq!(min.exaggeration(), 5.0);
        min.iteration = 25;
        assert_eq!(min.exaggeration(), 5.0);
        min.iteration = 30;
        assert_eq!(min.exaggeration(), 1.0);
    }

    #[test]
    fn test_iterations_single_and_dual() {
        for dual in [false, true] {
            let params = SneParams {
                dual_hierarchy: dual,
                ..small_params()
            };
            let (ctx, sims, mut min) = setup(&params);
            assert!(!min.comp(&ctx, &sims));
            assert_eq!(min.iteration(), 50);
            assert!(min.embedding().iter().all(|v| v.is_finite()));
            assert!(min.z() > 0.0);
            // re-centred on the bounds
            let cols = min.embedding_columns();
            assert_eq!(cols.len(), 2);
            assert_eq!(cols[0].len(), 120);
        }
    }

    #[test]
    fn test_fixed_and_disabled_points_do_not_move() {
        // no exaggeration, so the only global motion is the re-centring
        let params = SneParams {
            exaggeration_factor: 1.0,
            ..small_params()
        };
        let (ctx, sims, mut min) = setup(&params);
        min.selection_mut()[0] = Selection::Primary;
        min.set_fixed();
        min.selection_mut()[0] = Selection::None;
        min.selection_mut()[1] = Selection::Secondary;
        min.set_disabled();

        let offset = |m: &Minimization<f64>| {
            let e = m.embedding();
            [e[0] - e[2], e[1] - e[3]]
        };
        let moving = |m: &Minimization<f64>| {
            let e = m.embedding();
            [e[4] - e[0], e[5] - e[1]]
        };
        let before = (offset(&min), moving(&min));
        for _ in 0..3 {
            min.comp_iteration(&ctx, &sims);
        }
        let after = (offset(&min), moving(&min));

        for d in 0..2 {
            assert_relative_eq!(before.0[d], after.0[d], epsilon = 1e-12);
        }
        assert_ne!(before.1, after.1);
        assert!(min.buffers().fixed[0]);
        assert!(min.buffers().disabled[1]);
        assert!(min.buffers().gradients[2..4].iter().all(|&g| g == 0.0));

        min.unfix_all();
        min.enable_all();
        assert!(!min.buffers().fixed[0]);
        assert!(!min.buffers().disabled[1]);
    }

    #[test]
    fn test_set_n_low_dims_requests_reconstruction() {
        let (ctx, sims, mut min) = setup(&small_params());
        assert!(!min.comp_iteration(&ctx, &sims));
        assert!(min.set_n_low_dims(4).is_err());
        min.set_n_low_dims(3).unwrap();
        let it = min.iteration();
        assert!(min.comp_iteration(&ctx, &sims));
        assert_eq!(min.iteration(), it);
        assert!(min.comp(&ctx, &sims));
    }

    #[test]
    fn test_translate_selected() {
        let params = SneParams {
            exaggeration_factor: 1.0,
            ..small_params()
        };
        let (ctx, sims, mut min) = setup(&params);
        min.comp_iteration(&ctx, &sims);
        min.selection_mut()[3] = Selection::Primary;
        min.selection_mut()[4] = Selection::Primary;

        let range = min.bounds().range;
        let e = min.embedding();
        let offset_before = [e[6] - e[8], e[7] - e[9]];
        min.translate_selected(&[0.5, 0.0]);
        assert!(min.buffers().translating[3]);
        min.comp_iteration(&ctx, &sims);

        // both selected points moved by the same offset, so their relative
        // position is unchanged
        let e = min.embedding();
        let offset_after = [e[6] - e[8], e[7] - e[9]];
        assert_relative_eq!(offset_before[0], offset_after[0], epsilon = 1e-12);
        assert_relative_eq!(offset_before[1], offset_after[1], epsilon = 1e-12);
        assert!(!min.buffers().translating[3]);
        assert!(range[0] > 0.0);
    }

    #[test]
    fn test_remove_points_keeps_buffers_consistent() {
        let (ctx, _, mut min) = setup(&small_params());
        min.selection_mut()[5] = Selection::Primary;
        min.set_weights(3.0);
        let mut selection = vec![false; 120];
        selection[0] = true;
        selection[1] = true;

        let n = min.remove_points(&ctx, &selection).unwrap();
        assert_eq!(n, 118);
        let b = min.buffers();
        assert_eq!(b.embedding.len(), 236);
        assert_eq!(b.field.len(), 118 * 3);
        assert_eq!(b.weights.len(), 118);
        assert_eq!(b.selection.len(), 118);
        // point 5 is now point 3
        assert_eq!(b.weights[3], 3.0);
        assert_eq!(b.selection[3], Selection::Primary);
    }

    #[test]
    fn test_kl_divergence_and_preservation() {
        // exaggeration inflates the attraction and with it the KL, so compare
        // plain t-SNE iterations only
        let params = SneParams {
            iterations: 300,
            n_exaggeration_iters: 0,
            n_exponential_decay_iters: 0,
            ..small_params()
        };
        let (ctx, sims, mut min) = setup(&params);
        let kl_start = min.kl_divergence(&ctx, &sims);
        let np_start = min.neighborhood_preservation(&ctx, &sims, 10).unwrap();
        min.comp(&ctx, &sims);
        let kl_end = min.kl_divergence(&ctx, &sims);
        let np_end = min.neighborhood_preservation(&ctx, &sims, 10).unwrap();

        assert!(kl_end.is_finite() && kl_end >= 0.0);
        assert!(kl_end < kl_start, "KL {} -> {}", kl_start, kl_end);
        assert!(np_end > np_start, "preservation {} -> {}", np_start, np_end);
        assert!((0.0..=1.0).contains(&np_end));
        assert_eq!(min.buffers().neighbourhood_preservation.len(), 120);
    }

    #[test]
    fn test_restart_draws_new_layouts() {
        let (ctx, sims, mut min) = setup(&small_params());
        let initial = min.embedding().to_vec();
        for _ in 0..5 {
            min.comp_iteration(&ctx, &sims);
        }
        min.restart();
        let first = min.embedding().to_vec();
        assert_eq!(min.iteration(), 0);
        min.restart();
        let second = min.embedding().to_vec();

        assert_ne!(first, initial);
        assert_ne!(first, second);
        assert!(second.iter().all(|v| v.abs() < 0.1));

        // same seed, same sequence of restarts
        let (_, _, mut other) = setup(&small_params());
        assert_eq!(other.embedding(), &initial[..]);
        other.restart();
        assert_eq!(other.embedding(), &first[..]);
    }
}
