use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::field::hierarchy::*;
use crate::utils::bh_tree::*;
use crate::utils::context::ComputeContext;
use crate::utils::math::SneFloat;
use crate::utils::primitives::ReduceOp;

/////////////////////
// Single hierarchy //
/////////////////////

/// Evaluate the field of every active point against the embedding hierarchy
///
/// ### Params
///
/// * `ctx` - Compute context
/// * `tree` - Embedding hierarchy built / refit on `positions`
/// * `positions` - Row-major `n x n_dims` embedding
/// * `active` - Optional mask; inactive points get a zero field
/// * `theta` - Barnes-Hut parameter
/// * `field` - Output, `n x (n_dims + 1)`: `[density, grad..]` per point
pub fn evaluate_single_hierarchy<T: SneFloat>(
    ctx: &ComputeContext,
    tree: &EmbeddingHierarchy<T>,
    positions: &[T],
    active: Option<&[bool]>,
    theta: T,
    field: &mut [T],
) {
    let n_dims = tree.n_dims();
    let width = n_dims + 1;

    ctx.dispatch(|| {
        field
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(i, out)| {
                out.iter_mut().for_each(|v| *v = T::zero());
                if active.map_or(true, |a| a[i]) {
                    let query = &positions[i * n_dims..(i + 1) * n_dims];
                    tree.accumulate_field(positions, query, Some(i), theta, out);
                }
            })
    });
}

///////////////////
// Dual hierarchy //
///////////////////

/// Results of traversing a part of the (field node, embedding node) pair
/// space
///
/// ### Fields
///
/// * `approx` - Field value accumulated per field node
/// * `near` - `(field leaf, embedding leaf)` pairs for the exact pass
#[derive(Default)]
struct PairAccumulator<T> {
    approx: FxHashMap<usize, [T; 4]>,
    near: Vec<(usize, usize)>,
}

impl<T: SneFloat> PairAccumulator<T> {
    fn merge(mut self, other: Self) -> Self {
        for (node, v) in other.approx {
            let entry = self.approx.entry(node).or_insert([T::zero(); 4]);
            for (a, b) in entry.iter_mut().zip(v) {
                *a += b;
            }
        }
        self.near.extend(other.near);
        self
    }
}

/// Shared read-only state of the dual traversal
struct DualTraversal<'a, T> {
    field: &'a FieldHierarchy<T>,
    tree: &'a EmbeddingHierarchy<T>,
    theta_sq: T,
    n_dims: usize,
}

impl<T: SneFloat> DualTraversal<'_, T> {
    /// Resolve the pair `(f, e)` or push the pairs it splits into
    fn visit(&self, f: usize, e: usize, acc: &mut PairAccumulator<T>, pending: &mut Vec<(usize, usize)>) {
        let layout = self.field.layout();
        let f_leaf = self.field.node_types[f] == NodeType::Leaf;
        let e_node = &self.tree.nodes[e];

        let center = self.field.cell_center(f);
        let size_f = self.field.cell_diameter(layout.level_of(f));
        let size_e = e_node.diameter;

        let mut diff = [T::zero(); 3];
        let mut dist_sq = T::zero();
        for d in 0..self.n_dims {
            diff[d] = center[d] - e_node.com[d];
            dist_sq += diff[d] * diff[d];
        }

        let size = size_f.max(size_e);
        if dist_sq > T::zero() && size * size < self.theta_sq * dist_sq {
            let entry = acc.approx.entry(f).or_insert([T::zero(); 4]);
            accumulate_interaction(&mut entry[..self.n_dims + 1], &diff[..self.n_dims], dist_sq, e_node.mass);
            return;
        }

        let e_leaf = e_node.is_leaf();
        if f_leaf && e_leaf {
            acc.near.push((f, e));
        } else if f_leaf || (!e_leaf && size_e >= size_f) {
            pending.extend(e_node.children.iter().flatten().map(|&c| (f, c)));
        } else {
            pending.extend(self.field.children(f).map(|c| (c, e)));
        }
    }
}

/// Evaluate the field of every point in the field hierarchy against the
/// embedding hierarchy
///
/// Pairs of (field node, embedding node) are traversed from the roots. A pair
/// is approximated when `max(size_F, size_E) / distance < theta` and its
/// contribution is evaluated at the centre of the field cell; otherwise the
/// larger node is split. Leaf/leaf pairs are deferred to an exact per-point
/// pass. The traversal fans out in parallel over the pairs of a shallow
/// frontier.
///
/// ### Params
///
/// * `ctx` - Compute context
/// * `tree` - Embedding hierarchy built / refit on `positions`
/// * `hierarchy` - Field hierarchy for the same embedding (`comp` was run);
///   its node values are overwritten
/// * `positions` - Row-major `n x n_dims` embedding
/// * `theta` - Approximation parameter (typically 0.25)
/// * `field` - Output, `n x (n_dims + 1)`: `[density, grad..]` per point;
///   zero for points not in the hierarchy
pub fn evaluate_dual_hierarchy<T: SneFloat>(
    ctx: &ComputeContext,
    tree: &EmbeddingHierarchy<T>,
    hierarchy: &mut FieldHierarchy<T>,
    positions: &[T],
    theta: T,
    field: &mut [T],
) {
    let n_dims = tree.n_dims();
    let width = n_dims + 1;
    ctx.set(field, T::zero());
    ctx.set(&mut hierarchy.values, T::zero());

    let (Some(root_f), Some(root_e)) = (hierarchy.root(), tree.root()) else {
        return;
    };

    let mut acc = {
        let traversal = DualTraversal {
            field: &*hierarchy,
            tree,
            theta_sq: theta * theta,
            n_dims,
        };

        let mut acc = PairAccumulator::default();
        let mut frontier = vec![(root_f, root_e)];
        let target = 4 * ctx.n_threads();
        while !frontier.is_empty() && frontier.len() < target {
            let mut next = Vec::with_capacity(frontier.len() * 4);
            for (f, e) in frontier.drain(..) {
                traversal.visit(f, e, &mut acc, &mut next);
            }
            frontier = next;
        }

        let traversal = &traversal;
        let partial = ctx.dispatch(|| {
            frontier
                .into_par_iter()
                .map(|pair| {
                    let mut local = PairAccumulator::default();
                    let mut stack = vec![pair];
                    while let Some((f, e)) = stack.pop() {
                        traversal.visit(f, e, &mut local, &mut stack);
                    }
                    local
                })
                .reduce(PairAccumulator::default, PairAccumulator::merge)
        });
        acc.merge(partial)
    };

    for (&node, v) in &acc.approx {
        for (dst, &src) in hierarchy.values[node * width..(node + 1) * width].iter_mut().zip(v) {
            *dst += src;
        }
    }
    hierarchy.push_down(ctx);

    ctx.dispatch(|| acc.near.par_sort_unstable());
    let near = &acc.near;
    let hierarchy = &*hierarchy;

    ctx.dispatch(|| {
        field
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(i, out)| {
                let leaf = hierarchy.point_leaf[i];
                if leaf == NO_LEAF {
                    return;
                }
                out.copy_from_slice(&hierarchy.values[leaf * width..(leaf + 1) * width]);

                let query = &positions[i * n_dims..(i + 1) * n_dims];
                let start = near.partition_point(|&(f, _)| f < leaf);
                let end = near.partition_point(|&(f, _)| f <= leaf);
                let mut diff = [T::zero(); 3];
                for &(_, e) in &near[start..end] {
                    for &j in &tree.nodes[e].point_indices {
                        if j == i {
                            continue;
                        }
                        let mut dist_sq = T::zero();
                        for d in 0..n_dims {
                            diff[d] = query[d] - positions[j * n_dims + d];
                            dist_sq += diff[d] * diff[d];
                        }
                        accumulate_interaction(out, &diff[..n_dims], dist_sq, T::one());
                    }
                }
            })
    });
}

/// Normalisation `Z = sum_i density_i` over the active points
pub fn partition_function<T: SneFloat>(
    ctx: &ComputeContext,
    field: &[T],
    n_dims: usize,
    active: Option<&[bool]>,
) -> T {
    ctx.reduce_columns(field, n_dims + 1, ReduceOp::Sum, active)[0]
}

///////////
// Tests //
///////////
