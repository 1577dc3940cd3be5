use log::debug;
use rayon::prelude::*;

use crate::data::structures::Bounds;
use crate::utils::context::ComputeContext;
use crate::utils::math::*;

/// Smallest texel grid resolution per axis
pub const FIELD_MIN_RESOLUTION: usize = 8;

/// Largest texel grid resolution per axis in 2-D
pub const FIELD_MAX_RESOLUTION_2D: usize = 2048;

/// Largest texel grid resolution per axis in 3-D
pub const FIELD_MAX_RESOLUTION_3D: usize = 128;

/// Sentinel for points that are not part of the hierarchy
pub const NO_LEAF: usize = usize::MAX;

////////////
// Layout //
////////////

/// Closed-form shape of the complete field tree
///
/// Nodes are stored level by level; level `l` holds `branch^l` nodes in
/// Morton order, starting at `sum_{m < l} branch^m`. The children of node
/// `k` are `k * branch + 1 + c`.
///
/// ### Fields
///
/// * `n_dims` - 2 or 3
/// * `resolution` - Texels per axis at the leaf level (power of two)
/// * `branch` - `2^n_dims`
/// * `n_levels` - Number of levels including root and leaf level
/// * `n_nodes` - Total number of nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldLayout {
    pub n_dims: usize,
    pub resolution: usize,
    pub branch: usize,
    pub n_levels: usize,
    pub n_nodes: usize,
}

impl FieldLayout {
    /// Layout of a `resolution^n_dims` texel grid
    ///
    /// ### Params
    ///
    /// * `n_dims` - 2 or 3
    /// * `resolution` - Texels per axis; rounded up to the next power of two
    pub fn new(n_dims: usize, resolution: usize) -> Self {
        let resolution = next_pow2(resolution);
        let branch: usize = 1 << n_dims;
        let n_levels = 1 + resolution.trailing_zeros() as usize;
        let n_nodes = (0..n_levels).map(|l| branch.pow(l as u32)).sum();

        Self {
            n_dims,
            resolution,
            branch,
            n_levels,
            n_nodes,
        }
    }

    /// Resolution for the current embedding bounds
    ///
    /// `max_range * scaling`, floored at [`FIELD_MIN_RESOLUTION`], capped per
    /// dimensionality and rounded up to a power of two.
    pub fn from_bounds<T: SneFloat>(bounds: &Bounds<T>, scaling: T) -> Self {
        let cap = if bounds.n_dims == 3 {
            FIELD_MAX_RESOLUTION_3D
        } else {
            FIELD_MAX_RESOLUTION_2D
        };
        let res = (bounds.max_range() * scaling)
            .ceil()
            .to_usize()
            .unwrap_or(FIELD_MIN_RESOLUTION)
            .clamp(FIELD_MIN_RESOLUTION, cap);

        Self::new(bounds.n_dims, res)
    }

    /// First node of level `level`
    #[inline]
    pub fn level_offset(&self, level: usize) -> usize {
        (self.branch.pow(level as u32) - 1) / (self.branch - 1)
    }

    /// Number of nodes on level `level`
    #[inline]
    pub fn level_size(&self, level: usize) -> usize {
        self.branch.pow(level as u32)
    }

    /// Index of the leaf (texel) level
    #[inline]
    pub fn leaf_level(&self) -> usize {
        self.n_levels - 1
    }

    /// Level a node sits on
    pub fn level_of(&self, node: usize) -> usize {
        let mut level = 0;
        while self.level_offset(level + 1) <= node {
            level += 1;
        }
        level
    }

    /// First child of `node`
    #[inline]
    pub fn first_child(&self, node: usize) -> usize {
        node * self.branch + 1
    }

    /// Parent of `node` (`None` for the root)
    #[inline]
    pub fn parent(&self, node: usize) -> Option<usize> {
        (node > 0).then(|| (node - 1) / self.branch)
    }
}

///////////
// Nodes //
///////////

/// Type tag of a field node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeType {
    /// No point in the cell
    #[default]
    Empty,
    /// Texel holding at least one point
    Leaf,
    /// At least two non-empty children
    Internal,
    /// Exactly one non-empty child; jump straight to the first descendant
    /// that is a leaf or has more than one non-empty child
    Skip(usize),
}

/// Read-only view of the field hierarchy for external collaborators
#[derive(Clone, Copy, Debug)]
pub struct FieldHierarchyBuffers<'a, T> {
    pub layout: FieldLayout,
    pub node_types: &'a [NodeType],
    pub counts: &'a [u32],
    pub values: &'a [T],
}

////////////////////
// FieldHierarchy //
////////////////////

/// Complete 2^D-ary tree over the texel grid covering the embedding
///
/// The grid covers a cube of side `max_range` centred on the bounds. Points
/// are sorted by the Morton code of their texel, which makes the points of
/// every subtree a contiguous run of `point_order` starting at `begins[k]`.
///
/// ### Fields
///
/// * `node_types` - Per node type tag
/// * `counts` - Per node number of points in the cell
/// * `begins` - Per node start of its run in `point_order`
/// * `values` - Per node field value `[density, grad..]`, `n_dims + 1` wide
/// * `point_order` - Active points sorted by texel
/// * `point_leaf` - Per point global index of its leaf node, or [`NO_LEAF`]
pub struct FieldHierarchy<T> {
    layout: FieldLayout,
    origin: [T; 3],
    side: T,
    pub node_types: Vec<NodeType>,
    pub counts: Vec<u32>,
    pub begins: Vec<usize>,
    pub values: Vec<T>,
    pub point_order: Vec<usize>,
    pub point_leaf: Vec<usize>,
}

impl<T: SneFloat> FieldHierarchy<T> {
    /// Empty hierarchy; storage is created on the first `comp`
    pub fn new(n_dims: usize) -> Self {
        Self {
            layout: FieldLayout::new(n_dims, FIELD_MIN_RESOLUTION),
            origin: [T::zero(); 3],
            side: T::one(),
            node_types: Vec::new(),
            counts: Vec::new(),
            begins: Vec::new(),
            values: Vec::new(),
            point_order: Vec::new(),
            point_leaf: Vec::new(),
        }
    }

    /// Current layout
    #[inline]
    pub fn layout(&self) -> FieldLayout {
        self.layout
    }

    /// Width of one value record
    #[inline]
    pub fn value_width(&self) -> usize {
        self.layout.n_dims + 1
    }

    /// Read-only buffer bundle
    pub fn buffers(&self) -> FieldHierarchyBuffers<'_, T> {
        FieldHierarchyBuffers {
            layout: self.layout,
            node_types: &self.node_types,
            counts: &self.counts,
            values: &self.values,
        }
    }

    /// Centre of the cell of `node`
    pub fn cell_center(&self, node: usize) -> [T; 3] {
        let level = self.layout.level_of(node);
        let local = node - self.layout.level_offset(level);
        let coords = morton_decode(local as u64, self.layout.n_dims);
        let cell = self.cell_size(level);
        let half = cast::<T>(0.5);

        let mut out = [T::zero(); 3];
        for d in 0..self.layout.n_dims {
            out[d] = self.origin[d] + (T::from_u32(coords[d]).unwrap() + half) * cell;
        }
        out
    }

    /// Edge length of a cell on `level`
    #[inline]
    pub fn cell_size(&self, level: usize) -> T {
        self.side / T::from_usize(1 << level).unwrap()
    }

    /// Diagonal of a cell on `level`; the node size of the dual traversal
    #[inline]
    pub fn cell_diameter(&self, level: usize) -> T {
        self.cell_size(level) * T::from_usize(self.layout.n_dims).unwrap().sqrt()
    }

    /// Non-empty children of `node`, with chains of single children skipped
    pub fn children(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        let first = self.layout.first_child(node);
        (first..first + self.layout.branch).filter_map(move |c| match self.node_types[c] {
            NodeType::Empty => None,
            NodeType::Skip(target) => Some(target),
            _ => Some(c),
        })
    }

    /// Points inside the cell of `node`
    #[inline]
    pub fn points(&self, node: usize) -> &[usize] {
        let begin = self.begins[node];
        &self.point_order[begin..begin + self.counts[node] as usize]
    }

    /// Root of the traversal (resolving a skip at the root)
    pub fn root(&self) -> Option<usize> {
        match self.node_types.first()? {
            NodeType::Empty => None,
            NodeType::Skip(target) => Some(*target),
            _ => Some(0),
        }
    }

    /// Build or refit the hierarchy for the current embedding
    ///
    /// ### Params
    ///
    /// * `ctx` - Compute context
    /// * `positions` - Row-major `n x n_dims` embedding
    /// * `active` - Optional mask of points to place in the hierarchy
    /// * `bounds` - Bounds the grid has to cover
    /// * `layout` - Target layout (see [`FieldLayout::from_bounds`])
    /// * `rebuild` - Recreate the node storage even if the node count did not
    ///   change
    ///
    /// ### Returns
    ///
    /// `true` if the storage was recreated, `false` if it was refit in place
    pub fn comp(
        &mut self,
        ctx: &ComputeContext,
        positions: &[T],
        active: Option<&[bool]>,
        bounds: &Bounds<T>,
        layout: FieldLayout,
        rebuild: bool,
    ) -> bool {
        let recreate = rebuild || layout.n_nodes != self.node_types.len();
        let width = layout.n_dims + 1;

        if layout != self.layout {
            debug!(
                "Resizing field hierarchy: resolution {} -> {}, {} nodes in {} levels",
                self.layout.resolution, layout.resolution, layout.n_nodes, layout.n_levels
            );
        }
        self.layout = layout;

        if recreate {
            self.node_types = vec![NodeType::Empty; layout.n_nodes];
            self.counts = vec![0; layout.n_nodes];
            self.begins = vec![0; layout.n_nodes];
            self.values = vec![T::zero(); layout.n_nodes * width];
        } else {
            ctx.set(&mut self.node_types, NodeType::Empty);
            ctx.set(&mut self.counts, 0);
            ctx.set(&mut self.begins, 0);
            ctx.set(&mut self.values, T::zero());
        }

        // cubic domain around the bounds
        let half = bounds.max_range().max(T::epsilon()) * cast::<T>(0.5);
        self.side = half + half;
        for d in 0..layout.n_dims {
            self.origin[d] = bounds.center[d] - half;
        }

        self.sort_points(ctx, positions, active);
        self.aggregate(ctx);

        recreate
    }

    /// Assign every active point to its texel and sort by Morton code
    fn sort_points(&mut self, ctx: &ComputeContext, positions: &[T], active: Option<&[bool]>) {
        let layout = self.layout;
        let n_dims = layout.n_dims;
        let n = positions.len() / n_dims;
        let res = layout.resolution;
        let res_t = T::from_usize(res).unwrap();
        let (origin, side) = (self.origin, self.side);
        let leaf_offset = layout.level_offset(layout.leaf_level());

        let mut keyed: Vec<(u64, usize)> = ctx.dispatch(|| {
            (0..n)
                .into_par_iter()
                .filter(|&i| active.map_or(true, |a| a[i]))
                .map(|i| {
                    let mut coords = [0u32; 3];
                    for d in 0..n_dims {
                        let t = (positions[i * n_dims + d] - origin[d]) / side * res_t;
                        coords[d] = t.floor().to_usize().unwrap_or(0).min(res - 1) as u32;
                    }
                    (morton_encode(&coords[..n_dims]), i)
                })
                .collect()
        });
        ctx.dispatch(|| keyed.par_sort_unstable());

        self.point_order.clear();
        self.point_order.extend(keyed.iter().map(|&(_, i)| i));
        self.point_leaf.clear();
        self.point_leaf.resize(n, NO_LEAF);

        // leaf level: one run per occupied texel
        let mut start = 0;
        while start < keyed.len() {
            let code = keyed[start].0;
            let end = start + keyed[start..].partition_point(|&(c, _)| c == code);
            let leaf = leaf_offset + code as usize;
            self.counts[leaf] = (end - start) as u32;
            self.begins[leaf] = start;
            self.node_types[leaf] = NodeType::Leaf;
            for &(_, i) in &keyed[start..end] {
                self.point_leaf[i] = leaf;
            }
            start = end;
        }
    }

    /// Bottom-up pass over the inner levels: counts, run starts and types
    fn aggregate(&mut self, ctx: &ComputeContext) {
        let layout = self.layout;
        let branch = layout.branch;

        for level in (0..layout.leaf_level()).rev() {
            let off = layout.level_offset(level);
            let child_off = layout.level_offset(level + 1);
            let size = layout.level_size(level);

            let (counts_head, counts_tail) = self.counts.split_at_mut(child_off);
            let (begins_head, begins_tail) = self.begins.split_at_mut(child_off);
            let (types_head, types_tail) = self.node_types.split_at_mut(child_off);
            let child_counts = &counts_tail[..size * branch];
            let child_begins = &begins_tail[..size * branch];
            let child_types = &types_tail[..size * branch];

            ctx.dispatch(|| {
                counts_head[off..off + size]
                    .par_iter_mut()
                    .zip(begins_head[off..off + size].par_iter_mut())
                    .zip(types_head[off..off + size].par_iter_mut())
                    .enumerate()
                    .for_each(|(k, ((count, begin), ty))| {
                        let mut n_children = 0;
                        let mut only = 0;
                        *count = 0;
                        for c in k * branch..(k + 1) * branch {
                            if child_counts[c] == 0 {
                                continue;
                            }
                            if n_children == 0 {
                                *begin = child_begins[c];
                            }
                            n_children += 1;
                            only = c;
                            *count += child_counts[c];
                        }

                        *ty = match n_children {
                            0 => NodeType::Empty,
                            1 => match child_types[only] {
                                NodeType::Skip(target) => NodeType::Skip(target),
                                _ => NodeType::Skip(child_off + only),
                            },
                            _ => NodeType::Internal,
                        };
                    })
            });
        }
    }

    /// Push the field values down from every node to its descendants
    ///
    /// Afterwards each leaf holds the sum of its own value and those of all
    /// its ancestors.
    pub fn push_down(&mut self, ctx: &ComputeContext) {
        let layout = self.layout;
        let width = self.value_width();
        let branch = layout.branch;

        for level in 1..layout.n_levels {
            let off = layout.level_offset(level);
            let parent_off = layout.level_offset(level - 1);
            let (head, tail) = self.values.split_at_mut(off * width);
            let parents = &head[parent_off * width..];
            let children = &mut tail[..layout.level_size(level) * width];

            ctx.dispatch(|| {
                children
                    .par_chunks_mut(width)
                    .enumerate()
                    .for_each(|(k, child)| {
                        let p = &parents[(k / branch) * width..(k / branch + 1) * width];
                        for (c, &v) in child.iter_mut().zip(p) {
                            *c += v;
                        }
                    })
            });
        }
    }
}

///////////
// Tests //
///////////
