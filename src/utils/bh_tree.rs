use crate::utils::math::SneFloat;

/// Maximum number of children of a node (octree)
pub const MAX_CHILDREN: usize = 8;

/////////////
// Helpers //
/////////////

/// Tight bounding box and centre of mass of a set of points
///
/// ### Returns
///
/// `(min, max, com)`; only the first `n_dims` entries are meaningful
fn aggregate_points<T: SneFloat>(
    positions: &[T],
    n_dims: usize,
    indices: &[usize],
) -> ([T; 3], [T; 3], [T; 3]) {
    let mut min = [T::infinity(); 3];
    let mut max = [T::neg_infinity(); 3];
    let mut com = [T::zero(); 3];

    for &idx in indices {
        let p = &positions[idx * n_dims..(idx + 1) * n_dims];
        for d in 0..n_dims {
            min[d] = min[d].min(p[d]);
            max[d] = max[d].max(p[d]);
            com[d] += p[d];
        }
    }

    let mass = T::from_usize(indices.len().max(1)).unwrap();
    for c in com.iter_mut().take(n_dims) {
        *c /= mass;
    }

    (min, max, com)
}

/// Length of the diagonal of a box
#[inline]
fn diagonal<T: SneFloat>(min: &[T; 3], max: &[T; 3], n_dims: usize) -> T {
    (0..n_dims)
        .map(|d| {
            let e = (max[d] - min[d]).max(T::zero());
            e * e
        })
        .sum::<T>()
        .sqrt()
}

///////////////////
// EmbeddingNode //
///////////////////

/// A node in the flattened embedding hierarchy
///
/// ### Fields
///
/// * `com` - Centre of mass
/// * `min` - Lower corner of the tight bounding box of the subtree
/// * `max` - Upper corner of the tight bounding box of the subtree
/// * `diameter` - Diagonal of the bounding box; the node size of the
///   Barnes-Hut criterion
/// * `mass` - Number of points in this subtree
/// * `children` - Indices of the children in the `nodes` vector; child `c`
///   holds the points on the upper side of the split along axis `d` iff bit
///   `d` of `c` is set.
/// * `point_indices` - If this is a leaf, the points in it (one point, or a
///   set of coincident points). Empty for internal nodes.
#[derive(Debug, Clone)]
pub struct EmbeddingNode<T> {
    pub com: [T; 3],
    pub min: [T; 3],
    pub max: [T; 3],
    pub diameter: T,
    pub mass: T,
    pub children: [Option<usize>; MAX_CHILDREN],
    pub point_indices: Vec<usize>,
}

impl<T: SneFloat> EmbeddingNode<T> {
    /// Check if this node directly contains a specific point index
    #[inline]
    pub fn contains_point(&self, idx: usize) -> bool {
        self.point_indices.contains(&idx)
    }

    /// Check if this is a leaf node
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(|c| c.is_none())
    }
}

/// Accumulate the interaction of a query with a mass at squared distance
/// `dist_sq` and offset `diff` into `out = [density, grad..]`
#[inline]
pub fn accumulate_interaction<T: SneFloat>(out: &mut [T], diff: &[T], dist_sq: T, mass: T) {
    let q = T::one() / (T::one() + dist_sq);
    out[0] += mass * q;
    let mult = mass * q * q;
    for (o, &d) in out[1..].iter_mut().zip(diff) {
        *o += mult * d;
    }
}

/////////////////////////
// EmbeddingHierarchy //
/////////////////////////

/// Barnes-Hut tree over the embedding
///
/// Quadtree in 2-D, octree in 3-D. Stored as a flat arena in pre-order, so a
/// parent always precedes its children; this is what lets `refit` run as a
/// single reverse sweep.
#[derive(Debug, Clone)]
pub struct EmbeddingHierarchy<T> {
    pub nodes: Vec<EmbeddingNode<T>>,
    root: Option<usize>,
    n_dims: usize,
}

impl<T: SneFloat> EmbeddingHierarchy<T> {
    /// Build the tree over the active points of the embedding
    ///
    /// ### Params
    ///
    /// * `positions` - Row-major `n x n_dims` embedding
    /// * `n_dims` - 2 or 3
    /// * `active` - Optional mask; inactive (disabled) points are left out
    pub fn new(positions: &[T], n_dims: usize, active: Option<&[bool]>) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            root: None,
            n_dims,
        };
        tree.rebuild(positions, active);
        tree
    }

    /// Re-derive the topology from scratch
    pub fn rebuild(&mut self, positions: &[T], active: Option<&[bool]>) {
        let n = positions.len() / self.n_dims;
        let point_indices: Vec<usize> = (0..n)
            .filter(|&i| active.map_or(true, |a| a[i]))
            .collect();

        self.nodes.clear();
        self.nodes.reserve(point_indices.len() * 2);
        self.root = if point_indices.is_empty() {
            None
        } else {
            Some(Self::build_recursive(
                &mut self.nodes,
                positions,
                self.n_dims,
                point_indices,
            ))
        };
    }

    /// Recompute mass, centre of mass and bounding boxes with the topology
    /// kept fixed
    ///
    /// Children always sit after their parent in the arena, so one reverse
    /// sweep sees every child before its parent.
    pub fn refit(&mut self, positions: &[T]) {
        let n_dims = self.n_dims;
        for k in (0..self.nodes.len()).rev() {
            let (min, max, com, mass) = if self.nodes[k].is_leaf() {
                let node = &self.nodes[k];
                let (min, max, com) = aggregate_points(positions, n_dims, &node.point_indices);
                (min, max, com, node.mass)
            } else {
                let mut min = [T::infinity(); 3];
                let mut max = [T::neg_infinity(); 3];
                let mut com = [T::zero(); 3];
                let mut mass = T::zero();
                for &c in self.nodes[k].children.iter().flatten() {
                    let child = &self.nodes[c];
                    for d in 0..n_dims {
                        min[d] = min[d].min(child.min[d]);
                        max[d] = max[d].max(child.max[d]);
                        com[d] += child.com[d] * child.mass;
                    }
                    mass += child.mass;
                }
                for c in com.iter_mut().take(n_dims) {
                    *c /= mass;
                }
                (min, max, com, mass)
            };

            let node = &mut self.nodes[k];
            node.min = min;
            node.max = max;
            node.com = com;
            node.mass = mass;
            node.diameter = diagonal(&min, &max, n_dims);
        }
    }

    /// Recursively builds the tree by splitting a node's tight bounding box
    /// at its midpoint along every axis.
    ///
    /// A node with one point, or with points that can no longer be separated
    /// (coincident points), becomes a leaf holding all of them.
    ///
    /// ### Returns
    ///
    /// The index of the newly created node within the `nodes` vector.
    fn build_recursive(
        nodes: &mut Vec<EmbeddingNode<T>>,
        positions: &[T],
        n_dims: usize,
        point_indices: Vec<usize>,
    ) -> usize {
        let (min, max, com) = aggregate_points(positions, n_dims, &point_indices);
        let mass = T::from_usize(point_indices.len()).unwrap();
        let node_idx = nodes.len();

        nodes.push(EmbeddingNode {
            com,
            min,
            max,
            diameter: diagonal(&min, &max, n_dims),
            mass,
            children: [None; MAX_CHILDREN],
            point_indices: Vec::new(),
        });

        if point_indices.len() == 1 {
            nodes[node_idx].point_indices = point_indices;
            return node_idx;
        }

        let two = T::one() + T::one();
        let mut mid = [T::zero(); 3];
        for d in 0..n_dims {
            mid[d] = (min[d] + max[d]) / two;
        }

        let mut buckets: [Vec<usize>; MAX_CHILDREN] = Default::default();
        for &idx in &point_indices {
            let p = &positions[idx * n_dims..(idx + 1) * n_dims];
            let child = (0..n_dims).fold(0, |acc, d| acc | (usize::from(p[d] > mid[d]) << d));
            buckets[child].push(idx);
        }

        // nothing left to split: coincident points
        if buckets.iter().any(|b| b.len() == point_indices.len()) {
            nodes[node_idx].point_indices = point_indices;
            return node_idx;
        }

        let mut children = [None; MAX_CHILDREN];
        for (c, bucket) in buckets.into_iter().enumerate() {
            if !bucket.is_empty() {
                children[c] = Some(Self::build_recursive(nodes, positions, n_dims, bucket));
            }
        }
        nodes[node_idx].children = children;

        node_idx
    }

    /// Index of the root node; `None` if no point is active
    #[inline]
    pub fn root(&self) -> Option<usize> {
        self.root
    }

    /// Dimensionality of the tree
    #[inline]
    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    /// Accumulate the field at a query position using the Barnes-Hut
    /// approximation
    ///
    /// A node is summarised by its centre of mass when
    /// `diameter / distance < theta`. Leaves that are opened are evaluated
    /// exactly per point.
    ///
    /// ### Params
    ///
    /// * `positions` - Row-major embedding the tree was built / refit on
    /// * `query` - Query position (`n_dims` values)
    /// * `exclude` - Point to leave out (the query point itself)
    /// * `theta` - Barnes-Hut approximation parameter (typically 0.5)
    /// * `out` - `[density, grad_0, .., grad_{D-1}]`, accumulated into
    pub fn accumulate_field(
        &self,
        positions: &[T],
        query: &[T],
        exclude: Option<usize>,
        theta: T,
        out: &mut [T],
    ) {
        let Some(root) = self.root else {
            return;
        };
        let n_dims = self.n_dims;
        let min_dist_sq = T::from_f64(1e-12).unwrap();

        let mut stack = Vec::with_capacity(64);
        stack.push(root);
        let mut diff = [T::zero(); 3];

        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx];

            let mut dist_sq = T::zero();
            for d in 0..n_dims {
                diff[d] = query[d] - node.com[d];
                dist_sq += diff[d] * diff[d];
            }

            let holds_query = exclude.is_some_and(|e| node.contains_point(e));
            let is_summary = !holds_query
                && dist_sq > min_dist_sq
                && node.diameter * node.diameter < theta * theta * dist_sq;

            if is_summary {
                accumulate_interaction(out, &diff[..n_dims], dist_sq, node.mass);
            } else if node.is_leaf() {
                for &j in &node.point_indices {
                    if Some(j) == exclude {
                        continue;
                    }
                    let p = &positions[j * n_dims..(j + 1) * n_dims];
                    let mut dist_sq = T::zero();
                    for d in 0..n_dims {
                        diff[d] = query[d] - p[d];
                        dist_sq += diff[d] * diff[d];
                    }
                    accumulate_interaction(out, &diff[..n_dims], dist_sq, T::one());
                }
            } else {
                stack.extend(node.children.iter().flatten());
            }
        }
    }
}
