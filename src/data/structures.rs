use faer::MatRef;
use rayon::prelude::*;
use std::ops::Range;

use crate::error::SneError;
use crate::utils::context::ComputeContext;
use crate::utils::math::SneFloat;

/////////////////////
// Data structures //
/////////////////////

////////////
// Layout //
////////////

/// Position of one point's neighbour set inside the shared neighbour arena
///
/// ### Fields
///
/// * `offset` - First arena slot of the point
/// * `size` - Number of neighbours of the point
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    pub offset: usize,
    pub size: usize,
}

impl Layout {
    /// Arena range covered by this point
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Split an arena buffer into one mutable slice per point
///
/// ### Params
///
/// * `arena` - Buffer aligned with the neighbour arena
/// * `layout` - Contiguous, ascending per-point layout covering `arena`
///
/// ### Returns
///
/// Per-point slices in point order, ready to be handed to a parallel kernel
pub fn split_by_layout<'a, V>(arena: &'a mut [V], layout: &[Layout]) -> Vec<&'a mut [V]> {
    let mut out = Vec::with_capacity(layout.len());
    let mut rest = arena;
    for l in layout {
        let (head, tail) = rest.split_at_mut(l.size);
        out.push(head);
        rest = tail;
    }
    out
}

///////////////
// Selection //
///////////////

/// Per-point selection tag written by the interactive layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    None,
    Primary,
    Secondary,
}

impl Selection {
    #[inline]
    pub fn is_selected(&self) -> bool {
        !matches!(self, Selection::None)
    }
}

/// Turn a tag buffer into a plain mask of selected points
pub fn selection_mask(selection: &[Selection]) -> Vec<bool> {
    selection.par_iter().map(|s| s.is_selected()).collect()
}

////////////
// Bounds //
////////////

/// Axis aligned bounds of the embedding
///
/// Only the first `n_dims` entries of each array are meaningful.
///
/// ### Fields
///
/// * `min` - Minimum per axis
/// * `max` - Maximum per axis
/// * `center` - Midpoint per axis
/// * `range` - Extent per axis
/// * `n_dims` - Dimensionality of the embedding (2 or 3)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds<T> {
    pub min: [T; 3],
    pub max: [T; 3],
    pub center: [T; 3],
    pub range: [T; 3],
    pub n_dims: usize,
}

impl<T: SneFloat> Bounds<T> {
    /// Generate bounds from per-axis minima and maxima
    ///
    /// ### Params
    ///
    /// * `min` - Per-axis minima (length `n_dims`)
    /// * `max` - Per-axis maxima (length `n_dims`)
    ///
    /// ### Returns
    ///
    /// Initialised self with derived center and range
    pub fn from_min_max(min: &[T], max: &[T]) -> Self {
        let n_dims = min.len();
        let two = T::one() + T::one();
        let mut out = Self::empty(n_dims);
        for d in 0..n_dims {
            out.min[d] = min[d];
            out.max[d] = max[d];
            out.center[d] = (min[d] + max[d]) / two;
            out.range[d] = max[d] - min[d];
        }
        out
    }

    /// All-zero bounds
    pub fn empty(n_dims: usize) -> Self {
        Self {
            min: [T::zero(); 3],
            max: [T::zero(); 3],
            center: [T::zero(); 3],
            range: [T::zero(); 3],
            n_dims,
        }
    }

    /// Grow the bounds by `padding` (fraction of the range) on every side
    pub fn padded(&self, padding: T) -> Self {
        let mut min = [T::zero(); 3];
        let mut max = [T::zero(); 3];
        for d in 0..self.n_dims {
            let pad = (self.range[d] * padding).max(T::epsilon());
            min[d] = self.min[d] - pad;
            max[d] = self.max[d] + pad;
        }
        Self::from_min_max(&min[..self.n_dims], &max[..self.n_dims])
    }

    /// Largest extent over all axes
    pub fn max_range(&self) -> T {
        self.range[..self.n_dims]
            .iter()
            .fold(T::zero(), |acc, &r| acc.max(r))
    }

    /// Smallest extent over all axes
    pub fn min_range(&self) -> T {
        self.range[..self.n_dims]
            .iter()
            .fold(T::infinity(), |acc, &r| acc.min(r))
    }
}

/////////////
// Dataset //
/////////////

/// The high-dimensional input data
///
/// ### Fields
///
/// * `n` - Number of points
/// * `n_dims` - Number of attributes per point
/// * `data` - Row-major `n x n_dims` values
/// * `labels` - Optional per-point label; negative values mark unlabeled
///   points
#[derive(Clone, Debug)]
pub struct Dataset<T> {
    pub n: usize,
    pub n_dims: usize,
    pub data: Vec<T>,
    pub labels: Option<Vec<i32>>,
}

impl<T: SneFloat> Dataset<T> {
    /// Copy a samples x features matrix into a dataset
    ///
    /// ### Params
    ///
    /// * `data` - Input data matrix (samples × features)
    /// * `labels` - Optional labels, one per sample
    ///
    /// ### Returns
    ///
    /// The dataset or an error if it is empty / the labels do not match
    pub fn from_mat(data: MatRef<T>, labels: Option<&[i32]>) -> Result<Self, SneError> {
        let (n, n_dims) = (data.nrows(), data.ncols());
        if n == 0 || n_dims == 0 {
            return Err(SneError::EmptyDataset);
        }
        if let Some(l) = labels {
            if l.len() != n {
                return Err(SneError::LabelMismatch {
                    got: l.len(),
                    expected: n,
                });
            }
        }

        let values = (0..n)
            .flat_map(|i| (0..n_dims).map(move |j| data[(i, j)]))
            .collect();

        Ok(Self {
            n,
            n_dims,
            data: values,
            labels: labels.map(|l| l.to_vec()),
        })
    }

    /// Build a dataset from an already row-major buffer
    pub fn from_rows(data: Vec<T>, n_dims: usize, labels: Option<Vec<i32>>) -> Result<Self, SneError> {
        if data.is_empty() || n_dims == 0 || data.len() % n_dims != 0 {
            return Err(SneError::EmptyDataset);
        }
        let n = data.len() / n_dims;
        if let Some(l) = &labels {
            if l.len() != n {
                return Err(SneError::LabelMismatch {
                    got: l.len(),
                    expected: n,
                });
            }
        }
        Ok(Self {
            n,
            n_dims,
            data,
            labels,
        })
    }

    /// Attributes of point `i`
    #[inline]
    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.n_dims..(i + 1) * self.n_dims]
    }

    /// Per-point flag whether a (non-negative) label is known
    pub fn labeled(&self) -> Vec<bool> {
        match &self.labels {
            Some(l) => l.par_iter().map(|&x| x >= 0).collect(),
            None => vec![false; self.n],
        }
    }

    /// Remove the selected points
    ///
    /// ### Params
    ///
    /// * `ctx` - Compute context
    /// * `selection` - Points to drop
    ///
    /// ### Returns
    ///
    /// The new number of points
    pub fn remove(&mut self, ctx: &ComputeContext, selection: &[bool]) -> Result<usize, SneError> {
        let data = ctx.remove(&self.data, self.n_dims, selection, false)?;
        let labels = match &self.labels {
            Some(l) => Some(ctx.remove(l, 1, selection, false)?),
            None => None,
        };

        self.n = data.len() / self.n_dims;
        self.data = data;
        self.labels = labels;

        Ok(self.n)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_structures {
    use super::*;
    use approx::assert_relative_eq;
    use faer::Mat;

    #[test]
    fn test_layout_range() {
        let l = Layout { offset: 4, size: 3 };
        assert_eq!(l.range(), 4..7);
    }

    #[test]
    fn test_bounds_from_min_max() {
        let b = Bounds::from_min_max(&[-1.0, 2.0], &[3.0, 3.0]);
        assert_relative_eq!(b.center[0], 1.0);
        assert_relative_eq!(b.center[1], 2.5);
        assert_relative_eq!(b.range[0], 4.0);
        assert_relative_eq!(b.max_range(), 4.0);
        assert_relative_eq!(b.min_range(), 1.0);

        let p = b.padded(0.25);
        assert_relative_eq!(p.min[0], -2.0);
        assert_relative_eq!(p.max[1], 3.25);
    }

    #[test]
    fn test_dataset_from_mat() {
        let mat = Mat::from_fn(3, 2, |i, j| (i * 10 + j) as f64);
        let ds = Dataset::from_mat(mat.as_ref(), Some(&[0, -1, 2])).unwrap();
        assert_eq!(ds.n, 3);
        assert_eq!(ds.row(1), &[10.0, 11.0]);
        assert_eq!(ds.labeled(), vec![true, false, true]);

        assert!(Dataset::from_mat(mat.as_ref(), Some(&[0])).is_err());
    }

    #[test]
    fn test_dataset_remove() {
        let ctx = ComputeContext::new(Some(2)).unwrap();
        let mut ds = Dataset::from_rows(vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0], 2, Some(vec![5, 6, 7])).unwrap();
        let n = ds.remove(&ctx, &[false, true, false]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(ds.data, vec![0.0, 0.0, 2.0, 2.0]);
        assert_eq!(ds.labels, Some(vec![5, 7]));
    }

    #[test]
    fn test_split_by_layout() {
        let layout = vec![
            Layout { offset: 0, size: 1 },
            Layout { offset: 1, size: 0 },
            Layout { offset: 1, size: 2 },
        ];
        let mut arena = vec![1, 2, 3];
        let slices = split_by_layout(&mut arena, &layout);
        assert_eq!(slices.len(), 3);
        assert_eq!(&*slices[0], &[1]);
        assert!(slices[1].is_empty());
        assert_eq!(&*slices[2], &[2, 3]);
    }

    #[test]
    fn test_selection_mask() {
        let sel = vec![Selection::None, Selection::Primary, Selection::Secondary];
        assert_eq!(selection_mask(&sel), vec![false, true, true]);
    }
}
