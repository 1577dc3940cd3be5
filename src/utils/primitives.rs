//! Data-parallel building blocks shared by every other component: blocked
//! reductions, prefix sums, stream compaction and a handful of per-element
//! utility kernels. All of them are methods on [`ComputeContext`] and run on
//! its pool.

use num_traits::Zero;
use rayon::prelude::*;
use std::ops::Add;

use crate::assert_rows;
use crate::data::structures::Layout;
use crate::error::SneError;
use crate::utils::context::ComputeContext;
use crate::utils::math::SneFloat;

////////////
// Reduce //
////////////

/// Reduction operator
///
/// * `Sum` - Sum of all elements
/// * `Min` - Minimum
/// * `Max` - Maximum
/// * `Count(v)` - Number of elements equal to `v`, returned as float
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReduceOp<T> {
    Sum,
    Min,
    Max,
    Count(T),
}

impl<T: SneFloat> ReduceOp<T> {
    /// Neutral element of the operator
    #[inline]
    fn identity(&self) -> T {
        match self {
            ReduceOp::Sum | ReduceOp::Count(_) => T::zero(),
            ReduceOp::Min => T::infinity(),
            ReduceOp::Max => T::neg_infinity(),
        }
    }

    /// Value an input element contributes before combining
    #[inline]
    fn map(&self, x: T) -> T {
        match self {
            ReduceOp::Count(v) => {
                if x == *v {
                    T::one()
                } else {
                    T::zero()
                }
            }
            _ => x,
        }
    }

    #[inline]
    fn combine(&self, a: T, b: T) -> T {
        match self {
            ReduceOp::Sum | ReduceOp::Count(_) => a + b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    /// Operator used for every pass after the first one (counts are summed)
    #[inline]
    fn second_pass(&self) -> Self {
        match self {
            ReduceOp::Count(_) => ReduceOp::Sum,
            op => *op,
        }
    }
}

impl ComputeContext {
    /// Reduce a buffer to a single value
    ///
    /// The first pass reduces every work group to one partial, further passes
    /// reduce the partials group-wise until one value remains.
    ///
    /// ### Params
    ///
    /// * `buffer` - Input values
    /// * `op` - The reduction operator
    /// * `selection` - Optional mask; only elements with `true` take part
    ///
    /// ### Returns
    ///
    /// The reduced value (the operator's identity for an empty input)
    pub fn reduce<T: SneFloat>(&self, buffer: &[T], op: ReduceOp<T>, selection: Option<&[bool]>) -> T {
        let g = self.group_size();
        self.dispatch(|| {
            let mut partials: Vec<T> = buffer
                .par_chunks(g)
                .enumerate()
                .map(|(group, chunk)| {
                    let base = group * g;
                    chunk
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| selection.map_or(true, |s| s[base + i]))
                        .fold(op.identity(), |acc, (_, &x)| op.combine(acc, op.map(x)))
                })
                .collect();

            let op = op.second_pass();
            while partials.len() > 1 {
                partials = partials
                    .par_chunks(g)
                    .map(|chunk| chunk.iter().fold(op.identity(), |acc, &x| op.combine(acc, x)))
                    .collect();
            }

            partials.first().copied().unwrap_or_else(|| op.identity())
        })
    }

    /// Reduce over the sparse neighbour arena as if it was a dense per-point
    /// buffer
    ///
    /// Every point first accumulates its own arena range (given by `layout`),
    /// the per-point values are then reduced with [`Self::reduce`].
    ///
    /// ### Params
    ///
    /// * `arena` - Values aligned with the neighbour arena
    /// * `layout` - Per-point offset/size into `arena`
    /// * `op` - The reduction operator
    /// * `selection` - Optional per-point mask
    ///
    /// ### Returns
    ///
    /// The reduced value
    pub fn reduce_arena<T: SneFloat>(
        &self,
        arena: &[T],
        layout: &[Layout],
        op: ReduceOp<T>,
        selection: Option<&[bool]>,
    ) -> T {
        let per_point: Vec<T> = self.dispatch(|| {
            layout
                .par_iter()
                .map(|l| {
                    arena[l.range()]
                        .iter()
                        .fold(op.identity(), |acc, &x| op.combine(acc, op.map(x)))
                })
                .collect()
        });

        self.reduce(&per_point, op.second_pass(), selection)
    }

    /// Per-column reduction of a row-major `n x d` buffer
    ///
    /// ### Params
    ///
    /// * `buffer` - Row-major input with `d` columns
    /// * `d` - Number of columns
    /// * `op` - Reduction operator
    /// * `selection` - Optional per-row mask
    ///
    /// ### Returns
    ///
    /// Vector with one reduced value per column
    pub fn reduce_columns<T: SneFloat>(
        &self,
        buffer: &[T],
        d: usize,
        op: ReduceOp<T>,
        selection: Option<&[bool]>,
    ) -> Vec<T> {
        let g = self.group_size();
        self.dispatch(|| {
            buffer
                .par_chunks(g * d)
                .enumerate()
                .map(|(group, chunk)| {
                    let mut acc = vec![op.identity(); d];
                    for (r, row) in chunk.chunks_exact(d).enumerate() {
                        if selection.map_or(true, |s| s[group * g + r]) {
                            for (a, &x) in acc.iter_mut().zip(row) {
                                *a = op.combine(*a, op.map(x));
                            }
                        }
                    }
                    acc
                })
                .reduce(
                    || vec![op.second_pass().identity(); d],
                    |a, b| {
                        let op = op.second_pass();
                        a.iter().zip(&b).map(|(&x, &y)| op.combine(x, y)).collect()
                    },
                )
        })
    }

    //////////
    // Scan //
    //////////

    /// Inclusive prefix sum
    ///
    /// Two-level blocked scan: every work group scans locally, the group
    /// totals are scanned (recursively), and the resulting offsets are added
    /// back to each group.
    ///
    /// ### Params
    ///
    /// * `input` - Values to scan
    ///
    /// ### Returns
    ///
    /// `out[i] = input[0] + ... + input[i]`
    pub fn inclusive_scan<T>(&self, input: &[T]) -> Vec<T>
    where
        T: Copy + Send + Sync + Zero + Add<Output = T>,
    {
        let g = self.group_size();
        let mut out = input.to_vec();
        if out.is_empty() {
            return out;
        }

        let totals: Vec<T> = self.dispatch(|| {
            out.par_chunks_mut(g)
                .map(|chunk| {
                    for i in 1..chunk.len() {
                        chunk[i] = chunk[i] + chunk[i - 1];
                    }
                    chunk[chunk.len() - 1]
                })
                .collect()
        });

        if totals.len() > 1 {
            let (offsets, _) = self.exclusive_scan(&totals);
            self.dispatch(|| {
                out.par_chunks_mut(g)
                    .zip(offsets.par_iter())
                    .for_each(|(chunk, &offset)| {
                        for x in chunk.iter_mut() {
                            *x = *x + offset;
                        }
                    })
            });
        }

        out
    }

    /// Exclusive prefix sum
    ///
    /// ### Params
    ///
    /// * `input` - Values to scan
    ///
    /// ### Returns
    ///
    /// Tuple of `(scan, total)` with `scan[i] = input[0] + ... + input[i - 1]`
    /// and `total` the sum of all inputs, i.e. `scan[n - 1] + input[n - 1]`
    pub fn exclusive_scan<T>(&self, input: &[T]) -> (Vec<T>, T)
    where
        T: Copy + Send + Sync + Zero + Add<Output = T>,
    {
        let inclusive = self.inclusive_scan(input);
        let total = inclusive.last().copied().unwrap_or_else(T::zero);

        let exclusive = self.dispatch(|| {
            (0..inclusive.len())
                .into_par_iter()
                .map(|i| if i == 0 { T::zero() } else { inclusive[i - 1] })
                .collect()
        });

        (exclusive, total)
    }

    ////////////
    // Remove //
    ////////////

    /// Order-preserving stream compaction of `d`-wide records
    ///
    /// The keep flags are scanned; every output slot then gathers its source
    /// record by a binary search on the inclusive scan. The output buffer is
    /// a freshly allocated one, the input is left untouched.
    ///
    /// ### Params
    ///
    /// * `buffer` - Row-major records, `selection.len()` rows of width `d`
    /// * `d` - Record width
    /// * `selection` - Per-record selection flags
    /// * `keep_selected` - If `true` the selected records are kept, otherwise
    ///   the unselected ones are
    ///
    /// ### Returns
    ///
    /// The compacted buffer; its length divided by `d` is the new record count
    pub fn remove<V>(
        &self,
        buffer: &[V],
        d: usize,
        selection: &[bool],
        keep_selected: bool,
    ) -> Result<Vec<V>, SneError>
    where
        V: Copy + Default + Send + Sync,
    {
        assert_rows!(selection.len(); (buffer, d));

        let flags: Vec<usize> = self.dispatch(|| {
            selection
                .par_iter()
                .map(|&s| usize::from(s == keep_selected))
                .collect()
        });
        let inclusive = self.inclusive_scan(&flags);
        let total = inclusive.last().copied().unwrap_or(0);

        let mut out: Vec<V> = Vec::new();
        out.try_reserve_exact(total * d)?;
        out.resize(total * d, V::default());

        if d > 0 {
            self.dispatch(|| {
                out.par_chunks_mut(d).enumerate().for_each(|(k, dst)| {
                    // first record whose inclusive count exceeds k is the (k+1)-th kept one
                    let src = inclusive.partition_point(|&c| c <= k);
                    dst.copy_from_slice(&buffer[src * d..(src + 1) * d]);
                })
            });
        }

        Ok(out)
    }

    ///////////
    // Utils //
    ///////////

    /// Set every element of `buffer` to `value`
    pub fn set<V: Copy + Send + Sync>(&self, buffer: &mut [V], value: V) {
        self.dispatch(|| buffer.par_iter_mut().for_each(|x| *x = value));
    }

    /// Invert a selection mask in place
    pub fn flip(&self, selection: &mut [bool]) {
        self.dispatch(|| selection.par_iter_mut().for_each(|x| *x = !*x));
    }

    /// Element-wise difference `a - b`
    pub fn difference<T: SneFloat>(&self, a: &[T], b: &[T]) -> Vec<T> {
        assert_rows!(a.len(); (b, 1));
        self.dispatch(|| a.par_iter().zip(b).map(|(&x, &y)| x - y).collect())
    }

    /// Column-wise mean (and optionally variance) over selected rows
    ///
    /// ### Params
    ///
    /// * `data` - Row-major `n x d` buffer
    /// * `d` - Number of columns
    /// * `selection` - Optional row mask; all rows when `None`
    /// * `variance` - Also compute the (population) variance
    ///
    /// ### Returns
    ///
    /// Tuple of `(means, variances)`; both are zero when nothing is selected
    pub fn average_per_datapoint<T: SneFloat>(
        &self,
        data: &[T],
        d: usize,
        selection: Option<&[bool]>,
        variance: bool,
    ) -> (Vec<T>, Option<Vec<T>>) {
        let n = data.len() / d.max(1);
        let count = match selection {
            Some(s) => s.iter().filter(|&&x| x).count(),
            None => n,
        };
        if count == 0 {
            return (vec![T::zero(); d], variance.then(|| vec![T::zero(); d]));
        }
        let count_t = T::from_usize(count).unwrap();

        let means: Vec<T> = self
            .reduce_columns(data, d, ReduceOp::Sum, selection)
            .into_iter()
            .map(|s| s / count_t)
            .collect();

        let variances = variance.then(|| {
            let centre = &means;
            let sq: Vec<T> = self.dispatch(|| {
                data.par_chunks(d)
                    .flat_map_iter(move |row| {
                        row.iter()
                            .zip(centre.iter())
                            .map(|(&x, &m)| (x - m) * (x - m))
                    })
                    .collect()
            });
            self.reduce_columns(&sq, d, ReduceOp::Sum, selection)
                .into_iter()
                .map(|s| s / count_t)
                .collect()
        });

        (means, variances)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_primitives {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn ctx() -> ComputeContext {
        ComputeContext::new(Some(4)).unwrap()
    }

    fn uniform(n: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.random::<f32>()).collect()
    }

    #[test]
    fn test_reduce_sum_across_group_boundaries() {
        let ctx = ctx();
        for n in [1, 255, 256, 257, 100_000] {
            let values = uniform(n, n as u64);
            let expected: f64 = values.iter().map(|&x| x as f64).sum();
            let got = ctx.reduce(&values, ReduceOp::Sum, None) as f64;
            assert_relative_eq!(got, expected, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_reduce_min_max_count() {
        let ctx = ctx();
        let values: Vec<f64> = (0..1000).map(|i| ((i * 37) % 1000) as f64).collect();
        assert_eq!(ctx.reduce(&values, ReduceOp::Min, None), 0.0);
        assert_eq!(ctx.reduce(&values, ReduceOp::Max, None), 999.0);

        let flags: Vec<f64> = (0..1000).map(|i| (i % 3 == 0) as u8 as f64).collect();
        assert_eq!(ctx.reduce(&flags, ReduceOp::Count(1.0), None), 334.0);
    }

    #[test]
    fn test_reduce_with_selection() {
        let ctx = ctx();
        let values: Vec<f64> = (0..600).map(|i| i as f64).collect();
        let selection: Vec<bool> = (0..600).map(|i| i % 2 == 0).collect();
        let expected: f64 = (0..600).filter(|i| i % 2 == 0).map(|i| i as f64).sum();
        assert_relative_eq!(ctx.reduce(&values, ReduceOp::Sum, Some(&selection)), expected);
        assert_eq!(ctx.reduce(&values, ReduceOp::Max, Some(&selection)), 598.0);
    }

    #[test]
    fn test_reduce_empty_returns_identity() {
        let ctx = ctx();
        let empty: Vec<f64> = Vec::new();
        assert_eq!(ctx.reduce(&empty, ReduceOp::Sum, None), 0.0);
        assert_eq!(ctx.reduce(&empty, ReduceOp::Min, None), f64::INFINITY);
    }

    #[test]
    fn test_reduce_arena() {
        let ctx = ctx();
        let layout = vec![
            Layout { offset: 0, size: 2 },
            Layout { offset: 2, size: 0 },
            Layout { offset: 2, size: 3 },
        ];
        let arena = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_relative_eq!(ctx.reduce_arena(&arena, &layout, ReduceOp::Sum, None), 15.0);
        assert_relative_eq!(ctx.reduce_arena(&arena, &layout, ReduceOp::Max, None), 5.0);

        let selection = vec![true, true, false];
        assert_relative_eq!(
            ctx.reduce_arena(&arena, &layout, ReduceOp::Sum, Some(&selection)),
            3.0
        );
        assert_relative_eq!(
            ctx.reduce_arena(&arena, &layout, ReduceOp::Count(4.0), None),
            1.0
        );
    }

    #[test]
    fn test_reduce_columns() {
        let ctx = ComputeContext::new(Some(2)).unwrap().with_group_size(3);
        let data: Vec<f64> = (0..20).flat_map(|i| [i as f64, -(i as f64)]).collect();
        let mins = ctx.reduce_columns(&data, 2, ReduceOp::Min, None);
        let maxs = ctx.reduce_columns(&data, 2, ReduceOp::Max, None);
        assert_eq!(mins, vec![0.0, -19.0]);
        assert_eq!(maxs, vec![19.0, 0.0]);
    }

    #[test]
    fn test_exclusive_scan_total() {
        let ctx = ctx();
        for n in [1usize, 255, 256, 257, 70_000] {
            let input: Vec<usize> = (0..n).map(|i| (i * 7) % 5).collect();
            let (scan, total) = ctx.exclusive_scan(&input);
            assert_eq!(scan.len(), n);
            assert_eq!(scan[0], 0);
            assert_eq!(scan[n - 1] + input[n - 1], total);
            assert_eq!(total, input.iter().sum::<usize>());

            let mut running = 0;
            for i in 0..n {
                assert_eq!(scan[i], running);
                running += input[i];
            }
        }
    }

    #[test]
    fn test_scan_of_zeros_is_zero() {
        let ctx = ctx();
        let zeros = vec![0usize; 1000];
        let (scan, total) = ctx.exclusive_scan(&zeros);
        assert!(scan.iter().all(|&x| x == 0));
        assert_eq!(total, 0);
        assert!(ctx.inclusive_scan(&zeros).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_inclusive_scan_small_groups() {
        // forces the recursive path on the group totals
        let ctx = ComputeContext::new(Some(2)).unwrap().with_group_size(2);
        let input: Vec<usize> = vec![1; 37];
        let scan = ctx.inclusive_scan(&input);
        assert_eq!(scan, (1..=37).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_preserves_order() {
        let ctx = ctx();
        let buffer: Vec<f32> = (0..1000).flat_map(|i| [i as f32, i as f32 + 0.5]).collect();
        let selection: Vec<bool> = (0..1000).map(|i| i % 3 == 0).collect();

        let kept = ctx.remove(&buffer, 2, &selection, false).unwrap();
        assert_eq!(kept.len() / 2, 1000 - 334);
        let mut expected = (0..1000).filter(|i| i % 3 != 0);
        for rec in kept.chunks_exact(2) {
            let i = expected.next().unwrap() as f32;
            assert_eq!(rec, &[i, i + 0.5]);
        }

        let selected = ctx.remove(&buffer, 2, &selection, true).unwrap();
        assert_eq!(selected.len() / 2, 334);
        assert_eq!(&selected[0..4], &[0.0, 0.5, 3.0, 3.5]);
    }

    #[test]
    fn test_remove_everything() {
        let ctx = ctx();
        let buffer = vec![1u32, 2, 3];
        let out = ctx.remove(&buffer, 1, &[true, true, true], false).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_set_flip_difference() {
        let ctx = ctx();
        let mut buffer = vec![1.0f64; 300];
        ctx.set(&mut buffer, 3.0);
        assert!(buffer.iter().all(|&x| x == 3.0));

        let mut selection = vec![true, false, true];
        ctx.flip(&mut selection);
        assert_eq!(selection, vec![false, true, false]);

        let diff = ctx.difference(&[3.0, 2.0], &[1.0, 5.0]);
        assert_eq!(diff, vec![2.0, -3.0]);
    }

    #[test]
    fn test_average_per_datapoint() {
        let ctx = ctx();
        // rows: (1, 10), (3, 10), (5, 40)
        let data = vec![1.0, 10.0, 3.0, 10.0, 5.0, 40.0];
        let (mean, var) = ctx.average_per_datapoint(&data, 2, None, true);
        assert_relative_eq!(mean[0], 3.0);
        assert_relative_eq!(mean[1], 20.0);
        let var = var.unwrap();
        assert_relative_eq!(var[0], 8.0 / 3.0);
        assert_relative_eq!(var[1], 200.0);

        let selection = vec![true, true, false];
        let (mean, var) = ctx.average_per_datapoint(&data, 2, Some(&selection), false);
        assert_relative_eq!(mean[0], 2.0);
        assert_relative_eq!(mean[1], 10.0);
        assert!(var.is_none());

        let none = vec![false; 3];
        let (mean, _) = ctx.average_per_datapoint(&data, 2, Some(&none), false);
        assert_eq!(mean, vec![0.0, 0.0]);
    }
}
