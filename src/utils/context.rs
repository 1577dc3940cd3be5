use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::SneError;

/// Number of elements a single work group processes in the reduction and
/// scan kernels
pub const WORK_GROUP_SIZE: usize = 256;

/// Explicitly constructed compute context
///
/// Owns the thread pool every kernel of a run is dispatched on and the work
/// group size of the blocked primitives (see `utils::primitives`). One context
/// is created per solver and passed by reference to every call site; it is
/// dropped together with its owner.
///
/// ### Fields
///
/// * `pool` - The rayon pool the kernels run on.
/// * `group_size` - Block size of the reduce / scan kernels.
pub struct ComputeContext {
    pool: ThreadPool,
    group_size: usize,
}

impl ComputeContext {
    /// Generate a new context
    ///
    /// ### Params
    ///
    /// * `n_threads` - Number of worker threads. `None` lets rayon decide
    ///   (usually one per logical core).
    ///
    /// ### Returns
    ///
    /// The context or the pool creation error
    pub fn new(n_threads: Option<usize>) -> Result<Self, SneError> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(n) = n_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build()?;

        Ok(Self {
            pool,
            group_size: WORK_GROUP_SIZE,
        })
    }

    /// Override the work group size (mostly useful for tests)
    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size.max(1);
        self
    }

    /// Work group size of the blocked kernels
    #[inline]
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Number of worker threads in the pool
    pub fn n_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Dispatch a kernel on the pool
    ///
    /// All parallel work spawned by `kernel` has finished when this returns,
    /// so consecutive dispatches are separated by a full barrier.
    ///
    /// ### Params
    ///
    /// * `kernel` - The data-parallel work to run
    ///
    /// ### Returns
    ///
    /// Whatever the kernel returns
    #[inline]
    pub fn dispatch<R, F>(&self, kernel: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(kernel)
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("n_threads", &self.n_threads())
            .field("group_size", &self.group_size)
            .finish()
    }
}

#[cfg(test)]
mod test_context {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_dispatch_runs_on_pool() {
        let ctx = ComputeContext::new(Some(2)).unwrap();
        assert_eq!(ctx.n_threads(), 2);
        let n_threads = ctx.dispatch(rayon::current_num_threads);
        assert_eq!(n_threads, 2);
    }

    #[test]
    fn test_dispatch_is_a_barrier() {
        let ctx = ComputeContext::new(Some(4)).unwrap();
        let mut buffer = vec![0usize; 10_000];
        ctx.dispatch(|| buffer.par_iter_mut().enumerate().for_each(|(i, v)| *v = i));
        // every write of the first kernel is visible to the second
        let total: usize = ctx.dispatch(|| buffer.par_iter().sum());
        assert_eq!(total, (0..10_000).sum::<usize>());
    }

    #[test]
    fn test_group_size_floor() {
        let ctx = ComputeContext::new(Some(1)).unwrap().with_group_size(0);
        assert_eq!(ctx.group_size(), 1);
    }
}
