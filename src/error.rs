use std::collections::TryReserveError;

/// Errors surfaced at the construction / mutation boundary of the solver
///
/// The per-iteration hot path is infallible; everything in here is either a
/// violated caller precondition (checked once by [`crate::SneParams::validate`])
/// a failure to (re)create a buffer or a failed nearest neighbour search.
#[derive(Debug, thiserror::Error)]
pub enum SneError {
    #[error("Dataset is empty")]
    EmptyDataset,

    #[error("Unsupported embedding dimensionality: {0} (only 2 and 3 are supported)")]
    Dimensionality(usize),

    #[error("Number of neighbours k = {k} exceeds k_max = {k_max}")]
    KnnTooLarge { k: usize, k_max: usize },

    #[error("Label vector has length {got}, expected {expected}")]
    LabelMismatch { got: usize, expected: usize },

    #[error("Selection buffer has length {got}, expected {expected}")]
    SelectionMismatch { got: usize, expected: usize },

    #[error("Parameter validation failed: {0}")]
    InvalidParams(String),

    #[error("Buffer allocation failed: {0}")]
    Allocation(#[from] TryReserveError),

    #[error("Nearest neighbour search failed: {0}")]
    Knn(#[from] ann_search_rs::errors::AnnSearchErrors),

    #[error("Failed to create compute thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
