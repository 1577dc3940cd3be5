pub use crate::data::nearest_neighbours::{parse_knn_method, run_knn, KnnMethod, NearestNeighbourParams};
pub use crate::data::similarities::{Similarities, SimilaritiesBuffers};
pub use crate::data::structures::{Bounds, Dataset, Layout, Selection};
pub use crate::error::SneError;
pub use crate::field::hierarchy::{FieldHierarchyBuffers, NodeType};
pub use crate::training::minimization::{Minimization, MinimizationBuffers};
pub use crate::utils::context::ComputeContext;
pub use crate::utils::math::SneFloat;
pub use crate::utils::primitives::ReduceOp;
pub use crate::{run_dhsne, Sne, SneParams};
