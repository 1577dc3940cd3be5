pub mod bh_tree;
pub mod context;
pub mod macros;
pub mod math;
pub mod primitives;
