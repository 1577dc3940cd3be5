pub mod evaluator;
pub mod hierarchy;
