//! Labeled array storage consumed by the relationship graph and the kernels.
pub mod array;
pub mod dataset;
pub mod types;

pub use array::Array2;
pub use dataset::{Dataset, Variable};
pub use types::{Coords, Dimension, LabelKind, ValueKind, Values};
