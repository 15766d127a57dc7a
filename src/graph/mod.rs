//! Defines the relationship graph linking datasets to one another.
pub mod dag;
pub mod edge;
pub mod node;

// Re-export key types for convenient access
pub use dag::RelationshipGraph;
pub use edge::{LinkMode, Relationship};
pub use node::DatasetNode;
