//! Compiles batches of symbolic expressions over a graph of related datasets into
//! row kernels, caches them by a content digest and runs them with fused dot-product
//! and multinomial-logit epilogues.
//!
//! The `python` feature exposes the same pipeline as the `_core` extension module.

pub mod analysis;
pub mod compiler;
pub mod compute;
pub mod config;
pub mod display;
pub mod error;
pub mod expr;
pub mod graph;
pub mod store;

#[cfg(feature = "python")]
pub mod bindings {
    pub mod python;
}

pub use compiler::FlowCompiler;
pub use compute::{BoundKernel, BoundSource, Kernel, MnlOutcome, Mode, Output, OutputFormat};
pub use config::FlowConfig;
pub use error::{FlowError, Result};
pub use expr::ExpressionSet;
pub use graph::{LinkMode, Relationship, RelationshipGraph};
pub use store::{Array2, Coords, Dataset, Values};

#[cfg(feature = "python")]
pub use bindings::python::_core;
