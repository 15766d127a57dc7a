//! Kernel generation, assembly and execution.
pub mod bind;
pub mod bytecode;
pub mod codegen;
pub mod engine;
pub mod kernel;
pub mod output;

pub use bind::BoundSource;
pub use bytecode::{assemble, Mode, OpCode, Program};
pub use engine::{BoundKernel, Kernel};
pub use output::{Frame, LabeledArray, LabeledChoices, MnlOutcome, Output, OutputFormat};
