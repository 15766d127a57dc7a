pub mod flow;
pub mod resolve;
pub mod telemetry;
pub mod topology;

pub use flow::{FlowGraph, SlotId};
pub use resolve::{analyze, Analysis, Extent, ResolvedRef, Typed, ValueType};
