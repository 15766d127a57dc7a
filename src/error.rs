//! Error taxonomy shared by every stage of the pipeline.
use thiserror::Error;

use crate::compute::Mode;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// Structural problem in the relationship graph (unknown node, ambiguous path, cycle).
    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Cannot resolve '{name}' in expression {index} ({expr})")]
    Resolution { index: usize, name: String, expr: String },

    /// A reference that cannot broadcast against the batch dimension, or a value used
    /// with an operator that does not accept its type.
    #[error("Type error in expression {index} ({expr}): {msg}")]
    Type { index: usize, expr: String, msg: String },

    #[error("Compile error{}: {msg}", fmt_location(.index, .expr))]
    Compile { index: Option<usize>, expr: String, msg: String },

    #[error("Kernel cache unavailable: {0}")]
    CacheIo(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Domain error: {0}")]
    Domain(String),

    #[error("Kernel was compiled for mode '{compiled}' but was run as '{requested}'")]
    ModeMismatch { compiled: Mode, requested: Mode },

    /// Generated kernel source was rejected by the assembler. Always a code generation bug.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_location(index: &Option<usize>, expr: &str) -> String {
    match *index {
        Some(i) => format!(" in expression {} ({})", i, expr),
        None if expr.is_empty() => String::new(),
        None => format!(" ({})", expr),
    }
}

impl FlowError {
    pub fn compile(index: Option<usize>, expr: &str, msg: impl Into<String>) -> Self {
        FlowError::Compile {
            index,
            expr: crate::display::truncate(expr, 80),
            msg: msg.into(),
        }
    }

    /// True for failures that should never reach a caller as anything but a bug report.
    pub fn is_internal(&self) -> bool {
        matches!(self, FlowError::Internal(_))
    }
}

impl From<std::io::Error> for FlowError {
    fn from(e: std::io::Error) -> Self {
        FlowError::CacheIo(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_formats_location() {
        let e = FlowError::compile(Some(2), "a +", "unexpected end of input");
        assert_eq!(
            e.to_string(),
            "Compile error in expression 2 (a +): unexpected end of input"
        );

        let e = FlowError::compile(None, "", "empty expression set");
        assert_eq!(e.to_string(), "Compile error: empty expression set");
    }

    #[test]
    fn test_io_errors_become_cache_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let e: FlowError = io.into();
        assert!(matches!(e, FlowError::CacheIo(_)));
        assert!(!e.is_internal());
    }
}
