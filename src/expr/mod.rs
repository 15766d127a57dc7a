//! The restricted expression language: tokens, syntax tree and parser.
pub mod ast;
pub mod lexer;
pub mod parser;
pub mod set;

pub use ast::{BinaryOp, Expr, Func, UnaryOp};
pub use parser::{parse, ParseError};
pub use set::ExpressionSet;
