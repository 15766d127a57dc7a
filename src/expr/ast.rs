//! Syntax tree of one expression.

use super::lexer::Span;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    /// `node.name` or a bare `name`.
    Name { node: Option<String>, name: String, span: Span },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call { func: Func, args: SmallVec<[Box<Expr>; 3]>, span: Span },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// The fixed function set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Func {
    Abs,
    Exp,
    Log,
    Sqrt,
    Min,
    Max,
    Pow,
    /// `clip(x, lower, upper)`
    Clip,
    /// `where(condition, if_true, if_false)`
    Where,
}

impl Func {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Func::Abs,
            "exp" => Func::Exp,
            "log" => Func::Log,
            "sqrt" => Func::Sqrt,
            "min" | "minimum" => Func::Min,
            "max" | "maximum" => Func::Max,
            "pow" | "power" => Func::Pow,
            "clip" => Func::Clip,
            "where" => Func::Where,
            _ => return None,
        })
    }

    pub fn arity(&self) -> usize {
        match self {
            Func::Abs | Func::Exp | Func::Log | Func::Sqrt => 1,
            Func::Min | Func::Max | Func::Pow => 2,
            Func::Clip | Func::Where => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Func::Abs => "abs",
            Func::Exp => "exp",
            Func::Log => "log",
            Func::Sqrt => "sqrt",
            Func::Min => "min",
            Func::Max => "max",
            Func::Pow => "pow",
            Func::Clip => "clip",
            Func::Where => "where",
        }
    }
}

impl Expr {
    /// Visits every name reference in source order.
    pub fn for_each_name<'a>(&'a self, f: &mut impl FnMut(Option<&'a str>, &'a str, Span)) {
        match self {
            Expr::Number(_) | Expr::Bool(_) => {}
            Expr::Name { node, name, span } => f(node.as_deref(), name, *span),
            Expr::Unary(_, a) => a.for_each_name(f),
            Expr::Binary(_, a, b) => {
                a.for_each_name(f);
                b.for_each_name(f);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.for_each_name(f);
                }
            }
        }
    }
}
