use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Coordinate labels along one dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum Coords {
    /// Implicit `0..n` labels. No allocation.
    Range(usize),
    Int(Arc<[i64]>),
    Str(Arc<[String]>),
}

impl Coords {
    pub fn len(&self) -> usize {
        match self {
            Coords::Range(n) => *n,
            Coords::Int(v) => v.len(),
            Coords::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> LabelKind {
        match self {
            Coords::Range(_) | Coords::Int(_) => LabelKind::Int,
            Coords::Str(_) => LabelKind::Str,
        }
    }

    /// Renders label `i` for display purposes.
    pub fn label(&self, i: usize) -> Option<String> {
        match self {
            Coords::Range(n) => (i < *n).then(|| i.to_string()),
            Coords::Int(v) => v.get(i).map(|x| x.to_string()),
            Coords::Str(v) => v.get(i).cloned(),
        }
    }

    pub fn same_storage(&self, other: &Coords) -> bool {
        match (self, other) {
            (Coords::Range(a), Coords::Range(b)) => a == b,
            (Coords::Int(a), Coords::Int(b)) => Arc::ptr_eq(a, b),
            (Coords::Str(a), Coords::Str(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Vec<i64>> for Coords {
    fn from(v: Vec<i64>) -> Self {
        Coords::Int(v.into())
    }
}

impl From<Vec<String>> for Coords {
    fn from(v: Vec<String>) -> Self {
        Coords::Str(v.into())
    }
}

impl From<Vec<&str>> for Coords {
    fn from(v: Vec<&str>) -> Self {
        Coords::Str(v.into_iter().map(String::from).collect::<Vec<_>>().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelKind {
    Int,
    Str,
}

/// Flat, row-major variable storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    F64(Arc<[f64]>),
    /// Categorical labels. Only usable as the source of a label-mode relationship.
    Str(Arc<[String]>),
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::F64(v) => v.len(),
            Values::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f64(&self) -> Option<&Arc<[f64]>> {
        match self {
            Values::F64(v) => Some(v),
            Values::Str(_) => None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Values::F64(_) => ValueKind::F64,
            Values::Str(_) => ValueKind::Str,
        }
    }

    pub fn same_storage(&self, other: &Values) -> bool {
        match (self, other) {
            (Values::F64(a), Values::F64(b)) => Arc::ptr_eq(a, b),
            (Values::Str(a), Values::Str(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Vec<f64>> for Values {
    fn from(v: Vec<f64>) -> Self {
        Values::F64(v.into())
    }
}

impl From<Vec<String>> for Values {
    fn from(v: Vec<String>) -> Self {
        Values::Str(v.into())
    }
}

impl From<Vec<&str>> for Values {
    fn from(v: Vec<&str>) -> Self {
        Values::Str(v.into_iter().map(String::from).collect::<Vec<_>>().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    F64,
    Str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub coords: Coords,
}

impl Dimension {
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }
}
