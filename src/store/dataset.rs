//! Immutable labeled containers: the storage side of a relationship graph.
//!
//! A `Dataset` is a cheap handle. Every dimension's coordinates and every variable's
//! values live behind an `Arc`, so cloning a dataset or swapping one member out
//! never copies the data of the remaining members.

use super::types::{Coords, Dimension, Values};
use crate::error::{FlowError, Result};
use smallvec::SmallVec;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Indices into the owning dataset's dimensions, in storage order.
    pub(crate) dims: SmallVec<[usize; 4]>,
    pub(crate) values: Values,
}

impl Variable {
    pub fn dim_indices(&self) -> &[usize] {
        &self.dims
    }

    pub fn values(&self) -> &Values {
        &self.values
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    dims: Vec<Dimension>,
    variables: BTreeMap<String, Variable>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a one-dimensional dataset from row-labeled columns.
    ///
    /// The column buffers are moved into shared storage, not copied.
    pub fn from_table<I, S, V>(index_name: &str, index: impl Into<Coords>, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<Values>,
    {
        let mut ds = Self::new().with_dim(index_name, index)?;
        for (name, values) in columns {
            ds = ds.with_variable(name, &[index_name], values)?;
        }
        Ok(ds)
    }

    pub fn with_dim(mut self, name: &str, coords: impl Into<Coords>) -> Result<Self> {
        check_identifier(name)?;
        if self.dim_index(name).is_some() {
            return Err(FlowError::Shape(format!("duplicate dimension '{}'", name)));
        }
        self.dims.push(Dimension { name: name.to_string(), coords: coords.into() });
        Ok(self)
    }

    /// Adds or replaces a variable laid out row-major over `dims`.
    ///
    /// Replacing keeps every other member's storage shared with `self`.
    pub fn with_variable(
        mut self,
        name: impl Into<String>,
        dims: &[&str],
        values: impl Into<Values>,
    ) -> Result<Self> {
        let name = name.into();
        check_identifier(&name)?;
        let values = values.into();

        let mut indices = SmallVec::new();
        let mut expected = 1usize;
        for d in dims {
            let idx = self
                .dim_index(d)
                .ok_or_else(|| {
                    FlowError::Shape(format!("variable '{}' uses unknown dimension '{}'", name, d))
                })?;
            if indices.contains(&idx) {
                return Err(FlowError::Shape(format!("variable '{}' repeats dimension '{}'", name, d)));
            }
            expected *= self.dims[idx].len();
            indices.push(idx);
        }

        if values.len() != expected {
            return Err(FlowError::Shape(format!(
                "variable '{}' has {} values but dimensions {:?} require {}",
                name,
                values.len(),
                dims,
                expected
            )));
        }

        self.variables.insert(name, Variable { dims: indices, values });
        Ok(self)
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    pub fn dim(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|d| d.name == name)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    /// Dimension names of a variable, in storage order.
    pub fn variable_dims(&self, name: &str) -> Option<Vec<&str>> {
        self.variables
            .get(name)
            .map(|v| v.dims.iter().map(|&i| self.dims[i].name.as_str()).collect())
    }

    /// Number of rows along the leading dimension. Zero for dimensionless datasets.
    pub fn len(&self) -> usize {
        self.dims.first().map_or(0, Dimension::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(s: &str) -> Result<()> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(FlowError::Shape(format!("'{}' is not a valid identifier", s)))
    }
}
