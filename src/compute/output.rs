//! Result containers. Formatting attaches labels to an already computed buffer;
//! it never copies or recomputes the numbers.

use crate::store::{Array2, Dimension};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Raw,
    /// Two labeled axes: root rows by expressions (or alternatives).
    Labeled,
    /// Columns keyed by name, rows keyed by the root index.
    Frame,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Raw(Array2),
    Labeled(LabeledArray),
    Frame(Frame),
}

impl Output {
    pub(crate) fn wrap(
        data: Array2,
        rows: &Dimension,
        columns: Arc<[String]>,
        column_dim: &str,
        format: OutputFormat,
    ) -> Self {
        match format {
            OutputFormat::Raw => Output::Raw(data),
            OutputFormat::Labeled => Output::Labeled(LabeledArray {
                data,
                row_dim: rows.clone(),
                column_dim: column_dim.to_string(),
                columns,
            }),
            OutputFormat::Frame => Output::Frame(Frame { data, index: rows.clone(), columns }),
        }
    }

    pub fn data(&self) -> &Array2 {
        match self {
            Output::Raw(a) => a,
            Output::Labeled(l) => &l.data,
            Output::Frame(f) => &f.data,
        }
    }

    pub fn into_data(self) -> Array2 {
        match self {
            Output::Raw(a) => a,
            Output::Labeled(l) => l.data,
            Output::Frame(f) => f.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledArray {
    pub data: Array2,
    pub row_dim: Dimension,
    /// `"expressions"` or `"alternatives"`.
    pub column_dim: String,
    pub columns: Arc<[String]>,
}

impl LabeledArray {
    /// Value at (root label, column name).
    pub fn get(&self, row_label: &str, column: &str) -> Option<f64> {
        let coords = &self.row_dim.coords;
        let r = (0..self.row_dim.len()).find(|&i| coords.label(i).as_deref() == Some(row_label))?;
        let c = self.columns.iter().position(|n| n == column)?;
        Some(self.data.get(r, c))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Array2,
    pub index: Dimension,
    pub columns: Arc<[String]>,
}

impl Frame {
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = f64> + '_> {
        let c = self.columns.iter().position(|n| n == name)?;
        Some(self.data.column(c))
    }

    pub fn len(&self) -> usize {
        self.data.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.rows() == 0
    }
}

/// Result of a discrete-choice simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct MnlOutcome {
    /// Index of the chosen alternative per root row.
    pub choices: Vec<usize>,
    /// Probability of the chosen alternative per root row.
    pub probabilities: Vec<f64>,
}

impl MnlOutcome {
    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    /// Attaches the root index and alternative names.
    pub fn labeled(self, rows: &Dimension, alternatives: &[String]) -> LabeledChoices {
        let chosen = self
            .choices
            .iter()
            .map(|&c| alternatives.get(c).cloned().unwrap_or_else(|| c.to_string()))
            .collect();
        LabeledChoices { index: rows.clone(), chosen, outcome: self }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledChoices {
    pub index: Dimension,
    pub chosen: Vec<String>,
    pub outcome: MnlOutcome,
}
