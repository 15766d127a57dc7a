use crate::error::{FlowError, Result};

/// Dense, row-major two-dimensional buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Array2 {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Array2 {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![0.0; rows * cols] }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(FlowError::Shape(format!(
                "buffer of {} values cannot be viewed as {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds from nested rows; every row must have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, r) in rows.iter().enumerate() {
            if r.len() != cols {
                return Err(FlowError::Shape(format!("row {} has {} columns, expected {}", i, r.len(), cols)));
            }
            data.extend_from_slice(r);
        }
        Ok(Self { rows: rows.len(), cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline(always)]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn column(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().skip(col).step_by(self.cols.max(1)).copied().take(self.rows)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    pub fn to_nested(&self) -> Vec<Vec<f64>> {
        (0..self.rows).map(|r| self.row(r).to_vec()).collect()
    }

    /// Plain matrix product. Used to check fused results against the two-step form.
    pub fn matmul(&self, rhs: &Array2) -> Result<Array2> {
        if self.cols != rhs.rows {
            return Err(FlowError::Shape(format!(
                "cannot multiply {}x{} by {}x{}",
                self.rows, self.cols, rhs.rows, rhs.cols
            )));
        }
        let mut out = Array2::zeros(self.rows, rhs.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self.get(i, k);
                let dest = &mut out.data[i * rhs.cols..(i + 1) * rhs.cols];
                for (d, b) in dest.iter_mut().zip(rhs.row(k)) {
                    *d += a * b;
                }
            }
        }
        Ok(out)
    }

    /// Row-wise softmax with the row maximum subtracted first.
    pub fn softmax_rows(&self) -> Array2 {
        let mut out = self.clone();
        for r in 0..self.rows {
            let row = &mut out.data[r * self.cols..(r + 1) * self.cols];
            softmax_in_place(row);
        }
        out
    }
}

/// Numerically stable softmax. Returns the normalizing sum of the shifted exponentials.
pub(crate) fn softmax_in_place(row: &mut [f64]) -> f64 {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_small() {
        let a = Array2::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = Array2::from_rows(&[vec![1.0, 0.0, 2.0], vec![0.0, 1.0, 1.0]]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.to_nested(), vec![vec![1.0, 2.0, 4.0], vec![3.0, 4.0, 10.0]]);
        assert!(b.matmul(&a).is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let a = Array2::from_rows(&[vec![1000.0, 1001.0], vec![-5.0, 0.0]]).unwrap();
        let p = a.softmax_rows();
        for r in 0..2 {
            let s: f64 = p.row(r).iter().sum();
            assert!((s - 1.0).abs() < 1e-12);
        }
        assert!(p.get(0, 1) > p.get(0, 0));
    }

    #[test]
    fn test_column_view() {
        let a = Array2::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        assert_eq!(a.column(1).collect::<Vec<_>>(), vec![2.0, 4.0, 6.0]);
        assert!(Array2::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}
