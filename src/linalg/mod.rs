//! Linear algebra for the Levenberg-Marquardt engines.
//!
//! This module provides:
//! - [`ColumnJacobian`], a column-compressed finite-difference Jacobian
//! - The [`NormalEquationSolver`] interface for assembling `J^T J` and solving
//!   the damped system `(J^T J + mu I) dp = J^T e`
//! - A dense LU implementation using nalgebra
//! - A sparse Cholesky implementation using faer (feature `sparse`)

use crate::error::EngineError;
use nalgebra::DVector;

pub mod dense;

#[cfg(feature = "sparse")]
pub mod cholesky;

pub use dense::DenseLuSolver;

#[cfg(feature = "sparse")]
pub use cholesky::SparseCholeskySolver;

/// Jacobian stored column by column, keeping only non-zero derivatives.
///
/// Each column holds `(row, value)` pairs sorted by row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnJacobian {
    rows: usize,
    columns: Vec<Vec<(usize, f64)>>,
}

impl ColumnJacobian {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            columns: vec![Vec::new(); cols],
        }
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    pub fn column(&self, col: usize) -> &[(usize, f64)] {
        &self.columns[col]
    }

    /// Replace a column with the non-zero entries of a dense derivative column.
    pub fn set_column_from_dense(&mut self, col: usize, derivative: &[f64]) {
        let column = &mut self.columns[col];
        column.clear();
        column.extend(
            derivative
                .iter()
                .enumerate()
                .filter(|(_, value)| **value != 0.0)
                .map(|(row, &value)| (row, value)),
        );
    }

    pub fn is_finite(&self) -> bool {
        self.columns
            .iter()
            .flatten()
            .all(|(_, value)| value.is_finite())
    }

    /// `J^T e`
    pub fn transpose_mul(&self, errors: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            self.columns.len(),
            self.columns
                .iter()
                .map(|column| column.iter().map(|&(row, value)| value * errors[row]).sum()),
        )
    }

    /// Dot product of two columns, `None` when they share no row.
    pub fn column_dot(&self, a: usize, b: usize) -> Option<f64> {
        let (left, right) = (&self.columns[a], &self.columns[b]);
        let (mut i, mut j) = (0, 0);
        let mut sum = None;
        while i < left.len() && j < right.len() {
            match left[i].0.cmp(&right[j].0) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    *sum.get_or_insert(0.0) += left[i].1 * right[j].1;
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }
}

/// Assembles and solves the damped normal equations of one LM iteration.
///
/// [`assemble`](Self::assemble) is called once per outer iteration, then
/// [`solve_damped`](Self::solve_damped) once per damping attempt.
pub trait NormalEquationSolver {
    fn name(&self) -> &'static str;

    /// Build `J^T J` from the Jacobian.
    fn assemble(&mut self, jacobian: &ColumnJacobian) -> Result<(), EngineError>;

    /// Largest diagonal entry of the assembled `J^T J`.
    fn max_diagonal(&self) -> f64;

    /// Solve `(J^T J + mu I) dp = rhs`, `None` when the system cannot be factorized.
    fn solve_damped(&mut self, mu: f64, rhs: &DVector<f64>) -> Option<DVector<f64>>;
}

/// Reserve a zeroed buffer, reporting failure instead of aborting.
pub(crate) fn allocate_workspace(len: usize) -> Result<Vec<f64>, EngineError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| EngineError::Allocation { requested: len })?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_jacobian() -> ColumnJacobian {
        // [1 0]
        // [2 3]
        // [0 4]
        let mut jacobian = ColumnJacobian::new(3, 2);
        jacobian.set_column_from_dense(0, &[1.0, 2.0, 0.0]);
        jacobian.set_column_from_dense(1, &[0.0, 3.0, 4.0]);
        jacobian
    }

    #[test]
    fn test_column_storage_skips_zeros() {
        let jacobian = sample_jacobian();
        assert_eq!(jacobian.nnz(), 4);
        assert_eq!(jacobian.column(1), &[(1, 3.0), (2, 4.0)]);
    }

    #[test]
    fn test_transpose_mul() {
        let jacobian = sample_jacobian();
        let product = jacobian.transpose_mul(&[1.0, 1.0, 2.0]);
        assert_eq!(product, DVector::from_vec(vec![3.0, 11.0]));
    }

    #[test]
    fn test_column_dot() {
        let jacobian = sample_jacobian();
        assert_eq!(jacobian.column_dot(0, 0), Some(5.0));
        assert_eq!(jacobian.column_dot(0, 1), Some(6.0));

        let mut disjoint = ColumnJacobian::new(2, 2);
        disjoint.set_column_from_dense(0, &[1.0, 0.0]);
        disjoint.set_column_from_dense(1, &[0.0, 1.0]);
        assert_eq!(disjoint.column_dot(0, 1), None);
    }

    #[test]
    fn test_non_finite_detected() {
        let mut jacobian = sample_jacobian();
        assert!(jacobian.is_finite());
        jacobian.set_column_from_dense(0, &[f64::NAN, 0.0, 0.0]);
        assert!(!jacobian.is_finite());
    }

    #[test]
    fn test_allocate_workspace_zeroed() {
        let buffer = allocate_workspace(4).unwrap();
        assert_eq!(buffer, vec![0.0; 4]);
    }

    #[test]
    fn test_allocate_workspace_reports_failure() {
        assert_eq!(
            allocate_workspace(usize::MAX),
            Err(EngineError::Allocation { requested: usize::MAX })
        );
    }
}
