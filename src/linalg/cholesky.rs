use std::collections::BTreeMap;

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;
use faer::sparse::{SparseColMat, Triplet};
use faer::{Mat, Side};
use nalgebra::DVector;

use super::{ColumnJacobian, NormalEquationSolver};
use crate::error::EngineError;

/// Sparse normal equations solved by a faer Cholesky (`Llt`) factorization.
///
/// `J^T J` is stored as its lower triangle. Diagonal entries are always
/// present so the damped matrix keeps the pattern of the undamped one, which
/// lets every damping attempt of an iteration reuse one symbolic analysis.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    dimension: usize,
    lower: BTreeMap<(usize, usize), f64>,
    symbolic_pattern: Option<solvers::SymbolicLlt<usize>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored entries of the lower triangle of `J^T J`.
    pub fn nnz(&self) -> usize {
        self.lower.len()
    }

    fn damped_matrix(&self, mu: f64) -> Option<SparseColMat<usize, f64>> {
        let triplets: Vec<_> = self
            .lower
            .iter()
            .map(|(&(row, col), &value)| {
                let damping = if row == col { mu } else { 0.0 };
                Triplet::new(row, col, value + damping)
            })
            .collect();
        SparseColMat::try_new_from_triplets(self.dimension, self.dimension, &triplets).ok()
    }
}

impl NormalEquationSolver for SparseCholeskySolver {
    fn name(&self) -> &'static str {
        "sparse Cholesky"
    }

    fn assemble(&mut self, jacobian: &ColumnJacobian) -> Result<(), EngineError> {
        let m = jacobian.ncols();
        self.dimension = m;
        self.lower.clear();

        for col in 0..m {
            self.lower
                .insert((col, col), jacobian.column_dot(col, col).unwrap_or(0.0));
            for row in col + 1..m {
                if let Some(value) = jacobian.column_dot(row, col) {
                    self.lower.insert((row, col), value);
                }
            }
        }

        let pattern = self.damped_matrix(0.0).ok_or_else(|| {
            EngineError::LinearSolver("failed to build the normal matrix".to_string())
        })?;
        let symbolic = solvers::SymbolicLlt::try_new(pattern.symbolic(), Side::Lower)
            .map_err(|e| EngineError::LinearSolver(format!("symbolic analysis failed: {e:?}")))?;
        self.symbolic_pattern = Some(symbolic);
        Ok(())
    }

    fn max_diagonal(&self) -> f64 {
        (0..self.dimension)
            .filter_map(|i| self.lower.get(&(i, i)))
            .copied()
            .fold(0.0, f64::max)
    }

    fn solve_damped(&mut self, mu: f64, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        let symbolic = self.symbolic_pattern.as_ref()?;
        let augmented = self.damped_matrix(mu)?;

        let cholesky =
            solvers::Llt::try_new_with_symbolic(symbolic.clone(), augmented.as_ref(), Side::Lower)
                .ok()?;
        let gradient = Mat::from_fn(self.dimension, 1, |i, _| rhs[i]);
        let dx = cholesky.solve(gradient);

        let step = DVector::from_fn(self.dimension, |i, _| dx[(i, 0)]);
        step.iter().all(|v| v.is_finite()).then_some(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::DenseLuSolver;

    fn banded_jacobian() -> ColumnJacobian {
        // Each error row touches two neighbouring parameters.
        let mut jacobian = ColumnJacobian::new(6, 4);
        jacobian.set_column_from_dense(0, &[1.0, 0.5, 0.0, 0.0, 0.0, 0.0]);
        jacobian.set_column_from_dense(1, &[0.0, 2.0, 1.0, 0.0, 0.0, 0.0]);
        jacobian.set_column_from_dense(2, &[0.0, 0.0, -1.0, 3.0, 0.0, 0.7]);
        jacobian.set_column_from_dense(3, &[0.0, 0.0, 0.0, 0.2, 1.5, 0.0]);
        jacobian
    }

    #[test]
    fn test_lower_triangle_keeps_only_coupled_pairs() {
        let mut solver = SparseCholeskySolver::new();
        solver.assemble(&banded_jacobian()).unwrap();
        // 4 diagonal entries plus (1,0), (2,1) and (3,2)
        assert_eq!(solver.nnz(), 7);
        assert!((solver.max_diagonal() - (1.0 + 9.0 + 0.49)).abs() < 1e-12);
    }

    #[test]
    fn test_sparse_and_dense_steps_agree() {
        let jacobian = banded_jacobian();
        let rhs = DVector::from_vec(vec![0.3, -1.2, 0.8, 2.0]);

        let mut sparse = SparseCholeskySolver::new();
        sparse.assemble(&jacobian).unwrap();
        let mut dense = DenseLuSolver::new();
        dense.assemble(&jacobian).unwrap();

        for mu in [1e-3, 1.0, 50.0] {
            let a = sparse.solve_damped(mu, &rhs).unwrap();
            let b = dense.solve_damped(mu, &rhs).unwrap();
            assert!((a - b).norm() < 1e-10, "mismatch at mu = {mu}");
        }
    }

    #[test]
    fn test_unobserved_parameter_solvable_with_damping() {
        let mut jacobian = ColumnJacobian::new(2, 2);
        jacobian.set_column_from_dense(0, &[1.0, 1.0]);

        let mut solver = SparseCholeskySolver::new();
        solver.assemble(&jacobian).unwrap();
        let step = solver
            .solve_damped(1.0, &DVector::from_vec(vec![3.0, 0.0]))
            .unwrap();
        assert!((step[0] - 1.0).abs() < 1e-12);
        assert_eq!(step[1], 0.0);
    }
}
