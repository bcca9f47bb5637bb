use nalgebra::{DMatrix, DVector};

use super::{ColumnJacobian, NormalEquationSolver, allocate_workspace};
use crate::error::EngineError;

/// Dense normal equations solved by LU decomposition.
#[derive(Debug, Clone, Default)]
pub struct DenseLuSolver {
    hessian: Option<DMatrix<f64>>,
}

impl DenseLuSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The assembled `J^T J`, if any.
    pub fn hessian(&self) -> Option<&DMatrix<f64>> {
        self.hessian.as_ref()
    }
}

impl NormalEquationSolver for DenseLuSolver {
    fn name(&self) -> &'static str {
        "dense LU"
    }

    fn assemble(&mut self, jacobian: &ColumnJacobian) -> Result<(), EngineError> {
        let (n, m) = (jacobian.nrows(), jacobian.ncols());

        let mut dense = DMatrix::from_vec(n, m, allocate_workspace(n * m)?);
        for col in 0..m {
            for &(row, value) in jacobian.column(col) {
                dense[(row, col)] = value;
            }
        }

        let mut hessian = DMatrix::from_vec(m, m, allocate_workspace(m * m)?);
        dense.tr_mul_to(&dense, &mut hessian);
        self.hessian = Some(hessian);
        Ok(())
    }

    fn max_diagonal(&self) -> f64 {
        self.hessian
            .as_ref()
            .map_or(0.0, |h| h.diagonal().iter().copied().fold(0.0, f64::max))
    }

    fn solve_damped(&mut self, mu: f64, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        let mut augmented = self.hessian.as_ref()?.clone();
        for i in 0..augmented.nrows() {
            augmented[(i, i)] += mu;
        }

        let step = augmented.lu().solve(rhs)?;
        step.iter().all(|v| v.is_finite()).then_some(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_builds_jtj() {
        let mut jacobian = ColumnJacobian::new(3, 2);
        jacobian.set_column_from_dense(0, &[1.0, 2.0, 0.0]);
        jacobian.set_column_from_dense(1, &[0.0, 3.0, 4.0]);

        let mut solver = DenseLuSolver::new();
        solver.assemble(&jacobian).unwrap();
        let hessian = solver.hessian().unwrap();
        assert_eq!(*hessian, DMatrix::from_row_slice(2, 2, &[5.0, 6.0, 6.0, 25.0]));
        assert_eq!(solver.max_diagonal(), 25.0);
    }

    #[test]
    fn test_solve_damped() {
        let mut jacobian = ColumnJacobian::new(2, 2);
        jacobian.set_column_from_dense(0, &[1.0, 0.0]);
        jacobian.set_column_from_dense(1, &[0.0, 2.0]);

        let mut solver = DenseLuSolver::new();
        solver.assemble(&jacobian).unwrap();
        // (diag(1, 4) + I) x = [2, 10]
        let step = solver
            .solve_damped(1.0, &DVector::from_vec(vec![2.0, 10.0]))
            .unwrap();
        assert!((step[0] - 1.0).abs() < 1e-12);
        assert!((step[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular_system_without_damping_fails() {
        let jacobian = ColumnJacobian::new(2, 2);
        let mut solver = DenseLuSolver::new();
        solver.assemble(&jacobian).unwrap();
        assert!(solver.solve_damped(0.0, &DVector::from_vec(vec![1.0, 1.0])).is_none());
    }

    #[test]
    fn test_solve_before_assemble_fails() {
        let mut solver = DenseLuSolver::new();
        assert!(solver.solve_damped(1.0, &DVector::zeros(1)).is_none());
    }
}
