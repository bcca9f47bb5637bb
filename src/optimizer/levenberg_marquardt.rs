//! Levenberg-Marquardt with finite-difference Jacobians.
//!
//! Minimizes `||target - f(p)||^2` following the classic levmar scheme:
//! - Initial damping `mu = tau * max(J^T J)_ii`
//! - Gain-ratio damping update `mu *= max(1/3, 1 - (2 rho - 1)^3)` on accepted steps
//! - `mu *= nu`, `nu *= 2` on rejected steps, stopping once `nu` overflows
//! - Stopping tests on the gradient, the step, the error and non-finite values
//!
//! The normal equations are handed to a [`NormalEquationSolver`], which is
//! the only difference between the dense and the sparse engine.

use super::jacobian::estimate_jacobian;
use super::{
    EngineInfo, EngineKind, EngineOptions, ErrorFunction, EvaluationPhase,
    NonlinearLeastSquaresEngine, TerminationReason,
};
use crate::error::EngineError;
use crate::linalg::{ColumnJacobian, DenseLuSolver, NormalEquationSolver, allocate_workspace};
use nalgebra::DVector;
use tracing::{debug, trace};

#[cfg(feature = "sparse")]
use crate::linalg::SparseCholeskySolver;

/// Sum of squares of `target - values`.
fn squared_error(target: &[f64], values: &[f64], errors: Option<&mut [f64]>) -> f64 {
    match errors {
        Some(errors) => {
            let mut sum = 0.0;
            for ((e, &t), &v) in errors.iter_mut().zip(target).zip(values) {
                *e = t - v;
                sum += *e * *e;
            }
            sum
        }
        None => target
            .iter()
            .zip(values)
            .map(|(&t, &v)| (t - v) * (t - v))
            .sum(),
    }
}

/// Levenberg-Marquardt engine over a normal-equation solver.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt<L: NormalEquationSolver> {
    kind: EngineKind,
    linear_solver: L,
}

/// Levenberg-Marquardt on dense normal equations.
pub type DenseLevenbergMarquardt = LevenbergMarquardt<DenseLuSolver>;

/// Levenberg-Marquardt on sparse normal equations.
#[cfg(feature = "sparse")]
pub type SparseLevenbergMarquardt = LevenbergMarquardt<SparseCholeskySolver>;

impl<L: NormalEquationSolver> LevenbergMarquardt<L> {
    pub fn with_linear_solver(kind: EngineKind, linear_solver: L) -> Self {
        Self {
            kind,
            linear_solver,
        }
    }
}

impl DenseLevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_linear_solver(EngineKind::DenseLM, DenseLuSolver::new())
    }
}

impl Default for DenseLevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "sparse")]
impl SparseLevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_linear_solver(EngineKind::SparseLM, SparseCholeskySolver::new())
    }
}

#[cfg(feature = "sparse")]
impl Default for SparseLevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: NormalEquationSolver> NonlinearLeastSquaresEngine for LevenbergMarquardt<L> {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn minimize(
        &mut self,
        func: &mut dyn ErrorFunction,
        params: &mut [f64],
        target: &[f64],
        options: &EngineOptions,
    ) -> Result<EngineInfo, EngineError> {
        let (m, n) = (params.len(), target.len());
        if n < m {
            return Err(EngineError::InvalidDimensions {
                parameters: m,
                errors: n,
            });
        }

        let mut hx = allocate_workspace(n)?;
        let mut errors = allocate_workspace(n)?;
        let mut trial_hx = allocate_workspace(n)?;
        let mut plus = allocate_workspace(n)?;
        let mut minus = allocate_workspace(n)?;
        let mut trial = allocate_workspace(m)?;
        let mut jacobian = ColumnJacobian::new(n, m);

        let mut info = EngineInfo::default();

        func.evaluate(params, &mut hx, EvaluationPhase::Nominal);
        info.function_evaluations = 1;
        let mut p_el2 = squared_error(target, &hx, Some(&mut errors));
        info.initial_error_norm = p_el2.sqrt();

        let mut reason = if p_el2.is_finite() {
            None
        } else {
            Some(TerminationReason::InvalidValues)
        };

        let eps2_sq = options.eps2 * options.eps2;
        let mut mu = 0.0;
        let mut nu: i32 = 2;
        let mut dp_l2 = 0.0;
        let mut k = 0;

        while k < options.max_iterations && reason.is_none() {
            if p_el2 <= options.eps3 {
                reason = Some(TerminationReason::SmallError);
                break;
            }

            info.function_evaluations += estimate_jacobian(
                func,
                params,
                &hx,
                options.delta,
                &mut plus,
                &mut minus,
                &mut jacobian,
            );
            info.jacobian_evaluations += 1;
            if !jacobian.is_finite() {
                reason = Some(TerminationReason::InvalidValues);
                break;
            }

            self.linear_solver.assemble(&jacobian)?;
            let gradient = jacobian.transpose_mul(&errors);
            info.gradient_norm = gradient.iter().fold(0.0, |acc: f64, g| acc.max(g.abs()));
            let p_l2: f64 = params.iter().map(|p| p * p).sum();

            if info.gradient_norm <= options.eps1 {
                dp_l2 = 0.0;
                reason = Some(TerminationReason::SmallGradient);
                break;
            }

            if k == 0 {
                mu = options.tau * self.linear_solver.max_diagonal();
            }

            loop {
                info.linear_solves += 1;
                if let Some(step) = self.linear_solver.solve_damped(mu, &gradient) {
                    dp_l2 = step.norm_squared();
                    for ((t, &p), &dp) in trial.iter_mut().zip(params.iter()).zip(step.iter()) {
                        *t = p + dp;
                    }

                    if dp_l2 <= eps2_sq * p_l2 {
                        reason = Some(TerminationReason::SmallStep);
                        break;
                    }
                    if dp_l2 >= (p_l2 + options.eps2) / (f64::EPSILON * f64::EPSILON) {
                        reason = Some(TerminationReason::SingularMatrix);
                        break;
                    }

                    func.evaluate(&trial, &mut trial_hx, EvaluationPhase::Nominal);
                    info.function_evaluations += 1;
                    let trial_el2 = squared_error(target, &trial_hx, None);
                    if !trial_el2.is_finite() {
                        reason = Some(TerminationReason::InvalidValues);
                        break;
                    }

                    let df = p_el2 - trial_el2;
                    let dl = predicted_reduction(&step, &gradient, mu);
                    if dl > 0.0 && df > 0.0 {
                        let rho = 2.0 * df / dl - 1.0;
                        mu *= (1.0 - rho * rho * rho).max(1.0 / 3.0);
                        nu = 2;

                        params.copy_from_slice(&trial);
                        std::mem::swap(&mut hx, &mut trial_hx);
                        p_el2 = squared_error(target, &hx, Some(&mut errors));
                        trace!("Accepted step {k}: ||e||^2 = {p_el2:.6e}, mu = {mu:.3e}");
                        break;
                    }
                }

                mu *= f64::from(nu);
                match nu.checked_mul(2) {
                    Some(next) => nu = next,
                    None => {
                        reason = Some(TerminationReason::DampingExhausted);
                        break;
                    }
                }
            }

            if reason.is_some() {
                break;
            }
            k += 1;
        }

        let reason = reason.unwrap_or(if k >= options.max_iterations {
            TerminationReason::MaxIterations
        } else {
            TerminationReason::NoReason
        });

        info.iterations = k;
        info.final_error_norm = p_el2.sqrt();
        info.step_norm = dp_l2.sqrt();
        info.damping_ratio = mu / self.linear_solver.max_diagonal().max(f64::MIN_POSITIVE);
        info.reason_code = reason.code();

        debug!(
            "{} finished with {} linear solver: {}",
            self.kind,
            self.linear_solver.name(),
            info
        );
        Ok(info)
    }
}

/// `dL = dp^T (mu dp + J^T e)`, the decrease predicted by the damped linear model.
fn predicted_reduction(step: &DVector<f64>, gradient: &DVector<f64>, mu: f64) -> f64 {
    step.iter()
        .zip(gradient.iter())
        .map(|(&dp, &g)| dp * (mu * dp + g))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a * exp(b * x) sampled without noise at a = 2, b = -0.5
    fn exponential_problem() -> (Vec<f64>, Vec<f64>) {
        let xs: Vec<f64> = (0..12).map(|i| i as f64 * 0.5).collect();
        let ys = xs.iter().map(|x| 2.0 * (-0.5 * x).exp()).collect();
        (xs, ys)
    }

    fn tight_options() -> EngineOptions {
        EngineOptions {
            max_iterations: 100,
            eps1: 1e-12,
            eps2: 1e-12,
            eps3: 1e-16,
            ..EngineOptions::default()
        }
    }

    fn run_exponential<E: NonlinearLeastSquaresEngine>(
        engine: &mut E,
        options: &EngineOptions,
    ) -> (Vec<f64>, EngineInfo) {
        let (xs, ys) = exponential_problem();
        let mut model = |p: &[f64], out: &mut [f64]| {
            for (o, x) in out.iter_mut().zip(&xs) {
                *o = p[0] * (p[1] * x).exp();
            }
        };
        let mut params = vec![1.0, 0.0];
        let info = engine
            .minimize(&mut model, &mut params, &ys, options)
            .unwrap();
        (params, info)
    }

    #[test]
    fn test_fits_exponential_curve() {
        let options = tight_options();
        let (params, info) = run_exponential(&mut DenseLevenbergMarquardt::new(), &options);

        assert!((params[0] - 2.0).abs() < 1e-3, "a = {}", params[0]);
        assert!((params[1] + 0.5).abs() < 1e-3, "b = {}", params[1]);
        assert!(info.final_error_norm < info.initial_error_norm);
        assert!(info.reason().is_success());
        assert!(info.jacobian_evaluations >= 1);
        assert!(info.linear_solves >= info.iterations);
    }

    #[test]
    fn test_central_differences_converge() {
        let options = EngineOptions {
            delta: -1e-4,
            ..tight_options()
        };
        let (params, info) = run_exponential(&mut DenseLevenbergMarquardt::new(), &options);
        assert!((params[0] - 2.0).abs() < 1e-3);
        assert!((params[1] + 0.5).abs() < 1e-3);
        assert!(info.reason().is_success());
    }

    #[test]
    fn test_iteration_limit_reports_reason_3() {
        let options = EngineOptions {
            max_iterations: 1,
            eps1: 0.0,
            eps2: 0.0,
            eps3: 0.0,
            ..EngineOptions::default()
        };
        let (_, info) = run_exponential(&mut DenseLevenbergMarquardt::new(), &options);
        assert_eq!(info.iterations, 1);
        assert_eq!(info.reason(), TerminationReason::MaxIterations);
    }

    #[test]
    fn test_no_parameters_stop_on_gradient() {
        let mut engine = DenseLevenbergMarquardt::new();
        let mut func = |_: &[f64], out: &mut [f64]| out.fill(1.0);
        let info = engine
            .minimize(&mut func, &mut [], &[0.0, 0.0, 0.0], &EngineOptions::default())
            .unwrap();
        assert_eq!(info.iterations, 0);
        assert_eq!(info.reason(), TerminationReason::SmallGradient);
        assert_eq!(info.function_evaluations, 1);
        assert!((info.initial_error_norm - 3.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_exact_start_stops_on_small_error() {
        let mut engine = DenseLevenbergMarquardt::new();
        let mut func = |p: &[f64], out: &mut [f64]| {
            out[0] = p[0];
            out[1] = 2.0 * p[0];
        };
        let mut params = [3.0];
        let info = engine
            .minimize(&mut func, &mut params, &[3.0, 6.0], &EngineOptions::default())
            .unwrap();
        assert_eq!(info.reason(), TerminationReason::SmallError);
        assert_eq!(info.iterations, 0);
        assert_eq!(info.jacobian_evaluations, 0);
        assert_eq!(params, [3.0]);
    }

    #[test]
    fn test_nan_values_stop_with_reason_7() {
        let mut engine = DenseLevenbergMarquardt::new();
        let mut func = |_: &[f64], out: &mut [f64]| out.fill(f64::NAN);
        let mut params = [1.0];
        let info = engine
            .minimize(&mut func, &mut params, &[0.0, 0.0], &EngineOptions::default())
            .unwrap();
        assert_eq!(info.reason(), TerminationReason::InvalidValues);
        assert_eq!(info.iterations, 0);
        assert_eq!(params, [1.0]);
    }

    #[test]
    fn test_nan_during_jacobian_stops_with_reason_7() {
        let mut engine = DenseLevenbergMarquardt::new();
        let mut func = |p: &[f64], out: &mut [f64]| {
            let value = if p[0] == 1.0 { 1.0 } else { f64::NAN };
            out.fill(value);
        };
        let mut params = [1.0];
        let info = engine
            .minimize(&mut func, &mut params, &[0.0, 0.0], &EngineOptions::default())
            .unwrap();
        assert_eq!(info.reason(), TerminationReason::InvalidValues);
        assert_eq!(info.jacobian_evaluations, 1);
    }

    #[test]
    fn test_fewer_errors_than_parameters_is_rejected() {
        let mut engine = DenseLevenbergMarquardt::new();
        let mut func = |_: &[f64], _: &mut [f64]| {};
        let result = engine.minimize(&mut func, &mut [0.0, 0.0], &[1.0], &EngineOptions::default());
        assert_eq!(
            result,
            Err(EngineError::InvalidDimensions {
                parameters: 2,
                errors: 1
            })
        );
    }

    #[test]
    fn test_linear_problem_converges_quickly() {
        // Overdetermined linear system with exact solution (1, -2)
        let mut func = |p: &[f64], out: &mut [f64]| {
            out[0] = p[0] + p[1];
            out[1] = p[0] - p[1];
            out[2] = 2.0 * p[0];
        };
        let target = [-1.0, 3.0, 2.0];
        let mut params = [0.0, 0.0];
        let info = DenseLevenbergMarquardt::new()
            .minimize(&mut func, &mut params, &target, &EngineOptions::default())
            .unwrap();
        assert!((params[0] - 1.0).abs() < 1e-4);
        assert!((params[1] + 2.0).abs() < 1e-4);
        assert!(info.iterations < 10);
    }

    #[cfg(feature = "sparse")]
    #[test]
    fn test_sparse_engine_matches_dense() {
        let options = tight_options();
        let (dense, dense_info) = run_exponential(&mut DenseLevenbergMarquardt::new(), &options);
        let (sparse, sparse_info) =
            run_exponential(&mut SparseLevenbergMarquardt::new(), &options);

        assert!((dense[0] - sparse[0]).abs() < 1e-6);
        assert!((dense[1] - sparse[1]).abs() < 1e-6);
        assert!(dense_info.reason().is_success());
        assert!(sparse_info.reason().is_success());
        assert_eq!(SparseLevenbergMarquardt::new().kind(), EngineKind::SparseLM);
    }
}
