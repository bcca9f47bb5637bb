//! Finite-difference Jacobian estimation.

use super::{ErrorFunction, EvaluationPhase};
use crate::linalg::ColumnJacobian;

/// Relative part of the finite difference step.
const RELATIVE_STEP: f64 = 1e-4;

/// How each Jacobian column is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferenceScheme {
    /// `(f(p + d e_j) - f(p)) / d`, one evaluation per parameter
    Forward,
    /// `(f(p + d e_j) - f(p - d e_j)) / 2d`, two evaluations per parameter
    Central,
}

impl DifferenceScheme {
    /// Forward for a positive step, central for a negative one.
    pub fn from_delta(delta: f64) -> Self {
        if delta < 0.0 {
            DifferenceScheme::Central
        } else {
            DifferenceScheme::Forward
        }
    }

    pub fn evaluations_per_parameter(self) -> usize {
        match self {
            DifferenceScheme::Forward => 1,
            DifferenceScheme::Central => 2,
        }
    }
}

/// Step used to perturb a parameter of value `param`.
pub fn difference_step(param: f64, delta: f64) -> f64 {
    (RELATIVE_STEP * param.abs()).max(delta.abs())
}

/// Estimate the Jacobian of `func` at `params`, where `hx = func(params)`.
///
/// Each parameter is perturbed in turn and restored afterwards. `plus` and
/// `minus` are scratch buffers of the error dimension; `minus` is only used by
/// central differences. Returns the number of evaluations made.
pub fn estimate_jacobian(
    func: &mut dyn ErrorFunction,
    params: &mut [f64],
    hx: &[f64],
    delta: f64,
    plus: &mut [f64],
    minus: &mut [f64],
    jacobian: &mut ColumnJacobian,
) -> usize {
    let scheme = DifferenceScheme::from_delta(delta);

    for j in 0..params.len() {
        let original = params[j];
        let d = difference_step(original, delta);

        params[j] = original + d;
        func.evaluate(params, plus, EvaluationPhase::Jacobian);

        match scheme {
            DifferenceScheme::Forward => {
                for (derivative, &nominal) in plus.iter_mut().zip(hx) {
                    *derivative = (*derivative - nominal) / d;
                }
            }
            DifferenceScheme::Central => {
                params[j] = original - d;
                func.evaluate(params, minus, EvaluationPhase::Jacobian);
                let scale = 0.5 / d;
                for (derivative, &below) in plus.iter_mut().zip(minus.iter()) {
                    *derivative = (*derivative - below) * scale;
                }
            }
        }

        params[j] = original;
        jacobian.set_column_from_dense(j, plus);
    }

    params.len() * scheme.evaluations_per_parameter()
}
