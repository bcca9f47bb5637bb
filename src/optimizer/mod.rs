//! Non-linear least squares engines.
//!
//! This module provides the contract between a solve and the optimizer driving
//! it, and two engines implementing it:
//! - Dense Levenberg-Marquardt (nalgebra LU on the normal equations)
//! - Sparse Levenberg-Marquardt (faer Cholesky, feature `sparse`)
//!
//! Both estimate the Jacobian by finite differences of the error function.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub mod jacobian;
pub mod levenberg_marquardt;

pub use jacobian::{DifferenceScheme, estimate_jacobian};
pub use levenberg_marquardt::{DenseLevenbergMarquardt, LevenbergMarquardt};

#[cfg(feature = "sparse")]
pub use levenberg_marquardt::SparseLevenbergMarquardt;

/// Why the error function is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationPhase {
    /// Evaluation at the current or a candidate parameter vector
    Nominal,
    /// Evaluation at a perturbed parameter vector to estimate the Jacobian
    Jacobian,
}

/// The function minimized by an engine.
///
/// `evaluate` cannot fail. An implementation that cannot produce values
/// writes NaN into `errors`; the engine then stops with
/// [`TerminationReason::InvalidValues`].
pub trait ErrorFunction {
    fn evaluate(&mut self, params: &[f64], errors: &mut [f64], phase: EvaluationPhase);
}

impl<F: FnMut(&[f64], &mut [f64])> ErrorFunction for F {
    fn evaluate(&mut self, params: &[f64], errors: &mut [f64], _phase: EvaluationPhase) {
        self(params, errors)
    }
}

/// A non-linear least squares minimizer of `||target - f(params)||^2`.
pub trait NonlinearLeastSquaresEngine {
    fn kind(&self) -> EngineKind;

    /// Minimize in place, leaving the best parameters found in `params`.
    fn minimize(
        &mut self,
        func: &mut dyn ErrorFunction,
        params: &mut [f64],
        target: &[f64],
        options: &EngineOptions,
    ) -> Result<EngineInfo, EngineError>;
}

/// Available engines. Codes are stable and used by scene files and the CLI.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[default]
    DenseLM,
    SparseLM,
}

impl EngineKind {
    pub fn code(self) -> i32 {
        match self {
            EngineKind::DenseLM => 0,
            EngineKind::SparseLM => 1,
        }
    }

    /// Engine for a numeric code, falling back to [`EngineKind::DenseLM`] for
    /// unknown codes.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => EngineKind::DenseLM,
            1 => EngineKind::SparseLM,
            _ => {
                warn!("Selected engine type '{code}' is unknown, switching to DenseLM instead.");
                EngineKind::DenseLM
            }
        }
    }

    /// Engine for a name or numeric code, falling back to [`EngineKind::DenseLM`].
    pub fn parse_lossy(name: &str) -> Self {
        match name.parse() {
            Ok(kind) => kind,
            Err(_) => match name.trim().parse::<i32>() {
                Ok(code) => Self::from_code(code),
                Err(_) => {
                    warn!("Selected engine '{name}' is unknown, switching to DenseLM instead.");
                    EngineKind::DenseLM
                }
            },
        }
    }

    /// Whether this build contains the engine.
    pub fn is_available(self) -> bool {
        match self {
            EngineKind::DenseLM => true,
            EngineKind::SparseLM => cfg!(feature = "sparse"),
        }
    }

    /// The engine actually used for this selection.
    pub fn resolve(self) -> Self {
        if self.is_available() {
            self
        } else {
            warn!("{self} is not available in this build, switching to DenseLM instead.");
            EngineKind::DenseLM
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "denselm" | "dense" | "levmar" => Ok(EngineKind::DenseLM),
            "sparselm" | "sparse" | "sparse_levmar" => Ok(EngineKind::SparseLM),
            other => Err(format!("unknown engine '{other}'")),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::DenseLM => write!(f, "DenseLM"),
            EngineKind::SparseLM => write!(f, "SparseLM"),
        }
    }
}

/// Create the engine for `kind`, after availability fallback.
pub fn create_engine(kind: EngineKind) -> Box<dyn NonlinearLeastSquaresEngine> {
    match kind.resolve() {
        #[cfg(feature = "sparse")]
        EngineKind::SparseLM => Box::new(SparseLevenbergMarquardt::new()),
        _ => Box::new(DenseLevenbergMarquardt::new()),
    }
}

/// Tuning of one minimization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub max_iterations: usize,
    /// Scale of the initial damping `mu = tau * max(J^T J)_ii`
    pub tau: f64,
    /// Stop when `||J^T e||_inf <= eps1`
    pub eps1: f64,
    /// Stop when `||dp||_2 <= eps2 * ||p||_2`
    pub eps2: f64,
    /// Stop when `||e||_2^2 <= eps3`
    pub eps3: f64,
    /// Finite difference step; negative selects central differences
    pub delta: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tau: 1e-3,
            eps1: 1e-6,
            eps2: 1e-6,
            eps3: 1e-6,
            delta: 1e-4,
        }
    }
}

/// Statistics of a finished minimization.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineInfo {
    /// `||e||_2` at the initial parameters
    pub initial_error_norm: f64,
    /// `||e||_2` at the final parameters
    pub final_error_norm: f64,
    /// `||J^T e||_inf` of the last Jacobian
    pub gradient_norm: f64,
    /// `||dp||_2` of the last step tried
    pub step_norm: f64,
    /// `mu / max(J^T J)_ii`
    pub damping_ratio: f64,
    pub iterations: usize,
    pub reason_code: i32,
    pub function_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub linear_solves: usize,
}

impl EngineInfo {
    pub fn reason(&self) -> TerminationReason {
        TerminationReason::from_code(self.reason_code)
    }
}

impl fmt::Display for EngineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error norm: {:.6e} -> {:.6e}, Iterations: {}, Reason: {} ({}), Gradient norm: {:.2e}, Step norm: {:.2e}, Damping ratio: {:.2e}, Function evaluations: {}, Jacobian evaluations: {}, Linear solves: {}",
            self.initial_error_norm,
            self.final_error_norm,
            self.iterations,
            self.reason_code,
            self.reason().description(),
            self.gradient_norm,
            self.step_norm,
            self.damping_ratio,
            self.function_evaluations,
            self.jacobian_evaluations,
            self.linear_solves
        )
    }
}

/// Why an engine stopped. The discriminants are the engine's reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    NoReason = 0,
    SmallGradient = 1,
    SmallStep = 2,
    MaxIterations = 3,
    SingularMatrix = 4,
    DampingExhausted = 5,
    SmallError = 6,
    InvalidValues = 7,
}

impl TerminationReason {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Reason for an engine code; unknown codes map to [`TerminationReason::NoReason`].
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TerminationReason::NoReason,
            1 => TerminationReason::SmallGradient,
            2 => TerminationReason::SmallStep,
            3 => TerminationReason::MaxIterations,
            4 => TerminationReason::SingularMatrix,
            5 => TerminationReason::DampingExhausted,
            6 => TerminationReason::SmallError,
            7 => TerminationReason::InvalidValues,
            _ => {
                warn!("Unknown termination reason code {code}");
                TerminationReason::NoReason
            }
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            TerminationReason::NoReason => "No reason, should not get here!",
            TerminationReason::SmallGradient => "Stopped by small gradient J^T e",
            TerminationReason::SmallStep => "Stopped by small Dp",
            TerminationReason::MaxIterations => "Stopped by reaching maximum iterations",
            TerminationReason::SingularMatrix => {
                "Singular matrix. Restart from current p with increased mu"
            }
            TerminationReason::DampingExhausted => {
                "Too many failed attempts to increase damping. Restart with increased mu"
            }
            TerminationReason::SmallError => "Stopped by small ||e||_2",
            TerminationReason::InvalidValues => "User canceled",
        }
    }

    /// Operator guidance for reasons that ask for a restart.
    pub fn remedy(self) -> Option<&'static str> {
        match self {
            TerminationReason::SingularMatrix | TerminationReason::DampingExhausted => {
                Some("restart the solve with an increased tau")
            }
            _ => None,
        }
    }

    /// Whether the parameters reached are a usable solution.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            TerminationReason::NoReason
                | TerminationReason::SmallGradient
                | TerminationReason::SmallStep
                | TerminationReason::MaxIterations
                | TerminationReason::SmallError
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_round_trip_through_table() {
        for code in 0..=7 {
            assert_eq!(TerminationReason::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_unknown_reason_code_maps_to_no_reason() {
        assert_eq!(TerminationReason::from_code(42), TerminationReason::NoReason);
        assert_eq!(TerminationReason::from_code(-1), TerminationReason::NoReason);
    }

    #[test]
    fn test_remedy_only_for_restart_reasons() {
        assert!(TerminationReason::SingularMatrix.remedy().is_some());
        assert!(TerminationReason::DampingExhausted.remedy().is_some());
        assert!(TerminationReason::MaxIterations.remedy().is_none());
        assert!(TerminationReason::InvalidValues.remedy().is_none());
    }

    #[test]
    fn test_success_classification() {
        assert!(TerminationReason::SmallGradient.is_success());
        assert!(TerminationReason::MaxIterations.is_success());
        assert!(TerminationReason::NoReason.is_success());
        assert!(!TerminationReason::SingularMatrix.is_success());
        assert!(!TerminationReason::InvalidValues.is_success());
    }

    #[test]
    fn test_engine_kind_codes() {
        assert_eq!(EngineKind::from_code(0), EngineKind::DenseLM);
        assert_eq!(EngineKind::from_code(1), EngineKind::SparseLM);
        assert_eq!(EngineKind::from_code(9), EngineKind::DenseLM);
        assert_eq!(EngineKind::SparseLM.code(), 1);
    }

    #[test]
    fn test_engine_kind_parse_lossy() {
        assert_eq!(EngineKind::parse_lossy("SparseLM"), EngineKind::SparseLM);
        assert_eq!(EngineKind::parse_lossy(" dense "), EngineKind::DenseLM);
        assert_eq!(EngineKind::parse_lossy("1"), EngineKind::SparseLM);
        assert_eq!(EngineKind::parse_lossy("gauss-newton"), EngineKind::DenseLM);
    }

    #[test]
    fn test_resolve_falls_back_when_unavailable() {
        assert_eq!(EngineKind::DenseLM.resolve(), EngineKind::DenseLM);
        let expected = if cfg!(feature = "sparse") {
            EngineKind::SparseLM
        } else {
            EngineKind::DenseLM
        };
        assert_eq!(EngineKind::SparseLM.resolve(), expected);
        assert_eq!(create_engine(EngineKind::SparseLM).kind(), expected);
    }

    #[test]
    fn test_default_options() {
        let options = EngineOptions::default();
        assert_eq!(options.max_iterations, 20);
        assert_eq!(options.tau, 1e-3);
        assert_eq!(options.delta, 1e-4);
    }
}
