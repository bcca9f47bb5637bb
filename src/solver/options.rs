use crate::error::{MatchmoveError, MatchmoveResult};
use crate::optimizer::{EngineKind, EngineOptions};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration of one solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Maximum number of outer optimizer iterations
    pub max_iterations: usize,
    /// Scale of the initial damping factor
    pub tau: f64,
    /// Gradient threshold `||J^T e||_inf`
    pub eps1: f64,
    /// Relative step threshold `||dp||_2 / ||p||_2`
    pub eps2: f64,
    /// Squared error threshold `||e||_2^2`
    pub eps3: f64,
    /// Finite difference step, negative for central differences
    pub delta: f64,
    /// Requested engine; unavailable engines fall back to DenseLM
    pub engine: EngineKind,
    /// Log every solved parameter value
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        let engine = EngineOptions::default();
        Self {
            max_iterations: engine.max_iterations,
            tau: engine.tau,
            eps1: engine.eps1,
            eps2: engine.eps2,
            eps3: engine.eps3,
            delta: engine.delta,
            engine: EngineKind::default(),
            verbose: false,
        }
    }
}

impl SolverOptions {
    /// Create solver options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the initial damping scale
    pub fn with_tau(mut self, tau: f64) -> Self {
        self.tau = tau;
        self
    }

    /// Set the gradient, step and error thresholds
    pub fn with_thresholds(mut self, eps1: f64, eps2: f64, eps3: f64) -> Self {
        self.eps1 = eps1;
        self.eps2 = eps2;
        self.eps3 = eps3;
        self
    }

    /// Set the finite difference step
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    /// Select the engine
    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Enable or disable logging of solved values
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Check every numeric option against its allowed range.
    pub fn validate(&self) -> MatchmoveResult<()> {
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be greater than zero"));
        }
        if !(self.tau.is_finite() && self.tau > 0.0) {
            return Err(invalid(format!("tau must be positive and finite, got {}", self.tau)));
        }
        for (name, value) in [("eps1", self.eps1), ("eps2", self.eps2), ("eps3", self.eps3)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(invalid(format!(
                    "{name} must be non-negative and finite, got {value}"
                )));
            }
        }
        if !self.delta.is_finite() || self.delta == 0.0 {
            return Err(invalid(format!(
                "delta must be non-zero and finite, got {}",
                self.delta
            )));
        }
        Ok(())
    }

    /// Engine tuning derived from these options.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_iterations: self.max_iterations,
            tau: self.tau,
            eps1: self.eps1,
            eps2: self.eps2,
            eps3: self.eps3,
            delta: self.delta,
        }
    }
}

fn invalid(message: impl Into<String>) -> MatchmoveError {
    MatchmoveError::InvalidOptions(message.into())
}

impl fmt::Display for SolverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SolverOptions {{ engine: {}, max_iterations: {}, tau: {:e}, eps1: {:e}, eps2: {:e}, eps3: {:e}, delta: {:e}, verbose: {} }}",
            self.engine,
            self.max_iterations,
            self.tau,
            self.eps1,
            self.eps2,
            self.eps3,
            self.delta,
            self.verbose
        )
    }
}
