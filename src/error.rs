//! Error types for the matchmove-solver library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! Errors only travel through `Result` before and after optimization. Inside the
//! reprojection callback a failure is reported to the engine by filling the error
//! vector with NaN (see [`crate::core::reprojection`]).

use crate::core::{AttrId, BundleId, CameraId, Frame, MarkerId};
use std::io::Error;
use thiserror::Error;

/// Main result type used throughout the matchmove-solver library
pub type MatchmoveResult<T> = Result<T, MatchmoveError>;

/// Result type for queries against the scene collaborators
pub type SceneResult<T> = Result<T, SceneError>;

/// Failures raised by an [`AttributeStore`](crate::core::scene::AttributeStore) or
/// [`SceneEvaluator`](crate::core::scene::SceneEvaluator).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SceneError {
    #[error("unknown attribute {0}")]
    UnknownAttribute(AttrId),

    #[error("unknown camera {0}")]
    UnknownCamera(CameraId),

    #[error("unknown marker {0}")]
    UnknownMarker(MarkerId),

    #[error("unknown bundle {0}")]
    UnknownBundle(BundleId),

    /// An animated attribute has no keyframes to sample
    #[error("attribute {attr} has no keyframes to evaluate at frame {frame}")]
    NoKeyframes { attr: AttrId, frame: Frame },

    /// A marker has no observed position on the requested frame
    #[error("marker {marker} has no position at frame {frame}")]
    MissingObservation { marker: MarkerId, frame: Frame },

    /// A camera transform could not be inverted
    #[error("camera {camera} has a singular transform at frame {frame}")]
    SingularTransform { camera: CameraId, frame: Frame },

    /// Lens coefficients that the distortion model cannot evaluate
    #[error("camera {camera} has an invalid lens at frame {frame}")]
    InvalidLens { camera: CameraId, frame: Frame },

    /// Any other backend failure
    #[error("scene query failed: {0}")]
    Query(String),
}

/// Failures of a non-linear least squares engine that abort the solve.
///
/// Numerical trouble during iteration is not an error; it is reported through a
/// termination reason code instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Workspace memory could not be reserved
    #[error("failed to allocate optimizer workspace of {requested} values")]
    Allocation { requested: usize },

    /// Parameter/error vectors do not describe a solvable problem
    #[error("invalid problem dimensions: {parameters} parameters, {errors} errors")]
    InvalidDimensions { parameters: usize, errors: usize },

    /// The linear solver could not be set up for the normal equations
    #[error("linear solver setup failed: {0}")]
    LinearSolver(String),
}

/// Main error type for the matchmove-solver library
#[derive(Debug, Clone, Error)]
pub enum MatchmoveError {
    /// A scene query failed while building indices or seeding parameters
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    /// The optimizer could not run
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Solver options outside of their allowed ranges
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The problem cannot be solved as posed, detected before optimization
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// IO related errors (scene file loading and saving)
    #[error("IO error: {0}")]
    Io(String),

    /// Malformed scene description
    #[error("Parse error: {0}")]
    Parse(String),
}

// Conversions from standard library errors

impl From<Error> for MatchmoveError {
    fn from(err: Error) -> Self {
        MatchmoveError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MatchmoveError {
    fn from(err: serde_json::Error) -> Self {
        MatchmoveError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_matchmove_error_display() {
        let error = MatchmoveError::Precondition("3 parameters > 0 errors".to_string());
        assert_eq!(
            error.to_string(),
            "Precondition failed: 3 parameters > 0 errors"
        );
    }

    #[test]
    fn test_scene_error_converts() {
        let error: MatchmoveError = SceneError::UnknownAttribute(AttrId(4)).into();
        match error {
            MatchmoveError::Scene(SceneError::UnknownAttribute(id)) => assert_eq!(id, AttrId(4)),
            _ => panic!("Expected scene error"),
        }
    }

    #[test]
    fn test_matchmove_error_from_io() {
        let io_error = Error::new(ErrorKind::NotFound, "File not found");
        let error = MatchmoveError::from(io_error);

        match error {
            MatchmoveError::Io(msg) => assert!(msg.contains("File not found")),
            _ => panic!("Expected IO error"),
        }
    }

    #[test]
    fn test_engine_error_display() {
        let error = EngineError::Allocation { requested: 12 };
        assert_eq!(
            error.to_string(),
            "failed to allocate optimizer workspace of 12 values"
        );
    }
}
