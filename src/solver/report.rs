use crate::core::index::ERRORS_PER_OBSERVATION;
use crate::core::{ErrorIndex, Frame, MarkerId, SolveObjects};
use crate::error::SceneError;
use crate::optimizer::{EngineInfo, EngineKind, TerminationReason};
use std::fmt;
use std::time::Duration;

/// Final outcome of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// The engine stopped on a convergence test or the iteration limit
    Converged,
    /// The progress sink requested cancellation
    Cancelled,
    /// The engine stopped on a numerical failure or a scene error
    Failed,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Converged => write!(f, "Converged"),
            SolveStatus::Cancelled => write!(f, "Cancelled"),
            SolveStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Mean distance error of one marker over its valid frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerError {
    pub marker: MarkerId,
    pub mean_distance: f64,
    pub observations: usize,
}

/// Mean distance error of one frame over its valid markers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameError {
    pub frame: Frame,
    pub mean_distance: f64,
    pub observations: usize,
}

/// Wall-clock time spent in a solve.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolveTimings {
    pub total: Duration,
    /// Writing parameters into the scene inside the error function
    pub parameter_write: Duration,
    /// Measuring reprojection errors inside the error function
    pub error_measure: Duration,
}

/// Everything known about a finished solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub status: SolveStatus,
    /// Engine actually used, after fallback
    pub engine: EngineKind,
    pub reason: TerminationReason,
    /// Operator guidance when the reason asks for a restart
    pub remedy: Option<&'static str>,
    pub parameter_count: usize,
    pub error_count: usize,
    /// Mean absolute value over the retained error buffer
    pub mean_error: f64,
    pub engine_info: EngineInfo,
    /// Function evaluations seen by the error function, nominal and Jacobian
    pub solve_evaluations: usize,
    pub jacobian_solve_evaluations: usize,
    pub marker_errors: Vec<MarkerError>,
    pub frame_errors: Vec<FrameError>,
    /// Solved parameter vector in parameter-index order
    pub parameters: Vec<f64>,
    /// First scene failure raised inside the error function
    pub scene_error: Option<SceneError>,
    pub timings: SolveTimings,
}

impl SolveReport {
    pub fn is_success(&self) -> bool {
        self.status == SolveStatus::Converged
    }

    pub fn iterations(&self) -> usize {
        self.engine_info.iterations
    }
}

/// Per-marker and per-frame mean distance errors from the retained error triples.
pub(crate) fn summarize_errors(
    errors: &ErrorIndex,
    objects: &SolveObjects,
    retained: &[f64],
) -> (Vec<MarkerError>, Vec<FrameError>) {
    let mut per_marker = vec![(0.0, 0usize); objects.markers.len()];
    let mut per_frame = vec![(0.0, 0usize); objects.frames.len()];

    for (position, entry) in errors.iter().enumerate() {
        let distance = retained[position * ERRORS_PER_OBSERVATION + 2];
        let marker = &mut per_marker[entry.marker_index];
        marker.0 += distance;
        marker.1 += 1;
        let frame = &mut per_frame[entry.frame_index];
        frame.0 += distance;
        frame.1 += 1;
    }

    let markers = objects
        .markers
        .iter()
        .zip(per_marker)
        .filter(|(_, (_, count))| *count > 0)
        .map(|(&marker, (sum, count))| MarkerError {
            marker,
            mean_distance: sum / count as f64,
            observations: count,
        })
        .collect();
    let frames = objects
        .frames
        .iter()
        .zip(per_frame)
        .filter(|(_, (_, count))| *count > 0)
        .map(|(&frame, (sum, count))| FrameError {
            frame,
            mean_distance: sum / count as f64,
            observations: count,
        })
        .collect();
    (markers, frames)
}

impl fmt::Display for SolveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = &self.engine_info;
        writeln!(f, "=== Solve Report ===")?;
        writeln!(f, "Status:                {}", self.status)?;
        writeln!(f, "Engine:                {}", self.engine)?;
        writeln!(
            f,
            "Reason:                {} ({})",
            self.reason,
            self.reason.code()
        )?;
        if let Some(remedy) = self.remedy {
            writeln!(f, "Remedy:                {remedy}")?;
        }
        if let Some(error) = &self.scene_error {
            writeln!(f, "Scene error:           {error}")?;
        }
        writeln!(
            f,
            "Parameters / errors:   {} / {}",
            self.parameter_count, self.error_count
        )?;
        writeln!(f, "Mean error:            {:.6e}", self.mean_error)?;
        writeln!(f, "Initial error norm:    {:.6e}", info.initial_error_norm)?;
        writeln!(f, "Final error norm:      {:.6e}", info.final_error_norm)?;
        writeln!(f, "Iterations:            {}", info.iterations)?;
        writeln!(
            f,
            "Evaluations:           {} ({} solves, {} Jacobian solves)",
            info.function_evaluations, self.solve_evaluations, self.jacobian_solve_evaluations
        )?;
        writeln!(f, "Jacobian evaluations:  {}", info.jacobian_evaluations)?;
        writeln!(f, "Linear solves:         {}", info.linear_solves)?;
        writeln!(f, "Gradient norm:         {:.6e}", info.gradient_norm)?;
        writeln!(f, "Step norm:             {:.6e}", info.step_norm)?;
        writeln!(f, "Damping ratio:         {:.6e}", info.damping_ratio)?;
        for marker in &self.marker_errors {
            writeln!(
                f,
                "  {} mean error:  {:.6e} over {} frames",
                marker.marker, marker.mean_distance, marker.observations
            )?;
        }
        for frame in &self.frame_errors {
            writeln!(
                f,
                "  frame {} mean error: {:.6e} over {} markers",
                frame.frame, frame.mean_distance, frame.observations
            )?;
        }
        writeln!(f, "Total time:            {:?}", self.timings.total)?;
        writeln!(f, "Parameter write time:  {:?}", self.timings.parameter_write)?;
        writeln!(f, "Error measure time:    {:?}", self.timings.error_measure)?;
        Ok(())
    }
}
