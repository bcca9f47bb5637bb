//! End-to-end solve orchestration.
//!
//! [`SolveController`] runs one solve through its states:
//!
//! ```text
//! Idle -> Configuring -> Indexing -> Seeding -> Optimizing
//!      -> {Converged, Cancelled, Failed} -> Reporting -> Idle
//! ```
//!
//! Failures before optimization (options, preconditions, scene queries) return
//! `Err` and leave the scene untouched. Once the engine runs, problems surface
//! as a [`SolveStatus`] in the returned [`SolveReport`].

use crate::core::{
    ErrorIndex, ParameterIndex, ProgressSink, ReprojectionErrorFunction, SceneContext, SolveObjects,
};
use crate::error::{MatchmoveError, MatchmoveResult};
use crate::optimizer::{
    DifferenceScheme, NonlinearLeastSquaresEngine, TerminationReason, create_engine,
};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

pub mod options;
pub mod report;

pub use options::SolverOptions;
pub use report::{FrameError, MarkerError, SolveReport, SolveStatus, SolveTimings};

/// Lifecycle state of a [`SolveController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveState {
    Idle,
    Configuring,
    Indexing,
    Seeding,
    Optimizing,
    Converged,
    Cancelled,
    Failed,
    Reporting,
}

impl fmt::Display for SolveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Runs solves with one set of options.
pub struct SolveController {
    options: SolverOptions,
    engine: Option<Box<dyn NonlinearLeastSquaresEngine>>,
    state: SolveState,
    history: Vec<SolveState>,
}

impl SolveController {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            engine: None,
            state: SolveState::Idle,
            history: Vec::new(),
        }
    }

    /// Use `engine` instead of creating one from the options' engine kind.
    ///
    /// The engine is kept for later solves.
    pub fn with_engine(mut self, engine: Box<dyn NonlinearLeastSquaresEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn state(&self) -> SolveState {
        self.state
    }

    /// States entered during the last solve, in order.
    pub fn state_history(&self) -> &[SolveState] {
        &self.history
    }

    fn transition(&mut self, state: SolveState) {
        debug!("Solve state {} -> {}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    /// Solve `objects.attributes` so the markers line up with their bundles.
    ///
    /// Whenever the engine ran, `scene` is left holding the report's
    /// `parameters`, whatever the final status.
    pub fn solve<S, P>(
        &mut self,
        scene: &mut S,
        objects: &SolveObjects,
        progress: &P,
    ) -> MatchmoveResult<SolveReport>
    where
        S: SceneContext + ?Sized,
        P: ProgressSink + ?Sized,
    {
        self.history.clear();
        let result = self.run(scene, objects, progress);
        if let Err(err) = &result {
            warn!("Solve aborted: {err}");
            self.transition(SolveState::Failed);
        }
        self.transition(SolveState::Idle);
        result
    }

    fn run<S, P>(
        &mut self,
        scene: &mut S,
        objects: &SolveObjects,
        progress: &P,
    ) -> MatchmoveResult<SolveReport>
    where
        S: SceneContext + ?Sized,
        P: ProgressSink + ?Sized,
    {
        let start = Instant::now();

        self.transition(SolveState::Configuring);
        self.options.validate()?;
        let engine_options = self.options.engine_options();
        let kind = self.options.engine.resolve();
        debug!("Configured {}", self.options);

        self.transition(SolveState::Indexing);
        let parameters = ParameterIndex::build(scene, &objects.attributes, objects.frames.len())?;
        let errors = ErrorIndex::build(scene, &objects.markers, &objects.frames)?;
        let (m, n) = (parameters.len(), errors.error_count());
        info!("Solving {m} parameters against {n} errors");
        if n == 0 {
            return Err(MatchmoveError::Precondition(
                "no valid marker observations on the solve frames".to_string(),
            ));
        }
        if m > n {
            return Err(MatchmoveError::Precondition(format!(
                "{m} parameters exceed {n} errors, add markers or frames"
            )));
        }

        self.transition(SolveState::Seeding);
        let mut params = parameters
            .iter()
            .map(|entry| {
                let attr = objects.attributes[entry.attr_index];
                let frame = entry.frame_index.map(|index| objects.frames[index]);
                scene.get_value(attr, frame)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.transition(SolveState::Optimizing);
        let evaluations_per_parameter =
            DifferenceScheme::from_delta(engine_options.delta).evaluations_per_parameter();
        let per_iteration = m.saturating_mul(evaluations_per_parameter).saturating_add(1);
        progress.set_total(
            engine_options
                .max_iterations
                .saturating_mul(per_iteration)
                .saturating_add(1),
        );

        let mut function =
            ReprojectionErrorFunction::new(scene, progress, objects, &parameters, &errors)?;
        let target = vec![0.0; n];
        let mut engine = self.engine.take().unwrap_or_else(|| create_engine(kind));
        let minimized = engine.minimize(&mut function, &mut params, &target, &engine_options);
        let kind = engine.kind();
        self.engine = Some(engine);
        let engine_info = minimized?;

        let reason = engine_info.reason();
        let mut status = if reason.is_success() {
            SolveStatus::Converged
        } else if reason == TerminationReason::InvalidValues && function.was_cancelled() {
            SolveStatus::Cancelled
        } else {
            SolveStatus::Failed
        };

        // The engine's last evaluation may be a rejected trial or a finite
        // difference step. Leave the scene at the returned parameters instead.
        let mut write_back_error = None;
        if function.has_written() {
            let mut final_errors = vec![0.0; n];
            if let Err(err) = function.apply_parameters(&params, &mut final_errors) {
                warn!("Writing the solved parameters back failed: {err}");
                status = SolveStatus::Failed;
                write_back_error = Some(err);
            }
        }
        self.transition(match status {
            SolveStatus::Converged => SolveState::Converged,
            SolveStatus::Cancelled => SolveState::Cancelled,
            SolveStatus::Failed => SolveState::Failed,
        });

        self.transition(SolveState::Reporting);
        let (marker_errors, frame_errors) =
            report::summarize_errors(&errors, objects, function.retained_errors());
        let evaluation_timings = function.timings();
        let report = SolveReport {
            status,
            engine: kind,
            reason,
            remedy: reason.remedy(),
            parameter_count: m,
            error_count: n,
            mean_error: function.mean_error(),
            engine_info,
            solve_evaluations: function.function_evaluations(),
            jacobian_solve_evaluations: function.jacobian_evaluations(),
            marker_errors,
            frame_errors,
            parameters: params,
            scene_error: function.scene_error().cloned().or(write_back_error),
            timings: SolveTimings {
                total: start.elapsed(),
                parameter_write: evaluation_timings.parameter_write,
                error_measure: evaluation_timings.error_measure,
            },
        };
        drop(function);

        if self.options.verbose {
            for (slot, value) in report.parameters.iter().enumerate() {
                if let Some((attr, frame)) = parameters.resolve(slot, objects) {
                    match frame {
                        Some(frame) => info!("Solved {attr} at frame {frame} = {value}"),
                        None => info!("Solved {attr} = {value}"),
                    }
                }
            }
        }

        match report.status {
            SolveStatus::Converged => info!(
                "Solve converged after {} iterations: {} (mean error {:.6e})",
                report.iterations(),
                report.reason,
                report.mean_error
            ),
            SolveStatus::Cancelled => warn!("Solve cancelled by the user"),
            SolveStatus::Failed => match report.remedy {
                Some(remedy) => warn!("Solve failed: {}, {remedy}", report.reason),
                None => warn!("Solve failed: {}", report.reason),
            },
        }
        Ok(report)
    }
}

impl Default for SolveController {
    fn default() -> Self {
        Self::new(SolverOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scene::{AttributeStore, CancellationToken, NoProgress};
    use crate::core::{AttrId, Frame};
    use crate::scene::MemoryScene;
    use nalgebra::{Point3, Vector3};

    fn single_marker_scene() -> (MemoryScene, SolveObjects) {
        let mut scene = MemoryScene::new();
        let camera = scene.add_camera(
            "cam",
            Vector3::new(0.0, 0.0, 10.0),
            Vector3::zeros(),
            35.0,
            (36.0, 24.0),
        );
        let bundle = scene.add_bundle("bnd", Point3::new(0.5, 0.25, 0.0));
        let marker = scene.add_marker("mkr", camera, bundle);
        for frame in [Frame(1), Frame(2)] {
            scene.place_marker_on_bundle(marker, frame).unwrap();
        }
        let attr = scene.bundle(bundle).unwrap().translate[0];
        let objects = SolveObjects::new()
            .with_cameras([camera])
            .with_markers([marker])
            .with_bundles([bundle])
            .with_attributes([attr])
            .with_frames([Frame(1), Frame(2)]);
        (scene, objects)
    }

    #[test]
    fn test_perfect_start_converges_on_small_error() {
        let (mut scene, objects) = single_marker_scene();
        let mut controller = SolveController::default();
        let report = controller.solve(&mut scene, &objects, &NoProgress).unwrap();

        assert_eq!(report.status, SolveStatus::Converged);
        assert_eq!(report.reason, TerminationReason::SmallError);
        assert_eq!(report.iterations(), 0);
        assert_eq!(report.error_count, 6);
        assert!(report.mean_error < 1e-12);
        assert_eq!(controller.state(), SolveState::Idle);
        assert_eq!(
            controller.state_history(),
            &[
                SolveState::Configuring,
                SolveState::Indexing,
                SolveState::Seeding,
                SolveState::Optimizing,
                SolveState::Converged,
                SolveState::Reporting,
                SolveState::Idle,
            ]
        );
    }

    #[test]
    fn test_progress_total_saturates_for_huge_iteration_limits() {
        let (mut scene, objects) = single_marker_scene();
        let token = CancellationToken::new();
        let options = SolverOptions::new()
            .with_max_iterations(usize::MAX)
            .with_delta(-1e-4);
        let report = SolveController::new(options)
            .solve(&mut scene, &objects, &token)
            .unwrap();

        assert_eq!(report.status, SolveStatus::Converged);
        assert_eq!(token.total(), usize::MAX);
    }

    #[test]
    fn test_invalid_options_fail_before_indexing() {
        let (mut scene, objects) = single_marker_scene();
        let mut controller = SolveController::new(SolverOptions::new().with_tau(-1.0));
        let result = controller.solve(&mut scene, &objects, &NoProgress);

        assert!(matches!(result, Err(MatchmoveError::InvalidOptions(_))));
        assert_eq!(
            controller.state_history(),
            &[SolveState::Configuring, SolveState::Failed, SolveState::Idle]
        );
        assert_eq!(scene.commit_count(), 0);
    }

    #[test]
    fn test_unknown_attribute_fails_indexing() {
        let (mut scene, objects) = single_marker_scene();
        let objects = objects.with_attributes([AttrId(100)]);
        let result = SolveController::default().solve(&mut scene, &objects, &NoProgress);
        assert!(matches!(result, Err(MatchmoveError::Scene(_))));
    }

    #[test]
    fn test_seeding_reads_dynamic_values_per_frame() {
        let (mut scene, objects) = single_marker_scene();
        let animated = scene.add_animated_attribute("anim", [(Frame(1), 1.0), (Frame(2), 2.0)]);
        let objects = objects.with_attributes([animated]);

        let report = SolveController::default()
            .solve(&mut scene, &objects, &NoProgress)
            .unwrap();
        // The attribute drives nothing, so the engine stops without moving it.
        assert_eq!(report.parameters, vec![1.0, 2.0]);
        assert_eq!(scene.get_value(animated, Some(Frame(2))).unwrap(), 2.0);
    }
}
