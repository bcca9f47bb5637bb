//! The reprojection error function handed to the optimizer.
//!
//! Every call writes the candidate parameters into the live scene, invalidates
//! every camera's projection cache and measures each valid observation, so
//! the scene always holds the optimizer's latest trial point. Once the engine
//! returns, [`ReprojectionErrorFunction::apply_parameters`] puts the scene back
//! at the point it reported.
//!
//! # Failure channel
//!
//! The engine drives this function and does not accept errors back. Two
//! situations are reported by filling *every* output slot with NaN instead:
//!
//! - cancellation, checked before anything else so a cancelled call never
//!   touches the scene;
//! - any scene failure while writing parameters or measuring errors. The first
//!   such failure is kept and can be read back with [`ReprojectionErrorFunction::scene_error`].
//!   A write batch that fails partway is discarded, never committed later.
//!
//! The engine notices the non-finite values with its own check and stops with
//! termination reason 7.
//!
//! # Error layout
//!
//! Each observation owns three consecutive slots holding `|dx|`, `|dy|` and the
//! euclidean distance between the projected marker and bundle.

use crate::core::index::{ERRORS_PER_OBSERVATION, ErrorIndex, ErrorMapEntry, ParameterIndex};
use crate::core::scene::{ProgressSink, SceneContext};
use crate::core::{BundleId, CameraId, Frame, MarkerId, SolveObjects};
use crate::error::{SceneError, SceneResult};
use crate::optimizer::{ErrorFunction, EvaluationPhase};
use nalgebra::{Matrix4, Point2, Point3};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// An observation with its camera and bundle resolved once up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundObservation {
    marker: MarkerId,
    camera: CameraId,
    bundle: BundleId,
    frame: Frame,
}

/// Accumulated wall-clock time spent inside the callback.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvaluationTimings {
    /// Writing parameters, committing and invalidating caches
    pub parameter_write: Duration,
    /// Projecting and measuring observations
    pub error_measure: Duration,
}

/// Project a world-space point through a world-projection matrix and divide by w.
///
/// Points on the camera plane (w == 0) have no image position and come back as NaN.
pub fn project_point(matrix: &Matrix4<f64>, point: &Point3<f64>) -> Point2<f64> {
    match Point3::from_homogeneous(matrix * point.to_homogeneous()) {
        Some(projected) => Point2::new(projected.x, projected.y),
        None => Point2::new(f64::NAN, f64::NAN),
    }
}

/// The optimizer-facing callback over one solve's scene, indices and progress sink.
pub struct ReprojectionErrorFunction<'a, S: SceneContext + ?Sized, P: ProgressSink + ?Sized> {
    scene: &'a mut S,
    progress: &'a P,
    objects: &'a SolveObjects,
    parameters: &'a ParameterIndex,
    observations: Vec<BoundObservation>,
    cameras: Vec<CameraId>,
    retained: Vec<f64>,
    function_evaluations: usize,
    jacobian_evaluations: usize,
    commits: usize,
    cancelled: bool,
    scene_error: Option<SceneError>,
    timings: EvaluationTimings,
}

impl<'a, S: SceneContext + ?Sized, P: ProgressSink + ?Sized> ReprojectionErrorFunction<'a, S, P> {
    /// Bind every observation of `errors` to its marker's camera and bundle.
    ///
    /// Cameras referenced by markers but missing from `objects.cameras` are
    /// invalidated as well.
    pub fn new(
        scene: &'a mut S,
        progress: &'a P,
        objects: &'a SolveObjects,
        parameters: &'a ParameterIndex,
        errors: &ErrorIndex,
    ) -> SceneResult<Self> {
        let mut observations = Vec::with_capacity(errors.len());
        for entry in errors.iter() {
            let marker = objects.markers[entry.marker_index];
            observations.push(BoundObservation {
                marker,
                camera: scene.marker_camera(marker)?,
                bundle: scene.marker_bundle(marker)?,
                frame: objects.frames[entry.frame_index],
            });
        }

        let mut cameras = objects.cameras.clone();
        for observation in &observations {
            if !cameras.contains(&observation.camera) {
                cameras.push(observation.camera);
            }
        }

        Ok(Self {
            scene,
            progress,
            objects,
            parameters,
            observations,
            cameras,
            retained: vec![0.0; errors.error_count()],
            function_evaluations: 0,
            jacobian_evaluations: 0,
            commits: 0,
            cancelled: false,
            scene_error: None,
            timings: EvaluationTimings::default(),
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn error_count(&self) -> usize {
        self.retained.len()
    }

    /// Error triples measured by the last successful evaluation.
    pub fn retained_errors(&self) -> &[f64] {
        &self.retained
    }

    /// Mean of the retained errors, zero when there are none.
    pub fn mean_error(&self) -> f64 {
        if self.retained.is_empty() {
            return 0.0;
        }
        self.retained.iter().map(|e| e.abs()).sum::<f64>() / self.retained.len() as f64
    }

    pub fn function_evaluations(&self) -> usize {
        self.function_evaluations
    }

    pub fn jacobian_evaluations(&self) -> usize {
        self.jacobian_evaluations
    }

    /// Whether a call observed a cancellation request.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The first scene failure swallowed into the NaN channel, if any.
    pub fn scene_error(&self) -> Option<&SceneError> {
        self.scene_error.as_ref()
    }

    pub fn timings(&self) -> EvaluationTimings {
        self.timings
    }

    /// Write `params` into the scene and measure them without consulting the
    /// progress sink, returning scene failures instead of filling NaN.
    ///
    /// Leaves the scene at a point the engine did not necessarily evaluate
    /// last, such as its best accepted estimate after a cancelled solve.
    pub fn apply_parameters(&mut self, params: &[f64], errors: &mut [f64]) -> SceneResult<()> {
        self.try_evaluate(params, errors)
    }

    /// Whether any call has committed parameters to the scene.
    pub fn has_written(&self) -> bool {
        self.commits > 0
    }

    fn write_parameters(&mut self, params: &[f64]) -> SceneResult<()> {
        if let Err(err) = self.queue_parameters(params) {
            self.scene.discard_batch();
            return Err(err);
        }
        self.commits += 1;

        // Any parameter may move any camera, so every cache goes.
        for &camera in &self.cameras {
            self.scene.invalidate_cache(camera);
        }
        Ok(())
    }

    /// Queue one write per parameter and commit them as one batch.
    fn queue_parameters(&mut self, params: &[f64]) -> SceneResult<()> {
        for (entry, &value) in self.parameters.iter().zip(params) {
            let attr = self.objects.attributes[entry.attr_index];
            let frame = entry.frame_index.map(|index| self.objects.frames[index]);
            self.scene.set_value(attr, value, frame)?;
        }
        self.scene.commit_batch()
    }

    fn measure_errors(&mut self, errors: &mut [f64]) -> SceneResult<()> {
        for (position, observation) in self.observations.iter().enumerate() {
            let matrix = self
                .scene
                .camera_world_projection_matrix(observation.camera, observation.frame)?;
            let marker = project_point(
                &matrix,
                &self.scene.marker_position(observation.marker, observation.frame)?,
            );
            let bundle = project_point(
                &matrix,
                &self.scene.bundle_position(observation.bundle, observation.frame)?,
            );

            let dx = (marker.x - bundle.x).abs();
            let dy = (marker.y - bundle.y).abs();
            let distance = nalgebra::distance(&bundle, &marker);

            let slot = ErrorMapEntry::first_slot(position);
            errors[slot..slot + ERRORS_PER_OBSERVATION].copy_from_slice(&[dx, dy, distance]);
        }
        self.retained.copy_from_slice(errors);
        Ok(())
    }

    fn try_evaluate(&mut self, params: &[f64], errors: &mut [f64]) -> SceneResult<()> {
        let start = Instant::now();
        self.write_parameters(params)?;
        let written = Instant::now();
        self.timings.parameter_write += written - start;

        let result = self.measure_errors(errors);
        self.timings.error_measure += written.elapsed();
        result
    }
}

impl<S: SceneContext + ?Sized, P: ProgressSink + ?Sized> ErrorFunction
    for ReprojectionErrorFunction<'_, S, P>
{
    fn evaluate(&mut self, params: &[f64], errors: &mut [f64], phase: EvaluationPhase) {
        self.progress
            .advance(self.function_evaluations + self.jacobian_evaluations);
        match phase {
            EvaluationPhase::Nominal => {
                self.function_evaluations += 1;
                debug!("Solve {}", self.function_evaluations);
            }
            EvaluationPhase::Jacobian => {
                self.jacobian_evaluations += 1;
                trace!("Solve Jacobian {}", self.jacobian_evaluations);
            }
        }

        if self.progress.is_cancel_requested() {
            if !self.cancelled {
                warn!("Cancellation requested, stopping the solve");
            }
            self.cancelled = true;
            errors.fill(f64::NAN);
            return;
        }

        if let Err(err) = self.try_evaluate(params, errors) {
            if self.scene_error.is_none() {
                warn!("Scene evaluation failed during optimization: {err}");
                self.scene_error = Some(err);
            }
            errors.fill(f64::NAN);
        }
    }
}
