//! Collaborator contracts the solver core reads and writes the scene through.
//!
//! The core never owns scene data. A solve borrows one [`SceneContext`] mutably
//! for its whole duration, so no other reader can observe a half-written trial
//! state while the optimizer is running.

use crate::core::{AttrId, BundleId, CameraId, Frame, MarkerId};
use crate::error::SceneResult;
use nalgebra::{Matrix4, Point3};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Storage of solvable scalar attributes.
///
/// A `frame` of `None` addresses the current frame, which is how static
/// attributes (no time dependency) are read and written.
pub trait AttributeStore {
    /// Whether the attribute is animated over the solve's frame range.
    fn is_dynamic(&self, attr: AttrId) -> SceneResult<bool>;

    /// Read the committed value of an attribute.
    fn get_value(&self, attr: AttrId, frame: Option<Frame>) -> SceneResult<f64>;

    /// Queue a value for the next [`commit_batch`](Self::commit_batch).
    fn set_value(&mut self, attr: AttrId, value: f64, frame: Option<Frame>) -> SceneResult<()>;

    /// Apply every queued write as one update.
    fn commit_batch(&mut self) -> SceneResult<()>;

    /// Drop every queued write without applying it.
    fn discard_batch(&mut self);
}

/// Read access to markers, bundles and cameras as evaluated at a frame.
pub trait SceneEvaluator {
    /// Whether the marker holds a usable observation at `frame`.
    fn marker_valid(&self, marker: MarkerId, frame: Frame) -> SceneResult<bool>;

    fn marker_camera(&self, marker: MarkerId) -> SceneResult<CameraId>;

    fn marker_bundle(&self, marker: MarkerId) -> SceneResult<BundleId>;

    /// The marker's observed 2D position, placed on its camera's film plane in
    /// world space. Projecting it through the camera's world-projection matrix
    /// yields the observed image coordinate.
    fn marker_position(&self, marker: MarkerId, frame: Frame) -> SceneResult<Point3<f64>>;

    /// World-space position of the bundle.
    fn bundle_position(&self, bundle: BundleId, frame: Frame) -> SceneResult<Point3<f64>>;

    /// World-to-image projection matrix of the camera, served from a per-frame cache.
    fn camera_world_projection_matrix(
        &mut self,
        camera: CameraId,
        frame: Frame,
    ) -> SceneResult<Matrix4<f64>>;

    /// Drop every cached world-projection matrix of the camera.
    fn invalidate_cache(&mut self, camera: CameraId);
}

/// Everything a solve needs from the scene, passed around as one handle.
pub trait SceneContext: AttributeStore + SceneEvaluator {}

impl<T: AttributeStore + SceneEvaluator> SceneContext for T {}

/// Progress reporting and cooperative cancellation.
pub trait ProgressSink {
    fn set_total(&self, total: usize);

    fn advance(&self, progress: usize);

    fn is_cancel_requested(&self) -> bool;
}

/// A sink that ignores progress and never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn set_total(&self, _total: usize) {}

    fn advance(&self, _progress: usize) {}

    fn is_cancel_requested(&self) -> bool {
        false
    }
}

/// Thread-safe progress sink whose cancellation flag can be raised from any
/// clone, for example from a UI thread while a solve is running.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    total: Arc<AtomicUsize>,
    progress: Arc<AtomicUsize>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.progress.store(0, Ordering::SeqCst);
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }
}

impl ProgressSink for CancellationToken {
    fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn advance(&self, progress: usize) {
        self.progress.store(progress, Ordering::Relaxed);
    }

    fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancel_requested());

        token.cancel();
        assert!(observer.is_cancel_requested());

        observer.reset();
        assert!(!token.is_cancel_requested());
    }

    #[test]
    fn test_cancellation_token_tracks_progress() {
        let token = CancellationToken::new();
        token.set_total(20);
        token.advance(7);
        assert_eq!(token.total(), 20);
        assert_eq!(token.progress(), 7);
    }

    #[test]
    fn test_no_progress_never_cancels() {
        let sink = NoProgress;
        sink.set_total(3);
        sink.advance(1);
        assert!(!sink.is_cancel_requested());
    }
}
