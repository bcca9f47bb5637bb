//! Shared utilities for solve integration tests
//!
//! Scenes are built from a deterministic point cloud seen by one camera that
//! slides along X over the solve frames, with every marker placed exactly on
//! the projection of its bundle.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use matchmove_solver::core::{
    AttrId, AttributeStore, BundleId, CameraId, Frame, MarkerId, SolveObjects,
};
use matchmove_solver::scene::MemoryScene;
use matchmove_solver::SolverOptions;
use nalgebra::{Point3, Vector3};

/// A generated scene and the handles tests need to drive it.
pub struct TestScene {
    pub scene: MemoryScene,
    pub camera: CameraId,
    pub bundles: Vec<BundleId>,
    pub markers: Vec<MarkerId>,
    pub frames: Vec<Frame>,
    pub points: Vec<Point3<f64>>,
}

impl TestScene {
    /// Solve objects covering every marker, bundle and frame, solving nothing yet.
    pub fn objects(&self) -> SolveObjects {
        SolveObjects::new()
            .with_cameras([self.camera])
            .with_markers(self.markers.iter().copied())
            .with_bundles(self.bundles.iter().copied())
            .with_frames(self.frames.iter().copied())
    }

    /// Translate attributes of every bundle, three per bundle.
    pub fn bundle_attributes(&self) -> Vec<AttrId> {
        self.bundles
            .iter()
            .flat_map(|&bundle| self.scene.bundle(bundle).unwrap().translate)
            .collect()
    }

    pub fn camera_translate_x(&self) -> AttrId {
        self.scene.camera(self.camera).unwrap().translate[0]
    }

    /// Add `offset` to the committed value of each attribute at `frame`.
    pub fn perturb(&mut self, attributes: &[AttrId], offset: f64, frame: Option<Frame>) {
        for &attr in attributes {
            let value = self.scene.get_value(attr, frame).unwrap();
            self.scene.set_value(attr, value + offset, frame).unwrap();
        }
        self.scene.commit_batch().unwrap();
    }
}

/// Generate N well-spread points around the origin
pub fn generate_points(n: usize) -> Vec<Point3<f64>> {
    (0..n)
        .map(|i| {
            let angle = i as f64 * 2.4;
            let radius = 0.5 + 1.5 * ((i as f64 * 0.37) % 1.0);
            let z = -1.0 + 2.0 * ((i as f64 * 0.61) % 1.0);
            Point3::new(radius * angle.cos(), radius * angle.sin(), z)
        })
        .collect()
}

/// Camera X position on frame `frame` of the generated sequence.
pub fn camera_x(frame: Frame) -> f64 {
    f64::from(frame.0 - 2)
}

/// Build a scene of `n` bundles seen from a camera moving along X on frames 1..=`frame_count`.
pub fn build_scene(n: usize, frame_count: i32) -> TestScene {
    let mut scene = MemoryScene::new();
    let frames: Vec<Frame> = (1..=frame_count).map(Frame).collect();

    let camera = scene.add_camera(
        "cam",
        Vector3::new(0.0, 0.0, 10.0),
        Vector3::zeros(),
        35.0,
        (36.0, 24.0),
    );
    let translate_x = scene.camera(camera).unwrap().translate[0];
    scene
        .animate_attribute(translate_x, frames.iter().map(|&f| (f, camera_x(f))))
        .unwrap();

    let points = generate_points(n);
    let mut bundles = Vec::with_capacity(n);
    let mut markers = Vec::with_capacity(n);
    for (i, point) in points.iter().enumerate() {
        let bundle = scene.add_bundle(&format!("bundle{i}"), *point);
        let marker = scene.add_marker(&format!("marker{i}"), camera, bundle);
        for &frame in &frames {
            scene.place_marker_on_bundle(marker, frame).unwrap();
        }
        bundles.push(bundle);
        markers.push(marker);
    }

    TestScene {
        scene,
        camera,
        bundles,
        markers,
        frames,
        points,
    }
}

/// Options tight enough that a solve stops at the true solution, not near it.
pub fn tight_options() -> SolverOptions {
    SolverOptions::new()
        .with_max_iterations(100)
        .with_thresholds(1e-15, 1e-15, 1e-24)
        .with_delta(-1e-6)
}
