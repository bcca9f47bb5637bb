//! Core solve components for the matchmove-solver library
//!
//! This module contains the numerical heart of a solve:
//! - Identifiers for scene objects and the frame type
//! - Collaborator traits the core reads and writes the scene through
//! - Parameter and error indexing
//! - The reprojection error function handed to the optimizer

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod index;
pub mod reprojection;
pub mod scene;

pub use index::{ErrorIndex, ErrorMapEntry, ParameterIndex, ParameterMapEntry};
pub use reprojection::{EvaluationTimings, ReprojectionErrorFunction, project_point};
pub use scene::{
    AttributeStore, CancellationToken, NoProgress, ProgressSink, SceneContext, SceneEvaluator,
};

/// A point in the time domain used to sample animated attributes and markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(pub i32);

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! scene_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub usize);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

scene_id!(
    /// Identity of a solvable scalar attribute
    AttrId,
    "attr"
);
scene_id!(
    /// Identity of a camera
    CameraId,
    "camera"
);
scene_id!(
    /// Identity of a 2D marker
    MarkerId,
    "marker"
);
scene_id!(
    /// Identity of a 3D bundle
    BundleId,
    "bundle"
);

/// The caller-supplied objects taking part in one solve.
///
/// Every list is used in the order given; indices stored in the parameter and
/// error maps refer to positions in these lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveObjects {
    pub cameras: Vec<CameraId>,
    pub markers: Vec<MarkerId>,
    pub bundles: Vec<BundleId>,
    pub attributes: Vec<AttrId>,
    pub frames: Vec<Frame>,
}

impl SolveObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cameras(mut self, cameras: impl IntoIterator<Item = CameraId>) -> Self {
        self.cameras = cameras.into_iter().collect();
        self
    }

    pub fn with_markers(mut self, markers: impl IntoIterator<Item = MarkerId>) -> Self {
        self.markers = markers.into_iter().collect();
        self
    }

    pub fn with_bundles(mut self, bundles: impl IntoIterator<Item = BundleId>) -> Self {
        self.bundles = bundles.into_iter().collect();
        self
    }

    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = AttrId>) -> Self {
        self.attributes = attributes.into_iter().collect();
        self
    }

    pub fn with_frames(mut self, frames: impl IntoIterator<Item = Frame>) -> Self {
        self.frames = frames.into_iter().collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(AttrId(3).to_string(), "attr#3");
        assert_eq!(MarkerId(0).to_string(), "marker#0");
        assert_eq!(Frame(-2).to_string(), "-2");
    }

    #[test]
    fn test_solve_objects_builder_keeps_order() {
        let objects = SolveObjects::new()
            .with_attributes([AttrId(2), AttrId(0)])
            .with_frames([Frame(5), Frame(1)]);
        assert_eq!(objects.attributes, vec![AttrId(2), AttrId(0)]);
        assert_eq!(objects.frames, vec![Frame(5), Frame(1)]);
        assert!(objects.markers.is_empty());
    }
}
