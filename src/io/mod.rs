//! JSON scene files.
//!
//! A scene file describes an in-memory scene (attributes, cameras, bundles and
//! markers) together with the solve to run on it. Objects refer to each other
//! by name; attribute names of cameras and bundles are `{object}.{channel}`,
//! for example `cam.translateX` or `bundle1.translateZ`. A camera with a `lens`
//! also has `distortion`, `anamorphicSqueeze`, `curvatureX`, `curvatureY` and
//! `quarticDistortion` channels.

use crate::core::{AttrId, Frame, SolveObjects};
use crate::error::{MatchmoveError, SceneError};
use crate::scene::camera::{ClassicDistortion, DEFAULT_FAR_CLIP, DEFAULT_NEAR_CLIP};
use crate::scene::{AttributeValue, Camera, MemoryScene};
use crate::solver::SolverOptions;
use nalgebra::{Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while reading or applying a scene file
#[derive(Error, Debug)]
pub enum SceneFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown {kind} '{name}'")]
    UnknownReference { kind: &'static str, name: String },

    #[error("Duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Unknown channel '{channel}' on '{object}'")]
    UnknownChannel { object: String, channel: String },

    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),
}

impl From<SceneFileError> for MatchmoveError {
    fn from(err: SceneFileError) -> Self {
        match err {
            SceneFileError::Io(err) => err.into(),
            SceneFileError::Json(err) => err.into(),
            SceneFileError::Scene(err) => err.into(),
            other => MatchmoveError::Parse(other.to_string()),
        }
    }
}

/// Keys of an animated channel as `[frame, value]` pairs.
pub type Keys = Vec<(Frame, f64)>;

/// A free-standing scalar attribute. Non-empty `keys` make it animated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub name: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Keys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub name: String,
    #[serde(default)]
    pub translate: [f64; 3],
    /// XYZ euler rotation in degrees
    #[serde(default)]
    pub rotate: [f64; 3],
    pub focal_length: f64,
    /// Film back width and height in the focal length's units
    pub film_back: (f64, f64),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_clip: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub far_clip: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens: Option<ClassicDistortion>,
    /// Animated channels by name, e.g. `translateX` or `focalLength`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub animation: BTreeMap<String, Keys>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub name: String,
    pub position: [f64; 3],
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub animation: BTreeMap<String, Keys>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub name: String,
    pub camera: String,
    pub bundle: String,
    /// Observations as `[frame, x, y]` in normalized device coordinates
    #[serde(default)]
    pub positions: Vec<(Frame, f64, f64)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<Frame>,
}

/// What to solve. Omitted marker and camera lists mean "all of them".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveRecord {
    pub attributes: Vec<String>,
    pub frames: Vec<Frame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cameras: Option<Vec<String>>,
    #[serde(default)]
    pub options: SolverOptions,
}

/// A complete scene file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneFile {
    #[serde(default = "default_frame")]
    pub current_frame: Frame,
    #[serde(default)]
    pub attributes: Vec<AttributeRecord>,
    #[serde(default)]
    pub cameras: Vec<CameraRecord>,
    #[serde(default)]
    pub bundles: Vec<BundleRecord>,
    #[serde(default)]
    pub markers: Vec<MarkerRecord>,
    #[serde(default)]
    pub solve: SolveRecord,
}

fn default_frame() -> Frame {
    Frame(1)
}

const CAMERA_CHANNELS: [&str; 7] = [
    "translateX",
    "translateY",
    "translateZ",
    "rotateX",
    "rotateY",
    "rotateZ",
    "focalLength",
];

const LENS_CHANNELS: [&str; 5] = [
    "distortion",
    "anamorphicSqueeze",
    "curvatureX",
    "curvatureY",
    "quarticDistortion",
];

const BUNDLE_CHANNELS: [&str; 3] = ["translateX", "translateY", "translateZ"];

/// Channel names of a camera and the attributes behind them.
fn camera_channels(camera: &Camera) -> (Vec<&'static str>, Vec<AttrId>) {
    let mut names = CAMERA_CHANNELS.to_vec();
    let mut attributes = vec![
        camera.translate[0],
        camera.translate[1],
        camera.translate[2],
        camera.rotate[0],
        camera.rotate[1],
        camera.rotate[2],
        camera.focal_length,
    ];
    if let Some(lens) = &camera.lens {
        names.extend(LENS_CHANNELS);
        attributes.extend(lens.attributes());
    }
    (names, attributes)
}

fn unknown(kind: &'static str, name: &str) -> SceneFileError {
    SceneFileError::UnknownReference {
        kind,
        name: name.to_string(),
    }
}

/// Turn the named channels of an object into animated attributes.
fn apply_animation(
    scene: &mut MemoryScene,
    object: &str,
    channels: &[&str],
    attributes: &[AttrId],
    animation: &BTreeMap<String, Keys>,
) -> Result<(), SceneFileError> {
    for (channel, keys) in animation {
        let position = channels
            .iter()
            .position(|c| *c == channel.as_str())
            .ok_or_else(|| SceneFileError::UnknownChannel {
                object: object.to_string(),
                channel: channel.clone(),
            })?;
        scene.animate_attribute(attributes[position], keys.iter().copied())?;
    }
    Ok(())
}

/// Read back channel values: static values into `values`, animated ones into `animation`.
fn read_channels(
    scene: &MemoryScene,
    channels: &[&str],
    attributes: &[AttrId],
    values: &mut [f64],
    animation: &mut BTreeMap<String, Keys>,
) {
    animation.clear();
    for ((channel, attr), value) in channels.iter().zip(attributes).zip(values.iter_mut()) {
        match scene.attribute(*attr).map(|a| &a.value) {
            Some(AttributeValue::Static(v)) => *value = *v,
            Some(AttributeValue::Animated(keys)) => {
                animation.insert(
                    channel.to_string(),
                    keys.iter().map(|(&f, &v)| (f, v)).collect(),
                );
            }
            None => {}
        }
    }
}

impl SceneFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SceneFileError> {
        let content = fs::read_to_string(path.as_ref())?;
        let file = Self::from_json(&content)?;
        info!(
            "Loaded scene file {} with {} cameras, {} bundles and {} markers",
            path.as_ref().display(),
            file.cameras.len(),
            file.bundles.len(),
            file.markers.len()
        );
        Ok(file)
    }

    pub fn from_json(content: &str) -> Result<Self, SceneFileError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String, SceneFileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), SceneFileError> {
        fs::write(path.as_ref(), self.to_json()?)?;
        debug!("Wrote scene file {}", path.as_ref().display());
        Ok(())
    }

    /// Build the in-memory scene described by this file.
    pub fn build_scene(&self) -> Result<MemoryScene, SceneFileError> {
        let mut scene = MemoryScene::new();
        scene.set_current_frame(self.current_frame);

        for record in &self.attributes {
            if scene.attribute_by_name(&record.name).is_some() {
                return Err(SceneFileError::DuplicateName {
                    kind: "attribute",
                    name: record.name.clone(),
                });
            }
            if record.keys.is_empty() {
                scene.add_static_attribute(record.name.as_str(), record.value);
            } else {
                scene.add_animated_attribute(record.name.as_str(), record.keys.iter().copied());
            }
        }

        for record in &self.cameras {
            if scene.camera_by_name(&record.name).is_some() {
                return Err(SceneFileError::DuplicateName {
                    kind: "camera",
                    name: record.name.clone(),
                });
            }
            let id = scene.add_camera(
                &record.name,
                Vector3::from(record.translate),
                Vector3::from(record.rotate),
                record.focal_length,
                record.film_back,
            );
            scene.set_camera_clip_planes(
                id,
                record.near_clip.unwrap_or(DEFAULT_NEAR_CLIP),
                record.far_clip.unwrap_or(DEFAULT_FAR_CLIP),
            )?;
            if let Some(lens) = record.lens {
                scene.add_lens(id, lens)?;
            }
            let (channels, attributes) = scene
                .camera(id)
                .map(camera_channels)
                .ok_or_else(|| unknown("camera", &record.name))?;
            apply_animation(
                &mut scene,
                &record.name,
                &channels,
                &attributes,
                &record.animation,
            )?;
        }

        for record in &self.bundles {
            if scene.bundle_by_name(&record.name).is_some() {
                return Err(SceneFileError::DuplicateName {
                    kind: "bundle",
                    name: record.name.clone(),
                });
            }
            let id = scene.add_bundle(&record.name, Point3::from(record.position));
            let attributes = scene
                .bundle(id)
                .map(|bundle| bundle.translate)
                .ok_or_else(|| unknown("bundle", &record.name))?;
            apply_animation(
                &mut scene,
                &record.name,
                &BUNDLE_CHANNELS,
                &attributes,
                &record.animation,
            )?;
        }

        for record in &self.markers {
            if scene.marker_by_name(&record.name).is_some() {
                return Err(SceneFileError::DuplicateName {
                    kind: "marker",
                    name: record.name.clone(),
                });
            }
            let camera = scene
                .camera_by_name(&record.camera)
                .ok_or_else(|| unknown("camera", &record.camera))?;
            let bundle = scene
                .bundle_by_name(&record.bundle)
                .ok_or_else(|| unknown("bundle", &record.bundle))?;
            let marker = scene.add_marker(&record.name, camera, bundle);
            for &(frame, x, y) in &record.positions {
                scene.set_marker_position(marker, frame, Point2::new(x, y))?;
            }
            for &frame in &record.disabled {
                scene.disable_marker(marker, frame)?;
            }
        }

        Ok(scene)
    }

    /// Resolve the solve section against a scene built from this file.
    pub fn solve_objects(&self, scene: &MemoryScene) -> Result<SolveObjects, SceneFileError> {
        let attributes = self
            .solve
            .attributes
            .iter()
            .map(|name| {
                scene
                    .attribute_by_name(name)
                    .ok_or_else(|| unknown("attribute", name))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let markers = match &self.solve.markers {
            Some(names) => names
                .iter()
                .map(|name| scene.marker_by_name(name).ok_or_else(|| unknown("marker", name)))
                .collect::<Result<Vec<_>, _>>()?,
            None => scene.markers().map(|(id, _)| id).collect(),
        };

        let mut bundles = Vec::new();
        let mut marker_cameras = Vec::new();
        for &marker in &markers {
            if let Some(m) = scene.marker(marker) {
                if !bundles.contains(&m.bundle) {
                    bundles.push(m.bundle);
                }
                if !marker_cameras.contains(&m.camera) {
                    marker_cameras.push(m.camera);
                }
            }
        }

        let cameras = match &self.solve.cameras {
            Some(names) => names
                .iter()
                .map(|name| scene.camera_by_name(name).ok_or_else(|| unknown("camera", name)))
                .collect::<Result<Vec<_>, _>>()?,
            None => marker_cameras,
        };

        Ok(SolveObjects::new()
            .with_cameras(cameras)
            .with_markers(markers)
            .with_bundles(bundles)
            .with_attributes(attributes)
            .with_frames(self.solve.frames.iter().copied()))
    }

    /// Copy the scene's current attribute values back into this file.
    pub fn update_from_scene(&mut self, scene: &MemoryScene) {
        for record in &mut self.attributes {
            let value = scene
                .attribute_by_name(&record.name)
                .and_then(|id| scene.attribute(id));
            match value.map(|a| &a.value) {
                Some(AttributeValue::Static(v)) => record.value = *v,
                Some(AttributeValue::Animated(keys)) => {
                    record.keys = keys.iter().map(|(&f, &v)| (f, v)).collect();
                }
                None => {}
            }
        }

        for record in &mut self.cameras {
            let Some(camera) = scene.camera_by_name(&record.name).and_then(|id| scene.camera(id))
            else {
                continue;
            };
            let (channels, attributes) = camera_channels(camera);
            let lens = record.lens.unwrap_or_default();
            let mut values = [
                record.translate[0],
                record.translate[1],
                record.translate[2],
                record.rotate[0],
                record.rotate[1],
                record.rotate[2],
                record.focal_length,
                lens.distortion,
                lens.anamorphic_squeeze,
                lens.curvature_x,
                lens.curvature_y,
                lens.quartic_distortion,
            ];
            read_channels(
                scene,
                &channels,
                &attributes,
                &mut values,
                &mut record.animation,
            );
            record.translate = [values[0], values[1], values[2]];
            record.rotate = [values[3], values[4], values[5]];
            record.focal_length = values[6];
            if camera.lens.is_some() {
                record.lens = Some(ClassicDistortion {
                    distortion: values[7],
                    anamorphic_squeeze: values[8],
                    curvature_x: values[9],
                    curvature_y: values[10],
                    quartic_distortion: values[11],
                });
            }
        }

        for record in &mut self.bundles {
            let Some(bundle) = scene.bundle_by_name(&record.name).and_then(|id| scene.bundle(id))
            else {
                continue;
            };
            let attributes = bundle.translate;
            read_channels(
                scene,
                &BUNDLE_CHANNELS,
                &attributes,
                &mut record.position,
                &mut record.animation,
            );
        }
    }
}
