//! An in-memory scene implementing the solver's collaborator traits.
//!
//! Attributes are either static scalars or animated key lists (linearly
//! interpolated, clamped at both ends). Cameras, bundles and markers refer to
//! attributes by id, so any channel can be handed to a solve as an unknown.

use crate::core::reprojection::project_point;
use crate::core::scene::{AttributeStore, SceneEvaluator};
use crate::core::{AttrId, BundleId, CameraId, Frame, MarkerId};
use crate::error::{SceneError, SceneResult};
use crate::scene::camera::{
    ClassicDistortion, DEFAULT_FAR_CLIP, DEFAULT_NEAR_CLIP, PinholeModel, transform_from_trs,
    world_projection_matrix,
};
use nalgebra::{Isometry3, Matrix4, Point2, Point3, Vector3};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

/// Storage of one attribute's value(s).
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Static(f64),
    Animated(BTreeMap<Frame, f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    fn sample(&self, id: AttrId, frame: Frame) -> SceneResult<f64> {
        let keys = match &self.value {
            AttributeValue::Static(value) => return Ok(*value),
            AttributeValue::Animated(keys) => keys,
        };

        let before = keys.range(..=frame).next_back();
        let after = keys.range(frame..).next();
        match (before, after) {
            (Some((&f0, &v0)), Some((&f1, &v1))) if f1 != f0 => {
                let t = f64::from(frame.0 - f0.0) / f64::from(f1.0 - f0.0);
                Ok(v0 + t * (v1 - v0))
            }
            (Some((_, &v)), _) | (None, Some((_, &v))) => Ok(v),
            (None, None) => Err(SceneError::NoKeyframes { attr: id, frame }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub name: String,
    pub translate: [AttrId; 3],
    /// XYZ-order euler rotation in degrees
    pub rotate: [AttrId; 3],
    pub focal_length: AttrId,
    /// Film back width and height, same units as the focal length
    pub film_back: (f64, f64),
    pub near_clip: f64,
    pub far_clip: f64,
    pub lens: Option<LensChannels>,
}

/// Attributes holding a camera's lens coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LensChannels {
    pub distortion: AttrId,
    pub anamorphic_squeeze: AttrId,
    pub curvature_x: AttrId,
    pub curvature_y: AttrId,
    pub quartic_distortion: AttrId,
}

impl LensChannels {
    pub fn attributes(&self) -> [AttrId; 5] {
        [
            self.distortion,
            self.anamorphic_squeeze,
            self.curvature_x,
            self.curvature_y,
            self.quartic_distortion,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub name: String,
    pub translate: [AttrId; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub name: String,
    pub camera: CameraId,
    pub bundle: BundleId,
    /// Observed positions in normalized device coordinates
    pub observations: BTreeMap<Frame, Point2<f64>>,
    /// Frames on which the marker is switched off
    pub disabled: BTreeSet<Frame>,
}

/// Projection cache bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub invalidations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingWrite {
    attr: AttrId,
    value: f64,
    frame: Option<Frame>,
}

/// Scene storage backing a solve in memory.
#[derive(Debug, Clone)]
pub struct MemoryScene {
    current_frame: Frame,
    attributes: Vec<Attribute>,
    cameras: Vec<Camera>,
    bundles: Vec<Bundle>,
    markers: Vec<Marker>,
    pending: Vec<PendingWrite>,
    projection_cache: HashMap<(CameraId, Frame), Matrix4<f64>>,
    cache_stats: CacheStats,
    commits: usize,
}

impl Default for MemoryScene {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryScene {
    pub fn new() -> Self {
        Self {
            current_frame: Frame(1),
            attributes: Vec::new(),
            cameras: Vec::new(),
            bundles: Vec::new(),
            markers: Vec::new(),
            pending: Vec::new(),
            projection_cache: HashMap::new(),
            cache_stats: CacheStats::default(),
            commits: 0,
        }
    }

    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub fn set_current_frame(&mut self, frame: Frame) {
        self.current_frame = frame;
    }

    pub fn add_static_attribute(&mut self, name: impl Into<String>, value: f64) -> AttrId {
        self.push_attribute(name.into(), AttributeValue::Static(value))
    }

    pub fn add_animated_attribute(
        &mut self,
        name: impl Into<String>,
        keys: impl IntoIterator<Item = (Frame, f64)>,
    ) -> AttrId {
        self.push_attribute(name.into(), AttributeValue::Animated(keys.into_iter().collect()))
    }

    fn push_attribute(&mut self, name: String, value: AttributeValue) -> AttrId {
        self.attributes.push(Attribute { name, value });
        AttrId(self.attributes.len() - 1)
    }

    /// Turn an attribute into an animated one holding `keys`.
    pub fn animate_attribute(
        &mut self,
        attr: AttrId,
        keys: impl IntoIterator<Item = (Frame, f64)>,
    ) -> SceneResult<()> {
        let attribute = self
            .attributes
            .get_mut(attr.0)
            .ok_or(SceneError::UnknownAttribute(attr))?;
        attribute.value = AttributeValue::Animated(keys.into_iter().collect());
        Ok(())
    }

    /// Add a camera whose channels are new static attributes named `{name}.{channel}`.
    pub fn add_camera(
        &mut self,
        name: &str,
        translate: Vector3<f64>,
        rotate_degrees: Vector3<f64>,
        focal_length: f64,
        film_back: (f64, f64),
    ) -> CameraId {
        let translate = self.add_vector_attributes(name, "translate", &translate);
        let rotate = self.add_vector_attributes(name, "rotate", &rotate_degrees);
        let focal_length = self.add_static_attribute(format!("{name}.focalLength"), focal_length);
        self.add_camera_with_attributes(Camera {
            name: name.to_string(),
            translate,
            rotate,
            focal_length,
            film_back,
            near_clip: DEFAULT_NEAR_CLIP,
            far_clip: DEFAULT_FAR_CLIP,
            lens: None,
        })
    }

    /// Give the camera a lens whose coefficients are new static attributes
    /// named `{camera}.distortion`, `{camera}.anamorphicSqueeze` and so on.
    pub fn add_lens(
        &mut self,
        camera: CameraId,
        lens: ClassicDistortion,
    ) -> SceneResult<LensChannels> {
        let name = self.camera_ref(camera)?.name.clone();
        let channels = LensChannels {
            distortion: self.add_static_attribute(format!("{name}.distortion"), lens.distortion),
            anamorphic_squeeze: self.add_static_attribute(
                format!("{name}.anamorphicSqueeze"),
                lens.anamorphic_squeeze,
            ),
            curvature_x: self.add_static_attribute(format!("{name}.curvatureX"), lens.curvature_x),
            curvature_y: self.add_static_attribute(format!("{name}.curvatureY"), lens.curvature_y),
            quartic_distortion: self.add_static_attribute(
                format!("{name}.quarticDistortion"),
                lens.quartic_distortion,
            ),
        };
        if let Some(entry) = self.cameras.get_mut(camera.0) {
            entry.lens = Some(channels);
        }
        Ok(channels)
    }

    pub fn set_camera_clip_planes(
        &mut self,
        camera: CameraId,
        near: f64,
        far: f64,
    ) -> SceneResult<()> {
        let entry = self
            .cameras
            .get_mut(camera.0)
            .ok_or(SceneError::UnknownCamera(camera))?;
        entry.near_clip = near;
        entry.far_clip = far;
        self.projection_cache.retain(|(cached, _), _| *cached != camera);
        Ok(())
    }

    pub fn add_camera_with_attributes(&mut self, camera: Camera) -> CameraId {
        self.cameras.push(camera);
        CameraId(self.cameras.len() - 1)
    }

    /// Add a bundle whose position channels are new static attributes.
    pub fn add_bundle(&mut self, name: &str, position: Point3<f64>) -> BundleId {
        let translate = self.add_vector_attributes(name, "translate", &position.coords);
        self.add_bundle_with_attributes(Bundle {
            name: name.to_string(),
            translate,
        })
    }

    pub fn add_bundle_with_attributes(&mut self, bundle: Bundle) -> BundleId {
        self.bundles.push(bundle);
        BundleId(self.bundles.len() - 1)
    }

    fn add_vector_attributes(
        &mut self,
        name: &str,
        channel: &str,
        value: &Vector3<f64>,
    ) -> [AttrId; 3] {
        [
            self.add_static_attribute(format!("{name}.{channel}X"), value.x),
            self.add_static_attribute(format!("{name}.{channel}Y"), value.y),
            self.add_static_attribute(format!("{name}.{channel}Z"), value.z),
        ]
    }

    /// Add a marker with no observations yet.
    pub fn add_marker(&mut self, name: &str, camera: CameraId, bundle: BundleId) -> MarkerId {
        self.markers.push(Marker {
            name: name.to_string(),
            camera,
            bundle,
            observations: BTreeMap::new(),
            disabled: BTreeSet::new(),
        });
        MarkerId(self.markers.len() - 1)
    }

    pub fn set_marker_position(
        &mut self,
        marker: MarkerId,
        frame: Frame,
        position: Point2<f64>,
    ) -> SceneResult<()> {
        self.marker_mut(marker)?.observations.insert(frame, position);
        Ok(())
    }

    pub fn disable_marker(&mut self, marker: MarkerId, frame: Frame) -> SceneResult<()> {
        self.marker_mut(marker)?.disabled.insert(frame);
        Ok(())
    }

    /// Set the marker's observation to the current projection of its bundle,
    /// distorted by the camera's lens.
    pub fn place_marker_on_bundle(&mut self, marker: MarkerId, frame: Frame) -> SceneResult<()> {
        let (camera, bundle) = {
            let m = self.marker_ref(marker)?;
            (m.camera, m.bundle)
        };
        let position = self.bundle_position(bundle, frame)?;
        let image = self.project(camera, &position, frame)?;
        let observed = self.camera_model(camera, frame)?.distort_image(&image);
        self.set_marker_position(marker, frame, observed)
    }

    /// Project a world-space point through the camera without using the cache.
    pub fn project(
        &self,
        camera: CameraId,
        point: &Point3<f64>,
        frame: Frame,
    ) -> SceneResult<Point2<f64>> {
        let matrix = self.compute_world_projection(camera, frame)?;
        Ok(project_point(&matrix, point))
    }

    pub fn attribute(&self, attr: AttrId) -> Option<&Attribute> {
        self.attributes.get(attr.0)
    }

    pub fn camera(&self, camera: CameraId) -> Option<&Camera> {
        self.cameras.get(camera.0)
    }

    pub fn bundle(&self, bundle: BundleId) -> Option<&Bundle> {
        self.bundles.get(bundle.0)
    }

    pub fn marker(&self, marker: MarkerId) -> Option<&Marker> {
        self.markers.get(marker.0)
    }

    pub fn attribute_by_name(&self, name: &str) -> Option<AttrId> {
        self.attributes.iter().position(|a| a.name == name).map(AttrId)
    }

    pub fn camera_by_name(&self, name: &str) -> Option<CameraId> {
        self.cameras.iter().position(|c| c.name == name).map(CameraId)
    }

    pub fn bundle_by_name(&self, name: &str) -> Option<BundleId> {
        self.bundles.iter().position(|b| b.name == name).map(BundleId)
    }

    pub fn marker_by_name(&self, name: &str) -> Option<MarkerId> {
        self.markers.iter().position(|m| m.name == name).map(MarkerId)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (AttrId, &Attribute)> {
        self.attributes.iter().enumerate().map(|(i, a)| (AttrId(i), a))
    }

    pub fn cameras(&self) -> impl Iterator<Item = (CameraId, &Camera)> {
        self.cameras.iter().enumerate().map(|(i, c)| (CameraId(i), c))
    }

    pub fn bundles(&self) -> impl Iterator<Item = (BundleId, &Bundle)> {
        self.bundles.iter().enumerate().map(|(i, b)| (BundleId(i), b))
    }

    pub fn markers(&self) -> impl Iterator<Item = (MarkerId, &Marker)> {
        self.markers.iter().enumerate().map(|(i, m)| (MarkerId(i), m))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache_stats
    }

    /// Number of committed write batches.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Number of queued, uncommitted writes.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    fn attribute_ref(&self, attr: AttrId) -> SceneResult<&Attribute> {
        self.attributes.get(attr.0).ok_or(SceneError::UnknownAttribute(attr))
    }

    fn camera_ref(&self, camera: CameraId) -> SceneResult<&Camera> {
        self.cameras.get(camera.0).ok_or(SceneError::UnknownCamera(camera))
    }

    fn bundle_ref(&self, bundle: BundleId) -> SceneResult<&Bundle> {
        self.bundles.get(bundle.0).ok_or(SceneError::UnknownBundle(bundle))
    }

    fn marker_ref(&self, marker: MarkerId) -> SceneResult<&Marker> {
        self.markers.get(marker.0).ok_or(SceneError::UnknownMarker(marker))
    }

    fn marker_mut(&mut self, marker: MarkerId) -> SceneResult<&mut Marker> {
        self.markers.get_mut(marker.0).ok_or(SceneError::UnknownMarker(marker))
    }

    fn sample(&self, attr: AttrId, frame: Frame) -> SceneResult<f64> {
        self.attribute_ref(attr)?.sample(attr, frame)
    }

    fn sample_vector(&self, attrs: &[AttrId; 3], frame: Frame) -> SceneResult<Vector3<f64>> {
        Ok(Vector3::new(
            self.sample(attrs[0], frame)?,
            self.sample(attrs[1], frame)?,
            self.sample(attrs[2], frame)?,
        ))
    }

    /// Camera-to-world transform at `frame`.
    pub fn camera_transform(
        &self,
        camera: CameraId,
        frame: Frame,
    ) -> SceneResult<Isometry3<f64>> {
        let cam = self.camera_ref(camera)?;
        let translate = self.sample_vector(&cam.translate, frame)?;
        let rotate = self.sample_vector(&cam.rotate, frame)?;
        Ok(transform_from_trs(&translate, &rotate))
    }

    /// Pinhole intrinsics and lens at `frame`.
    pub fn camera_model(&self, camera: CameraId, frame: Frame) -> SceneResult<PinholeModel> {
        let cam = self.camera_ref(camera)?;
        let focal_length = self.sample(cam.focal_length, frame)?;
        let model = PinholeModel::new(focal_length, cam.film_back.0, cam.film_back.1)
            .with_clip_planes(cam.near_clip, cam.far_clip);
        let Some(lens) = &cam.lens else {
            return Ok(model);
        };
        let distortion = ClassicDistortion {
            distortion: self.sample(lens.distortion, frame)?,
            anamorphic_squeeze: self.sample(lens.anamorphic_squeeze, frame)?,
            curvature_x: self.sample(lens.curvature_x, frame)?,
            curvature_y: self.sample(lens.curvature_y, frame)?,
            quartic_distortion: self.sample(lens.quartic_distortion, frame)?,
        };
        if !distortion.is_valid() {
            return Err(SceneError::InvalidLens { camera, frame });
        }
        Ok(model.with_distortion(distortion))
    }

    fn compute_world_projection(
        &self,
        camera: CameraId,
        frame: Frame,
    ) -> SceneResult<Matrix4<f64>> {
        let model = self.camera_model(camera, frame)?;
        if model.focal_length <= 0.0 {
            return Err(SceneError::SingularTransform { camera, frame });
        }
        let transform = self.camera_transform(camera, frame)?;
        Ok(world_projection_matrix(&model, &transform))
    }
}

impl AttributeStore for MemoryScene {
    fn is_dynamic(&self, attr: AttrId) -> SceneResult<bool> {
        Ok(matches!(
            self.attribute_ref(attr)?.value,
            AttributeValue::Animated(_)
        ))
    }

    fn get_value(&self, attr: AttrId, frame: Option<Frame>) -> SceneResult<f64> {
        self.sample(attr, frame.unwrap_or(self.current_frame))
    }

    fn set_value(&mut self, attr: AttrId, value: f64, frame: Option<Frame>) -> SceneResult<()> {
        self.attribute_ref(attr)?;
        self.pending.push(PendingWrite { attr, value, frame });
        Ok(())
    }

    fn commit_batch(&mut self) -> SceneResult<()> {
        let current_frame = self.current_frame;
        for write in self.pending.drain(..) {
            let attribute = self
                .attributes
                .get_mut(write.attr.0)
                .ok_or(SceneError::UnknownAttribute(write.attr))?;
            match &mut attribute.value {
                AttributeValue::Static(value) => *value = write.value,
                AttributeValue::Animated(keys) => {
                    keys.insert(write.frame.unwrap_or(current_frame), write.value);
                }
            }
        }
        self.commits += 1;
        Ok(())
    }

    fn discard_batch(&mut self) {
        if !self.pending.is_empty() {
            trace!("Discarding {} queued writes", self.pending.len());
        }
        self.pending.clear();
    }
}

impl SceneEvaluator for MemoryScene {
    fn marker_valid(&self, marker: MarkerId, frame: Frame) -> SceneResult<bool> {
        let m = self.marker_ref(marker)?;
        Ok(m.observations.contains_key(&frame) && !m.disabled.contains(&frame))
    }

    fn marker_camera(&self, marker: MarkerId) -> SceneResult<CameraId> {
        Ok(self.marker_ref(marker)?.camera)
    }

    fn marker_bundle(&self, marker: MarkerId) -> SceneResult<BundleId> {
        Ok(self.marker_ref(marker)?.bundle)
    }

    fn marker_position(&self, marker: MarkerId, frame: Frame) -> SceneResult<Point3<f64>> {
        let m = self.marker_ref(marker)?;
        let image = m
            .observations
            .get(&frame)
            .ok_or(SceneError::MissingObservation { marker, frame })?;
        let model = self.camera_model(m.camera, frame)?;
        let transform = self.camera_transform(m.camera, frame)?;
        let undistorted = model.undistort_image(image);
        Ok(transform.transform_point(&model.film_point(&undistorted)))
    }

    fn bundle_position(&self, bundle: BundleId, frame: Frame) -> SceneResult<Point3<f64>> {
        let b = self.bundle_ref(bundle)?;
        Ok(Point3::from(self.sample_vector(&b.translate, frame)?))
    }

    fn camera_world_projection_matrix(
        &mut self,
        camera: CameraId,
        frame: Frame,
    ) -> SceneResult<Matrix4<f64>> {
        if let Some(matrix) = self.projection_cache.get(&(camera, frame)) {
            self.cache_stats.hits += 1;
            return Ok(*matrix);
        }
        let matrix = self.compute_world_projection(camera, frame)?;
        self.cache_stats.misses += 1;
        trace!("Cached world projection of {camera} at frame {frame}");
        self.projection_cache.insert((camera, frame), matrix);
        Ok(matrix)
    }

    fn invalidate_cache(&mut self, camera: CameraId) {
        self.projection_cache.retain(|(cached, _), _| *cached != camera);
        self.cache_stats.invalidations += 1;
    }
}
