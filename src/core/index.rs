//! Parameter and error indexing.
//!
//! A solve flattens its unknowns into one parameter vector and its measurements
//! into one error vector. [`ParameterIndex`] records which (attribute, frame)
//! pair each parameter slot addresses, and [`ErrorIndex`] records which
//! (marker, frame) observation owns each triple of error slots. Both are built
//! once per solve and are read-only afterwards.

use crate::core::scene::{AttributeStore, SceneEvaluator};
use crate::core::{AttrId, Frame, MarkerId, SolveObjects};
use crate::error::SceneResult;

/// Number of scalar errors produced by one valid observation: dx, dy and distance.
pub const ERRORS_PER_OBSERVATION: usize = 3;

/// One parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterMapEntry {
    /// Position in the solve's attribute list
    pub attr_index: usize,
    /// Position in the solve's frame list, `None` for a static attribute
    pub frame_index: Option<usize>,
}

impl ParameterMapEntry {
    pub fn is_static(&self) -> bool {
        self.frame_index.is_none()
    }
}

/// One valid observation, owning three consecutive error slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMapEntry {
    /// Position in the solve's marker list
    pub marker_index: usize,
    /// Position in the solve's frame list
    pub frame_index: usize,
}

impl ErrorMapEntry {
    /// First of the three error slots this observation writes.
    pub fn first_slot(position: usize) -> usize {
        position * ERRORS_PER_OBSERVATION
    }
}

/// Mapping between the flat parameter vector and (attribute, frame) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterIndex {
    entries: Vec<ParameterMapEntry>,
}

impl ParameterIndex {
    /// Enumerate parameters for attributes with the given dynamic flags.
    ///
    /// Dynamic attributes contribute one slot per frame in frame-list order,
    /// static attributes a single slot.
    pub fn from_dynamic_flags(dynamic: &[bool], frame_count: usize) -> Self {
        let capacity = dynamic
            .iter()
            .map(|&is_dynamic| if is_dynamic { frame_count } else { 1 })
            .sum();
        let mut entries = Vec::with_capacity(capacity);

        for (attr_index, &is_dynamic) in dynamic.iter().enumerate() {
            if is_dynamic {
                entries.extend((0..frame_count).map(|frame_index| ParameterMapEntry {
                    attr_index,
                    frame_index: Some(frame_index),
                }));
            } else {
                entries.push(ParameterMapEntry {
                    attr_index,
                    frame_index: None,
                });
            }
        }

        Self { entries }
    }

    /// Enumerate parameters by querying each attribute's dynamic flag.
    pub fn build<S: AttributeStore + ?Sized>(
        store: &S,
        attributes: &[AttrId],
        frame_count: usize,
    ) -> SceneResult<Self> {
        let dynamic = attributes
            .iter()
            .map(|&attr| store.is_dynamic(attr))
            .collect::<SceneResult<Vec<_>>>()?;
        Ok(Self::from_dynamic_flags(&dynamic, frame_count))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_at(&self, slot: usize) -> Option<&ParameterMapEntry> {
        self.entries.get(slot)
    }

    pub fn entries(&self) -> &[ParameterMapEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterMapEntry> {
        self.entries.iter()
    }

    /// Resolve a slot to the attribute and frame it addresses.
    pub fn resolve(&self, slot: usize, objects: &SolveObjects) -> Option<(AttrId, Option<Frame>)> {
        let entry = self.entries.get(slot)?;
        let attr = *objects.attributes.get(entry.attr_index)?;
        let frame = match entry.frame_index {
            Some(frame_index) => Some(*objects.frames.get(frame_index)?),
            None => None,
        };
        Some((attr, frame))
    }
}

/// Mapping between the flat error vector and valid (marker, frame) observations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorIndex {
    entries: Vec<ErrorMapEntry>,
}

impl ErrorIndex {
    /// Enumerate observations for which `is_valid(marker_index, frame_index)` holds.
    ///
    /// The first failing query aborts construction.
    pub fn from_validity<F>(
        marker_count: usize,
        frame_count: usize,
        mut is_valid: F,
    ) -> SceneResult<Self>
    where
        F: FnMut(usize, usize) -> SceneResult<bool>,
    {
        let mut entries = Vec::new();
        for marker_index in 0..marker_count {
            for frame_index in 0..frame_count {
                if is_valid(marker_index, frame_index)? {
                    entries.push(ErrorMapEntry {
                        marker_index,
                        frame_index,
                    });
                }
            }
        }
        Ok(Self { entries })
    }

    /// Enumerate observations by querying marker validity at each exact frame.
    pub fn build<S: SceneEvaluator + ?Sized>(
        scene: &S,
        markers: &[MarkerId],
        frames: &[Frame],
    ) -> SceneResult<Self> {
        Self::from_validity(markers.len(), frames.len(), |marker_index, frame_index| {
            scene.marker_valid(markers[marker_index], frames[frame_index])
        })
    }

    /// Number of valid observations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of scalar errors, three per observation.
    pub fn error_count(&self) -> usize {
        self.entries.len() * ERRORS_PER_OBSERVATION
    }

    pub fn entry_at(&self, position: usize) -> Option<&ErrorMapEntry> {
        self.entries.get(position)
    }

    pub fn entries(&self) -> &[ErrorMapEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorMapEntry> {
        self.entries.iter()
    }

    /// Resolve an observation to its marker and frame.
    pub fn resolve(&self, position: usize, objects: &SolveObjects) -> Option<(MarkerId, Frame)> {
        let entry = self.entries.get(position)?;
        Some((
            *objects.markers.get(entry.marker_index)?,
            *objects.frames.get(entry.frame_index)?,
        ))
    }
}
