//! In-memory scene backing solves outside a host application.
//!
//! - Pinhole camera math (projection, film plane, transforms)
//! - [`MemoryScene`], implementing [`AttributeStore`](crate::core::AttributeStore)
//!   and [`SceneEvaluator`](crate::core::SceneEvaluator)

pub mod camera;
pub mod memory;

pub use camera::{
    ClassicDistortion, PinholeModel, transform_from_trs, world_projection_matrix,
};
pub use memory::{
    Attribute, AttributeValue, Bundle, CacheStats, Camera, LensChannels, Marker, MemoryScene,
};
