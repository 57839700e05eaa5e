// scene/mod.rs

pub mod bounds;
pub mod camera;
pub mod drawable;
pub mod light;
pub mod spatial;

pub use bounds::{BoundingBox, Frustum, IntRect};
pub use camera::{Camera, FrameInfo};
pub use drawable::{
    AmbientSh, Drawable, DrawableFlags, DrawableFrameData, GeometryType, SourceBatch, StaticModel,
};
pub use light::{Light, LightImportance, LightNode, LightType};
pub use spatial::{LinearSpatialIndex, SpatialIndex};
