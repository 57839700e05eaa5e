use std::sync::Arc;

use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use super::bounds::BoundingBox;
use super::camera::FrameInfo;
use super::light::Light;
use crate::renderer::geometry::Geometry;
use crate::renderer::material::Material;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DrawableFlags: u8 {
        const GEOMETRY = 1 << 0;
        const LIGHT = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryType {
    #[default]
    Static,
    Skinned,
    Instanced,
    Billboard,
}

/// Ambient lighting packed as 7 vectors of a 9-coefficient spherical harmonic.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AmbientSh {
    pub rows: [Vec4; 7],
}

impl AmbientSh {
    /// Constant ambient term with no directional variation.
    pub fn uniform(color: Vec3) -> Self {
        let mut rows = [Vec4::ZERO; 7];
        rows[0].w = color.x;
        rows[1].w = color.y;
        rows[2].w = color.z;
        Self { rows }
    }
}

/// One renderable piece of a drawable.
#[derive(Clone, Debug)]
pub struct SourceBatch {
    pub geometry: Arc<Geometry>,
    /// `None` falls back to the renderer's default material.
    pub material: Option<Arc<Material>>,
    pub geometry_type: GeometryType,
    /// Zero means "no lightmap".
    pub lightmap_index: u32,
    pub distance: f32,
    pub world_transform: Mat4,
}

/// What a drawable reports about itself for the current frame.
#[derive(Clone, Debug, Default)]
pub struct DrawableFrameData {
    pub world_bounds: BoundingBox,
    pub distance: f32,
    pub lod_distance: f32,
    pub batches: Vec<SourceBatch>,
    pub ambient: AmbientSh,
}

/// Anything the spatial index can return: geometry, lights or both.
///
/// `update_batches` may be called from worker threads and must not mutate
/// shared state; the collector guarantees it runs at most once per frame.
pub trait Drawable: Send + Sync {
    fn drawable_index(&self) -> usize;
    fn flags(&self) -> DrawableFlags;
    fn world_bounds(&self) -> BoundingBox;
    fn update_batches(&self, frame: &FrameInfo) -> DrawableFrameData;

    /// Zero means unlimited.
    fn draw_distance(&self) -> f32 {
        0.0
    }

    /// Zero means unlimited.
    fn shadow_distance(&self) -> f32 {
        0.0
    }

    fn cast_shadows(&self) -> bool {
        false
    }

    fn view_mask(&self) -> u32 {
        u32::MAX
    }

    fn light_mask(&self) -> u32 {
        u32::MAX
    }

    fn light(&self) -> Option<&Light> {
        None
    }
}

/// Rigid model made of one or more geometry/material pairs.
#[derive(Clone, Debug)]
pub struct StaticModel {
    index: usize,
    parts: Vec<(Arc<Geometry>, Option<Arc<Material>>)>,
    local_bounds: BoundingBox,
    translation: Vec3,
    rotation: Quat,
    scale: Vec3,
    geometry_type: GeometryType,
    lightmap_index: u32,
    cast_shadows: bool,
    draw_distance: f32,
    shadow_distance: f32,
    view_mask: u32,
    light_mask: u32,
    ambient: AmbientSh,
}

impl StaticModel {
    pub fn new(index: usize, geometry: Arc<Geometry>, material: Option<Arc<Material>>) -> Self {
        Self {
            index,
            parts: vec![(geometry, material)],
            local_bounds: BoundingBox::from_center_half_extents(Vec3::ZERO, Vec3::splat(0.5)),
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            geometry_type: GeometryType::Static,
            lightmap_index: 0,
            cast_shadows: false,
            draw_distance: 0.0,
            shadow_distance: 0.0,
            view_mask: u32::MAX,
            light_mask: u32::MAX,
            ambient: AmbientSh::uniform(Vec3::splat(0.1)),
        }
    }

    pub fn with_part(mut self, geometry: Arc<Geometry>, material: Option<Arc<Material>>) -> Self {
        self.parts.push((geometry, material));
        self
    }

    pub fn with_position(mut self, translation: Vec3) -> Self {
        self.translation = translation;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_local_bounds(mut self, bounds: BoundingBox) -> Self {
        self.local_bounds = bounds;
        self
    }

    pub fn with_geometry_type(mut self, geometry_type: GeometryType) -> Self {
        self.geometry_type = geometry_type;
        self
    }

    pub fn with_lightmap(mut self, lightmap_index: u32) -> Self {
        self.lightmap_index = lightmap_index;
        self
    }

    pub fn with_cast_shadows(mut self, cast_shadows: bool) -> Self {
        self.cast_shadows = cast_shadows;
        self
    }

    pub fn with_draw_distance(mut self, distance: f32) -> Self {
        self.draw_distance = distance;
        self
    }

    pub fn with_shadow_distance(mut self, distance: f32) -> Self {
        self.shadow_distance = distance;
        self
    }

    pub fn with_view_mask(mut self, mask: u32) -> Self {
        self.view_mask = mask;
        self
    }

    pub fn with_light_mask(mut self, mask: u32) -> Self {
        self.light_mask = mask;
        self
    }

    pub fn with_ambient(mut self, ambient: AmbientSh) -> Self {
        self.ambient = ambient;
        self
    }

    pub fn world_transform(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

impl Drawable for StaticModel {
    fn drawable_index(&self) -> usize {
        self.index
    }

    fn flags(&self) -> DrawableFlags {
        DrawableFlags::GEOMETRY
    }

    fn world_bounds(&self) -> BoundingBox {
        self.local_bounds.transformed(&self.world_transform())
    }

    fn update_batches(&self, frame: &FrameInfo) -> DrawableFrameData {
        let world_transform = self.world_transform();
        let world_bounds = self.local_bounds.transformed(&world_transform);
        let distance = frame.camera.distance(world_bounds.center());
        let batches = self
            .parts
            .iter()
            .map(|(geometry, material)| SourceBatch {
                geometry: Arc::clone(geometry),
                material: material.clone(),
                geometry_type: self.geometry_type,
                lightmap_index: self.lightmap_index,
                distance,
                world_transform,
            })
            .collect();

        DrawableFrameData {
            world_bounds,
            distance,
            lod_distance: frame.camera.lod_distance(distance),
            batches,
            ambient: self.ambient,
        }
    }

    fn draw_distance(&self) -> f32 {
        self.draw_distance
    }

    fn shadow_distance(&self) -> f32 {
        self.shadow_distance
    }

    fn cast_shadows(&self) -> bool {
        self.cast_shadows
    }

    fn view_mask(&self) -> u32 {
        self.view_mask
    }

    fn light_mask(&self) -> u32 {
        self.light_mask
    }
}
