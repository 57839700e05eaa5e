use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use super::bounds::{BoundingBox, Frustum};
use super::camera::{Camera, FrameInfo};
use super::drawable::{Drawable, DrawableFlags, DrawableFrameData};

const MIN_INTENSITY_DIVISOR: f32 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightType {
    Directional,
    Point,
    Spot,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightImportance {
    NotImportant,
    #[default]
    Auto,
    Important,
}

impl LightImportance {
    /// Lower tiers are preferred when ranking lights for a drawable.
    pub fn tier(self) -> u8 {
        match self {
            LightImportance::Important => 0,
            LightImportance::Auto => 1,
            LightImportance::NotImportant => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Light {
    pub light_type: LightType,
    pub importance: LightImportance,
    pub color: Vec3,
    pub brightness: f32,
    pub position: Vec3,
    pub direction: Vec3,
    pub range: f32,
    pub fov_degrees: f32,
    pub cast_shadows: bool,
    /// Zero means unlimited.
    pub shadow_distance: f32,
    /// 0 is fully dark shadow, 1 disables shadowing.
    pub shadow_intensity: f32,
    pub light_mask: u32,
}

impl Light {
    fn with_type(light_type: LightType) -> Self {
        Self {
            light_type,
            importance: LightImportance::Auto,
            color: Vec3::ONE,
            brightness: 1.0,
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            range: 10.0,
            fov_degrees: 30.0,
            cast_shadows: false,
            shadow_distance: 0.0,
            shadow_intensity: 0.0,
            light_mask: u32::MAX,
        }
    }

    pub fn directional(direction: Vec3) -> Self {
        Self {
            direction: direction.normalize_or_zero(),
            ..Self::with_type(LightType::Directional)
        }
    }

    pub fn point(position: Vec3, range: f32) -> Self {
        Self {
            position,
            range,
            ..Self::with_type(LightType::Point)
        }
    }

    pub fn spot(position: Vec3, direction: Vec3, range: f32, fov_degrees: f32) -> Self {
        Self {
            position,
            direction: direction.normalize_or_zero(),
            range,
            fov_degrees,
            ..Self::with_type(LightType::Spot)
        }
    }

    pub fn with_importance(mut self, importance: LightImportance) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = color;
        self
    }

    pub fn with_brightness(mut self, brightness: f32) -> Self {
        self.brightness = brightness;
        self
    }

    pub fn with_shadows(mut self, shadow_distance: f32, shadow_intensity: f32) -> Self {
        self.cast_shadows = true;
        self.shadow_distance = shadow_distance;
        self.shadow_intensity = shadow_intensity;
        self
    }

    pub fn with_light_mask(mut self, mask: u32) -> Self {
        self.light_mask = mask;
        self
    }

    pub fn effective_color(&self) -> Vec3 {
        self.color * self.brightness
    }

    pub fn is_black(&self) -> bool {
        self.effective_color().max_element() <= 0.0
    }

    pub fn intensity_divisor(&self) -> f32 {
        self.effective_color().max_element().max(MIN_INTENSITY_DIVISOR)
    }

    /// Distance from the light to the closest point of `bounds`; zero for directional lights.
    pub fn distance_to(&self, bounds: &BoundingBox) -> f32 {
        match self.light_type {
            LightType::Directional => 0.0,
            LightType::Point | LightType::Spot => bounds.distance_to_point(self.position),
        }
    }

    pub fn distance_to_camera(&self, camera: &Camera) -> f32 {
        match self.light_type {
            LightType::Directional => 0.0,
            LightType::Point | LightType::Spot => {
                ((self.position - camera.position()).length() - self.range).max(0.0)
            }
        }
    }

    pub fn spot_view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.direction, up_vector_for(self.direction))
    }

    pub fn spot_proj(&self, near: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_degrees.to_radians(), 1.0, near, self.range.max(near * 2.0))
    }

    pub fn spot_frustum(&self) -> Frustum {
        Frustum::from_view_proj(self.spot_proj(self.range * 0.01) * self.spot_view())
    }

    pub fn world_bounds(&self) -> BoundingBox {
        match self.light_type {
            LightType::Directional => BoundingBox::infinite(),
            LightType::Point | LightType::Spot => {
                BoundingBox::from_center_half_extents(self.position, Vec3::splat(self.range))
            }
        }
    }

    /// Whether the lit volume touches `bounds`.
    pub fn illuminates(&self, bounds: &BoundingBox) -> bool {
        match self.light_type {
            LightType::Directional => true,
            LightType::Point => bounds.intersects_sphere(self.position, self.range),
            LightType::Spot => {
                bounds.intersects_sphere(self.position, self.range)
                    && self.spot_frustum().intersects_box(bounds)
            }
        }
    }
}

/// Picks an up vector that is not parallel to `direction`.
pub fn up_vector_for(direction: Vec3) -> Vec3 {
    if direction.abs().dot(Vec3::Y) > 0.95 {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

/// A light placed in the scene.
#[derive(Clone, Debug)]
pub struct LightNode {
    index: usize,
    light: Light,
    view_mask: u32,
}

impl LightNode {
    pub fn new(index: usize, light: Light) -> Self {
        Self {
            index,
            light,
            view_mask: u32::MAX,
        }
    }

    pub fn with_view_mask(mut self, view_mask: u32) -> Self {
        self.view_mask = view_mask;
        self
    }
}

impl Drawable for LightNode {
    fn drawable_index(&self) -> usize {
        self.index
    }

    fn flags(&self) -> DrawableFlags {
        DrawableFlags::LIGHT
    }

    fn world_bounds(&self) -> BoundingBox {
        self.light.world_bounds()
    }

    fn update_batches(&self, frame: &FrameInfo) -> DrawableFrameData {
        let world_bounds = self.light.world_bounds();
        let distance = self.light.distance_to_camera(&frame.camera);
        DrawableFrameData {
            world_bounds,
            distance,
            lod_distance: frame.camera.lod_distance(distance),
            ..Default::default()
        }
    }

    fn view_mask(&self) -> u32 {
        self.view_mask
    }

    fn light_mask(&self) -> u32 {
        self.light.light_mask
    }

    fn light(&self) -> Option<&Light> {
        Some(&self.light)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intensity_divisor_uses_brightest_channel() {
        let light = Light::point(Vec3::ZERO, 5.0)
            .with_color(Vec3::new(0.5, 2.0, 1.0))
            .with_brightness(2.0);
        assert!((light.intensity_divisor() - 4.0).abs() < 1e-6);
        assert!(Light::point(Vec3::ZERO, 5.0).with_brightness(0.0).is_black());
    }

    #[test]
    fn point_light_illuminates_only_within_range() {
        let light = Light::point(Vec3::ZERO, 2.0);
        let near = BoundingBox::from_center_half_extents(Vec3::new(2.5, 0.0, 0.0), Vec3::splat(1.0));
        let far = BoundingBox::from_center_half_extents(Vec3::new(5.0, 0.0, 0.0), Vec3::splat(1.0));
        assert!(light.illuminates(&near));
        assert!(!light.illuminates(&far));
    }

    #[test]
    fn spot_light_ignores_boxes_behind_it() {
        let light = Light::spot(Vec3::ZERO, Vec3::NEG_Z, 10.0, 45.0);
        let front = BoundingBox::from_center_half_extents(Vec3::new(0.0, 0.0, -5.0), Vec3::splat(0.5));
        let back = BoundingBox::from_center_half_extents(Vec3::new(0.0, 0.0, 5.0), Vec3::splat(0.5));
        assert!(light.illuminates(&front));
        assert!(!light.illuminates(&back));
    }
}
