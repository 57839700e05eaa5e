use std::sync::{Arc, Weak};

use glam::{Mat4, UVec2, Vec3};
use log::debug;

use super::batch::BaseSceneBatch;
use super::callback::SceneBatchCollectorCallback;
use super::internal::drawable_data::{DrawableTraits, SceneDrawableData, ZRange};
use super::internal::threaded_vector::ThreadedVector;
use super::pipeline_state::stable_hash;
use super::shadow_atlas::ShadowMap;
use super::sorting::BatchSortedByState;
use crate::scene::bounds::Frustum;
use crate::scene::camera::{Camera, FrameInfo};
use crate::scene::drawable::{Drawable, DrawableFlags};
use crate::scene::light::{up_vector_for, Light, LightType};
use crate::scene::spatial::SpatialIndex;
use crate::settings::ShadowSettings;

pub const MAX_LIGHT_SPLITS: usize = 6;

/// Extra depth behind a directional cascade so casters outside the view still land in the map.
const SHADOW_CASTER_EXTRUSION: f32 = 100.0;

/// Cube faces in the order they are dropped from the back when fewer than 6 are used.
const POINT_LIGHT_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Y, Vec3::Z),
];

#[derive(Clone, Copy, Debug)]
pub struct ShadowCamera {
    pub view: Mat4,
    pub proj: Mat4,
    pub position: Vec3,
    pub orthographic: bool,
}

impl ShadowCamera {
    fn new(view: Mat4, proj: Mat4, position: Vec3, orthographic: bool) -> Self {
        Self {
            view,
            proj,
            position,
            orthographic,
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        self.proj * self.view
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_proj(self.view_proj())
    }
}

/// One shadow-casting view of a light: a cascade, a cube face or the spot cone.
pub struct SceneLightShadowSplit {
    pub shadow_camera: ShadowCamera,
    pub shadow_map: Option<ShadowMap>,
    /// World to shadow atlas texture coordinates.
    pub shadow_matrix: Mat4,
    /// Cascade depth range; zero for non-directional splits.
    pub z_range: ZRange,
    pub shadow_casters: Vec<Arc<dyn Drawable>>,
    pub shadow_batches: Vec<BaseSceneBatch>,
    pub sorted_shadow_batches: Vec<BatchSortedByState>,
}

impl SceneLightShadowSplit {
    fn new(shadow_camera: ShadowCamera, z_range: ZRange) -> Self {
        Self {
            shadow_camera,
            shadow_map: None,
            shadow_matrix: Mat4::IDENTITY,
            z_range,
            shadow_casters: Vec::new(),
            shadow_batches: Vec::new(),
            sorted_shadow_batches: Vec::new(),
        }
    }
}

pub struct SceneLightProcessContext<'a> {
    pub frame: &'a FrameInfo,
    pub scene_z_range: ZRange,
    pub visible_geometries: &'a [Arc<dyn Drawable>],
    pub drawable_data: &'a SceneDrawableData,
    pub spatial: &'a dyn SpatialIndex,
    pub shadow_casters_to_update: &'a ThreadedVector<Arc<dyn Drawable>>,
    pub shadows: &'a ShadowSettings,
}

/// A visible light with its per-frame lit set and shadow splits.
///
/// Cached across frames by drawable index and reinitialized in `begin_frame`.
pub struct SceneLight {
    drawable: Weak<dyn Drawable>,
    drawable_index: usize,
    light: Light,
    distance: f32,
    has_shadow: bool,
    pipeline_state_hash: u64,
    splits: Vec<SceneLightShadowSplit>,
    lit_geometries: Vec<usize>,
    last_seen_frame: u32,
}

impl SceneLight {
    pub fn new(drawable: &Arc<dyn Drawable>, light: Light) -> Self {
        Self {
            drawable: Arc::downgrade(drawable),
            drawable_index: drawable.drawable_index(),
            light,
            distance: 0.0,
            has_shadow: false,
            pipeline_state_hash: 0,
            splits: Vec::new(),
            lit_geometries: Vec::new(),
            last_seen_frame: 0,
        }
    }

    /// Whether this cache entry still refers to a live drawable.
    pub fn is_alive(&self) -> bool {
        self.drawable.strong_count() > 0
    }

    pub fn last_seen_frame(&self) -> u32 {
        self.last_seen_frame
    }

    pub fn begin_frame(&mut self, light: Light, frame_number: u32) {
        self.light = light;
        self.last_seen_frame = frame_number;
        self.distance = 0.0;
        self.has_shadow = false;
        self.splits.clear();
        self.lit_geometries.clear();
        self.update_pipeline_state_hash();
    }

    pub fn set_shadow(&mut self, has_shadow: bool, distance: f32) {
        self.has_shadow = has_shadow;
        self.distance = distance;
        self.update_pipeline_state_hash();
    }

    fn update_pipeline_state_hash(&mut self) {
        self.pipeline_state_hash = stable_hash(&(self.light.light_type, self.has_shadow));
    }

    /// Find lit geometries and, for shadowed lights, build splits and gather casters.
    pub fn update_lit_geometries_and_shadow_casters(
        &mut self,
        ctx: &SceneLightProcessContext<'_>,
        thread_index: usize,
    ) {
        for geometry in ctx.visible_geometries {
            let index = geometry.drawable_index();
            if !ctx.drawable_data.traits(index).contains(DrawableTraits::FORWARD_LIT) {
                continue;
            }
            if geometry.light_mask() & self.light.light_mask == 0 {
                continue;
            }
            let Some(frame) = ctx.drawable_data.frame(index) else {
                continue;
            };
            if self.light.illuminates(&frame.data.world_bounds) {
                self.lit_geometries.push(index);
            }
        }

        if !self.has_shadow {
            return;
        }

        self.splits = self.build_splits(ctx);
        if self.splits.is_empty() {
            self.drop_shadows();
            return;
        }

        let camera = &ctx.frame.camera;
        let view_mask = camera.view_mask;
        let light_mask = self.light.light_mask;
        let mut candidates = Vec::new();
        for split in &mut self.splits {
            candidates.clear();
            ctx.spatial.query_frustum(
                &split.shadow_camera.frustum(),
                DrawableFlags::GEOMETRY,
                view_mask,
                &mut candidates,
            );
            for caster in candidates.drain(..) {
                if !caster.cast_shadows() || caster.light_mask() & light_mask == 0 {
                    continue;
                }
                if !caster_in_range(caster.as_ref(), camera) {
                    continue;
                }
                if !ctx.drawable_data.is_updated(caster.drawable_index()) {
                    ctx.shadow_casters_to_update.insert(thread_index, Arc::clone(&caster));
                }
                split.shadow_casters.push(caster);
            }
            split
                .shadow_casters
                .sort_by_key(|caster| caster.drawable_index());
            split.shadow_casters.dedup_by_key(|caster| caster.drawable_index());
        }
    }

    fn build_splits(&self, ctx: &SceneLightProcessContext<'_>) -> Vec<SceneLightShadowSplit> {
        match self.light.light_type {
            LightType::Directional => self.directional_splits(ctx),
            LightType::Spot => {
                let near = (self.light.range * 0.01).max(0.01);
                vec![SceneLightShadowSplit::new(
                    ShadowCamera::new(
                        self.light.spot_view(),
                        self.light.spot_proj(near),
                        self.light.position,
                        false,
                    ),
                    ZRange::EMPTY,
                )]
            }
            LightType::Point => {
                let near = (self.light.range * 0.01).max(0.01);
                let proj = Mat4::perspective_rh(
                    std::f32::consts::FRAC_PI_2,
                    1.0,
                    near,
                    self.light.range.max(near * 2.0),
                );
                let num_faces = ctx.shadows.point_shadow_faces.clamp(4, 6);
                POINT_LIGHT_FACES[..num_faces]
                    .iter()
                    .map(|(direction, up)| {
                        let position = self.light.position;
                        let view = Mat4::look_at_rh(position, position + *direction, *up);
                        SceneLightShadowSplit::new(
                            ShadowCamera::new(view, proj, position, false),
                            ZRange::EMPTY,
                        )
                    })
                    .collect()
            }
        }
    }

    fn directional_splits(&self, ctx: &SceneLightProcessContext<'_>) -> Vec<SceneLightShadowSplit> {
        let camera = &ctx.frame.camera;
        let mut near = camera.near;
        let mut far = camera.far;
        if self.light.shadow_distance > 0.0 {
            far = far.min(self.light.shadow_distance);
        }
        if ctx.scene_z_range.is_valid() {
            near = near.max(ctx.scene_z_range.min);
            far = far.min(ctx.scene_z_range.max);
        }
        if far <= near {
            debug!("Directional light {} has nothing to shadow", self.drawable_index);
            return Vec::new();
        }

        let direction = self.light.direction.normalize_or_zero();
        if direction == Vec3::ZERO {
            return Vec::new();
        }
        let up = up_vector_for(direction);
        let rotation = Mat4::look_at_rh(Vec3::ZERO, direction, up);
        let texel_count = ctx.shadows.shadow_map_size.max(1) as f32;

        let distances = cascade_splits(near, far, ctx.shadows.directional_cascades, ctx.shadows.cascade_split_lambda);
        distances
            .windows(2)
            .map(|range| {
                let corners = camera.frustum_corners(range[0], range[1]);
                let center = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;
                let radius = corners
                    .iter()
                    .map(|corner| corner.distance(center))
                    .fold(0.0_f32, f32::max)
                    .max(0.01);

                // Snap to whole texels so the map does not shimmer as the camera moves.
                let texel = 2.0 * radius / texel_count;
                let mut light_space = rotation.transform_point3(center);
                light_space.x = (light_space.x / texel).floor() * texel;
                light_space.y = (light_space.y / texel).floor() * texel;
                let center = rotation.inverse().transform_point3(light_space);

                let position = center - direction * (radius + SHADOW_CASTER_EXTRUSION);
                let view = Mat4::look_at_rh(position, center, up);
                let proj = Mat4::orthographic_rh(
                    -radius,
                    radius,
                    -radius,
                    radius,
                    0.0,
                    2.0 * radius + SHADOW_CASTER_EXTRUSION,
                );
                SceneLightShadowSplit::new(
                    ShadowCamera::new(view, proj, position, true),
                    ZRange::new(range[0], range[1]),
                )
            })
            .collect()
    }

    /// Request one atlas tile per split. Shadows are dropped for the frame if any request fails.
    pub fn allocate_shadow_maps(
        &mut self,
        callback: &dyn SceneBatchCollectorCallback,
        shadows: &ShadowSettings,
    ) -> bool {
        if !self.has_shadow {
            return true;
        }
        let size = UVec2::splat(shadows.shadow_map_size);
        for split in &mut self.splits {
            match callback.get_temporary_shadow_map(size) {
                Some(map) => {
                    split.shadow_matrix = map.texture_matrix(split.shadow_camera.view_proj());
                    split.shadow_map = Some(map);
                }
                None => {
                    self.drop_shadows();
                    return false;
                }
            }
        }
        true
    }

    fn drop_shadows(&mut self) {
        self.has_shadow = false;
        self.splits.clear();
        self.update_pipeline_state_hash();
    }

    /// Total atlas area requested, used to serve the largest lights first.
    pub fn shadow_map_area(&self, shadows: &ShadowSettings) -> u64 {
        let side = u64::from(shadows.shadow_map_size);
        side * side * self.splits.len() as u64
    }

    pub fn drawable_index(&self) -> usize {
        self.drawable_index
    }

    pub fn light(&self) -> &Light {
        &self.light
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub fn has_shadow(&self) -> bool {
        self.has_shadow
    }

    pub fn pipeline_state_hash(&self) -> u64 {
        self.pipeline_state_hash
    }

    pub fn num_splits(&self) -> usize {
        self.splits.len()
    }

    pub fn splits(&self) -> &[SceneLightShadowSplit] {
        &self.splits
    }

    pub fn splits_mut(&mut self) -> &mut [SceneLightShadowSplit] {
        &mut self.splits
    }

    /// Drawable indices lit by this light, ascending.
    pub fn lit_geometries(&self) -> &[usize] {
        &self.lit_geometries
    }

    pub fn is_lit_geometry(&self, drawable_index: usize) -> bool {
        self.lit_geometries.binary_search(&drawable_index).is_ok()
    }
}

/// Casters past their own shadow or draw distance are left out of the map.
fn caster_in_range(caster: &dyn Drawable, camera: &Camera) -> bool {
    let distance = camera.distance(caster.world_bounds().center());
    let within = |max: f32| max <= 0.0 || distance <= max;
    within(caster.shadow_distance()) && within(caster.draw_distance())
}

/// Practical split scheme: a `lambda` blend of logarithmic and uniform distribution.
pub fn cascade_splits(near: f32, far: f32, count: usize, lambda: f32) -> Vec<f32> {
    let count = count.clamp(1, 4);
    let near = near.max(1e-3);
    (0..=count)
        .map(|i| {
            if i == 0 {
                return near;
            }
            if i == count {
                return far;
            }
            let t = i as f32 / count as f32;
            let uniform = near + (far - near) * t;
            let logarithmic = near * (far / near).powf(t);
            lambda * logarithmic + (1.0 - lambda) * uniform
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_splits_are_monotonic_and_bounded() {
        let splits = cascade_splits(0.1, 100.0, 4, 0.5);
        assert_eq!(splits.len(), 5);
        assert_eq!(splits[0], 0.1);
        assert_eq!(splits[4], 100.0);
        assert!(splits.windows(2).all(|w| w[0] < w[1]));

        let uniform = cascade_splits(0.0, 40.0, 2, 0.0);
        assert!((uniform[1] - 20.0).abs() < 0.01);
    }

    #[test]
    fn casters_respect_shadow_and_draw_distance() {
        use crate::renderer::geometry::Geometry;
        use crate::scene::drawable::StaticModel;

        let camera = Camera::default();
        let cube = Arc::new(Geometry::cube("cube"));
        let far = Vec3::new(0.0, 0.0, -17.0);
        let plain = StaticModel::new(0, Arc::clone(&cube), None).with_position(far);
        let short_shadow = StaticModel::new(1, Arc::clone(&cube), None)
            .with_position(far)
            .with_shadow_distance(10.0);
        let short_draw = StaticModel::new(2, cube, None).with_position(far).with_draw_distance(10.0);

        assert!(caster_in_range(&plain, &camera));
        assert!(!caster_in_range(&short_shadow, &camera));
        assert!(!caster_in_range(&short_draw, &camera));
    }

    #[test]
    fn point_faces_drop_vertical_faces_last() {
        let horizontal = POINT_LIGHT_FACES[..4].iter().all(|(dir, _)| dir.y == 0.0);
        assert!(horizontal);
    }
}
