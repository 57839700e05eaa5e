use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use super::callback::SceneBatchCollectorCallback;
use super::diagnostics::FrameDiagnostics;
use super::internal::drawable_data::{
    DrawableFrame, DrawableTraits, DrawableUpdateContext, SceneDrawableData, SceneZRange, ZRange,
    ZRangeEvaluator,
};
use super::internal::threaded_vector::ThreadedVector;
use super::internal::threading::{TaskQueue, WorkQueue};
use super::light_accumulator::{
    DrawableLightAccumulator, LightAccumulationContext, LightScore, MAIN_LIGHT_PENALTY,
    MAX_VERTEX_LIGHTS, NO_LIGHT,
};
use super::material::{Material, MaterialQuality};
use super::scene_light::{SceneLight, SceneLightProcessContext};
use super::scene_pass::{BatchCollectionContext, ScenePass, ScenePassId};
use super::sorting::BatchSortedByState;
use crate::scene::camera::FrameInfo;
use crate::scene::drawable::{Drawable, DrawableFlags};
use crate::scene::light::LightType;
use crate::scene::spatial::SpatialIndex;
use crate::settings::{RenderSettings, ScenePassConfig, ShadowSettings, WorkThresholds};

/// Turns the visible set of one view into per-pass batches.
///
/// A frame runs `begin_frame`, `process_visible_drawables`,
/// `process_visible_lights` and `collect_scene_batches` in that order.
pub struct SceneBatchCollector {
    work_queue: Arc<WorkQueue>,
    default_material: Arc<Material>,
    diagnostics: FrameDiagnostics,
    passes: Vec<ScenePass>,

    max_pixel_lights: usize,
    base_material_quality: MaterialQuality,
    thresholds: WorkThresholds,
    shadows: ShadowSettings,
    light_eviction_frames: u32,

    frame: FrameInfo,
    spatial: Option<Arc<dyn SpatialIndex>>,
    callback: Option<Arc<dyn SceneBatchCollectorCallback>>,
    num_threads: usize,
    num_drawables: usize,
    material_quality: MaterialQuality,

    drawable_data: SceneDrawableData,
    scene_z_range: SceneZRange,
    threaded_geometries: ThreadedVector<Arc<dyn Drawable>>,
    threaded_lights: ThreadedVector<Arc<dyn Drawable>>,
    shadow_casters_to_update: ThreadedVector<Arc<dyn Drawable>>,
    visible_geometries: Vec<Arc<dyn Drawable>>,
    /// Visible lights of this frame, ascending by drawable index.
    visible_lights: Vec<SceneLight>,
    /// Lights not visible this frame, kept until evicted.
    light_cache: HashMap<usize, SceneLight>,
    main_light_index: Option<usize>,
    drawable_lighting: Vec<DrawableLightAccumulator>,
}

impl SceneBatchCollector {
    pub fn new(work_queue: Arc<WorkQueue>, settings: &RenderSettings) -> Self {
        let num_threads = work_queue.num_threads();
        Self {
            work_queue,
            default_material: Arc::new(Material::default_lit()),
            diagnostics: FrameDiagnostics::default(),
            passes: settings.passes.iter().map(ScenePass::from_config).collect(),
            max_pixel_lights: settings.max_pixel_lights,
            base_material_quality: settings.material_quality,
            thresholds: settings.thresholds.clone(),
            shadows: settings.shadows.clone(),
            light_eviction_frames: settings.light_eviction_frames,
            frame: FrameInfo::default(),
            spatial: None,
            callback: None,
            num_threads,
            num_drawables: 0,
            material_quality: settings.material_quality,
            drawable_data: SceneDrawableData::default(),
            scene_z_range: SceneZRange::default(),
            threaded_geometries: ThreadedVector::new(),
            threaded_lights: ThreadedVector::new(),
            shadow_casters_to_update: ThreadedVector::new(),
            visible_geometries: Vec::new(),
            visible_lights: Vec::new(),
            light_cache: HashMap::new(),
            main_light_index: None,
            drawable_lighting: Vec::new(),
        }
    }

    pub fn set_default_material(&mut self, material: Arc<Material>) {
        self.default_material = material;
    }

    pub fn default_material(&self) -> &Arc<Material> {
        &self.default_material
    }

    pub fn reset_passes(&mut self) {
        self.passes.clear();
    }

    pub fn add_scene_pass(&mut self, config: &ScenePassConfig) -> ScenePassId {
        self.passes.push(ScenePass::from_config(config));
        ScenePassId(self.passes.len() - 1)
    }

    pub fn scene_pass(&self, id: ScenePassId) -> Option<&ScenePass> {
        self.passes.get(id.0)
    }

    pub fn scene_passes(&self) -> &[ScenePass] {
        &self.passes
    }

    pub fn begin_frame(
        &mut self,
        frame: FrameInfo,
        spatial: Arc<dyn SpatialIndex>,
        callback: Arc<dyn SceneBatchCollectorCallback>,
    ) {
        self.diagnostics.reset();
        self.num_threads = self.work_queue.num_threads();
        self.num_drawables = spatial.drawable_count();
        self.material_quality = if frame.camera.low_material_quality {
            MaterialQuality::Low
        } else {
            self.base_material_quality
        };
        self.frame = frame;
        self.spatial = Some(spatial);
        self.callback = Some(callback);

        self.return_lights_to_cache();
        let frame_number = frame.frame_number;
        let eviction_frames = self.light_eviction_frames;
        let before = self.light_cache.len();
        self.light_cache.retain(|_, light| {
            light.is_alive() && frame_number.wrapping_sub(light.last_seen_frame()) <= eviction_frames
        });
        if self.light_cache.len() != before {
            debug!("Evicted {} cached scene lights", before - self.light_cache.len());
        }

        self.reset_frame_state();
    }

    fn return_lights_to_cache(&mut self) {
        for light in self.visible_lights.drain(..) {
            self.light_cache.insert(light.drawable_index(), light);
        }
    }

    fn reset_frame_state(&mut self) {
        self.return_lights_to_cache();
        self.drawable_data.reset(self.num_drawables);
        self.scene_z_range.clear(self.num_threads);
        self.threaded_geometries.clear(self.num_threads);
        self.threaded_lights.clear(self.num_threads);
        self.shadow_casters_to_update.clear(self.num_threads);
        self.visible_geometries.clear();
        self.main_light_index = None;
        self.drawable_lighting.clear();
        self.drawable_lighting
            .resize(self.num_drawables, DrawableLightAccumulator::default());
        for pass in &mut self.passes {
            pass.begin_frame(self.num_threads);
        }
    }

    /// Update visible drawables, route their source batches into the passes and
    /// collect visible lights. Calling it twice in a frame replaces the first result.
    pub fn process_visible_drawables(&mut self, drawables: &[Arc<dyn Drawable>]) {
        self.reset_frame_state();

        let evaluator = ZRangeEvaluator::new(&self.frame.camera);
        let update_ctx = DrawableUpdateContext {
            frame: &self.frame,
            evaluator: &evaluator,
            default_material: &self.default_material,
            material_quality: self.material_quality,
        };
        let drawable_data = &self.drawable_data;
        let scene_z_range = &self.scene_z_range;
        let geometries = &self.threaded_geometries;
        let lights = &self.threaded_lights;
        let passes = &self.passes;

        self.work_queue
            .for_each_parallel(self.thresholds.drawables, drawables, |thread, _, chunk| {
                for drawable in chunk {
                    let flags = drawable.flags();
                    if flags.contains(DrawableFlags::GEOMETRY) {
                        let Some(frame) = drawable_data.get_or_update(drawable.as_ref(), &update_ctx) else {
                            continue;
                        };
                        let draw_distance = drawable.draw_distance();
                        if draw_distance > 0.0 && frame.data.distance > draw_distance {
                            continue;
                        }
                        Self::process_geometry(thread, drawable, frame, drawable_data, passes);
                        geometries.insert(thread, Arc::clone(drawable));
                        if frame.z_range.is_valid() {
                            scene_z_range.accumulate(thread, frame.z_range);
                        }
                    } else if flags.contains(DrawableFlags::LIGHT) {
                        let Some(light) = drawable.light() else {
                            continue;
                        };
                        if light.is_black() || light.light_mask == 0 {
                            continue;
                        }
                        lights.insert(thread, Arc::clone(drawable));
                    }
                }
            });

        self.visible_geometries = self.threaded_geometries.take_merged();
        self.visible_geometries.sort_by_key(|drawable| drawable.drawable_index());

        let mut light_drawables = self.threaded_lights.take_merged();
        light_drawables.sort_by_key(|drawable| drawable.drawable_index());
        light_drawables.dedup_by_key(|drawable| drawable.drawable_index());
        let frame_number = self.frame.frame_number;
        for drawable in &light_drawables {
            let Some(light) = drawable.light() else {
                continue;
            };
            let index = drawable.drawable_index();
            let mut scene_light = self
                .light_cache
                .remove(&index)
                .filter(SceneLight::is_alive)
                .unwrap_or_else(|| SceneLight::new(drawable, light.clone()));
            scene_light.begin_frame(light.clone(), frame_number);
            self.visible_lights.push(scene_light);
        }

        debug!(
            "Frame {}: {} visible geometries, {} visible lights",
            frame_number,
            self.visible_geometries.len(),
            self.visible_lights.len()
        );
    }

    fn process_geometry(
        thread: usize,
        drawable: &Arc<dyn Drawable>,
        frame: &DrawableFrame,
        drawable_data: &SceneDrawableData,
        passes: &[ScenePass],
    ) {
        let index = drawable.drawable_index();
        let mut traits = DrawableTraits::VISIBLE_GEOMETRY;
        for (source_index, technique) in frame.techniques.iter().enumerate() {
            let Some(technique) = technique else {
                continue;
            };
            for pass in passes {
                if pass.add_source_batch(thread, drawable, source_index, technique) {
                    traits |= DrawableTraits::FORWARD_LIT;
                }
            }
        }
        drawable_data.add_traits(index, traits);
    }

    /// Decide shadows, find lit geometries and casters, allocate shadow maps,
    /// build shadow batches and accumulate per-drawable lights.
    pub fn process_visible_lights(&mut self) {
        let Some(callback) = self.callback.clone() else {
            warn!("process_visible_lights called before begin_frame");
            return;
        };
        let Some(spatial) = self.spatial.clone() else {
            return;
        };

        let has_shadow_pass = self.passes.iter().any(|pass| pass.as_shadow().is_some());
        let camera = self.frame.camera;
        for light in &mut self.visible_lights {
            let distance = light.light().distance_to_camera(&camera);
            let has_shadow = has_shadow_pass && callback.has_shadow(light.light(), distance);
            light.set_shadow(has_shadow, distance);
        }

        self.update_lit_geometries_and_shadow_casters(spatial.as_ref());
        self.allocate_shadow_maps(callback.as_ref());
        self.update_shadow_casters();
        self.collect_shadow_batches(callback.as_ref());

        self.main_light_index = self
            .visible_lights
            .iter()
            .enumerate()
            .filter(|(_, light)| light.light().light_type == LightType::Directional)
            .min_by_key(|(index, light)| (light.light().importance.tier(), *index))
            .map(|(index, _)| index);

        self.accumulate_lights();
    }

    fn update_lit_geometries_and_shadow_casters(&mut self, spatial: &dyn SpatialIndex) {
        self.shadow_casters_to_update.clear(self.num_threads);
        let ctx = SceneLightProcessContext {
            frame: &self.frame,
            scene_z_range: self.scene_z_range.get(),
            visible_geometries: &self.visible_geometries,
            drawable_data: &self.drawable_data,
            spatial,
            shadow_casters_to_update: &self.shadow_casters_to_update,
            shadows: &self.shadows,
        };
        let ctx = &ctx;

        let mut tasks = TaskQueue::new();
        for light in &mut self.visible_lights {
            tasks.post(0, move |thread| light.update_lit_geometries_and_shadow_casters(ctx, thread));
        }
        tasks.complete(&self.work_queue, 0);
    }

    /// Biggest requests first so large lights are not starved by small ones.
    fn allocate_shadow_maps(&mut self, callback: &dyn SceneBatchCollectorCallback) {
        let mut order: Vec<usize> = (0..self.visible_lights.len())
            .filter(|&index| self.visible_lights[index].has_shadow())
            .collect();
        let shadows = &self.shadows;
        let lights = &self.visible_lights;
        order.sort_by_key(|&index| (std::cmp::Reverse(lights[index].shadow_map_area(shadows)), index));

        for index in order {
            let light = &mut self.visible_lights[index];
            if !light.allocate_shadow_maps(callback, &self.shadows) {
                self.diagnostics.record_shadow_map_allocation_failure();
                warn!(
                    "Out of shadow atlas space; light {} is drawn without shadows",
                    light.drawable_index()
                );
            }
        }
    }

    /// Casters outside the view have not been updated yet.
    fn update_shadow_casters(&mut self) {
        let mut casters = self.shadow_casters_to_update.take_merged();
        casters.sort_by_key(|caster| caster.drawable_index());
        casters.dedup_by_key(|caster| caster.drawable_index());
        if casters.is_empty() {
            return;
        }

        let evaluator = ZRangeEvaluator::new(&self.frame.camera);
        let update_ctx = DrawableUpdateContext {
            frame: &self.frame,
            evaluator: &evaluator,
            default_material: &self.default_material,
            material_quality: self.material_quality,
        };
        let drawable_data = &self.drawable_data;
        self.work_queue
            .for_each_parallel(self.thresholds.drawables, &casters, |_, _, chunk| {
                for caster in chunk {
                    drawable_data.get_or_update(caster.as_ref(), &update_ctx);
                }
            });
    }

    fn collect_shadow_batches(&mut self, callback: &dyn SceneBatchCollectorCallback) {
        let Some(shadow_pass) = self.passes.iter().find_map(ScenePass::as_shadow) else {
            return;
        };
        let drawable_data = &self.drawable_data;
        let default_material = &self.default_material;
        let diagnostics = &self.diagnostics;
        let camera = &self.frame.camera;

        {
            let mut tasks = TaskQueue::new();
            for (light_index, light) in self.visible_lights.iter_mut().enumerate() {
                if !light.has_shadow() {
                    continue;
                }
                let light_hash = light.pipeline_state_hash();
                for (split_index, split) in light.splits_mut().iter_mut().enumerate() {
                    tasks.post(0, move |thread| {
                        let dropped = shadow_pass.collect_shadow_batches(
                            thread,
                            light_index,
                            light_hash,
                            split_index,
                            split,
                            drawable_data,
                            default_material,
                            camera,
                        );
                        diagnostics.record_dropped_batches(dropped);
                    });
                }
            }
            tasks.complete(&self.work_queue, 0);
        }

        if let Some(shadow_pass) = self.passes.iter_mut().find_map(ScenePass::as_shadow_mut) {
            shadow_pass.finalize_shadow_batches(
                &mut self.visible_lights,
                &self.frame.camera,
                callback,
                &self.diagnostics,
            );
        }
    }

    fn accumulate_lights(&mut self) {
        let lights = &self.visible_lights;
        let drawable_data = &self.drawable_data;
        let main_light_index = self.main_light_index;
        let max_pixel_lights = self.max_pixel_lights;

        self.work_queue.for_each_parallel_mut(
            self.thresholds.lit_geometries,
            &mut self.drawable_lighting,
            |_, offset, chunk| {
                for (chunk_index, accumulator) in chunk.iter_mut().enumerate() {
                    let index = offset + chunk_index;
                    accumulator.reset(max_pixel_lights);
                    if !drawable_data.traits(index).contains(DrawableTraits::FORWARD_LIT) {
                        continue;
                    }
                    let Some(frame) = drawable_data.frame(index) else {
                        continue;
                    };
                    for (light_index, scene_light) in lights.iter().enumerate() {
                        if !scene_light.is_lit_geometry(index) {
                            continue;
                        }
                        let light = scene_light.light();
                        let penalty = if main_light_index == Some(light_index) {
                            MAIN_LIGHT_PENALTY
                        } else {
                            light.distance_to(&frame.data.world_bounds) / light.intensity_divisor()
                        };
                        accumulator.accumulate_light(
                            LightAccumulationContext {
                                importance: light.importance,
                                light_index: light_index as u32,
                            },
                            penalty,
                        );
                    }
                }
            },
        );
    }

    /// Build, resolve and sort the batches of every non-shadow pass.
    pub fn collect_scene_batches(&mut self) {
        let Some(callback) = self.callback.clone() else {
            warn!("collect_scene_batches called before begin_frame");
            return;
        };
        let ctx = BatchCollectionContext {
            work_queue: &self.work_queue,
            callback: callback.as_ref(),
            camera: &self.frame.camera,
            default_material: &self.default_material,
            drawable_data: &self.drawable_data,
            lights: &self.visible_lights,
            drawable_lighting: &self.drawable_lighting,
            diagnostics: &self.diagnostics,
            batch_threshold: self.thresholds.batches,
        };
        for pass in &mut self.passes {
            pass.collect_scene_batches(&ctx);
            pass.sort_scene_batches();
        }
    }

    /// Drop every cached pipeline state, e.g. after a device reset.
    pub fn invalidate_pipeline_states(&self) {
        for pass in &self.passes {
            pass.invalidate_pipeline_states();
        }
    }

    pub fn frame_info(&self) -> &FrameInfo {
        &self.frame
    }

    pub fn diagnostics(&self) -> &FrameDiagnostics {
        &self.diagnostics
    }

    pub fn scene_z_range(&self) -> ZRange {
        self.scene_z_range.get()
    }

    pub fn visible_geometries(&self) -> &[Arc<dyn Drawable>] {
        &self.visible_geometries
    }

    pub fn visible_lights(&self) -> &[SceneLight] {
        &self.visible_lights
    }

    pub fn main_light_index(&self) -> Option<usize> {
        self.main_light_index
    }

    pub fn main_light(&self) -> Option<&SceneLight> {
        self.main_light_index.and_then(|index| self.visible_lights.get(index))
    }

    pub fn drawable_frame(&self, drawable_index: usize) -> Option<&DrawableFrame> {
        self.drawable_data.frame(drawable_index)
    }

    pub fn pixel_lights(&self, drawable_index: usize) -> &[LightScore] {
        self.drawable_lighting
            .get(drawable_index)
            .map_or(&[][..], DrawableLightAccumulator::pixel_lights)
    }

    pub fn vertex_light_indices(&self, drawable_index: usize) -> [u32; MAX_VERTEX_LIGHTS] {
        self.drawable_lighting
            .get(drawable_index)
            .map_or([NO_LIGHT; MAX_VERTEX_LIGHTS], DrawableLightAccumulator::vertex_lights)
    }

    pub fn sorted_shadow_batches(&self, light_index: usize, split_index: usize) -> &[BatchSortedByState] {
        self.visible_lights
            .get(light_index)
            .and_then(|light| light.splits().get(split_index))
            .map_or(&[][..], |split| split.sorted_shadow_batches.as_slice())
    }

    pub fn num_cached_lights(&self) -> usize {
        self.light_cache.len() + self.visible_lights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::pipeline_factory::{DefaultSceneCallback, PermissiveShaderCompiler};
    use crate::renderer::shadow_atlas::ShadowMapAllocator;
    use crate::renderer::geometry::Geometry;
    use crate::scene::drawable::StaticModel;
    use crate::scene::light::{Light, LightImportance, LightNode};
    use crate::scene::spatial::LinearSpatialIndex;
    use glam::Vec3;
    use std::sync::Mutex;

    fn setup(drawables: Vec<Arc<dyn Drawable>>) -> (SceneBatchCollector, Arc<LinearSpatialIndex>, Arc<DefaultSceneCallback>) {
        let settings = RenderSettings::default();
        let queue = Arc::new(WorkQueue::new(2).expect("pool"));
        let collector = SceneBatchCollector::new(queue, &settings);
        let mut spatial = LinearSpatialIndex::new();
        for drawable in drawables {
            spatial.insert(drawable);
        }
        let callback = Arc::new(DefaultSceneCallback::new(
            Arc::new(PermissiveShaderCompiler),
            Arc::new(Mutex::new(ShadowMapAllocator::new(4096, 1, 128))),
            &settings.shadows,
            true,
        ));
        (collector, Arc::new(spatial), callback)
    }

    fn run(collector: &mut SceneBatchCollector, spatial: &Arc<LinearSpatialIndex>, callback: &Arc<DefaultSceneCallback>) {
        collector.begin_frame(FrameInfo::default(), spatial.clone(), callback.clone());
        let drawables = spatial.drawables().to_vec();
        collector.process_visible_drawables(&drawables);
        collector.process_visible_lights();
        collector.collect_scene_batches();
    }

    #[test]
    fn main_light_prefers_importance_then_index() {
        let (mut collector, spatial, callback) = setup(vec![
            Arc::new(LightNode::new(0, Light::directional(Vec3::NEG_Y))),
            Arc::new(LightNode::new(
                1,
                Light::directional(Vec3::NEG_X).with_importance(LightImportance::Important),
            )),
            Arc::new(LightNode::new(
                2,
                Light::directional(Vec3::NEG_Z).with_importance(LightImportance::Important),
            )),
            Arc::new(LightNode::new(3, Light::point(Vec3::ZERO, 5.0).with_importance(LightImportance::Important))),
        ]);
        run(&mut collector, &spatial, &callback);
        assert_eq!(collector.visible_lights().len(), 4);
        assert_eq!(collector.main_light().map(SceneLight::drawable_index), Some(1));
    }

    #[test]
    fn black_and_masked_lights_are_ignored() {
        let (mut collector, spatial, callback) = setup(vec![
            Arc::new(LightNode::new(0, Light::directional(Vec3::NEG_Y).with_brightness(0.0))),
            Arc::new(LightNode::new(1, Light::point(Vec3::ZERO, 5.0).with_light_mask(0))),
        ]);
        run(&mut collector, &spatial, &callback);
        assert!(collector.visible_lights().is_empty());
        assert!(collector.main_light().is_none());
    }

    #[test]
    fn processing_twice_replaces_results() {
        let cube = Arc::new(Geometry::cube("cube"));
        let (mut collector, spatial, callback) = setup(vec![
            Arc::new(StaticModel::new(0, Arc::clone(&cube), None)),
            Arc::new(StaticModel::new(1, cube, None)),
        ]);
        collector.begin_frame(FrameInfo::default(), spatial.clone(), callback.clone());
        let drawables = spatial.drawables().to_vec();
        collector.process_visible_drawables(&drawables);
        collector.process_visible_drawables(&drawables);
        assert_eq!(collector.visible_geometries().len(), 2);
        collector.process_visible_lights();
        collector.collect_scene_batches();
        let pass = collector.scene_passes()[0].as_forward_lighting().expect("forward pass");
        assert_eq!(pass.lit_base_batches().len(), 2);
    }

    #[test]
    fn draw_distance_culls_geometry() {
        let cube = Arc::new(Geometry::cube("cube"));
        let (mut collector, spatial, callback) = setup(vec![
            Arc::new(StaticModel::new(0, Arc::clone(&cube), None).with_draw_distance(1.0)),
            Arc::new(StaticModel::new(1, cube, None)),
        ]);
        run(&mut collector, &spatial, &callback);
        let indices: Vec<_> = collector.visible_geometries().iter().map(|d| d.drawable_index()).collect();
        assert_eq!(indices, vec![1]);
    }

    #[test]
    fn lights_are_evicted_after_unseen_frames() {
        let (mut collector, spatial, callback) = setup(vec![Arc::new(LightNode::new(
            0,
            Light::directional(Vec3::NEG_Y),
        ))]);
        run(&mut collector, &spatial, &callback);
        assert_eq!(collector.num_cached_lights(), 1);

        let frame = FrameInfo {
            frame_number: 1000,
            ..FrameInfo::default()
        };
        collector.begin_frame(frame, spatial.clone(), callback.clone());
        assert_eq!(collector.num_cached_lights(), 0);
    }
}
