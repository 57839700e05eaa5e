use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};

use super::batch_renderer::{BatchRenderFlags, CameraUniform, SceneBatchRenderContext, SceneBatchRenderer};
use super::collector::SceneBatchCollector;
use super::device::{ClearFlags, GpuObject, RenderDevice};
use super::diagnostics::FrameStats;
use super::draw_queue::DrawCommandQueue;
use super::internal::threading::WorkQueue;
use super::pipeline_factory::{DefaultSceneCallback, ShaderCompiler};
use super::scene_pass::ScenePass;
use super::shadow_atlas::ShadowMapAllocator;
use super::sorting::SortedBatches;
use crate::scene::bounds::IntRect;
use crate::scene::camera::{Camera, FrameInfo};
use crate::scene::drawable::{Drawable, DrawableFlags};
use crate::scene::spatial::SpatialIndex;
use crate::settings::RenderSettings;

/// One camera rendering one scene into a viewport of the backbuffer.
///
/// Owns every piece of per-view state, so several views can render the same
/// scene independently. Only the work queue is shared.
pub struct CustomView {
    settings: RenderSettings,
    compiler: Arc<dyn ShaderCompiler>,
    shadow_allocator: Arc<Mutex<ShadowMapAllocator>>,
    /// Rebuilt when the device's constant buffer support changes or the device is reset.
    callback: Option<(bool, Arc<DefaultSceneCallback>)>,
    collector: SceneBatchCollector,
    renderer: SceneBatchRenderer,
    draw_queue: DrawCommandQueue,

    scene: Option<Arc<dyn SpatialIndex>>,
    camera: Option<Camera>,
    viewport: IntRect,
    frame_number: u32,
    visible_drawables: Vec<Arc<dyn Drawable>>,
}

/// Counters gathered while executing draw queues.
#[derive(Default)]
struct QueueTotals {
    commands: usize,
    draws: usize,
}

impl QueueTotals {
    fn add(&mut self, queue: &DrawCommandQueue) {
        self.commands += queue.len();
        self.draws += queue.num_draws();
    }
}

impl CustomView {
    pub fn new(settings: RenderSettings, work_queue: Arc<WorkQueue>, compiler: Arc<dyn ShaderCompiler>) -> Self {
        let shadows = &settings.shadows;
        let shadow_allocator = Arc::new(Mutex::new(ShadowMapAllocator::new(
            shadows.atlas_page_size,
            shadows.max_atlas_pages,
            shadows.min_shadow_map_size,
        )));
        Self {
            collector: SceneBatchCollector::new(work_queue, &settings),
            renderer: SceneBatchRenderer::new(settings.constant_buffer_page_size),
            draw_queue: DrawCommandQueue::new(),
            compiler,
            shadow_allocator,
            callback: None,
            scene: None,
            camera: None,
            viewport: IntRect::ZERO,
            frame_number: 0,
            visible_drawables: Vec::new(),
            settings,
        }
    }

    /// Set what to render. Returns false, and skips later frames, when the scene,
    /// camera or viewport is missing.
    pub fn define(
        &mut self,
        scene: Option<Arc<dyn SpatialIndex>>,
        camera: Option<Camera>,
        viewport: IntRect,
    ) -> bool {
        self.scene = scene;
        self.camera = camera;
        self.viewport = viewport;
        self.is_defined()
    }

    pub fn is_defined(&self) -> bool {
        self.scene.is_some() && self.camera.is_some() && !self.viewport.is_empty()
    }

    pub fn collector(&self) -> &SceneBatchCollector {
        &self.collector
    }

    pub fn collector_mut(&mut self) -> &mut SceneBatchCollector {
        &mut self.collector
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn shadow_allocator(&self) -> &Arc<Mutex<ShadowMapAllocator>> {
        &self.shadow_allocator
    }

    pub fn num_constant_buffer_pages(&self) -> usize {
        self.renderer.num_constant_buffer_pages()
    }

    fn scene_callback(&mut self, constant_buffers: bool) -> Arc<DefaultSceneCallback> {
        if let Some((enabled, callback)) = &self.callback {
            if *enabled == constant_buffers {
                return Arc::clone(callback);
            }
            debug!("Constant buffer support changed, rebuilding pipeline states");
            self.collector.invalidate_pipeline_states();
        }
        let callback = Arc::new(DefaultSceneCallback::new(
            Arc::clone(&self.compiler),
            Arc::clone(&self.shadow_allocator),
            &self.settings.shadows,
            constant_buffers,
        ));
        self.callback = Some((constant_buffers, Arc::clone(&callback)));
        callback
    }

    /// Collect and draw one frame.
    pub fn render(&mut self, device: &mut dyn RenderDevice, time_step: f32) -> FrameStats {
        let (Some(scene), Some(camera)) = (self.scene.clone(), self.camera) else {
            debug!("View is not defined, skipping frame");
            return FrameStats::default();
        };
        if self.viewport.is_empty() {
            return FrameStats::default();
        }

        let callback = self.scene_callback(device.constant_buffers_enabled());
        self.shadow_allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();

        self.frame_number = self.frame_number.wrapping_add(1);
        let frame = FrameInfo {
            frame_number: self.frame_number,
            time_step,
            camera,
            view_size: self.viewport.size(),
            view_rect: self.viewport,
        };
        self.collector.begin_frame(frame, Arc::clone(&scene), callback);

        self.visible_drawables.clear();
        scene.query_frustum(
            &camera.frustum(),
            DrawableFlags::GEOMETRY | DrawableFlags::LIGHT,
            camera.view_mask,
            &mut self.visible_drawables,
        );
        self.collector.process_visible_drawables(&self.visible_drawables);
        self.collector.process_visible_lights();
        self.collector.collect_scene_batches();

        self.renderer.begin_frame();
        let mut totals = QueueTotals::default();
        let atlas_guard = Arc::clone(&self.shadow_allocator);
        let mut atlas = atlas_guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.render_shadow_maps(device, &mut atlas, &mut totals);
        self.render_scene(device, &atlas, &camera, &mut totals);
        drop(atlas);

        self.frame_stats(totals)
    }

    fn render_shadow_maps(
        &mut self,
        device: &mut dyn RenderDevice,
        atlas: &mut ShadowMapAllocator,
        totals: &mut QueueTotals,
    ) {
        let Self {
            collector,
            renderer,
            draw_queue,
            ..
        } = self;
        let collector = &*collector;

        for light in collector.visible_lights().iter().filter(|light| light.has_shadow()) {
            for split in light.splits() {
                let Some(map) = split.shadow_map else {
                    continue;
                };
                if !atlas.begin_shadow_map(device, &map) {
                    continue;
                }
                let ctx = SceneBatchRenderContext {
                    collector,
                    shadow_atlas: &*atlas,
                };
                draw_queue.reset(device);
                if !renderer.set_camera(device, draw_queue, &ctx, &CameraUniform::from_shadow_camera(&split.shadow_camera)) {
                    continue;
                }
                let batches = split
                    .sorted_shadow_batches
                    .iter()
                    .filter_map(|sorted| split.shadow_batches.get(sorted.batch_index));
                renderer.render_batches(device, draw_queue, &ctx, BatchRenderFlags::empty(), batches);
                renderer.apply(device);
                draw_queue.execute(device);
                totals.add(draw_queue);
            }
        }
    }

    fn render_scene(
        &mut self,
        device: &mut dyn RenderDevice,
        atlas: &ShadowMapAllocator,
        camera: &Camera,
        totals: &mut QueueTotals,
    ) {
        device.set_render_target(None, None);
        device.set_viewport(self.viewport);
        device.clear(
            ClearFlags::COLOR | ClearFlags::DEPTH | ClearFlags::STENCIL,
            self.settings.clear_color,
            1.0,
            0,
        );

        let Self {
            collector,
            renderer,
            draw_queue,
            ..
        } = self;
        let collector = &*collector;
        let ctx = SceneBatchRenderContext {
            collector,
            shadow_atlas: atlas,
        };
        draw_queue.reset(device);
        if !renderer.set_camera(device, draw_queue, &ctx, &CameraUniform::from_camera(camera)) {
            warn!("Failed to bind camera block, skipping scene passes");
            return;
        }

        let passes = collector.scene_passes();
        let is_transparent = |pass: &ScenePass| {
            pass.as_unlit()
                .is_some_and(|unlit| matches!(unlit.sorted_batches(), SortedBatches::BackToFront(_)))
        };

        for pass in passes.iter().filter(|pass| !is_transparent(*pass)) {
            match pass {
                ScenePass::OpaqueForwardLighting(pass) => {
                    renderer.render_batches(
                        device,
                        draw_queue,
                        &ctx,
                        BatchRenderFlags::AMBIENT | BatchRenderFlags::VERTEX_LIGHTS,
                        pass.sorted_unlit_base_batches().iter(pass.unlit_base_batches()),
                    );
                    renderer.render_batches(
                        device,
                        draw_queue,
                        &ctx,
                        BatchRenderFlags::all(),
                        pass.sorted_lit_base_batches().iter(pass.lit_base_batches()),
                    );
                }
                ScenePass::Unlit(pass) => {
                    renderer.render_batches(
                        device,
                        draw_queue,
                        &ctx,
                        BatchRenderFlags::AMBIENT,
                        pass.sorted_batches().iter(pass.batches()),
                    );
                }
                ScenePass::Shadow(_) => {}
            }
        }

        for pass in passes.iter().filter_map(ScenePass::as_forward_lighting) {
            let batches = pass.light_batches();
            renderer.render_batches(
                device,
                draw_queue,
                &ctx,
                BatchRenderFlags::PIXEL_LIGHT,
                pass.sorted_light_batches()
                    .iter()
                    .filter_map(|sorted| batches.get(sorted.by_state.batch_index)),
            );
        }

        for pass in passes.iter().filter(|pass| is_transparent(*pass)).filter_map(ScenePass::as_unlit) {
            renderer.render_batches(
                device,
                draw_queue,
                &ctx,
                BatchRenderFlags::AMBIENT,
                pass.sorted_batches().iter(pass.batches()),
            );
        }

        renderer.apply(device);
        draw_queue.execute(device);
        totals.add(draw_queue);
    }

    fn frame_stats(&self, totals: QueueTotals) -> FrameStats {
        let collector = &self.collector;
        let (base_batches, light_batches) = collector
            .scene_passes()
            .iter()
            .map(ScenePass::num_batches)
            .fold((0, 0), |(base, light), (b, l)| (base + b, light + l));
        let splits = collector
            .visible_lights()
            .iter()
            .flat_map(|light| light.splits())
            .filter(|split| split.shadow_map.is_some());
        let (shadow_splits, shadow_batches) = splits.fold((0, 0), |(count, batches), split| {
            (count + 1, batches + split.shadow_batches.len())
        });

        let stats = FrameStats {
            frame_number: self.frame_number,
            visible_geometries: collector.visible_geometries().len() as u32,
            visible_lights: collector.visible_lights().len() as u32,
            shadow_splits: shadow_splits as u32,
            base_batches: base_batches as u32,
            light_batches: light_batches as u32,
            shadow_batches: shadow_batches as u32,
            draw_commands: totals.commands as u32,
            draws: totals.draws as u32,
            ..FrameStats::default()
        }
        .with_diagnostics(collector.diagnostics());
        debug!("Frame {}: {:?}", stats.frame_number, stats);
        stats
    }

    /// Recreate GPU objects after the device was lost and drop every cached pipeline state.
    pub fn on_device_reset(&mut self, device: &mut dyn RenderDevice) {
        self.renderer.on_device_reset(device);
        self.shadow_allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_device_reset(device);
        self.collector.invalidate_pipeline_states();
        self.callback = None;
    }

    pub fn release(&mut self, device: &mut dyn RenderDevice) {
        self.renderer.release(device);
        self.shadow_allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(device);
    }
}
