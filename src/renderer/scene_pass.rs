use std::sync::Arc;

use super::batch::{BaseSceneBatch, IntermediateSceneBatch};
use super::callback::SceneBatchCollectorCallback;
use super::diagnostics::FrameDiagnostics;
use super::internal::drawable_data::SceneDrawableData;
use super::internal::threaded_vector::ThreadedVector;
use super::internal::threading::WorkQueue;
use super::light_accumulator::{DrawableLightAccumulator, NO_LIGHT};
use super::material::{Material, Pass, Technique};
use super::pipeline_cache::{
    PipelineLookup, ScenePipelineStateCache, ScenePipelineStateContext, ScenePipelineStateKey,
};
use super::scene_light::{SceneLight, SceneLightShadowSplit};
use super::sorting::{
    sort_base_batches, sort_batches_by_state, sort_light_batches, BatchSortOrder,
    LightBatchSortedByState, SortedBatches,
};
use crate::scene::camera::Camera;
use crate::scene::drawable::Drawable;
use crate::settings::{ScenePassConfig, ScenePassKind};

/// Index of a pass registered on the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScenePassId(pub usize);

/// Shared inputs of batch collection, valid for one frame.
pub struct BatchCollectionContext<'a> {
    pub work_queue: &'a WorkQueue,
    pub callback: &'a dyn SceneBatchCollectorCallback,
    pub camera: &'a Camera,
    pub default_material: &'a Arc<Material>,
    pub drawable_data: &'a SceneDrawableData,
    pub lights: &'a [SceneLight],
    /// Indexed by drawable index.
    pub drawable_lighting: &'a [DrawableLightAccumulator],
    pub diagnostics: &'a FrameDiagnostics,
    pub batch_threshold: usize,
}

impl BatchCollectionContext<'_> {
    fn light(&self, light_index: u32) -> Option<&SceneLight> {
        if light_index == NO_LIGHT {
            return None;
        }
        self.lights.get(light_index as usize)
    }
}

/// Shader define for a pass tag, e.g. `("OPAQUE", "LIGHT")` gives `"OPAQUE_LIGHT "`.
pub fn tag_define(tag: &str, suffix: &str) -> String {
    let tag = tag.trim();
    match (tag.is_empty(), suffix.is_empty()) {
        (true, true) => String::new(),
        (true, false) => format!("{suffix} "),
        (false, true) => format!("{tag} "),
        (false, false) => format!("{tag}_{suffix} "),
    }
}

/// One pipeline state cache together with the defines its states are built with.
#[derive(Default)]
struct SubPass {
    defines: String,
    cache: ScenePipelineStateCache,
}

impl SubPass {
    fn new(defines: String) -> Self {
        Self {
            defines,
            cache: ScenePipelineStateCache::new(),
        }
    }

    /// Fill the pipeline state from the cache. `false` means the key is known to fail.
    fn lookup(&self, batch: &mut BaseSceneBatch, light_hash: u64, camera: &Camera) -> bool {
        let key = ScenePipelineStateKey::new(batch, light_hash, camera.reverse_culling);
        match self.cache.get_pipeline_state(&key) {
            PipelineLookup::Hit(state) => {
                batch.pipeline_state = Some(state);
                true
            }
            PipelineLookup::Miss => true,
            PipelineLookup::Failed => false,
        }
    }

    /// Create missing states on the calling thread and drop batches that still have none.
    /// Returns the number of dropped batches.
    fn resolve(
        &self,
        batches: &mut Vec<BaseSceneBatch>,
        ctx: &BatchCollectionContext<'_>,
    ) -> usize {
        for batch in batches.iter_mut().filter(|batch| batch.pipeline_state.is_none()) {
            let light = ctx.light(batch.light_index);
            let light_hash = light.map_or(0, SceneLight::pipeline_state_hash);
            let key = ScenePipelineStateKey::new(batch, light_hash, ctx.camera.reverse_culling);
            let state_ctx = ScenePipelineStateContext {
                shader_defines: &self.defines,
                shadow_pass: false,
                camera: ctx.camera,
                light,
            };
            batch.pipeline_state =
                self.cache
                    .get_or_create_pipeline_state(&key, &state_ctx, ctx.callback, ctx.diagnostics);
        }
        let before = batches.len();
        batches.retain(|batch| batch.pipeline_state.is_some());
        before - batches.len()
    }
}

fn make_batch(
    ctx: &BatchCollectionContext<'_>,
    intermediate: &IntermediateSceneBatch,
    light_index: u32,
    pass: &Arc<Pass>,
) -> Option<BaseSceneBatch> {
    let frame = ctx.drawable_data.frame(intermediate.drawable_index())?;
    let source = frame.data.batches.get(intermediate.source_batch_index)?;
    Some(BaseSceneBatch::new(
        light_index,
        &intermediate.drawable,
        intermediate.source_batch_index,
        source,
        pass,
        ctx.default_material,
    ))
}

fn merged_intermediates(vector: &mut ThreadedVector<IntermediateSceneBatch>) -> Vec<IntermediateSceneBatch> {
    let mut merged = vector.take_merged();
    merged.sort_by_key(IntermediateSceneBatch::order_key);
    merged
}

/// Emits one batch per source batch whose technique has the configured pass.
pub struct UnlitScenePass {
    tag: String,
    base_pass: String,
    sort_order: BatchSortOrder,
    intermediates: ThreadedVector<IntermediateSceneBatch>,
    base: SubPass,
    batches: Vec<BaseSceneBatch>,
    sorted_batches: SortedBatches,
}

impl UnlitScenePass {
    pub fn new(tag: &str, base_pass: &str, sort_order: BatchSortOrder) -> Self {
        Self {
            tag: tag.to_owned(),
            base_pass: base_pass.to_owned(),
            sort_order,
            intermediates: ThreadedVector::new(),
            base: SubPass::new(tag_define(tag, "UNLIT")),
            batches: Vec::new(),
            sorted_batches: SortedBatches::default(),
        }
    }

    fn begin_frame(&mut self, num_threads: usize) {
        self.intermediates.clear(num_threads);
        self.batches.clear();
        self.sorted_batches = SortedBatches::default();
    }

    fn add_source_batch(
        &self,
        thread_index: usize,
        drawable: &Arc<dyn Drawable>,
        source_batch_index: usize,
        technique: &Technique,
    ) -> bool {
        if let Some(pass) = technique.pass(&self.base_pass) {
            self.intermediates.insert(
                thread_index,
                IntermediateSceneBatch {
                    drawable: Arc::clone(drawable),
                    source_batch_index,
                    base_pass: Some(Arc::clone(pass)),
                    additional_pass: None,
                },
            );
        }
        false
    }

    fn collect_scene_batches(&mut self, ctx: &BatchCollectionContext<'_>) {
        let intermediates = merged_intermediates(&mut self.intermediates);
        let base = &self.base;
        let built = ctx.work_queue.map_parallel(ctx.batch_threshold, &intermediates, |_, intermediate| {
            let pass = intermediate.base_pass.as_ref()?;
            let mut batch = make_batch(ctx, intermediate, NO_LIGHT, pass)?;
            base.lookup(&mut batch, 0, ctx.camera).then_some(batch)
        });

        let mut dropped = built.iter().filter(|batch| batch.is_none()).count();
        self.batches = built.into_iter().flatten().collect();
        dropped += self.base.resolve(&mut self.batches, ctx);
        ctx.diagnostics.record_dropped_batches(dropped);
    }

    fn sort_scene_batches(&mut self) {
        self.sorted_batches = sort_base_batches(&self.batches, self.sort_order);
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn batches(&self) -> &[BaseSceneBatch] {
        &self.batches
    }

    pub fn sorted_batches(&self) -> &SortedBatches {
        &self.sorted_batches
    }
}

/// Opaque pass lit by per-pixel lights: an unlit or lit base batch per
/// source batch plus one additive batch per remaining per-pixel light.
pub struct ForwardLightingScenePass {
    tag: String,
    base_pass: String,
    lit_base_pass: String,
    light_pass: String,
    sort_order: BatchSortOrder,
    unlit_intermediates: ThreadedVector<IntermediateSceneBatch>,
    lit_intermediates: ThreadedVector<IntermediateSceneBatch>,
    unlit_base: SubPass,
    lit_base: SubPass,
    additional_light: SubPass,
    unlit_base_batches: Vec<BaseSceneBatch>,
    lit_base_batches: Vec<BaseSceneBatch>,
    light_batches: Vec<BaseSceneBatch>,
    sorted_unlit_base_batches: SortedBatches,
    sorted_lit_base_batches: SortedBatches,
    sorted_light_batches: Vec<LightBatchSortedByState>,
}

struct LitBatchOutput {
    base: Option<BaseSceneBatch>,
    lights: Vec<BaseSceneBatch>,
    dropped: usize,
}

impl ForwardLightingScenePass {
    pub fn new(
        tag: &str,
        base_pass: &str,
        lit_base_pass: &str,
        light_pass: &str,
        sort_order: BatchSortOrder,
    ) -> Self {
        Self {
            tag: tag.to_owned(),
            base_pass: base_pass.to_owned(),
            lit_base_pass: lit_base_pass.to_owned(),
            light_pass: light_pass.to_owned(),
            sort_order,
            unlit_intermediates: ThreadedVector::new(),
            lit_intermediates: ThreadedVector::new(),
            unlit_base: SubPass::new(tag_define(tag, "UNLIT")),
            lit_base: SubPass::new(tag_define(tag, "LITBASE")),
            additional_light: SubPass::new(tag_define(tag, "LIGHT")),
            unlit_base_batches: Vec::new(),
            lit_base_batches: Vec::new(),
            light_batches: Vec::new(),
            sorted_unlit_base_batches: SortedBatches::default(),
            sorted_lit_base_batches: SortedBatches::default(),
            sorted_light_batches: Vec::new(),
        }
    }

    fn begin_frame(&mut self, num_threads: usize) {
        self.unlit_intermediates.clear(num_threads);
        self.lit_intermediates.clear(num_threads);
        self.unlit_base_batches.clear();
        self.lit_base_batches.clear();
        self.light_batches.clear();
        self.sorted_unlit_base_batches = SortedBatches::default();
        self.sorted_lit_base_batches = SortedBatches::default();
        self.sorted_light_batches.clear();
    }

    fn add_source_batch(
        &self,
        thread_index: usize,
        drawable: &Arc<dyn Drawable>,
        source_batch_index: usize,
        technique: &Technique,
    ) -> bool {
        let intermediate = |base_pass, additional_pass| IntermediateSceneBatch {
            drawable: Arc::clone(drawable),
            source_batch_index,
            base_pass,
            additional_pass,
        };
        let base = technique.pass(&self.base_pass).cloned();
        let lit_base = technique.pass(&self.lit_base_pass).cloned();
        let light = technique.pass(&self.light_pass).cloned();

        match (light, lit_base, base) {
            (Some(light), Some(lit_base), _) => {
                self.lit_intermediates
                    .insert(thread_index, intermediate(Some(lit_base), Some(light)));
                true
            }
            (Some(light), None, base) => {
                if base.is_some() {
                    self.unlit_intermediates.insert(thread_index, intermediate(base, None));
                }
                self.lit_intermediates.insert(thread_index, intermediate(None, Some(light)));
                true
            }
            (None, _, Some(base)) => {
                self.unlit_intermediates.insert(thread_index, intermediate(Some(base), None));
                false
            }
            (None, _, None) => false,
        }
    }

    fn collect_scene_batches(&mut self, ctx: &BatchCollectionContext<'_>) {
        let unlit = merged_intermediates(&mut self.unlit_intermediates);
        let unlit_base = &self.unlit_base;
        let built = ctx.work_queue.map_parallel(ctx.batch_threshold, &unlit, |_, intermediate| {
            let pass = intermediate.base_pass.as_ref()?;
            let mut batch = make_batch(ctx, intermediate, NO_LIGHT, pass)?;
            unlit_base.lookup(&mut batch, 0, ctx.camera).then_some(batch)
        });
        let mut dropped = built.iter().filter(|batch| batch.is_none()).count();
        self.unlit_base_batches = built.into_iter().flatten().collect();

        let lit = merged_intermediates(&mut self.lit_intermediates);
        let (lit_base, additional_light) = (&self.lit_base, &self.additional_light);
        let outputs = ctx.work_queue.map_parallel(ctx.batch_threshold, &lit, |_, intermediate| {
            Self::build_lit_batches(ctx, intermediate, lit_base, additional_light)
        });
        for output in outputs {
            dropped += output.dropped;
            self.lit_base_batches.extend(output.base);
            self.light_batches.extend(output.lights);
        }

        dropped += self.unlit_base.resolve(&mut self.unlit_base_batches, ctx);
        dropped += self.lit_base.resolve(&mut self.lit_base_batches, ctx);
        dropped += self.additional_light.resolve(&mut self.light_batches, ctx);
        ctx.diagnostics.record_dropped_batches(dropped);
    }

    fn build_lit_batches(
        ctx: &BatchCollectionContext<'_>,
        intermediate: &IntermediateSceneBatch,
        lit_base: &SubPass,
        additional_light: &SubPass,
    ) -> LitBatchOutput {
        let mut output = LitBatchOutput {
            base: None,
            lights: Vec::new(),
            dropped: 0,
        };
        let pixel_lights = ctx
            .drawable_lighting
            .get(intermediate.drawable_index())
            .map_or(&[][..], DrawableLightAccumulator::pixel_lights);

        let mut additional = pixel_lights;
        if let Some(pass) = &intermediate.base_pass {
            let base_light = pixel_lights.first().map_or(NO_LIGHT, |score| score.light_index);
            if !pixel_lights.is_empty() {
                additional = &pixel_lights[1..];
            }
            match make_batch(ctx, intermediate, base_light, pass) {
                Some(mut batch) => {
                    let light_hash = ctx.light(base_light).map_or(0, SceneLight::pipeline_state_hash);
                    if lit_base.lookup(&mut batch, light_hash, ctx.camera) {
                        output.base = Some(batch);
                    } else {
                        output.dropped += 1;
                    }
                }
                None => output.dropped += 1,
            }
        }

        let Some(light_pass) = &intermediate.additional_pass else {
            return output;
        };
        for score in additional {
            let Some(light) = ctx.light(score.light_index) else {
                continue;
            };
            let Some(mut batch) = make_batch(ctx, intermediate, score.light_index, light_pass) else {
                output.dropped += 1;
                continue;
            };
            if additional_light.lookup(&mut batch, light.pipeline_state_hash(), ctx.camera) {
                output.lights.push(batch);
            } else {
                output.dropped += 1;
            }
        }
        output
    }

    fn sort_scene_batches(&mut self) {
        self.sorted_unlit_base_batches = sort_base_batches(&self.unlit_base_batches, self.sort_order);
        self.sorted_lit_base_batches = sort_base_batches(&self.lit_base_batches, self.sort_order);
        self.sorted_light_batches = sort_light_batches(&self.light_batches);
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn unlit_base_batches(&self) -> &[BaseSceneBatch] {
        &self.unlit_base_batches
    }

    pub fn lit_base_batches(&self) -> &[BaseSceneBatch] {
        &self.lit_base_batches
    }

    pub fn light_batches(&self) -> &[BaseSceneBatch] {
        &self.light_batches
    }

    pub fn sorted_unlit_base_batches(&self) -> &SortedBatches {
        &self.sorted_unlit_base_batches
    }

    pub fn sorted_lit_base_batches(&self) -> &SortedBatches {
        &self.sorted_lit_base_batches
    }

    pub fn sorted_light_batches(&self) -> &[LightBatchSortedByState] {
        &self.sorted_light_batches
    }
}

/// Builds shadow caster batches into the splits of shadowed lights.
pub struct ShadowScenePass {
    shadow_pass: String,
    sub_pass: SubPass,
    /// (light index, split index, batch index) of batches missing a pipeline state.
    pending: ThreadedVector<(usize, usize, usize)>,
}

impl ShadowScenePass {
    pub fn new(tag: &str, shadow_pass: &str) -> Self {
        Self {
            shadow_pass: shadow_pass.to_owned(),
            sub_pass: SubPass::new(tag_define(tag, "")),
            pending: ThreadedVector::new(),
        }
    }

    fn begin_frame(&mut self, num_threads: usize) {
        self.pending.clear(num_threads);
    }

    /// Emit one batch per caster source batch whose technique has the shadow pass.
    ///
    /// Casters must have been updated this frame. Casters beyond their shadow
    /// distance, or their draw distance when that is closer, are skipped.
    #[allow(clippy::too_many_arguments)]
    pub fn collect_shadow_batches(
        &self,
        thread_index: usize,
        light_index: usize,
        light_hash: u64,
        split_index: usize,
        split: &mut SceneLightShadowSplit,
        drawable_data: &SceneDrawableData,
        default_material: &Arc<Material>,
        camera: &Camera,
    ) -> usize {
        let mut dropped = 0;
        for caster in &split.shadow_casters {
            let mut max_distance = caster.shadow_distance();
            let draw_distance = caster.draw_distance();
            if draw_distance > 0.0 && (max_distance <= 0.0 || draw_distance < max_distance) {
                max_distance = draw_distance;
            }
            let Some(frame) = drawable_data.frame(caster.drawable_index()) else {
                continue;
            };
            if max_distance > 0.0 && frame.data.distance > max_distance {
                continue;
            }

            for (source_index, source) in frame.data.batches.iter().enumerate() {
                let Some(pass) = frame
                    .techniques
                    .get(source_index)
                    .and_then(Option::as_ref)
                    .and_then(|technique| technique.pass(&self.shadow_pass))
                else {
                    continue;
                };
                let mut batch =
                    BaseSceneBatch::new(NO_LIGHT, caster, source_index, source, pass, default_material);
                if !self.sub_pass.lookup(&mut batch, light_hash, camera) {
                    dropped += 1;
                    continue;
                }
                if batch.pipeline_state.is_none() {
                    self.pending.insert(
                        thread_index,
                        (light_index, split_index, split.shadow_batches.len()),
                    );
                }
                split.shadow_batches.push(batch);
            }
        }
        dropped
    }

    /// Resolve pending pipeline states, drop batches without one and sort every split.
    pub fn finalize_shadow_batches(
        &mut self,
        lights: &mut [SceneLight],
        camera: &Camera,
        callback: &dyn SceneBatchCollectorCallback,
        diagnostics: &FrameDiagnostics,
    ) {
        for (light_index, split_index, batch_index) in self.pending.take_merged() {
            let Some(light) = lights.get(light_index) else {
                continue;
            };
            let Some(batch) = light
                .splits()
                .get(split_index)
                .and_then(|split| split.shadow_batches.get(batch_index))
            else {
                continue;
            };
            let key = ScenePipelineStateKey::new(batch, light.pipeline_state_hash(), camera.reverse_culling);
            let state_ctx = ScenePipelineStateContext {
                shader_defines: &self.sub_pass.defines,
                shadow_pass: true,
                camera,
                light: Some(light),
            };
            let state = self
                .sub_pass
                .cache
                .get_or_create_pipeline_state(&key, &state_ctx, callback, diagnostics);

            if let Some(batch) = lights[light_index]
                .splits_mut()
                .get_mut(split_index)
                .and_then(|split| split.shadow_batches.get_mut(batch_index))
            {
                batch.pipeline_state = state;
            }
        }

        let mut dropped = 0;
        for split in lights.iter_mut().flat_map(|light| light.splits_mut().iter_mut()) {
            let before = split.shadow_batches.len();
            split.shadow_batches.retain(|batch| batch.pipeline_state.is_some());
            dropped += before - split.shadow_batches.len();
            split.sorted_shadow_batches = sort_batches_by_state(&split.shadow_batches);
        }
        diagnostics.record_dropped_batches(dropped);
    }

    pub fn shadow_pass(&self) -> &str {
        &self.shadow_pass
    }
}

/// A registered scene pass.
pub enum ScenePass {
    Unlit(UnlitScenePass),
    OpaqueForwardLighting(ForwardLightingScenePass),
    Shadow(ShadowScenePass),
}

impl ScenePass {
    pub fn from_config(config: &ScenePassConfig) -> Self {
        match config.kind {
            ScenePassKind::Unlit => {
                ScenePass::Unlit(UnlitScenePass::new(&config.tag, &config.base_pass, config.sort_order))
            }
            ScenePassKind::ForwardLighting => ScenePass::OpaqueForwardLighting(ForwardLightingScenePass::new(
                &config.tag,
                &config.base_pass,
                config.lit_base_pass.as_deref().unwrap_or("litbase"),
                config.light_pass.as_deref().unwrap_or("light"),
                config.sort_order,
            )),
            ScenePassKind::Shadow => ScenePass::Shadow(ShadowScenePass::new(&config.tag, &config.base_pass)),
        }
    }

    pub fn begin_frame(&mut self, num_threads: usize) {
        match self {
            ScenePass::Unlit(pass) => pass.begin_frame(num_threads),
            ScenePass::OpaqueForwardLighting(pass) => pass.begin_frame(num_threads),
            ScenePass::Shadow(pass) => pass.begin_frame(num_threads),
        }
    }

    /// Route one source batch. Returns whether the drawable needs per-pixel lighting.
    pub fn add_source_batch(
        &self,
        thread_index: usize,
        drawable: &Arc<dyn Drawable>,
        source_batch_index: usize,
        technique: &Technique,
    ) -> bool {
        match self {
            ScenePass::Unlit(pass) => {
                pass.add_source_batch(thread_index, drawable, source_batch_index, technique)
            }
            ScenePass::OpaqueForwardLighting(pass) => {
                pass.add_source_batch(thread_index, drawable, source_batch_index, technique)
            }
            // Shadow batches come from casters, not from visible geometry.
            ScenePass::Shadow(_) => false,
        }
    }

    pub fn collect_scene_batches(&mut self, ctx: &BatchCollectionContext<'_>) {
        match self {
            ScenePass::Unlit(pass) => pass.collect_scene_batches(ctx),
            ScenePass::OpaqueForwardLighting(pass) => pass.collect_scene_batches(ctx),
            ScenePass::Shadow(_) => {}
        }
    }

    pub fn sort_scene_batches(&mut self) {
        match self {
            ScenePass::Unlit(pass) => pass.sort_scene_batches(),
            ScenePass::OpaqueForwardLighting(pass) => pass.sort_scene_batches(),
            ScenePass::Shadow(_) => {}
        }
    }

    /// Forget every cached pipeline state, e.g. after shaders were reloaded.
    pub fn invalidate_pipeline_states(&self) {
        match self {
            ScenePass::Unlit(pass) => pass.base.cache.invalidate(),
            ScenePass::OpaqueForwardLighting(pass) => {
                pass.unlit_base.cache.invalidate();
                pass.lit_base.cache.invalidate();
                pass.additional_light.cache.invalidate();
            }
            ScenePass::Shadow(pass) => pass.sub_pass.cache.invalidate(),
        }
    }

    pub fn as_shadow(&self) -> Option<&ShadowScenePass> {
        match self {
            ScenePass::Shadow(pass) => Some(pass),
            _ => None,
        }
    }

    pub fn as_shadow_mut(&mut self) -> Option<&mut ShadowScenePass> {
        match self {
            ScenePass::Shadow(pass) => Some(pass),
            _ => None,
        }
    }

    pub fn as_unlit(&self) -> Option<&UnlitScenePass> {
        match self {
            ScenePass::Unlit(pass) => Some(pass),
            _ => None,
        }
    }

    pub fn as_forward_lighting(&self) -> Option<&ForwardLightingScenePass> {
        match self {
            ScenePass::OpaqueForwardLighting(pass) => Some(pass),
            _ => None,
        }
    }

    pub fn num_batches(&self) -> (usize, usize) {
        match self {
            ScenePass::Unlit(pass) => (pass.batches.len(), 0),
            ScenePass::OpaqueForwardLighting(pass) => (
                pass.unlit_base_batches.len() + pass.lit_base_batches.len(),
                pass.light_batches.len(),
            ),
            ScenePass::Shadow(_) => (0, 0),
        }
    }
}
