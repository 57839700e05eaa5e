use std::sync::Arc;

use glam::UVec2;

use super::pipeline_cache::{ScenePipelineStateContext, ScenePipelineStateKey};
use super::pipeline_state::PipelineState;
use super::shadow_atlas::ShadowMap;
use crate::scene::light::Light;

/// Hooks the collector calls out to. Only `has_shadow` and
/// `get_temporary_shadow_map` may be called while workers are running;
/// `create_pipeline_state` is only ever called from the collecting thread.
pub trait SceneBatchCollectorCallback: Send + Sync {
    /// `None` marks the key as failed until the cache is invalidated.
    fn create_pipeline_state(
        &self,
        key: &ScenePipelineStateKey,
        ctx: &ScenePipelineStateContext<'_>,
    ) -> Option<Arc<PipelineState>>;

    fn has_shadow(&self, light: &Light, distance: f32) -> bool;

    fn get_temporary_shadow_map(&self, size: UVec2) -> Option<ShadowMap>;
}
