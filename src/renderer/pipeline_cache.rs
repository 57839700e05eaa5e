use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use super::batch::BaseSceneBatch;
use super::callback::SceneBatchCollectorCallback;
use super::diagnostics::FrameDiagnostics;
use super::geometry::Geometry;
use super::material::{Material, Pass};
use super::pipeline_state::{stable_hash, PipelineState};
use super::scene_light::SceneLight;
use crate::scene::camera::Camera;
use crate::scene::drawable::GeometryType;

const CACHE_SHARDS: usize = 16;

/// Identity of a scene pipeline state. Resources compare by id, not by contents.
#[derive(Clone)]
pub struct ScenePipelineStateKey {
    pub geometry_type: GeometryType,
    pub geometry: Arc<Geometry>,
    pub material: Arc<Material>,
    pub pass: Arc<Pass>,
    pub light_hash: u64,
    pub reverse_culling: bool,
}

impl ScenePipelineStateKey {
    pub fn new(batch: &BaseSceneBatch, light_hash: u64, reverse_culling: bool) -> Self {
        Self {
            geometry_type: batch.geometry_type,
            geometry: Arc::clone(&batch.geometry),
            material: Arc::clone(&batch.material),
            pass: Arc::clone(&batch.pass),
            light_hash,
            reverse_culling,
        }
    }

    fn ids(&self) -> (GeometryType, u64, u64, u64, u64, bool) {
        (
            self.geometry_type,
            self.geometry.id(),
            self.material.id(),
            self.pass.id(),
            self.light_hash,
            self.reverse_culling,
        )
    }
}

impl PartialEq for ScenePipelineStateKey {
    fn eq(&self, other: &Self) -> bool {
        self.ids() == other.ids()
    }
}

impl Eq for ScenePipelineStateKey {}

impl Hash for ScenePipelineStateKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ids().hash(state);
    }
}

/// Everything besides the key a factory needs to build a state.
pub struct ScenePipelineStateContext<'a> {
    /// Pass-specific defines such as `"LITBASE "`.
    pub shader_defines: &'a str,
    pub shadow_pass: bool,
    pub camera: &'a Camera,
    pub light: Option<&'a SceneLight>,
}

pub enum PipelineLookup {
    Hit(Arc<PipelineState>),
    Failed,
    Miss,
}

/// Per-pass map from key to pipeline state, shared by worker threads.
///
/// A `None` entry records a failed creation so it is not retried every frame.
pub struct ScenePipelineStateCache {
    shards: Vec<RwLock<HashMap<ScenePipelineStateKey, Option<Arc<PipelineState>>>>>,
}

impl Default for ScenePipelineStateCache {
    fn default() -> Self {
        Self {
            shards: (0..CACHE_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }
}

impl ScenePipelineStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, key: &ScenePipelineStateKey) -> &RwLock<HashMap<ScenePipelineStateKey, Option<Arc<PipelineState>>>> {
        &self.shards[(stable_hash(key) as usize) % self.shards.len()]
    }

    /// Lookup only; safe during parallel phases.
    pub fn get_pipeline_state(&self, key: &ScenePipelineStateKey) -> PipelineLookup {
        let shard = self.shard(key).read().unwrap_or_else(PoisonError::into_inner);
        match shard.get(key) {
            Some(Some(state)) => PipelineLookup::Hit(Arc::clone(state)),
            Some(None) => PipelineLookup::Failed,
            None => PipelineLookup::Miss,
        }
    }

    pub fn get_or_create_pipeline_state(
        &self,
        key: &ScenePipelineStateKey,
        ctx: &ScenePipelineStateContext<'_>,
        callback: &dyn SceneBatchCollectorCallback,
        diagnostics: &FrameDiagnostics,
    ) -> Option<Arc<PipelineState>> {
        let mut shard = self.shard(key).write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = shard.get(key) {
            return entry.clone();
        }

        let state = callback.create_pipeline_state(key, ctx);
        if state.is_none() {
            diagnostics.record_pipeline_state_failure();
        }
        shard.insert(key.clone(), state.clone());
        state
    }

    pub fn invalidate(&self) {
        for shard in &self.shards {
            shard.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
