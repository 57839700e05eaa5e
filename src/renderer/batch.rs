use std::sync::Arc;

use super::geometry::Geometry;
use super::light_accumulator::NO_LIGHT;
use super::material::{Material, Pass};
use super::pipeline_state::PipelineState;
use crate::scene::drawable::{Drawable, GeometryType, SourceBatch};

/// A source batch routed into a scene pass, before lights are known.
#[derive(Clone)]
pub struct IntermediateSceneBatch {
    pub drawable: Arc<dyn Drawable>,
    pub source_batch_index: usize,
    /// Pass drawn once per batch: unlit base or lit base.
    pub base_pass: Option<Arc<Pass>>,
    /// Pass drawn once per additional per-pixel light.
    pub additional_pass: Option<Arc<Pass>>,
}

impl IntermediateSceneBatch {
    pub fn drawable_index(&self) -> usize {
        self.drawable.drawable_index()
    }

    /// Deterministic merge order for batches gathered on different threads.
    pub fn order_key(&self) -> (usize, usize) {
        (self.drawable_index(), self.source_batch_index)
    }
}

/// A fully resolved draw: one drawable source batch with one pass and at most one light.
#[derive(Clone)]
pub struct BaseSceneBatch {
    /// Index into the collector's visible lights, or `NO_LIGHT`.
    pub light_index: u32,
    pub drawable: Arc<dyn Drawable>,
    pub source_batch_index: usize,
    pub geometry_type: GeometryType,
    pub geometry: Arc<Geometry>,
    pub material: Arc<Material>,
    pub pass: Arc<Pass>,
    pub pipeline_state: Option<Arc<PipelineState>>,
    pub distance: f32,
    pub lightmap_index: u32,
}

impl BaseSceneBatch {
    pub fn new(
        light_index: u32,
        drawable: &Arc<dyn Drawable>,
        source_batch_index: usize,
        source: &SourceBatch,
        pass: &Arc<Pass>,
        default_material: &Arc<Material>,
    ) -> Self {
        Self {
            light_index,
            drawable: Arc::clone(drawable),
            source_batch_index,
            geometry_type: source.geometry_type,
            geometry: Arc::clone(&source.geometry),
            material: Arc::clone(source.material.as_ref().unwrap_or(default_material)),
            pass: Arc::clone(pass),
            pipeline_state: None,
            distance: source.distance,
            lightmap_index: source.lightmap_index,
        }
    }

    pub fn drawable_index(&self) -> usize {
        self.drawable.drawable_index()
    }

    pub fn has_light(&self) -> bool {
        self.light_index != NO_LIGHT
    }
}
