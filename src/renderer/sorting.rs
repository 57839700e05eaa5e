use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::batch::BaseSceneBatch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSortOrder {
    /// Minimize state changes; ties go front to back.
    #[default]
    ByState,
    /// Render order, then farthest first.
    BackToFront,
}

/// Sort record minimizing pipeline, material and geometry switches.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchSortedByState {
    /// Render order, shader and pipeline state hashes.
    pub pipeline_key: u64,
    /// Material (xor lightmap) and geometry hashes.
    pub material_geometry_key: u64,
    pub distance: f32,
    pub batch_index: usize,
}

impl BatchSortedByState {
    pub fn new(batch: &BaseSceneBatch, batch_index: usize) -> Self {
        let (shader_hash, state_hash) = batch
            .pipeline_state
            .as_ref()
            .map_or((0, 0), |state| (state.shader_hash(), state.state_hash()));
        let folded_state = (state_hash & 0x00ff_ffff) ^ (state_hash >> 24);
        let pipeline_key = (u64::from(batch.material.render_order) << 56)
            | (u64::from(shader_hash) << 24)
            | u64::from(folded_state);

        let material_hash = batch.material.hash32() ^ batch.lightmap_index;
        let material_geometry_key = (u64::from(material_hash) << 32) | u64::from(batch.geometry.hash32());

        Self {
            pipeline_key,
            material_geometry_key,
            distance: batch.distance,
            batch_index,
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.pipeline_key
            .cmp(&other.pipeline_key)
            .then(self.material_geometry_key.cmp(&other.material_geometry_key))
            .then(self.distance.total_cmp(&other.distance))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchSortedBackToFront {
    pub render_order: u8,
    pub distance: f32,
    pub batch_index: usize,
}

impl BatchSortedBackToFront {
    pub fn new(batch: &BaseSceneBatch, batch_index: usize) -> Self {
        Self {
            render_order: batch.material.render_order,
            distance: batch.distance,
            batch_index,
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.render_order
            .cmp(&other.render_order)
            .then(other.distance.total_cmp(&self.distance))
    }
}

/// State sort, grouped by light first.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightBatchSortedByState {
    pub light_index: u32,
    pub by_state: BatchSortedByState,
}

impl LightBatchSortedByState {
    pub fn new(batch: &BaseSceneBatch, batch_index: usize) -> Self {
        Self {
            light_index: batch.light_index,
            by_state: BatchSortedByState::new(batch, batch_index),
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.light_index
            .cmp(&other.light_index)
            .then_with(|| self.by_state.compare(&other.by_state))
    }
}

/// A sorted view over a batch list.
#[derive(Clone, Debug)]
pub enum SortedBatches {
    ByState(Vec<BatchSortedByState>),
    BackToFront(Vec<BatchSortedBackToFront>),
    ByLight(Vec<LightBatchSortedByState>),
}

impl Default for SortedBatches {
    fn default() -> Self {
        SortedBatches::ByState(Vec::new())
    }
}

impl SortedBatches {
    pub fn len(&self) -> usize {
        match self {
            SortedBatches::ByState(v) => v.len(),
            SortedBatches::BackToFront(v) => v.len(),
            SortedBatches::ByLight(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch indices in draw order.
    pub fn indices(&self) -> Vec<usize> {
        match self {
            SortedBatches::ByState(v) => v.iter().map(|s| s.batch_index).collect(),
            SortedBatches::BackToFront(v) => v.iter().map(|s| s.batch_index).collect(),
            SortedBatches::ByLight(v) => v.iter().map(|s| s.by_state.batch_index).collect(),
        }
    }

    pub fn iter<'a>(&self, batches: &'a [BaseSceneBatch]) -> impl Iterator<Item = &'a BaseSceneBatch> {
        self.indices().into_iter().filter_map(move |index| batches.get(index))
    }
}

pub fn sort_batches_by_state(batches: &[BaseSceneBatch]) -> Vec<BatchSortedByState> {
    let mut sorted: Vec<_> = batches
        .iter()
        .enumerate()
        .map(|(index, batch)| BatchSortedByState::new(batch, index))
        .collect();
    sorted.sort_by(BatchSortedByState::compare);
    sorted
}

pub fn sort_batches_back_to_front(batches: &[BaseSceneBatch]) -> Vec<BatchSortedBackToFront> {
    let mut sorted: Vec<_> = batches
        .iter()
        .enumerate()
        .map(|(index, batch)| BatchSortedBackToFront::new(batch, index))
        .collect();
    sorted.sort_by(BatchSortedBackToFront::compare);
    sorted
}

pub fn sort_light_batches(batches: &[BaseSceneBatch]) -> Vec<LightBatchSortedByState> {
    let mut sorted: Vec<_> = batches
        .iter()
        .enumerate()
        .map(|(index, batch)| LightBatchSortedByState::new(batch, index))
        .collect();
    sorted.sort_by(LightBatchSortedByState::compare);
    sorted
}

pub fn sort_base_batches(batches: &[BaseSceneBatch], order: BatchSortOrder) -> SortedBatches {
    match order {
        BatchSortOrder::ByState => SortedBatches::ByState(sort_batches_by_state(batches)),
        BatchSortOrder::BackToFront => SortedBatches::BackToFront(sort_batches_back_to_front(batches)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::geometry::Geometry;
    use crate::renderer::light_accumulator::NO_LIGHT;
    use crate::renderer::material::{Material, Pass};
    use crate::scene::drawable::{Drawable, SourceBatch, StaticModel};
    use glam::Mat4;
    use std::sync::Arc;

    fn batch(material: &Arc<Material>, distance: f32, light_index: u32) -> BaseSceneBatch {
        thread_local! {
            static CUBE: Arc<Geometry> = Arc::new(Geometry::cube("cube"));
        }
        let geometry = CUBE.with(Arc::clone);
        let drawable: Arc<dyn Drawable> = Arc::new(StaticModel::new(0, Arc::clone(&geometry), None));
        let source = SourceBatch {
            geometry,
            material: Some(Arc::clone(material)),
            geometry_type: Default::default(),
            lightmap_index: 0,
            distance,
            world_transform: Mat4::IDENTITY,
        };
        BaseSceneBatch::new(light_index, &drawable, 0, &source, &Arc::new(Pass::new("base")), material)
    }

    #[test]
    fn back_to_front_orders_by_render_order_then_far_first() {
        let early = Arc::new(Material::new("early").with_render_order(10));
        let normal = Arc::new(Material::new("normal"));
        let batches = vec![batch(&normal, 3.0, NO_LIGHT), batch(&normal, 7.0, NO_LIGHT), batch(&early, 1.0, NO_LIGHT)];
        let order: Vec<_> = sort_batches_back_to_front(&batches).iter().map(|s| s.batch_index).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn by_state_groups_materials_then_front_to_back() {
        let a = Arc::new(Material::new("a"));
        let b = Arc::new(Material::new("b"));
        let batches = vec![
            batch(&a, 9.0, NO_LIGHT),
            batch(&b, 1.0, NO_LIGHT),
            batch(&a, 2.0, NO_LIGHT),
        ];
        let sorted = sort_batches_by_state(&batches);
        let ids: Vec<_> = sorted.iter().map(|s| batches[s.batch_index].material.id()).collect();
        assert!(ids == vec![a.id(), a.id(), b.id()] || ids == vec![b.id(), a.id(), a.id()]);
        let a_positions: Vec<_> = sorted
            .iter()
            .filter(|s| batches[s.batch_index].material.id() == a.id())
            .map(|s| s.batch_index)
            .collect();
        assert_eq!(a_positions, vec![2, 0]);
    }

    #[test]
    fn light_batches_group_by_light() {
        let m = Arc::new(Material::new("m"));
        let batches = vec![batch(&m, 1.0, 2), batch(&m, 1.0, 0), batch(&m, 5.0, 2), batch(&m, 0.5, 0)];
        let order: Vec<_> = sort_light_batches(&batches).iter().map(|s| s.by_state.batch_index).collect();
        assert_eq!(order, vec![3, 1, 0, 2]);
    }

    #[test]
    fn sorted_batches_iterate_in_draw_order() {
        let m = Arc::new(Material::new("m"));
        let batches = vec![batch(&m, 1.0, NO_LIGHT), batch(&m, 4.0, NO_LIGHT)];
        let sorted = sort_base_batches(&batches, BatchSortOrder::BackToFront);
        let distances: Vec<_> = sorted.iter(&batches).map(|b| b.distance).collect();
        assert_eq!(distances, vec![4.0, 1.0]);
        assert_eq!(sorted.len(), 2);
    }
}
