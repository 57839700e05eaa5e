use std::sync::Arc;

use super::bounds::Frustum;
use super::drawable::{Drawable, DrawableFlags};

/// Scene-side query interface used by the renderer each frame.
pub trait SpatialIndex: Send + Sync {
    /// One past the largest drawable index this index can return.
    fn drawable_count(&self) -> usize;

    /// Append every drawable matching `flags` and `view_mask` whose bounds touch `frustum`.
    fn query_frustum(
        &self,
        frustum: &Frustum,
        flags: DrawableFlags,
        view_mask: u32,
        result: &mut Vec<Arc<dyn Drawable>>,
    );
}

/// Brute-force index; every query walks all drawables.
#[derive(Clone, Default)]
pub struct LinearSpatialIndex {
    drawables: Vec<Arc<dyn Drawable>>,
    drawable_count: usize,
}

impl LinearSpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, drawable: Arc<dyn Drawable>) {
        self.drawable_count = self.drawable_count.max(drawable.drawable_index() + 1);
        self.drawables.push(drawable);
    }

    /// Index to hand to the next drawable created for this scene.
    pub fn next_index(&self) -> usize {
        self.drawable_count
    }

    pub fn drawables(&self) -> &[Arc<dyn Drawable>] {
        &self.drawables
    }

    pub fn len(&self) -> usize {
        self.drawables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drawables.is_empty()
    }
}

impl SpatialIndex for LinearSpatialIndex {
    fn drawable_count(&self) -> usize {
        self.drawable_count
    }

    fn query_frustum(
        &self,
        frustum: &Frustum,
        flags: DrawableFlags,
        view_mask: u32,
        result: &mut Vec<Arc<dyn Drawable>>,
    ) {
        result.extend(
            self.drawables
                .iter()
                .filter(|drawable| drawable.flags().intersects(flags))
                .filter(|drawable| drawable.view_mask() & view_mask != 0)
                .filter(|drawable| frustum.intersects_box(&drawable.world_bounds()))
                .cloned(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::geometry::Geometry;
    use crate::scene::camera::Camera;
    use crate::scene::drawable::StaticModel;
    use crate::scene::light::{Light, LightNode};
    use glam::Vec3;

    #[test]
    fn query_filters_by_flags_mask_and_frustum() {
        let geometry = Arc::new(Geometry::cube("cube"));
        let mut index = LinearSpatialIndex::new();
        index.insert(Arc::new(StaticModel::new(0, Arc::clone(&geometry), None)));
        index.insert(Arc::new(
            StaticModel::new(1, Arc::clone(&geometry), None).with_position(Vec3::new(0.0, 0.0, 50.0)),
        ));
        index.insert(Arc::new(
            StaticModel::new(2, Arc::clone(&geometry), None).with_view_mask(0),
        ));
        index.insert(Arc::new(LightNode::new(3, Light::directional(Vec3::NEG_Y))));
        assert_eq!(index.drawable_count(), 4);

        let frustum = Camera::default().frustum();
        let mut geometries = Vec::new();
        index.query_frustum(&frustum, DrawableFlags::GEOMETRY, u32::MAX, &mut geometries);
        let indices: Vec<_> = geometries.iter().map(|d| d.drawable_index()).collect();
        assert_eq!(indices, vec![0]);

        let mut lights = Vec::new();
        index.query_frustum(&frustum, DrawableFlags::LIGHT, u32::MAX, &mut lights);
        assert_eq!(lights.len(), 1);
    }
}
