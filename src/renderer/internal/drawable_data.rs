use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use bitflags::bitflags;
use glam::{Mat4, Vec3};

use crate::renderer::material::{Material, MaterialQuality, Technique};
use crate::scene::bounds::BoundingBox;
use crate::scene::camera::{Camera, FrameInfo};
use crate::scene::drawable::{Drawable, DrawableFrameData};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DrawableTraits: u8 {
        const VISIBLE_GEOMETRY = 1 << 0;
        const FORWARD_LIT = 1 << 1;
    }
}

/// View-depth interval; `min > max` means empty.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZRange {
    pub min: f32,
    pub max: f32,
}

impl Default for ZRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl ZRange {
    pub const EMPTY: Self = Self {
        min: f32::INFINITY,
        max: f32::NEG_INFINITY,
    };

    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.max && self.min.is_finite() && self.max.is_finite()
    }

    pub fn merge(&mut self, other: ZRange) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Computes the view-depth interval of world-space boxes for one camera.
pub struct ZRangeEvaluator {
    depth_axis: Vec3,
    depth_offset: f32,
}

impl ZRangeEvaluator {
    pub fn new(camera: &Camera) -> Self {
        let view: Mat4 = camera.view();
        let row = view.row(2);
        Self {
            depth_axis: -row.truncate(),
            depth_offset: -row.w,
        }
    }

    pub fn evaluate(&self, bounds: &BoundingBox) -> ZRange {
        if bounds.is_infinite() {
            return ZRange::EMPTY;
        }
        let center = self.depth_axis.dot(bounds.center()) + self.depth_offset;
        let extent = self.depth_axis.abs().dot(bounds.half_extents());
        ZRange::new(center - extent, center + extent)
    }
}

/// Per-frame state for one drawable, written once by whichever thread updates it first.
#[derive(Clone, Debug)]
pub struct DrawableFrame {
    pub data: DrawableFrameData,
    pub z_range: ZRange,
    /// Technique picked for each source batch, `None` when the material has none.
    pub techniques: Vec<Option<Arc<Technique>>>,
}

pub struct DrawableUpdateContext<'a> {
    pub frame: &'a FrameInfo,
    pub evaluator: &'a ZRangeEvaluator,
    pub default_material: &'a Arc<Material>,
    pub material_quality: MaterialQuality,
}

/// Frame-transient data indexed by drawable index.
#[derive(Default)]
pub struct SceneDrawableData {
    frames: Vec<OnceLock<DrawableFrame>>,
    traits: Vec<AtomicU8>,
}

impl SceneDrawableData {
    pub fn reset(&mut self, num_drawables: usize) {
        self.frames.clear();
        self.frames.resize_with(num_drawables, OnceLock::new);
        self.traits.clear();
        self.traits.resize_with(num_drawables, || AtomicU8::new(0));
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&DrawableFrame> {
        self.frames.get(index).and_then(OnceLock::get)
    }

    pub fn is_updated(&self, index: usize) -> bool {
        self.frame(index).is_some()
    }

    /// Run `update_batches` at most once per frame; concurrent callers see the same result.
    pub fn get_or_update(
        &self,
        drawable: &dyn Drawable,
        ctx: &DrawableUpdateContext<'_>,
    ) -> Option<&DrawableFrame> {
        let Some(slot) = self.frames.get(drawable.drawable_index()) else {
            log::warn!(
                "Drawable {} is outside the {} slots reserved this frame",
                drawable.drawable_index(),
                self.frames.len()
            );
            return None;
        };
        Some(slot.get_or_init(|| {
            let data = drawable.update_batches(ctx.frame);
            let z_range = ctx.evaluator.evaluate(&data.world_bounds);
            let techniques = data
                .batches
                .iter()
                .map(|batch| {
                    batch
                        .material
                        .as_ref()
                        .unwrap_or(ctx.default_material)
                        .find_technique(data.lod_distance, ctx.material_quality)
                        .cloned()
                })
                .collect();
            DrawableFrame {
                data,
                z_range,
                techniques,
            }
        }))
    }

    pub fn add_traits(&self, index: usize, traits: DrawableTraits) {
        if let Some(slot) = self.traits.get(index) {
            slot.fetch_or(traits.bits(), Ordering::Relaxed);
        }
    }

    pub fn traits(&self, index: usize) -> DrawableTraits {
        self.traits
            .get(index)
            .map(|slot| DrawableTraits::from_bits_truncate(slot.load(Ordering::Relaxed)))
            .unwrap_or(DrawableTraits::empty())
    }
}

/// Scene depth interval accumulated per thread.
#[derive(Debug, Default)]
pub struct SceneZRange {
    ranges: Vec<Mutex<ZRange>>,
}

impl SceneZRange {
    pub fn clear(&mut self, num_threads: usize) {
        self.ranges.clear();
        self.ranges.resize_with(num_threads.max(1), || Mutex::new(ZRange::EMPTY));
    }

    pub fn accumulate(&self, thread_index: usize, range: ZRange) {
        if let Some(slot) = self.ranges.get(thread_index).or_else(|| self.ranges.last()) {
            slot.lock().unwrap_or_else(PoisonError::into_inner).merge(range);
        }
    }

    pub fn get(&self) -> ZRange {
        self.ranges.iter().fold(ZRange::EMPTY, |mut acc, slot| {
            acc.merge(*slot.lock().unwrap_or_else(PoisonError::into_inner));
            acc
        })
    }
}
