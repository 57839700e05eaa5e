use glam::{Mat4, UVec2, Vec3, Vec4};
use log::{debug, warn};

use super::device::{ClearFlags, GpuObject, RenderDevice, TextureId};
use crate::scene::bounds::IntRect;

pub const SHADOW_MAP_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// A tile of a shadow atlas page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowMap {
    pub page: usize,
    pub rect: IntRect,
    pub atlas_size: u32,
}

impl ShadowMap {
    /// Maps a light view-projection into this tile's texture coordinates.
    pub fn texture_matrix(&self, view_proj: Mat4) -> Mat4 {
        let atlas = self.atlas_size.max(1) as f32;
        let scale = Vec3::new(
            self.rect.width() as f32 / atlas,
            self.rect.height() as f32 / atlas,
            1.0,
        );
        let offset = Vec3::new(self.rect.left as f32 / atlas, self.rect.top as f32 / atlas, 0.0);
        // Clip space y points up, texture v points down.
        let clip_to_uv = Mat4::from_cols(
            Vec4::new(0.5, 0.0, 0.0, 0.0),
            Vec4::new(0.0, -0.5, 0.0, 0.0),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            Vec4::new(0.5, 0.5, 0.0, 1.0),
        );
        Mat4::from_translation(offset) * Mat4::from_scale(scale) * clip_to_uv * view_proj
    }
}

#[derive(Clone, Copy, Debug)]
struct SkylineNode {
    x: i32,
    y: i32,
    width: i32,
}

/// Bottom-left skyline rectangle packer.
#[derive(Clone, Debug)]
struct SkylinePacker {
    size: i32,
    nodes: Vec<SkylineNode>,
}

impl SkylinePacker {
    fn new(size: u32) -> Self {
        let size = size as i32;
        Self {
            size,
            nodes: vec![SkylineNode {
                x: 0,
                y: 0,
                width: size,
            }],
        }
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.nodes.push(SkylineNode {
            x: 0,
            y: 0,
            width: self.size,
        });
    }

    fn fit(&self, index: usize, width: i32, height: i32) -> Option<i32> {
        let x = self.nodes[index].x;
        if x + width > self.size {
            return None;
        }
        let mut remaining = width;
        let mut y = 0;
        let mut i = index;
        while remaining > 0 {
            let node = self.nodes.get(i)?;
            y = y.max(node.y);
            if y + height > self.size {
                return None;
            }
            remaining -= node.width;
            i += 1;
        }
        Some(y)
    }

    fn allocate(&mut self, width: i32, height: i32) -> Option<IntRect> {
        let mut best: Option<(usize, i32, i32)> = None;
        for index in 0..self.nodes.len() {
            if let Some(y) = self.fit(index, width, height) {
                let x = self.nodes[index].x;
                let better = match best {
                    None => true,
                    Some((_, best_x, best_y)) => y < best_y || (y == best_y && x < best_x),
                };
                if better {
                    best = Some((index, x, y));
                }
            }
        }

        let (index, x, y) = best?;
        self.add_level(index, x, y, width, height);
        Some(IntRect::new(x, y, x + width, y + height))
    }

    fn add_level(&mut self, index: usize, x: i32, y: i32, width: i32, height: i32) {
        self.nodes.insert(
            index,
            SkylineNode {
                x,
                y: y + height,
                width,
            },
        );

        let mut i = index + 1;
        while i < self.nodes.len() {
            let previous_end = self.nodes[i - 1].x + self.nodes[i - 1].width;
            let node = &mut self.nodes[i];
            if node.x >= previous_end {
                break;
            }
            let shrink = previous_end - node.x;
            if node.width <= shrink {
                self.nodes.remove(i);
            } else {
                node.x += shrink;
                node.width -= shrink;
                break;
            }
        }

        let mut i = 0;
        while i + 1 < self.nodes.len() {
            if self.nodes[i].y == self.nodes[i + 1].y {
                self.nodes[i].width += self.nodes[i + 1].width;
                self.nodes.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

struct ShadowAtlasPage {
    packer: SkylinePacker,
    texture: Option<TextureId>,
}

/// Hands out shadow map tiles from square depth atlas pages.
///
/// Tiles are valid until the next `reset`. Page textures are created lazily
/// on the first `begin_shadow_map` that targets them.
pub struct ShadowMapAllocator {
    page_size: u32,
    max_pages: usize,
    min_tile_size: u32,
    pages: Vec<ShadowAtlasPage>,
    allocations: Vec<ShadowMap>,
}

impl ShadowMapAllocator {
    pub fn new(page_size: u32, max_pages: usize, min_tile_size: u32) -> Self {
        let page_size = page_size.max(1).next_power_of_two();
        Self {
            page_size,
            max_pages: max_pages.max(1),
            min_tile_size: min_tile_size.clamp(1, page_size),
            pages: Vec::new(),
            allocations: Vec::new(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn reset(&mut self) {
        for page in &mut self.pages {
            page.packer.reset();
        }
        self.allocations.clear();
    }

    /// Round up to a power of two, then halve until the tile fits or the minimum is reached.
    pub fn allocate_shadow_map(&mut self, size: UVec2) -> Option<ShadowMap> {
        let mut side = size
            .max_element()
            .max(1)
            .next_power_of_two()
            .clamp(self.min_tile_size, self.page_size);

        loop {
            if let Some(map) = self.try_allocate(side) {
                if side < size.max_element() {
                    debug!("Shadow map request {:?} downsized to {}", size, side);
                }
                self.allocations.push(map);
                return Some(map);
            }
            if side <= self.min_tile_size {
                warn!("Shadow atlas is full, dropping shadow map request {:?}", size);
                return None;
            }
            side /= 2;
        }
    }

    fn try_allocate(&mut self, side: u32) -> Option<ShadowMap> {
        let side = side as i32;
        for (page_index, page) in self.pages.iter_mut().enumerate() {
            if let Some(rect) = page.packer.allocate(side, side) {
                return Some(ShadowMap {
                    page: page_index,
                    rect,
                    atlas_size: self.page_size,
                });
            }
        }

        if self.pages.len() >= self.max_pages {
            return None;
        }
        let mut packer = SkylinePacker::new(self.page_size);
        let rect = packer.allocate(side, side)?;
        self.pages.push(ShadowAtlasPage {
            packer,
            texture: None,
        });
        Some(ShadowMap {
            page: self.pages.len() - 1,
            rect,
            atlas_size: self.page_size,
        })
    }

    pub fn allocations(&self) -> &[ShadowMap] {
        &self.allocations
    }

    pub fn page_texture(&self, page: usize) -> Option<TextureId> {
        self.pages.get(page).and_then(|page| page.texture)
    }

    /// Bind the tile as depth target and clear it. Returns false if the page texture is unavailable.
    pub fn begin_shadow_map(&mut self, device: &mut dyn RenderDevice, map: &ShadowMap) -> bool {
        let page_size = self.page_size;
        let Some(page) = self.pages.get_mut(map.page) else {
            return false;
        };
        if page.texture.is_none() {
            page.texture = device.create_depth_texture(
                Some("Shadow Atlas"),
                UVec2::splat(page_size),
                SHADOW_MAP_FORMAT,
            );
        }
        let Some(texture) = page.texture else {
            warn!("Failed to create shadow atlas page {}", map.page);
            return false;
        };

        device.set_render_target(None, Some(texture));
        device.set_viewport(map.rect);
        device.clear(ClearFlags::DEPTH, [0.0; 4], 1.0, 0);
        true
    }
}

impl GpuObject for ShadowMapAllocator {
    fn on_device_reset(&mut self, _device: &mut dyn RenderDevice) {
        for page in &mut self.pages {
            page.texture = None;
        }
    }

    fn release(&mut self, device: &mut dyn RenderDevice) {
        for page in &mut self.pages {
            if let Some(texture) = page.texture.take() {
                device.destroy_texture(texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::RecordingDevice;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn allocations_never_overlap() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut allocator = ShadowMapAllocator::new(2048, 2, 64);
            for _ in 0..40 {
                let side = rng.gen_range(32..1200);
                allocator.allocate_shadow_map(UVec2::splat(side));
            }
            let maps = allocator.allocations();
            for (i, a) in maps.iter().enumerate() {
                assert!(a.rect.right <= 2048 && a.rect.bottom <= 2048);
                assert!(a.rect.width().count_ones() == 1);
                for b in &maps[i + 1..] {
                    assert!(a.page != b.page || !a.rect.overlaps(&b.rect), "{a:?} overlaps {b:?}");
                }
            }
        }
    }

    #[test]
    fn full_atlas_downsizes_then_fails() {
        let mut allocator = ShadowMapAllocator::new(1024, 1, 256);
        assert!(allocator.allocate_shadow_map(UVec2::splat(1024)).is_some());
        assert!(allocator.allocate_shadow_map(UVec2::splat(512)).is_none());

        allocator.reset();
        let big = allocator.allocate_shadow_map(UVec2::splat(700)).expect("fits after reset");
        assert_eq!(big.rect.width(), 1024);
    }

    #[test]
    fn requests_are_halved_to_fit() {
        let mut allocator = ShadowMapAllocator::new(1024, 1, 128);
        allocator.allocate_shadow_map(UVec2::splat(512)).expect("first");
        let second = allocator.allocate_shadow_map(UVec2::splat(1024)).expect("halved");
        assert_eq!(second.rect.width(), 512);
    }

    #[test]
    fn page_texture_is_created_lazily_and_dropped_on_reset() {
        let mut device = RecordingDevice::new(true);
        let mut allocator = ShadowMapAllocator::new(512, 1, 64);
        let map = allocator.allocate_shadow_map(UVec2::splat(256)).expect("tile");
        assert!(allocator.page_texture(0).is_none());
        assert!(allocator.begin_shadow_map(&mut device, &map));
        assert!(allocator.page_texture(0).is_some());
        assert_eq!(device.clear_count(), 1);

        allocator.on_device_reset(&mut device);
        assert!(allocator.page_texture(0).is_none());
    }

    #[test]
    fn texture_matrix_maps_clip_center_to_tile_center() {
        let map = ShadowMap {
            page: 0,
            rect: IntRect::new(256, 0, 512, 256),
            atlas_size: 1024,
        };
        let uv = map.texture_matrix(Mat4::IDENTITY).transform_point3(Vec3::ZERO);
        assert!((uv.x - 0.375).abs() < 1e-6);
        assert!((uv.y - 0.125).abs() < 1e-6);

        let top = map.texture_matrix(Mat4::IDENTITY).transform_point3(Vec3::Y);
        assert!(top.y < uv.y);
    }
}
