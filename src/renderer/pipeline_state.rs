use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::geometry::{fold_hash, VertexElement};
use super::material::{BlendMode, CullMode};

pub fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

/// A compiled shader permutation. Defines are normalized: unique, sorted, space separated.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderVariation {
    pub name: String,
    pub defines: String,
}

impl ShaderVariation {
    pub fn new(name: &str, defines: &str) -> Self {
        Self {
            name: name.to_owned(),
            defines: normalize_defines(defines),
        }
    }

    pub fn has_define(&self, define: &str) -> bool {
        self.defines.split(' ').any(|token| token == define)
    }
}

pub fn normalize_defines(defines: &str) -> String {
    let mut tokens: Vec<&str> = defines.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens.join(" ")
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineStateDesc {
    pub vertex_elements: Vec<VertexElement>,
    pub vertex_shader: ShaderVariation,
    pub pixel_shader: ShaderVariation,
    pub primitive: wgpu::PrimitiveTopology,
    pub index_format: Option<wgpu::IndexFormat>,
    pub depth_write: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub stencil_enabled: bool,
    pub color_write: bool,
    pub blend_mode: BlendMode,
    pub alpha_to_coverage: bool,
    pub fill_mode: wgpu::PolygonMode,
    pub cull_mode: CullMode,
    pub depth_bias: i32,
    pub slope_scaled_depth_bias: u32,
}

impl PipelineStateDesc {
    pub fn primitive_state(&self) -> wgpu::PrimitiveState {
        wgpu::PrimitiveState {
            topology: self.primitive,
            strip_index_format: match self.primitive {
                wgpu::PrimitiveTopology::LineStrip | wgpu::PrimitiveTopology::TriangleStrip => {
                    self.index_format
                }
                _ => None,
            },
            front_face: wgpu::FrontFace::Cw,
            cull_mode: self.cull_mode.to_wgpu(),
            polygon_mode: self.fill_mode,
            ..Default::default()
        }
    }

    pub fn depth_stencil_state(&self, format: wgpu::TextureFormat) -> wgpu::DepthStencilState {
        wgpu::DepthStencilState {
            format,
            depth_write_enabled: self.depth_write,
            depth_compare: self.depth_compare,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState {
                constant: self.depth_bias,
                slope_scale: f32::from_bits(self.slope_scaled_depth_bias),
                clamp: 0.0,
            },
        }
    }
}

/// Immutable, hash-consed pipeline state.
#[derive(Debug)]
pub struct PipelineState {
    id: u64,
    desc: PipelineStateDesc,
    shader_hash: u32,
    state_hash: u32,
}

impl PipelineState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &PipelineStateDesc {
        &self.desc
    }

    /// Identifies the shader pair only.
    pub fn shader_hash(&self) -> u32 {
        self.shader_hash
    }

    /// Identifies the whole state.
    pub fn state_hash(&self) -> u32 {
        self.state_hash
    }
}

/// Deduplicates pipeline states so identical descriptions share one object.
#[derive(Debug, Default)]
pub struct PipelineStateRegistry {
    states: Mutex<HashMap<PipelineStateDesc, Arc<PipelineState>>>,
    next_id: AtomicU64,
}

impl PipelineStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, desc: PipelineStateDesc) -> Arc<PipelineState> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get(&desc) {
            return Arc::clone(state);
        }

        let shader_hash = fold_hash(stable_hash(&(&desc.vertex_shader, &desc.pixel_shader)));
        let state_hash = fold_hash(stable_hash(&desc));
        let state = Arc::new(PipelineState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            desc: desc.clone(),
            shader_hash,
            state_hash,
        });
        states.insert(desc, Arc::clone(&state));
        state
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::geometry::Vertex;

    fn desc(pixel_defines: &str) -> PipelineStateDesc {
        PipelineStateDesc {
            vertex_elements: Vertex::elements(),
            vertex_shader: ShaderVariation::new("LitSolid", ""),
            pixel_shader: ShaderVariation::new("LitSolid", pixel_defines),
            primitive: wgpu::PrimitiveTopology::TriangleList,
            index_format: Some(wgpu::IndexFormat::Uint16),
            depth_write: true,
            depth_compare: wgpu::CompareFunction::LessEqual,
            stencil_enabled: false,
            color_write: true,
            blend_mode: BlendMode::Replace,
            alpha_to_coverage: false,
            fill_mode: wgpu::PolygonMode::Fill,
            cull_mode: CullMode::Ccw,
            depth_bias: 0,
            slope_scaled_depth_bias: 0,
        }
    }

    #[test]
    fn defines_are_normalized() {
        assert_eq!(normalize_defines("  PERPIXEL DIRLIGHT PERPIXEL "), "DIRLIGHT PERPIXEL");
        assert!(ShaderVariation::new("x", "SHADOW PERPIXEL").has_define("SHADOW"));
    }

    #[test]
    fn registry_shares_identical_states() {
        let registry = PipelineStateRegistry::new();
        let a = registry.get_or_create(desc("PERPIXEL DIRLIGHT"));
        let b = registry.get_or_create(desc("DIRLIGHT PERPIXEL"));
        let c = registry.get_or_create(desc("PERPIXEL POINTLIGHT"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(a.id(), c.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn primitive_state_uses_cull_mode() {
        let mut d = desc("");
        d.cull_mode = CullMode::None;
        assert_eq!(d.primitive_state().cull_mode, None);
    }
}
