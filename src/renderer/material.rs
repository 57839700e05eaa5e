// renderer/material.rs

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::device::TextureId;
use super::geometry::{fold_hash, next_resource_id};
use super::shader_params::{ShaderParameterValue, TextureUnit};

pub const DEFAULT_RENDER_ORDER: u8 = 128;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialQuality {
    Low = 0,
    Medium = 1,
    #[default]
    High = 2,
    Max = 15,
}

/// Winding order of the triangles that get culled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    #[default]
    Ccw,
    Cw,
}

impl CullMode {
    /// Mirrored transforms flip winding.
    pub fn flipped(self) -> Self {
        match self {
            CullMode::None => CullMode::None,
            CullMode::Ccw => CullMode::Cw,
            CullMode::Cw => CullMode::Ccw,
        }
    }

    /// Maps onto a clockwise-front-face primitive state.
    pub fn to_wgpu(self) -> Option<wgpu::Face> {
        match self {
            CullMode::None => None,
            CullMode::Ccw => Some(wgpu::Face::Back),
            CullMode::Cw => Some(wgpu::Face::Front),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    #[default]
    Replace,
    Add,
    Multiply,
    Alpha,
    AddAlpha,
    PremulAlpha,
    InvDestAlpha,
    Subtract,
    SubtractAlpha,
}

impl BlendMode {
    pub fn to_wgpu(self) -> Option<wgpu::BlendState> {
        use wgpu::{BlendComponent, BlendFactor as F, BlendOperation as Op, BlendState};

        let color = |src, dst, operation| BlendState {
            color: BlendComponent {
                src_factor: src,
                dst_factor: dst,
                operation,
            },
            alpha: BlendComponent {
                src_factor: src,
                dst_factor: dst,
                operation,
            },
        };

        match self {
            BlendMode::Replace => None,
            BlendMode::Add => Some(color(F::One, F::One, Op::Add)),
            BlendMode::Multiply => Some(color(F::Dst, F::Zero, Op::Add)),
            BlendMode::Alpha => Some(BlendState::ALPHA_BLENDING),
            BlendMode::AddAlpha => Some(color(F::SrcAlpha, F::One, Op::Add)),
            BlendMode::PremulAlpha => Some(BlendState::PREMULTIPLIED_ALPHA_BLENDING),
            BlendMode::InvDestAlpha => Some(color(F::OneMinusDstAlpha, F::DstAlpha, Op::Add)),
            BlendMode::Subtract => Some(color(F::One, F::One, Op::ReverseSubtract)),
            BlendMode::SubtractAlpha => Some(color(F::SrcAlpha, F::One, Op::ReverseSubtract)),
        }
    }
}

/// One way to render a material: shaders, defines and fixed-function state.
#[derive(Clone, Debug)]
pub struct Pass {
    id: u64,
    pub name: String,
    pub vertex_shader: String,
    pub pixel_shader: String,
    pub vertex_defines: String,
    pub pixel_defines: String,
    pub blend_mode: BlendMode,
    /// `None` uses the material's cull mode.
    pub cull_mode: Option<CullMode>,
    pub depth_write: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub alpha_to_coverage: bool,
}

impl Pass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_resource_id(),
            name: name.into(),
            vertex_shader: String::new(),
            pixel_shader: String::new(),
            vertex_defines: String::new(),
            pixel_defines: String::new(),
            blend_mode: BlendMode::Replace,
            cull_mode: None,
            depth_write: true,
            depth_compare: wgpu::CompareFunction::LessEqual,
            alpha_to_coverage: false,
        }
    }

    pub fn with_shaders(mut self, vertex: impl Into<String>, pixel: impl Into<String>) -> Self {
        self.vertex_shader = vertex.into();
        self.pixel_shader = pixel.into();
        self
    }

    pub fn with_defines(mut self, vertex: impl Into<String>, pixel: impl Into<String>) -> Self {
        self.vertex_defines = vertex.into();
        self.pixel_defines = pixel.into();
        self
    }

    pub fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = Some(cull_mode);
        self
    }

    pub fn with_depth(mut self, depth_write: bool, compare: wgpu::CompareFunction) -> Self {
        self.depth_write = depth_write;
        self.depth_compare = compare;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Clone, Debug, Default)]
pub struct Technique {
    pub name: String,
    passes: HashMap<String, Arc<Pass>>,
}

impl Technique {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passes: HashMap::new(),
        }
    }

    pub fn with_pass(mut self, pass: Pass) -> Self {
        self.passes.insert(pass.name.clone(), Arc::new(pass));
        self
    }

    pub fn pass(&self, name: &str) -> Option<&Arc<Pass>> {
        self.passes.get(name)
    }

    pub fn has_pass(&self, name: &str) -> bool {
        self.passes.contains_key(name)
    }
}

#[derive(Clone, Debug)]
pub struct TechniqueEntry {
    pub technique: Arc<Technique>,
    pub quality: MaterialQuality,
    pub lod_distance: f32,
}

#[derive(Clone, Debug)]
pub struct Material {
    id: u64,
    pub name: String,
    /// Kept ordered by descending LOD distance, then descending quality.
    techniques: Vec<TechniqueEntry>,
    pub render_order: u8,
    pub cull_mode: CullMode,
    pub shadow_cull_mode: CullMode,
    pub fill_mode: wgpu::PolygonMode,
    pub textures: Vec<(TextureUnit, TextureId)>,
    pub parameters: Vec<(Arc<str>, ShaderParameterValue)>,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_resource_id(),
            name: name.into(),
            techniques: Vec::new(),
            render_order: DEFAULT_RENDER_ORDER,
            cull_mode: CullMode::Ccw,
            shadow_cull_mode: CullMode::Ccw,
            fill_mode: wgpu::PolygonMode::Fill,
            textures: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Forward-lit material used when a source batch has none.
    pub fn default_lit() -> Self {
        Self::new("Default").with_technique(Arc::new(default_lit_technique()), MaterialQuality::Low, 0.0)
    }

    pub fn with_technique(
        mut self,
        technique: Arc<Technique>,
        quality: MaterialQuality,
        lod_distance: f32,
    ) -> Self {
        self.techniques.push(TechniqueEntry {
            technique,
            quality,
            lod_distance,
        });
        self.techniques.sort_by(|a, b| {
            b.lod_distance
                .total_cmp(&a.lod_distance)
                .then(b.quality.cmp(&a.quality))
        });
        self
    }

    pub fn with_render_order(mut self, render_order: u8) -> Self {
        self.render_order = render_order;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode, shadow_cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self.shadow_cull_mode = shadow_cull_mode;
        self
    }

    pub fn with_texture(mut self, unit: TextureUnit, texture: TextureId) -> Self {
        self.textures.push((unit, texture));
        self
    }

    pub fn with_parameter(mut self, name: &str, value: ShaderParameterValue) -> Self {
        self.parameters.push((Arc::from(name), value));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hash32(&self) -> u32 {
        fold_hash(self.id)
    }

    pub fn techniques(&self) -> &[TechniqueEntry] {
        &self.techniques
    }

    /// First entry usable at `quality` and `lod_distance`, else the last entry.
    pub fn find_technique(&self, lod_distance: f32, quality: MaterialQuality) -> Option<&Arc<Technique>> {
        self.techniques
            .iter()
            .find(|entry| entry.quality <= quality && lod_distance >= entry.lod_distance)
            .or_else(|| self.techniques.last())
            .map(|entry| &entry.technique)
    }
}

/// Technique with the standard forward and shadow passes.
pub fn default_lit_technique() -> Technique {
    Technique::new("NoTexture")
        .with_pass(Pass::new("base").with_shaders("LitSolid", "LitSolid"))
        .with_pass(Pass::new("litbase").with_shaders("LitSolid", "LitSolid"))
        .with_pass(
            Pass::new("light")
                .with_shaders("LitSolid", "LitSolid")
                .with_blend_mode(BlendMode::Add)
                .with_depth(false, wgpu::CompareFunction::Equal),
        )
        .with_pass(Pass::new("shadow").with_shaders("Shadow", "Shadow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn technique(name: &str) -> Arc<Technique> {
        Arc::new(Technique::new(name).with_pass(Pass::new("base")))
    }

    #[test]
    fn find_technique_respects_quality_and_lod() {
        let material = Material::new("m")
            .with_technique(technique("high"), MaterialQuality::High, 0.0)
            .with_technique(technique("far"), MaterialQuality::Low, 50.0)
            .with_technique(technique("low"), MaterialQuality::Low, 0.0);

        let near_high = material.find_technique(1.0, MaterialQuality::High).map(|t| t.name.as_str());
        let near_low = material.find_technique(1.0, MaterialQuality::Low).map(|t| t.name.as_str());
        let far_high = material.find_technique(80.0, MaterialQuality::High).map(|t| t.name.as_str());
        assert_eq!(near_high, Some("high"));
        assert_eq!(near_low, Some("low"));
        assert_eq!(far_high, Some("far"));
    }

    #[test]
    fn find_technique_falls_back_to_last_entry() {
        let material = Material::new("m").with_technique(technique("only"), MaterialQuality::Max, 0.0);
        let found = material.find_technique(0.0, MaterialQuality::Low).map(|t| t.name.as_str());
        assert_eq!(found, Some("only"));
        assert!(Material::new("empty").find_technique(0.0, MaterialQuality::High).is_none());
    }

    #[test]
    fn cull_mode_flips_winding() {
        assert_eq!(CullMode::Ccw.flipped(), CullMode::Cw);
        assert_eq!(CullMode::None.flipped(), CullMode::None);
        assert_eq!(CullMode::Cw.to_wgpu(), Some(wgpu::Face::Front));
    }

    #[test]
    fn default_material_has_forward_passes() {
        let material = Material::default_lit();
        assert_eq!(material.render_order, DEFAULT_RENDER_ORDER);
        let technique = material.find_technique(0.0, MaterialQuality::Low).expect("technique");
        for pass in ["base", "litbase", "light", "shadow"] {
            assert!(technique.has_pass(pass), "missing pass {pass}");
        }
    }
}
