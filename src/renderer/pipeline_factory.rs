use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use glam::UVec2;

use super::callback::SceneBatchCollectorCallback;
use super::error::PipelineStateError;
use super::light_accumulator::MAX_VERTEX_LIGHTS;
use super::pipeline_cache::{ScenePipelineStateContext, ScenePipelineStateKey};
use super::pipeline_state::{
    PipelineState, PipelineStateDesc, PipelineStateRegistry, ShaderStage, ShaderVariation,
};
use super::shadow_atlas::{ShadowMap, ShadowMapAllocator};
use crate::scene::light::{Light, LightImportance, LightType};
use crate::settings::ShadowSettings;

/// Produces shader variations; the real backend compiles, test backends may reject.
pub trait ShaderCompiler: Send + Sync {
    fn compile(
        &self,
        stage: ShaderStage,
        name: &str,
        defines: &str,
    ) -> Result<ShaderVariation, PipelineStateError>;
}

/// Accepts every permutation of a named shader.
#[derive(Debug, Default)]
pub struct PermissiveShaderCompiler;

impl ShaderCompiler for PermissiveShaderCompiler {
    fn compile(
        &self,
        stage: ShaderStage,
        name: &str,
        defines: &str,
    ) -> Result<ShaderVariation, PipelineStateError> {
        if name.is_empty() {
            return Err(PipelineStateError::Compilation {
                stage,
                name: name.to_owned(),
                defines: defines.to_owned(),
                reason: "empty shader name".to_owned(),
            });
        }
        Ok(ShaderVariation::new(name, defines))
    }
}

/// Shader and defines of the variation an error refers to.
fn failed_variation(err: &PipelineStateError) -> (String, String) {
    match err {
        PipelineStateError::MissingShader { pass, stage } => (format!("{pass}:{stage:?}"), String::new()),
        PipelineStateError::Compilation { name, defines, .. } => (name.clone(), defines.clone()),
    }
}

/// Light-dependent defines shared by both shader stages.
pub fn light_defines(light: &Light, has_shadow: bool) -> String {
    let mut defines = String::from("PERPIXEL ");
    if has_shadow {
        defines.push_str("SHADOW SIMPLE_SHADOW ");
    }
    match light.light_type {
        LightType::Directional => {
            defines.push_str(&format!("DIRLIGHT NUMVERTEXLIGHTS={MAX_VERTEX_LIGHTS} "));
        }
        LightType::Point => defines.push_str("POINTLIGHT "),
        LightType::Spot => defines.push_str("SPOTLIGHT "),
    }
    defines
}

/// Builds pipeline states from pass and material data and serves shadow maps from an atlas.
pub struct DefaultSceneCallback {
    registry: PipelineStateRegistry,
    compiler: Arc<dyn ShaderCompiler>,
    shadow_allocator: Arc<Mutex<ShadowMapAllocator>>,
    draw_shadows: bool,
    point_light_shadows: bool,
    constant_buffers: bool,
    reported_failures: Mutex<HashSet<(String, String)>>,
}

impl DefaultSceneCallback {
    pub fn new(
        compiler: Arc<dyn ShaderCompiler>,
        shadow_allocator: Arc<Mutex<ShadowMapAllocator>>,
        shadows: &ShadowSettings,
        constant_buffers: bool,
    ) -> Self {
        Self {
            registry: PipelineStateRegistry::new(),
            compiler,
            shadow_allocator,
            draw_shadows: shadows.enabled,
            point_light_shadows: shadows.point_light_shadows,
            constant_buffers,
            reported_failures: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &PipelineStateRegistry {
        &self.registry
    }

    pub fn set_constant_buffers(&mut self, enabled: bool) {
        self.constant_buffers = enabled;
    }

    /// Distinct shader variations that failed so far; each is logged once.
    pub fn reported_failures(&self) -> usize {
        self.reported_failures.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn build_desc(
        &self,
        key: &ScenePipelineStateKey,
        ctx: &ScenePipelineStateContext<'_>,
    ) -> Result<PipelineStateDesc, PipelineStateError> {
        let pass = &key.pass;
        for (stage, shader) in [
            (ShaderStage::Vertex, &pass.vertex_shader),
            (ShaderStage::Pixel, &pass.pixel_shader),
        ] {
            if shader.is_empty() {
                return Err(PipelineStateError::MissingShader {
                    pass: pass.name.clone(),
                    stage,
                });
            }
        }

        let mut common = String::from(ctx.shader_defines);
        if let Some(light) = ctx.light.filter(|_| !ctx.shadow_pass) {
            common.push_str(&light_defines(light.light(), light.has_shadow()));
        }
        if self.constant_buffers {
            common.push_str("USE_CBUFFERS ");
        }

        let vertex_defines = format!("{common}{}", pass.vertex_defines);
        let pixel_defines = format!("{common}{}", pass.pixel_defines);
        let vertex_shader = self.compiler.compile(ShaderStage::Vertex, &pass.vertex_shader, &vertex_defines)?;
        let pixel_shader = self.compiler.compile(ShaderStage::Pixel, &pass.pixel_shader, &pixel_defines)?;

        let material = &key.material;
        let base_cull = if ctx.shadow_pass {
            material.shadow_cull_mode
        } else {
            pass.cull_mode.unwrap_or(material.cull_mode)
        };
        let cull_mode = if ctx.camera.reverse_culling {
            base_cull.flipped()
        } else {
            base_cull
        };

        let geometry = &key.geometry;
        Ok(PipelineStateDesc {
            vertex_elements: geometry.vertex_elements(),
            vertex_shader,
            pixel_shader,
            primitive: geometry.primitive,
            index_format: geometry.index_format,
            depth_write: pass.depth_write,
            depth_compare: pass.depth_compare,
            stencil_enabled: false,
            color_write: !ctx.shadow_pass,
            blend_mode: pass.blend_mode,
            alpha_to_coverage: pass.alpha_to_coverage,
            fill_mode: material.fill_mode,
            cull_mode,
            depth_bias: if ctx.shadow_pass { 2 } else { 0 },
            slope_scaled_depth_bias: if ctx.shadow_pass { 2.0_f32.to_bits() } else { 0 },
        })
    }
}

impl SceneBatchCollectorCallback for DefaultSceneCallback {
    fn create_pipeline_state(
        &self,
        key: &ScenePipelineStateKey,
        ctx: &ScenePipelineStateContext<'_>,
    ) -> Option<Arc<PipelineState>> {
        match self.build_desc(key, ctx) {
            Ok(desc) => Some(self.registry.get_or_create(desc)),
            Err(err) => {
                let first = self
                    .reported_failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(failed_variation(&err));
                if first {
                    log::warn!(
                        "Failed to create pipeline state for pass '{}' of material '{}' on geometry '{}': {}",
                        key.pass.name, key.material.name, key.geometry.name, err
                    );
                }
                None
            }
        }
    }

    fn has_shadow(&self, light: &Light, distance: f32) -> bool {
        if !self.draw_shadows || !light.cast_shadows {
            return false;
        }
        if light.importance == LightImportance::NotImportant || light.shadow_intensity >= 1.0 {
            return false;
        }
        if light.shadow_distance > 0.0 && distance > light.shadow_distance {
            return false;
        }
        light.light_type != LightType::Point || self.point_light_shadows
    }

    fn get_temporary_shadow_map(&self, size: UVec2) -> Option<ShadowMap> {
        self.shadow_allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate_shadow_map(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::geometry::Geometry;
    use crate::renderer::material::{CullMode, Material, Pass};
    use crate::scene::camera::Camera;
    use crate::scene::drawable::GeometryType;
    use glam::Vec3;

    fn callback(shadows: &ShadowSettings) -> DefaultSceneCallback {
        DefaultSceneCallback::new(
            Arc::new(PermissiveShaderCompiler),
            Arc::new(Mutex::new(ShadowMapAllocator::new(2048, 1, 128))),
            shadows,
            true,
        )
    }

    fn key(pass: Pass) -> ScenePipelineStateKey {
        ScenePipelineStateKey {
            geometry_type: GeometryType::Static,
            geometry: Arc::new(Geometry::cube("cube")),
            material: Arc::new(Material::new("m").with_cull_mode(CullMode::Ccw, CullMode::Cw)),
            pass: Arc::new(pass),
            light_hash: 0,
            reverse_culling: false,
        }
    }

    #[test]
    fn unlit_pass_gets_tag_and_cbuffer_defines() {
        let factory = callback(&ShadowSettings::default());
        let camera = Camera::default();
        let ctx = ScenePipelineStateContext {
            shader_defines: "UNLIT ",
            shadow_pass: false,
            camera: &camera,
            light: None,
        };
        let desc = factory
            .build_desc(&key(Pass::new("base").with_shaders("Unlit", "Unlit")), &ctx)
            .expect("desc");
        assert_eq!(desc.pixel_shader.defines, "UNLIT USE_CBUFFERS");
        assert_eq!(desc.cull_mode, CullMode::Ccw);
    }

    #[test]
    fn reverse_culling_flips_and_shadow_pass_uses_shadow_cull() {
        let factory = callback(&ShadowSettings::default());
        let camera = Camera {
            reverse_culling: true,
            ..Camera::default()
        };
        let ctx = ScenePipelineStateContext {
            shader_defines: "",
            shadow_pass: true,
            camera: &camera,
            light: None,
        };
        let desc = factory
            .build_desc(&key(Pass::new("shadow").with_shaders("Shadow", "Shadow")), &ctx)
            .expect("desc");
        assert_eq!(desc.cull_mode, CullMode::Ccw);
        assert!(!desc.color_write);
    }

    #[test]
    fn missing_shader_is_an_error() {
        let factory = callback(&ShadowSettings::default());
        let camera = Camera::default();
        let ctx = ScenePipelineStateContext {
            shader_defines: "",
            shadow_pass: false,
            camera: &camera,
            light: None,
        };
        assert!(factory.create_pipeline_state(&key(Pass::new("base")), &ctx).is_none());
    }

    struct RejectingCompiler;

    impl ShaderCompiler for RejectingCompiler {
        fn compile(
            &self,
            stage: ShaderStage,
            name: &str,
            defines: &str,
        ) -> Result<ShaderVariation, PipelineStateError> {
            Err(PipelineStateError::Compilation {
                stage,
                name: name.to_owned(),
                defines: defines.to_owned(),
                reason: "rejected".to_owned(),
            })
        }
    }

    #[test]
    fn shared_failing_variation_is_reported_once() {
        let factory = DefaultSceneCallback::new(
            Arc::new(RejectingCompiler),
            Arc::new(Mutex::new(ShadowMapAllocator::new(2048, 1, 128))),
            &ShadowSettings::default(),
            true,
        );
        let camera = Camera::default();
        let ctx = ScenePipelineStateContext {
            shader_defines: "",
            shadow_pass: false,
            camera: &camera,
            light: None,
        };
        let pass = Pass::new("base").with_shaders("Lit", "Lit");
        let first = key(pass.clone());
        let second = ScenePipelineStateKey {
            material: Arc::new(Material::new("other")),
            ..key(pass)
        };

        assert!(factory.create_pipeline_state(&first, &ctx).is_none());
        assert!(factory.create_pipeline_state(&second, &ctx).is_none());
        assert_eq!(factory.reported_failures(), 1);

        let other_defines = ScenePipelineStateContext {
            shader_defines: "ALPHAMASK ",
            ..ctx
        };
        assert!(factory.create_pipeline_state(&first, &other_defines).is_none());
        assert_eq!(factory.reported_failures(), 2);
    }

    #[test]
    fn light_defines_depend_on_type_and_shadow() {
        let dir = Light::directional(Vec3::NEG_Y);
        assert_eq!(light_defines(&dir, true), "PERPIXEL SHADOW SIMPLE_SHADOW DIRLIGHT NUMVERTEXLIGHTS=4 ");
        assert_eq!(light_defines(&Light::point(Vec3::ZERO, 1.0), false), "PERPIXEL POINTLIGHT ");
    }

    #[test]
    fn has_shadow_rules() {
        let factory = callback(&ShadowSettings {
            point_light_shadows: false,
            ..ShadowSettings::default()
        });
        let shadowed = Light::directional(Vec3::NEG_Y).with_shadows(50.0, 0.2);
        assert!(factory.has_shadow(&shadowed, 0.0));
        assert!(!factory.has_shadow(&Light::directional(Vec3::NEG_Y), 0.0));
        assert!(!factory.has_shadow(&shadowed.clone().with_importance(LightImportance::NotImportant), 0.0));
        assert!(!factory.has_shadow(&Light::directional(Vec3::NEG_Y).with_shadows(50.0, 1.0), 0.0));

        let spot = Light::spot(Vec3::ZERO, Vec3::NEG_Z, 10.0, 45.0).with_shadows(20.0, 0.0);
        assert!(factory.has_shadow(&spot, 10.0));
        assert!(!factory.has_shadow(&spot, 30.0));

        let point = Light::point(Vec3::ZERO, 10.0).with_shadows(0.0, 0.0);
        assert!(!factory.has_shadow(&point, 1.0));
    }
}
