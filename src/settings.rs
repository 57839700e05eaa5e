use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::renderer::light_accumulator::MAX_PIXEL_LIGHTS;
use crate::renderer::material::MaterialQuality;
use crate::renderer::sorting::BatchSortOrder;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    /// Zero picks one less than the available parallelism.
    #[serde(default)]
    pub worker_threads: usize,
    #[serde(default = "RenderSettings::default_max_pixel_lights")]
    pub max_pixel_lights: usize,
    #[serde(default)]
    pub material_quality: MaterialQuality,
    #[serde(default)]
    pub thresholds: WorkThresholds,
    #[serde(default)]
    pub shadows: ShadowSettings,
    #[serde(default = "RenderSettings::default_passes")]
    pub passes: Vec<ScenePassConfig>,
    /// Frames a cached scene light survives without being visible.
    #[serde(default = "RenderSettings::default_light_eviction_frames")]
    pub light_eviction_frames: u32,
    #[serde(default = "RenderSettings::default_constant_buffer_page_size")]
    pub constant_buffer_page_size: u32,
    #[serde(default = "RenderSettings::default_clear_color")]
    pub clear_color: [f32; 4],
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_pixel_lights: Self::default_max_pixel_lights(),
            material_quality: MaterialQuality::default(),
            thresholds: WorkThresholds::default(),
            shadows: ShadowSettings::default(),
            passes: Self::default_passes(),
            light_eviction_frames: Self::default_light_eviction_frames(),
            constant_buffer_page_size: Self::default_constant_buffer_page_size(),
            clear_color: Self::default_clear_color(),
        }
    }
}

impl RenderSettings {
    pub fn load() -> Self {
        Self::load_from_path("settings.json")
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RenderSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    pub fn validate(mut self) -> Self {
        if self.max_pixel_lights > MAX_PIXEL_LIGHTS {
            warn!(
                "At most {} per-pixel lights are supported. Clamping {}.",
                MAX_PIXEL_LIGHTS, self.max_pixel_lights
            );
            self.max_pixel_lights = MAX_PIXEL_LIGHTS;
        }

        let shadows = &mut self.shadows;
        if shadows.shadow_map_size == 0 || shadows.shadow_map_size > shadows.atlas_page_size {
            warn!("Shadow map size must be within the atlas page. Using default value.");
            shadows.shadow_map_size = ShadowSettings::default().shadow_map_size.min(shadows.atlas_page_size.max(1));
        }

        if !(1..=4).contains(&shadows.directional_cascades) {
            warn!("Directional cascades must be between 1 and 4. Using default value.");
            shadows.directional_cascades = ShadowSettings::default().directional_cascades;
        }

        if !(4..=6).contains(&shadows.point_shadow_faces) {
            warn!("Point light shadows need 4 to 6 faces. Using 6.");
            shadows.point_shadow_faces = 6;
        }

        if !(0.0..=1.0).contains(&shadows.cascade_split_lambda) {
            warn!("Cascade split lambda must be within [0, 1]. Using default value.");
            shadows.cascade_split_lambda = ShadowSettings::default().cascade_split_lambda;
        }

        if self.passes.iter().filter(|p| p.kind == ScenePassKind::Shadow).count() > 1 {
            warn!("Only one shadow pass is supported. Ignoring extra shadow passes.");
            let mut seen_shadow = false;
            self.passes.retain(|p| {
                if p.kind != ScenePassKind::Shadow {
                    return true;
                }
                !std::mem::replace(&mut seen_shadow, true)
            });
        }

        if self.constant_buffer_page_size < 256 {
            warn!("Constant buffer pages must hold at least 256 bytes. Using default value.");
            self.constant_buffer_page_size = Self::default_constant_buffer_page_size();
        }

        self
    }

    const fn default_max_pixel_lights() -> usize {
        MAX_PIXEL_LIGHTS
    }

    const fn default_light_eviction_frames() -> u32 {
        60
    }

    const fn default_constant_buffer_page_size() -> u32 {
        64 * 1024
    }

    const fn default_clear_color() -> [f32; 4] {
        [0.1, 0.1, 0.12, 1.0]
    }

    fn default_passes() -> Vec<ScenePassConfig> {
        vec![
            ScenePassConfig::forward_lighting("base", "litbase", "light", BatchSortOrder::ByState),
            ScenePassConfig::unlit("alpha", BatchSortOrder::BackToFront),
            ScenePassConfig::shadow("shadow"),
        ]
    }
}

/// Minimum number of items per parallel task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkThresholds {
    pub drawables: usize,
    pub lit_geometries: usize,
    pub batches: usize,
}

impl Default for WorkThresholds {
    fn default() -> Self {
        Self {
            drawables: 64,
            lit_geometries: 64,
            batches: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowSettings {
    pub enabled: bool,
    pub point_light_shadows: bool,
    /// Requested size of each split's shadow map.
    pub shadow_map_size: u32,
    pub atlas_page_size: u32,
    pub max_atlas_pages: usize,
    pub min_shadow_map_size: u32,
    pub directional_cascades: usize,
    /// Blend between uniform (0) and logarithmic (1) cascade splits.
    pub cascade_split_lambda: f32,
    pub point_shadow_faces: usize,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            point_light_shadows: true,
            shadow_map_size: 1024,
            atlas_page_size: 4096,
            max_atlas_pages: 2,
            min_shadow_map_size: 128,
            directional_cascades: 4,
            cascade_split_lambda: 0.5,
            point_shadow_faces: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenePassKind {
    Unlit,
    ForwardLighting,
    Shadow,
}

/// One scene pass as configured for a view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenePassConfig {
    pub kind: ScenePassKind,
    /// Prefix for the shader defines of this pass, e.g. `OPAQUE` gives `OPAQUE_LITBASE`.
    #[serde(default)]
    pub tag: String,
    /// Technique pass for unlit geometry, or the shadow pass name.
    pub base_pass: String,
    #[serde(default)]
    pub lit_base_pass: Option<String>,
    #[serde(default)]
    pub light_pass: Option<String>,
    #[serde(default)]
    pub sort_order: BatchSortOrder,
}

impl ScenePassConfig {
    pub fn unlit(base_pass: &str, sort_order: BatchSortOrder) -> Self {
        Self {
            kind: ScenePassKind::Unlit,
            tag: String::new(),
            base_pass: base_pass.to_owned(),
            lit_base_pass: None,
            light_pass: None,
            sort_order,
        }
    }

    pub fn forward_lighting(
        base_pass: &str,
        lit_base_pass: &str,
        light_pass: &str,
        sort_order: BatchSortOrder,
    ) -> Self {
        Self {
            kind: ScenePassKind::ForwardLighting,
            tag: String::new(),
            base_pass: base_pass.to_owned(),
            lit_base_pass: Some(lit_base_pass.to_owned()),
            light_pass: Some(light_pass.to_owned()),
            sort_order,
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    pub fn shadow(shadow_pass: &str) -> Self {
        Self {
            kind: ScenePassKind::Shadow,
            tag: String::new(),
            base_pass: shadow_pass.to_owned(),
            lit_base_pass: None,
            light_pass: None,
            sort_order: BatchSortOrder::ByState,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_settings() -> RenderSettings {
        RenderSettings {
            max_pixel_lights: 16,
            shadows: ShadowSettings {
                shadow_map_size: 0,
                directional_cascades: 9,
                point_shadow_faces: 2,
                cascade_split_lambda: 3.0,
                ..ShadowSettings::default()
            },
            passes: vec![ScenePassConfig::shadow("shadow"), ScenePassConfig::shadow("shadow2")],
            constant_buffer_page_size: 16,
            ..RenderSettings::default()
        }
    }

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let validated = invalid_settings().validate();
        let defaults = ShadowSettings::default();

        assert_eq!(validated.max_pixel_lights, MAX_PIXEL_LIGHTS);
        assert_eq!(validated.shadows.shadow_map_size, defaults.shadow_map_size);
        assert_eq!(validated.shadows.directional_cascades, defaults.directional_cascades);
        assert_eq!(validated.shadows.point_shadow_faces, 6);
        assert_eq!(validated.shadows.cascade_split_lambda, defaults.cascade_split_lambda);
        assert_eq!(validated.passes.len(), 1);
        assert_eq!(validated.passes[0].base_pass, "shadow");
        assert_eq!(
            validated.constant_buffer_page_size,
            RenderSettings::default().constant_buffer_page_size
        );
    }

    #[test]
    fn missing_fields_use_defaults() {
        let parsed: RenderSettings =
            serde_json::from_str(r#"{ "max_pixel_lights": 2 }"#).expect("valid json");
        assert_eq!(parsed.max_pixel_lights, 2);
        assert_eq!(parsed.passes.len(), 3);
        assert_eq!(parsed.passes[0].kind, ScenePassKind::ForwardLighting);
        assert!(parsed.shadows.enabled);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = RenderSettings::load_from_path("definitely/not/here.json");
        assert_eq!(settings.max_pixel_lights, MAX_PIXEL_LIGHTS);
    }
}
