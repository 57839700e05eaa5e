#![allow(dead_code)]

use std::sync::Arc;

use glam::Vec3;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use scene_batcher::renderer::{
    BlendMode, CustomView, Geometry, Material, MaterialQuality, Pass, PermissiveShaderCompiler,
    RecordingDevice, Technique, WorkQueue,
};
use scene_batcher::scene::{Camera, IntRect, Light, LightNode, LinearSpatialIndex, SpatialIndex, StaticModel};
use scene_batcher::settings::RenderSettings;
use scene_batcher::FrameStats;

pub const VIEWPORT: IntRect = IntRect::new(0, 0, 640, 480);

pub fn camera() -> Camera {
    Camera {
        aspect_ratio: 640.0 / 480.0,
        ..Camera::default()
    }
}

pub fn view(settings: RenderSettings, threads: usize) -> CustomView {
    let work_queue = Arc::new(WorkQueue::new(threads).expect("work queue"));
    CustomView::new(settings, work_queue, Arc::new(PermissiveShaderCompiler))
}

pub fn base_only_material() -> Arc<Material> {
    let technique = Technique::new("Unlit").with_pass(Pass::new("base").with_shaders("Unlit", "Unlit"));
    Arc::new(Material::new("Unlit").with_technique(Arc::new(technique), MaterialQuality::Low, 0.0))
}

pub fn transparent_material() -> Arc<Material> {
    let technique = Technique::new("Alpha").with_pass(
        Pass::new("alpha")
            .with_shaders("Unlit", "Unlit")
            .with_blend_mode(BlendMode::Alpha)
            .with_depth(false, wgpu::CompareFunction::LessEqual),
    );
    Arc::new(Material::new("Alpha").with_technique(Arc::new(technique), MaterialQuality::Low, 0.0))
}

/// A scene whose geometry lives on a recording device.
pub struct TestScene {
    pub device: RecordingDevice,
    pub cube: Arc<Geometry>,
    pub scene: LinearSpatialIndex,
}

impl TestScene {
    pub fn new() -> Self {
        let mut device = RecordingDevice::new(true);
        let cube = Arc::new(Geometry::upload_cube(&mut device, "Cube").expect("cube upload"));
        Self {
            device,
            cube,
            scene: LinearSpatialIndex::new(),
        }
    }

    pub fn add_model(&mut self, position: Vec3, material: Option<Arc<Material>>) -> usize {
        let index = self.scene.next_index();
        let model = StaticModel::new(index, Arc::clone(&self.cube), material).with_position(position);
        self.scene.insert(Arc::new(model));
        index
    }

    pub fn add_shadow_caster(&mut self, position: Vec3, material: Option<Arc<Material>>) -> usize {
        let index = self.scene.next_index();
        let model = StaticModel::new(index, Arc::clone(&self.cube), material)
            .with_position(position)
            .with_cast_shadows(true);
        self.scene.insert(Arc::new(model));
        index
    }

    pub fn add_light(&mut self, light: Light) -> usize {
        let index = self.scene.next_index();
        self.scene.insert(Arc::new(LightNode::new(index, light)));
        index
    }

    /// Define `view` on this scene and draw one frame, recording only that frame's calls.
    pub fn render(&mut self, view: &mut CustomView) -> FrameStats {
        self.render_with(view, camera())
    }

    pub fn render_with(&mut self, view: &mut CustomView, camera: Camera) -> FrameStats {
        let scene: Arc<dyn SpatialIndex> = Arc::new(self.scene.clone());
        assert!(view.define(Some(scene), Some(camera), VIEWPORT));
        self.device.calls.clear();
        view.render(&mut self.device, 1.0 / 60.0)
    }
}

/// Shadow-casting cubes around the origin lit by a sun and a handful of point lights.
pub fn random_scene(seed: u64, models: usize, point_lights: usize) -> TestScene {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut test = TestScene::new();
    let material = Arc::new(Material::default_lit());

    test.add_light(Light::directional(Vec3::new(-0.3, -1.0, -0.4)).with_shadows(0.0, 0.4));
    for _ in 0..models {
        let position = Vec3::new(
            rng.gen_range(-6.0..6.0),
            rng.gen_range(-3.0..3.0),
            rng.gen_range(-12.0..-1.0),
        );
        test.add_shadow_caster(position, Some(Arc::clone(&material)));
    }
    for _ in 0..point_lights {
        let position = Vec3::new(
            rng.gen_range(-6.0..6.0),
            rng.gen_range(-3.0..3.0),
            rng.gen_range(-12.0..0.0),
        );
        let light = Light::point(position, rng.gen_range(2.0..8.0))
            .with_color(Vec3::new(rng.gen(), rng.gen(), rng.gen()))
            .with_shadows(0.0, rng.gen_range(0.0..0.9));
        test.add_light(light);
    }
    test
}
