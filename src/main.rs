use std::error::Error;
use std::sync::Arc;

use glam::Vec3;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use scene_batcher::renderer::{CustomView, Geometry, Material, PermissiveShaderCompiler, RecordingDevice, WorkQueue};
use scene_batcher::scene::{
    Camera, IntRect, Light, LightImportance, LightNode, LinearSpatialIndex, SpatialIndex, StaticModel,
};
use scene_batcher::settings::RenderSettings;

const FRAME_COUNT: u32 = 8;
const MODEL_COUNT: usize = 400;
const POINT_LIGHT_COUNT: usize = 12;
const SCENE_EXTENT: f32 = 40.0;

fn build_scene(device: &mut RecordingDevice, rng: &mut SmallRng) -> Option<LinearSpatialIndex> {
    let cube = Arc::new(Geometry::upload_cube(device, "Cube")?);
    let material = Arc::new(Material::default_lit());
    let mut scene = LinearSpatialIndex::new();

    let sun = Light::directional(Vec3::new(-0.3, -1.0, -0.2))
        .with_importance(LightImportance::Important)
        .with_shadows(0.0, 0.3);
    let index = scene.next_index();
    scene.insert(Arc::new(LightNode::new(index, sun)));

    let floor = StaticModel::new(scene.next_index(), Arc::clone(&cube), Some(Arc::clone(&material)))
        .with_scale(Vec3::new(SCENE_EXTENT * 2.0, 0.5, SCENE_EXTENT * 2.0))
        .with_position(Vec3::new(0.0, -0.25, 0.0));
    scene.insert(Arc::new(floor));

    for _ in 0..MODEL_COUNT {
        let position = Vec3::new(
            rng.gen_range(-SCENE_EXTENT..SCENE_EXTENT),
            rng.gen_range(0.5..4.0),
            rng.gen_range(-SCENE_EXTENT..SCENE_EXTENT),
        );
        let model = StaticModel::new(scene.next_index(), Arc::clone(&cube), Some(Arc::clone(&material)))
            .with_position(position)
            .with_scale(Vec3::splat(rng.gen_range(0.5..2.0)))
            .with_cast_shadows(true);
        scene.insert(Arc::new(model));
    }

    for _ in 0..POINT_LIGHT_COUNT {
        let position = Vec3::new(
            rng.gen_range(-SCENE_EXTENT..SCENE_EXTENT),
            rng.gen_range(2.0..6.0),
            rng.gen_range(-SCENE_EXTENT..SCENE_EXTENT),
        );
        let color = Vec3::new(rng.gen(), rng.gen(), rng.gen());
        let light = Light::point(position, rng.gen_range(5.0..15.0)).with_color(color);
        let index = scene.next_index();
        scene.insert(Arc::new(LightNode::new(index, light)));
    }

    Some(scene)
}

fn orbit_camera(frame: u32) -> Camera {
    let angle = frame as f32 * 0.15;
    Camera {
        eye: Vec3::new(angle.sin() * 30.0, 15.0, angle.cos() * 30.0),
        target: Vec3::ZERO,
        far: 150.0,
        aspect_ratio: 1280.0 / 720.0,
        ..Camera::default()
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    scene_batcher::init_logging();

    let settings = RenderSettings::load();
    let work_queue = Arc::new(WorkQueue::new(settings.worker_threads)?);
    let mut device = RecordingDevice::new(true);
    let mut rng = SmallRng::seed_from_u64(0x5eed);

    let scene = build_scene(&mut device, &mut rng).ok_or("failed to upload demo geometry")?;
    info!("Demo scene has {} drawables", scene.len());
    let scene: Arc<dyn SpatialIndex> = Arc::new(scene);

    let mut view = CustomView::new(settings, work_queue, Arc::new(PermissiveShaderCompiler));
    let viewport = IntRect::new(0, 0, 1280, 720);

    for frame in 0..FRAME_COUNT {
        if !view.define(Some(Arc::clone(&scene)), Some(orbit_camera(frame)), viewport) {
            return Err("view has no scene or camera".into());
        }
        device.calls.clear();
        let stats = view.render(&mut device, 1.0 / 60.0);
        info!(
            "Frame {}: {} geometries, {} lights, {} base / {} light / {} shadow batches, {} draws",
            stats.frame_number,
            stats.visible_geometries,
            stats.visible_lights,
            stats.base_batches,
            stats.light_batches,
            stats.shadow_batches,
            stats.draws,
        );
        println!("{}", serde_json::to_string(&stats)?);
    }

    view.release(&mut device);
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Demo error: {err}");
        std::process::exit(1);
    }
}
