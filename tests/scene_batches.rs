mod common;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError};

use glam::Vec3;

use common::{base_only_material, random_scene, transparent_material, view, TestScene};
use scene_batcher::renderer::sorting::BatchSortedByState;
use scene_batcher::renderer::{CustomView, DeviceCall, Material, ScenePass, MAX_VERTEX_LIGHTS, NO_LIGHT};
use scene_batcher::scene::{Light, StaticModel};
use scene_batcher::settings::{RenderSettings, ShadowSettings, WorkThresholds};

fn forward_pass(view: &CustomView) -> &scene_batcher::renderer::scene_pass::ForwardLightingScenePass {
    view.collector()
        .scene_passes()
        .iter()
        .find_map(ScenePass::as_forward_lighting)
        .expect("forward lighting pass")
}

fn single_cascade() -> RenderSettings {
    RenderSettings {
        shadows: ShadowSettings {
            directional_cascades: 1,
            ..ShadowSettings::default()
        },
        ..RenderSettings::default()
    }
}

#[test]
fn empty_scene_draws_nothing_and_clears_once() {
    let mut test = TestScene::new();
    let mut view = view(RenderSettings::default(), 2);
    let stats = test.render(&mut view);

    assert_eq!(test.device.clear_count(), 1);
    assert_eq!(test.device.draw_count(), 0);
    assert_eq!((stats.base_batches, stats.light_batches, stats.shadow_batches), (0, 0, 0));
    assert!(view.collector().main_light().is_none());
}

#[test]
fn base_only_material_gives_one_unlit_batch() {
    let mut test = TestScene::new();
    let model = test.add_model(Vec3::ZERO, Some(base_only_material()));
    let mut view = view(RenderSettings::default(), 2);
    let stats = test.render(&mut view);

    let pass = forward_pass(&view);
    assert_eq!(pass.unlit_base_batches().len(), 1);
    assert!(pass.lit_base_batches().is_empty());
    assert!(pass.light_batches().is_empty());

    let batch = &pass.unlit_base_batches()[0];
    assert_eq!(batch.drawable_index(), model);
    assert_eq!(batch.light_index, NO_LIGHT);
    assert!(batch.pipeline_state.is_some());
    assert_eq!(stats.base_batches, 1);
    assert_eq!(test.device.draw_count(), 1);
}

#[test]
fn shadowed_directional_light_lits_and_shadows_the_model() {
    let mut test = TestScene::new();
    test.add_light(Light::directional(Vec3::new(0.2, -1.0, -0.3)).with_shadows(0.0, 0.5));
    let model = test.add_shadow_caster(Vec3::ZERO, Some(Arc::new(Material::default_lit())));
    let mut view = view(single_cascade(), 2);
    let stats = test.render(&mut view);

    let collector = view.collector();
    assert_eq!(collector.main_light_index(), Some(0));
    let light = &collector.visible_lights()[0];
    assert!(light.has_shadow());
    assert_eq!(light.num_splits(), 1);

    let split = &light.splits()[0];
    assert!(split.shadow_map.is_some());
    let casters: Vec<_> = split.shadow_batches.iter().map(|b| b.drawable_index()).collect();
    assert_eq!(casters, vec![model]);

    let pass = forward_pass(&view);
    assert!(pass.unlit_base_batches().is_empty());
    assert_eq!(pass.lit_base_batches().len(), 1);
    assert_eq!(pass.lit_base_batches()[0].light_index, 0);
    assert!(pass.light_batches().is_empty());

    assert_eq!((stats.shadow_splits, stats.shadow_batches), (1, 1));
    assert_eq!(test.device.draw_count(), 2);
    assert_eq!(
        test.device.count(|call| matches!(call, DeviceCall::CreateDepthTexture { .. })),
        1
    );
}

#[test]
fn closer_point_light_is_per_pixel_and_the_other_per_vertex() {
    let mut test = TestScene::new();
    test.add_light(Light::point(Vec3::new(5.5, 0.0, 0.0), 20.0));
    test.add_light(Light::point(Vec3::new(-10.5, 0.0, 0.0), 20.0));
    let model = test.add_model(Vec3::ZERO, Some(Arc::new(Material::default_lit())));
    let mut view = view(
        RenderSettings {
            max_pixel_lights: 1,
            ..RenderSettings::default()
        },
        2,
    );
    test.render(&mut view);

    let collector = view.collector();
    let pixel: Vec<_> = collector.pixel_lights(model).iter().map(|s| s.light_index).collect();
    assert_eq!(pixel, vec![0]);
    let vertex = collector.vertex_light_indices(model);
    assert_eq!(vertex[0], 1);
    assert!(vertex[1..].iter().all(|&index| index == NO_LIGHT));

    let pass = forward_pass(&view);
    assert_eq!(pass.lit_base_batches().len(), 1);
    assert_eq!(pass.lit_base_batches()[0].light_index, 0);
    assert!(pass.light_batches().is_empty());
    assert_eq!(test.device.draw_count(), 1);
}

#[test]
fn extra_pixel_lights_become_additive_batches() {
    let mut test = TestScene::new();
    test.add_light(Light::point(Vec3::new(2.5, 0.0, 0.0), 20.0));
    test.add_light(Light::point(Vec3::new(-4.5, 0.0, 0.0), 20.0));
    let model = test.add_model(Vec3::ZERO, Some(Arc::new(Material::default_lit())));
    let mut view = view(RenderSettings::default(), 2);
    let stats = test.render(&mut view);

    let pass = forward_pass(&view);
    assert_eq!(pass.lit_base_batches().len(), 1);
    assert_eq!(pass.lit_base_batches()[0].light_index, 0);
    assert_eq!(pass.light_batches().len(), 1);
    assert_eq!(pass.light_batches()[0].light_index, 1);
    assert_eq!(pass.light_batches()[0].drawable_index(), model);
    assert_eq!(stats.light_batches, 1);
    assert_eq!(test.device.draw_count(), 2);
}

#[test]
fn transparent_batches_are_drawn_back_to_front() {
    let mut test = TestScene::new();
    let material = transparent_material();
    let near = test.add_model(Vec3::ZERO, Some(Arc::clone(&material)));
    let far = test.add_model(Vec3::new(0.0, 0.0, -4.0), Some(material));
    let mut view = view(RenderSettings::default(), 2);
    test.render(&mut view);

    let pass = view
        .collector()
        .scene_passes()
        .iter()
        .find_map(ScenePass::as_unlit)
        .expect("alpha pass");
    let order: Vec<_> = pass
        .sorted_batches()
        .iter(pass.batches())
        .map(|batch| (batch.drawable_index(), batch.distance.round()))
        .collect();
    assert_eq!(order, vec![(far, 7.0), (near, 3.0)]);
    assert!(forward_pass(&view).unlit_base_batches().is_empty());
    assert_eq!(test.device.draw_count(), 2);
}

type BatchKey = (usize, u32, String);

fn batch_keys<'a>(batches: impl Iterator<Item = &'a scene_batcher::renderer::BaseSceneBatch>) -> Vec<BatchKey> {
    batches
        .map(|batch| (batch.drawable_index(), batch.light_index, batch.pass.name.clone()))
        .collect()
}

/// Everything the collector produced for a frame, in draw order.
fn frame_signature(view: &CustomView) -> Vec<Vec<BatchKey>> {
    let collector = view.collector();
    let mut signature = Vec::new();
    for pass in collector.scene_passes() {
        match pass {
            ScenePass::OpaqueForwardLighting(pass) => {
                signature.push(batch_keys(pass.sorted_unlit_base_batches().iter(pass.unlit_base_batches())));
                signature.push(batch_keys(pass.sorted_lit_base_batches().iter(pass.lit_base_batches())));
                let light_batches = pass.light_batches();
                signature.push(batch_keys(
                    pass.sorted_light_batches()
                        .iter()
                        .filter_map(|sorted| light_batches.get(sorted.by_state.batch_index)),
                ));
            }
            ScenePass::Unlit(pass) => signature.push(batch_keys(pass.sorted_batches().iter(pass.batches()))),
            ScenePass::Shadow(_) => {}
        }
    }
    for light in collector.visible_lights() {
        for split in light.splits() {
            signature.push(batch_keys(
                split
                    .sorted_shadow_batches
                    .iter()
                    .filter_map(|sorted| split.shadow_batches.get(sorted.batch_index)),
            ));
        }
    }
    for geometry in collector.visible_geometries() {
        let index = geometry.drawable_index();
        let pixel = collector.pixel_lights(index).iter().map(|s| (index, s.light_index, String::from("pixel")));
        let vertex = collector
            .vertex_light_indices(index)
            .into_iter()
            .map(|light| (index, light, String::from("vertex")));
        signature.push(pixel.chain(vertex).collect());
    }
    signature
}

fn parallel_settings() -> RenderSettings {
    RenderSettings {
        thresholds: WorkThresholds {
            drawables: 1,
            lit_geometries: 1,
            batches: 1,
        },
        ..RenderSettings::default()
    }
}

#[test]
fn results_do_not_depend_on_thread_count() {
    for seed in [1, 2, 3] {
        let mut test = random_scene(seed, 80, 8);
        let mut single = view(parallel_settings(), 1);
        let mut parallel = view(parallel_settings(), 4);

        let single_stats = test.render(&mut single);
        let single_calls = std::mem::take(&mut test.device.calls);
        let parallel_stats = test.render(&mut parallel);

        assert!(single_stats.base_batches > 0);
        assert_eq!(single_stats, parallel_stats);
        assert_eq!(frame_signature(&single), frame_signature(&parallel));
        assert_eq!(single_calls.len(), test.device.calls.len());

        let first = frame_signature(&single);
        test.render(&mut single);
        assert_eq!(frame_signature(&single), first);
    }
}

#[test]
fn opaque_batches_are_sorted_by_state_key() {
    let mut test = random_scene(9, 80, 6);
    let mut view = view(parallel_settings(), 2);
    test.render(&mut view);

    let pass = forward_pass(&view);
    for (batches, sorted) in [
        (pass.unlit_base_batches(), pass.sorted_unlit_base_batches()),
        (pass.lit_base_batches(), pass.sorted_lit_base_batches()),
    ] {
        let keys: Vec<_> = sorted
            .indices()
            .into_iter()
            .map(|index| BatchSortedByState::new(&batches[index], index))
            .collect();
        assert_eq!(keys.len(), batches.len());
        for pair in keys.windows(2) {
            assert_ne!(pair[0].compare(&pair[1]), Ordering::Greater);
        }
    }
    assert!(!pass.lit_base_batches().is_empty());
}

#[test]
fn pixel_and_vertex_lights_are_disjoint_and_bounded() {
    let settings = RenderSettings {
        max_pixel_lights: 2,
        ..parallel_settings()
    };
    for seed in [4, 5, 6] {
        let mut test = random_scene(seed, 60, 12);
        let mut view = view(settings.clone(), 3);
        test.render(&mut view);

        let collector = view.collector();
        let num_lights = collector.visible_lights().len() as u32;
        for geometry in collector.visible_geometries() {
            let index = geometry.drawable_index();
            let pixel: HashSet<u32> = collector.pixel_lights(index).iter().map(|s| s.light_index).collect();
            let vertex: HashSet<u32> = collector
                .vertex_light_indices(index)
                .into_iter()
                .filter(|&light| light != NO_LIGHT)
                .collect();

            assert!(pixel.len() <= 2);
            assert!(vertex.len() <= MAX_VERTEX_LIGHTS);
            assert!(pixel.is_disjoint(&vertex));
            assert!(pixel.iter().chain(&vertex).all(|&light| light < num_lights));
            for &light in pixel.iter().chain(&vertex) {
                assert!(collector.visible_lights()[light as usize].is_lit_geometry(index));
            }
        }
    }
}

#[test]
fn shadow_tiles_never_overlap_within_a_frame() {
    let settings = RenderSettings {
        shadows: ShadowSettings {
            shadow_map_size: 512,
            atlas_page_size: 2048,
            max_atlas_pages: 1,
            min_shadow_map_size: 128,
            ..ShadowSettings::default()
        },
        ..parallel_settings()
    };
    for seed in [7, 8] {
        let mut test = random_scene(seed, 40, 10);
        let mut view = view(settings.clone(), 2);
        let stats = test.render(&mut view);

        let allocator = view.shadow_allocator().lock().unwrap_or_else(PoisonError::into_inner);
        let maps = allocator.allocations();
        for (i, a) in maps.iter().enumerate() {
            assert!(a.rect.right <= 2048 && a.rect.bottom <= 2048);
            for b in &maps[i + 1..] {
                assert!(a.page != b.page || !a.rect.overlaps(&b.rect), "{a:?} overlaps {b:?}");
            }
        }

        let mut assigned = 0;
        for light in view.collector().visible_lights() {
            if !light.has_shadow() {
                assert_eq!(light.num_splits(), 0);
                continue;
            }
            for split in light.splits() {
                let map = split.shadow_map.expect("shadowed split has a tile");
                assert!(maps.contains(&map));
                assigned += 1;
            }
        }
        assert_eq!(assigned, stats.shadow_splits);
    }
}

#[test]
fn masked_out_model_is_drawn_with_ambient_only() {
    let mut test = TestScene::new();
    test.add_light(Light::point(Vec3::new(2.0, 0.0, 0.0), 10.0).with_light_mask(0b10));
    let index = test.scene.next_index();
    let model = StaticModel::new(index, Arc::clone(&test.cube), Some(Arc::new(Material::default_lit())))
        .with_light_mask(0b01);
    test.scene.insert(Arc::new(model));
    let mut view = view(RenderSettings::default(), 1);
    test.render(&mut view);

    assert!(view.collector().pixel_lights(index).is_empty());
    let pass = forward_pass(&view);
    assert!(pass.unlit_base_batches().is_empty());
    assert_eq!(pass.lit_base_batches().len(), 1);
    assert_eq!(pass.lit_base_batches()[0].light_index, NO_LIGHT);
    assert!(pass.light_batches().is_empty());
}
