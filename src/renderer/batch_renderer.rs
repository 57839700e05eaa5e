use std::collections::HashMap;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use log::{debug, warn};

use super::batch::BaseSceneBatch;
use super::collector::SceneBatchCollector;
use super::constant_buffer::{ConstantBufferLayout, ConstantBufferRange, ConstantBufferRing};
use super::device::{BufferId, DrawCall, GpuObject, RenderDevice};
use super::draw_queue::DrawCommandQueue;
use super::geometry::Geometry;
use super::light_accumulator::{MAX_VERTEX_LIGHTS, NO_LIGHT};
use super::material::Material;
use super::scene_light::{SceneLight, ShadowCamera, MAX_LIGHT_SPLITS};
use super::shader_params::{ShaderParameterGroup, ShaderParameterValue, TextureUnit};
use super::shadow_atlas::ShadowMapAllocator;
use crate::scene::camera::Camera;
use crate::scene::drawable::AmbientSh;
use crate::scene::light::{Light, LightType};

/// Three rows per vertex light: color, direction, position.
pub const VERTEX_LIGHT_ROWS: usize = MAX_VERTEX_LIGHTS * 3;

bitflags! {
    /// Lighting inputs bound for a group of batches.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BatchRenderFlags: u8 {
        const PIXEL_LIGHT = 1 << 0;
        const VERTEX_LIGHTS = 1 << 1;
        const AMBIENT = 1 << 2;
    }
}

type ShaderParameters = Vec<(String, ShaderParameterValue)>;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub view_proj: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub camera_pos: [f32; 3],
    pub near_clip: f32,
    pub far_clip: f32,
    pub _padding: [f32; 3],
}

impl CameraUniform {
    pub fn from_matrices(view: Mat4, proj: Mat4, camera_pos: Vec3, near_clip: f32, far_clip: f32) -> Self {
        Self {
            view_proj: (proj * view).to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            camera_pos: camera_pos.to_array(),
            near_clip,
            far_clip,
            _padding: [0.0; 3],
        }
    }

    pub fn from_camera(camera: &Camera) -> Self {
        Self::from_matrices(camera.view(), camera.proj(), camera.position(), camera.near, camera.far)
    }

    pub fn from_shadow_camera(camera: &ShadowCamera) -> Self {
        Self::from_matrices(camera.view, camera.proj, camera.position, 0.0, 0.0)
    }

    fn shader_parameters(&self) -> ShaderParameters {
        vec![
            ("ViewProj".to_owned(), ShaderParameterValue::Mat4(Mat4::from_cols_array_2d(&self.view_proj))),
            ("View".to_owned(), ShaderParameterValue::Mat4(Mat4::from_cols_array_2d(&self.view))),
            ("CameraPos".to_owned(), ShaderParameterValue::Vec3(Vec3::from_array(self.camera_pos))),
            ("NearClip".to_owned(), ShaderParameterValue::Float(self.near_clip)),
            ("FarClip".to_owned(), ShaderParameterValue::Float(self.far_clip)),
        ]
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ObjectUniform {
    pub model: [[f32; 4]; 4],
    pub ambient_sh: [[f32; 4]; 7],
}

impl ObjectUniform {
    pub fn new(model: Mat4, ambient: &AmbientSh) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            ambient_sh: ambient.rows.map(|row| row.to_array()),
        }
    }

    fn shader_parameters(&self) -> ShaderParameters {
        let mut parameters = vec![(
            "Model".to_owned(),
            ShaderParameterValue::Mat4(Mat4::from_cols_array_2d(&self.model)),
        )];
        parameters.extend(self.ambient_sh.iter().enumerate().map(|(i, row)| {
            (format!("AmbientSH{i}"), ShaderParameterValue::Vec4(Vec4::from_array(*row)))
        }));
        parameters
    }
}

/// Pixel light, its shadow splits and the drawable's vertex lights.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LightUniform {
    /// xyz position, w inverse range (zero for directional lights).
    pub position_inv_range: [f32; 4],
    /// xyz direction, w spot cutoff.
    pub direction_cutoff: [f32; 4],
    pub color: [f32; 4],
    /// x shadow intensity, y split count, z atlas page size.
    pub shadow_params: [f32; 4],
    /// Far depth of each directional cascade.
    pub shadow_split_depths: [f32; 4],
    pub shadow_matrices: [[[f32; 4]; 4]; MAX_LIGHT_SPLITS],
    pub vertex_light_rows: [[f32; 4]; VERTEX_LIGHT_ROWS],
    pub vertex_light_inv_ranges: [f32; 4],
}

fn inv_range(light: &Light) -> f32 {
    match light.light_type {
        LightType::Directional => 0.0,
        LightType::Point | LightType::Spot => 1.0 / light.range.max(f32::EPSILON),
    }
}

fn spot_cutoff(light: &Light) -> f32 {
    match light.light_type {
        LightType::Spot => (light.fov_degrees.to_radians() * 0.5).cos(),
        LightType::Directional | LightType::Point => 0.0,
    }
}

impl LightUniform {
    pub fn new(pixel_light: Option<&SceneLight>, vertex_lights: &[Option<&Light>; MAX_VERTEX_LIGHTS]) -> Self {
        let mut uniform = Self::zeroed();

        if let Some(scene_light) = pixel_light {
            let light = scene_light.light();
            uniform.position_inv_range = light.position.extend(inv_range(light)).to_array();
            uniform.direction_cutoff = light
                .direction
                .normalize_or_zero()
                .extend(spot_cutoff(light))
                .to_array();
            uniform.color = light.effective_color().extend(1.0).to_array();

            if scene_light.has_shadow() {
                let splits = scene_light.splits();
                // Only one atlas page can be bound; splits placed elsewhere stay unshadowed.
                let page = splits.first().and_then(|split| split.shadow_map).map(|map| map.page);
                let page_size = splits
                    .first()
                    .and_then(|split| split.shadow_map)
                    .map_or(0, |map| map.atlas_size);
                uniform.shadow_params = [
                    light.shadow_intensity,
                    splits.len() as f32,
                    page_size as f32,
                    0.0,
                ];
                for (index, split) in splits.iter().take(MAX_LIGHT_SPLITS).enumerate() {
                    if split.shadow_map.map(|map| map.page) == page {
                        uniform.shadow_matrices[index] = split.shadow_matrix.to_cols_array_2d();
                    } else {
                        debug!("Shadow split {} of light {} is on another atlas page", index, scene_light.drawable_index());
                    }
                    if index < 4 && split.z_range.is_valid() {
                        uniform.shadow_split_depths[index] = split.z_range.max;
                    }
                }
            } else {
                uniform.shadow_params[0] = 1.0;
            }
        }

        let rows = vertex_light_rows(vertex_lights);
        for (dst, row) in uniform.vertex_light_rows.iter_mut().zip(&rows) {
            *dst = row.extend(0.0).to_array();
        }
        for (dst, light) in uniform.vertex_light_inv_ranges.iter_mut().zip(vertex_lights) {
            *dst = light.map_or(0.0, inv_range);
        }
        uniform
    }

    fn shader_parameters(&self) -> ShaderParameters {
        let mut parameters = vec![
            ("LightPos".to_owned(), ShaderParameterValue::Vec4(Vec4::from_array(self.position_inv_range))),
            ("LightDir".to_owned(), ShaderParameterValue::Vec4(Vec4::from_array(self.direction_cutoff))),
            ("LightColor".to_owned(), ShaderParameterValue::Vec4(Vec4::from_array(self.color))),
            ("ShadowParams".to_owned(), ShaderParameterValue::Vec4(Vec4::from_array(self.shadow_params))),
            ("ShadowSplits".to_owned(), ShaderParameterValue::Vec4(Vec4::from_array(self.shadow_split_depths))),
            (
                "VertexLightInvRanges".to_owned(),
                ShaderParameterValue::Vec4(Vec4::from_array(self.vertex_light_inv_ranges)),
            ),
        ];
        parameters.extend(self.shadow_matrices.iter().enumerate().map(|(i, matrix)| {
            (format!("LightMatrices{i}"), ShaderParameterValue::Mat4(Mat4::from_cols_array_2d(matrix)))
        }));
        parameters.extend(self.vertex_light_rows.iter().enumerate().map(|(i, row)| {
            (format!("VertexLights{i}"), ShaderParameterValue::Vec3(Vec4::from_array(*row).truncate()))
        }));
        parameters
    }
}

/// Color, direction and position rows for up to `MAX_VERTEX_LIGHTS` lights; empty slots are zero.
pub fn vertex_light_rows(lights: &[Option<&Light>; MAX_VERTEX_LIGHTS]) -> [Vec3; VERTEX_LIGHT_ROWS] {
    let mut rows = [Vec3::ZERO; VERTEX_LIGHT_ROWS];
    for (slot, light) in lights.iter().enumerate() {
        let Some(light) = light else {
            continue;
        };
        rows[slot * 3] = light.effective_color();
        rows[slot * 3 + 1] = light.direction.normalize_or_zero();
        rows[slot * 3 + 2] = light.position;
    }
    rows
}

pub struct SceneBatchRenderContext<'a> {
    pub collector: &'a SceneBatchCollector,
    pub shadow_atlas: &'a ShadowMapAllocator,
}

impl SceneBatchRenderContext<'_> {
    fn light(&self, index: u32) -> Option<&SceneLight> {
        if index == NO_LIGHT {
            return None;
        }
        self.collector.visible_lights().get(index as usize)
    }
}

type LightBlockKey = (u32, [u32; MAX_VERTEX_LIGHTS]);

/// Turns sorted scene batches into draw commands.
///
/// Uniform blocks go through a ring of paged constant buffers; objects,
/// materials and light combinations are uploaded once per frame and reused.
/// Call `apply` before executing the recorded queue.
pub struct SceneBatchRenderer {
    ring: ConstantBufferRing,
    object_blocks: HashMap<(usize, usize, bool), ConstantBufferRange>,
    light_blocks: HashMap<LightBlockKey, ConstantBufferRange>,
    material_blocks: HashMap<u64, Option<ConstantBufferRange>>,
    reported_block_failure: bool,
}

impl SceneBatchRenderer {
    pub fn new(constant_buffer_page_size: u32) -> Self {
        Self {
            ring: ConstantBufferRing::new(constant_buffer_page_size),
            object_blocks: HashMap::new(),
            light_blocks: HashMap::new(),
            material_blocks: HashMap::new(),
            reported_block_failure: false,
        }
    }

    pub fn begin_frame(&mut self) {
        self.ring.begin_frame();
        self.object_blocks.clear();
        self.light_blocks.clear();
        self.material_blocks.clear();
        self.reported_block_failure = false;
    }

    /// Upload every uniform block written this frame.
    pub fn apply(&mut self, device: &mut dyn RenderDevice) {
        self.ring.apply(device);
    }

    pub fn num_constant_buffer_pages(&self) -> usize {
        self.ring.num_pages()
    }

    pub fn set_camera(
        &mut self,
        device: &mut dyn RenderDevice,
        queue: &mut DrawCommandQueue,
        ctx: &SceneBatchRenderContext<'_>,
        camera: &CameraUniform,
    ) -> bool {
        if !queue.constant_buffers_enabled() {
            set_parameters(queue, &camera.shader_parameters());
            return true;
        }
        match self.add_block(device, ctx, bytemuck::bytes_of(camera)) {
            Some(range) => {
                queue.set_constant_buffer(ShaderParameterGroup::Camera, range);
                true
            }
            None => false,
        }
    }

    /// Record draws for `batches` in the given order. Returns the number of draws recorded.
    pub fn render_batches<'b>(
        &mut self,
        device: &mut dyn RenderDevice,
        queue: &mut DrawCommandQueue,
        ctx: &SceneBatchRenderContext<'_>,
        flags: BatchRenderFlags,
        batches: impl IntoIterator<Item = &'b BaseSceneBatch>,
    ) -> usize {
        let mut draws = 0;
        for batch in batches {
            if self.render_batch(device, queue, ctx, flags, batch) {
                draws += 1;
            }
        }
        draws
    }

    fn render_batch(
        &mut self,
        device: &mut dyn RenderDevice,
        queue: &mut DrawCommandQueue,
        ctx: &SceneBatchRenderContext<'_>,
        flags: BatchRenderFlags,
        batch: &BaseSceneBatch,
    ) -> bool {
        let Some(state) = batch.pipeline_state.as_ref() else {
            return false;
        };
        let Some(vertex_buffers) = geometry_buffers(&batch.geometry) else {
            debug!("Geometry '{}' has no GPU buffers, skipping batch", batch.geometry.name);
            return false;
        };
        let drawable_index = batch.drawable_index();
        let Some(frame) = ctx.collector.drawable_frame(drawable_index) else {
            return false;
        };
        let Some(source) = frame.data.batches.get(batch.source_batch_index) else {
            return false;
        };

        if flags.intersects(BatchRenderFlags::PIXEL_LIGHT | BatchRenderFlags::VERTEX_LIGHTS)
            && !self.bind_lights(device, queue, ctx, flags, batch)
        {
            return false;
        }
        if !self.bind_material(device, queue, ctx, &batch.material) {
            return false;
        }

        let with_ambient = flags.contains(BatchRenderFlags::AMBIENT);
        let ambient = if with_ambient {
            frame.data.ambient
        } else {
            AmbientSh::default()
        };
        let object = ObjectUniform::new(source.world_transform, &ambient);
        if queue.constant_buffers_enabled() {
            let key = (drawable_index, batch.source_batch_index, with_ambient);
            let range = match self.object_blocks.get(&key) {
                Some(range) => *range,
                None => {
                    let Some(range) = self.add_block(device, ctx, bytemuck::bytes_of(&object)) else {
                        return false;
                    };
                    self.object_blocks.insert(key, range);
                    range
                }
            };
            queue.set_constant_buffer(ShaderParameterGroup::Object, range);
        } else {
            set_parameters(queue, &object.shader_parameters());
        }

        queue.set_pipeline_state(state);
        queue.set_vertex_buffers(&vertex_buffers);
        queue.set_index_buffer(if batch.geometry.is_indexed() {
            batch.geometry.index_buffer
        } else {
            None
        });
        queue.draw(draw_call(&batch.geometry));
        true
    }

    fn bind_lights(
        &mut self,
        device: &mut dyn RenderDevice,
        queue: &mut DrawCommandQueue,
        ctx: &SceneBatchRenderContext<'_>,
        flags: BatchRenderFlags,
        batch: &BaseSceneBatch,
    ) -> bool {
        let pixel_index = if flags.contains(BatchRenderFlags::PIXEL_LIGHT) {
            batch.light_index
        } else {
            NO_LIGHT
        };
        let vertex_indices = if flags.contains(BatchRenderFlags::VERTEX_LIGHTS) {
            ctx.collector.vertex_light_indices(batch.drawable_index())
        } else {
            [NO_LIGHT; MAX_VERTEX_LIGHTS]
        };

        let pixel_light = ctx.light(pixel_index);
        if let Some(light) = pixel_light.filter(|light| light.has_shadow()) {
            let texture = light
                .splits()
                .first()
                .and_then(|split| split.shadow_map)
                .and_then(|map| ctx.shadow_atlas.page_texture(map.page));
            if texture.is_some() {
                queue.set_texture(TextureUnit::ShadowMap, texture, None);
            }
        }

        let key = (pixel_index, vertex_indices);
        if queue.constant_buffers_enabled() {
            if let Some(range) = self.light_blocks.get(&key) {
                queue.set_constant_buffer(ShaderParameterGroup::Light, *range);
                return true;
            }
        }

        let vertex_lights = vertex_indices.map(|index| ctx.light(index).map(SceneLight::light));
        let uniform = LightUniform::new(pixel_light, &vertex_lights);
        if !queue.constant_buffers_enabled() {
            set_parameters(queue, &uniform.shader_parameters());
            return true;
        }
        let Some(range) = self.add_block(device, ctx, bytemuck::bytes_of(&uniform)) else {
            return false;
        };
        self.light_blocks.insert(key, range);
        queue.set_constant_buffer(ShaderParameterGroup::Light, range);
        true
    }

    fn bind_material(
        &mut self,
        device: &mut dyn RenderDevice,
        queue: &mut DrawCommandQueue,
        ctx: &SceneBatchRenderContext<'_>,
        material: &Material,
    ) -> bool {
        for (unit, texture) in &material.textures {
            queue.set_texture(*unit, Some(*texture), None);
        }

        if !queue.constant_buffers_enabled() {
            for (name, value) in &material.parameters {
                queue.set_shader_parameter(name, *value);
            }
            return true;
        }

        let range = match self.material_blocks.get(&material.id()) {
            Some(range) => *range,
            None => {
                let range = if material.parameters.is_empty() {
                    None
                } else {
                    let data = material_block(material);
                    let Some(range) = self.add_block(device, ctx, &data) else {
                        return false;
                    };
                    Some(range)
                };
                self.material_blocks.insert(material.id(), range);
                range
            }
        };
        if let Some(range) = range {
            queue.set_constant_buffer(ShaderParameterGroup::Material, range);
        }
        true
    }

    fn add_block(
        &mut self,
        device: &mut dyn RenderDevice,
        ctx: &SceneBatchRenderContext<'_>,
        data: &[u8],
    ) -> Option<ConstantBufferRange> {
        match self.ring.add_block(device, data) {
            Ok(range) => Some(range),
            Err(err) => {
                ctx.collector.diagnostics().record_constant_buffer_failure();
                if !std::mem::replace(&mut self.reported_block_failure, true) {
                    warn!("Failed to allocate uniform block: {}", err);
                }
                None
            }
        }
    }
}

impl GpuObject for SceneBatchRenderer {
    fn on_device_reset(&mut self, device: &mut dyn RenderDevice) {
        self.ring.on_device_reset(device);
        self.object_blocks.clear();
        self.light_blocks.clear();
        self.material_blocks.clear();
    }

    fn release(&mut self, device: &mut dyn RenderDevice) {
        self.ring.release(device);
    }
}

fn set_parameters(queue: &mut DrawCommandQueue, parameters: &ShaderParameters) {
    for (name, value) in parameters {
        queue.set_shader_parameter(name, *value);
    }
}

fn material_block(material: &Material) -> Vec<u8> {
    let mut layout = ConstantBufferLayout::new();
    for (name, value) in &material.parameters {
        layout.add(name, value.parameter_type());
    }
    let values: Vec<(&str, ShaderParameterValue)> = material
        .parameters
        .iter()
        .map(|(name, value)| (&**name, *value))
        .collect();
    layout.pack(&values)
}

fn geometry_buffers(geometry: &Geometry) -> Option<Vec<BufferId>> {
    if geometry.is_indexed() && geometry.index_buffer.is_none() {
        return None;
    }
    let buffers: Option<Vec<BufferId>> = geometry.vertex_buffers.iter().map(|binding| binding.buffer).collect();
    buffers.filter(|buffers| !buffers.is_empty())
}

fn draw_call(geometry: &Geometry) -> DrawCall {
    if geometry.is_indexed() {
        DrawCall {
            primitive: geometry.primitive,
            indexed: true,
            start: geometry.index_start,
            count: geometry.index_count,
            base_vertex: (geometry.vertex_start > 0).then_some(geometry.vertex_start as i32),
            instance_count: None,
        }
    } else {
        DrawCall {
            primitive: geometry.primitive,
            indexed: false,
            start: geometry.vertex_start,
            count: geometry.vertex_count,
            base_vertex: None,
            instance_count: None,
        }
    }
}
