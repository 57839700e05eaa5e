use std::collections::HashMap;

use bitflags::bitflags;
use glam::UVec2;

use super::pipeline_state::PipelineState;
use super::shader_params::{ShaderParameterGroup, ShaderParameterValue, TextureUnit};
use crate::scene::bounds::IntRect;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SamplerId(pub u32);

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: Option<&'a str>,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawCall {
    pub primitive: wgpu::PrimitiveTopology,
    pub indexed: bool,
    pub start: u32,
    pub count: u32,
    pub base_vertex: Option<i32>,
    pub instance_count: Option<u32>,
}

/// Minimal command surface the batch renderer records against.
///
/// Resource creation may fail (device lost, out of memory); callers treat
/// `None` as a recoverable condition.
pub trait RenderDevice {
    fn constant_buffers_enabled(&self) -> bool;

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Option<BufferId>;
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]);
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn create_depth_texture(
        &mut self,
        label: Option<&str>,
        size: UVec2,
        format: wgpu::TextureFormat,
    ) -> Option<TextureId>;
    fn destroy_texture(&mut self, texture: TextureId);

    /// `None` for both targets means the backbuffer.
    fn set_render_target(&mut self, color: Option<TextureId>, depth: Option<TextureId>);
    fn set_viewport(&mut self, rect: IntRect);
    fn clear(&mut self, flags: ClearFlags, color: [f32; 4], depth: f32, stencil: u32);

    fn set_pipeline_state(&mut self, state: &PipelineState);
    fn set_vertex_buffers(&mut self, buffers: &[BufferId]);
    fn set_index_buffer(&mut self, buffer: Option<(BufferId, wgpu::IndexFormat)>);
    fn set_constant_buffer(
        &mut self,
        group: ShaderParameterGroup,
        buffer: BufferId,
        offset: u32,
        size: u32,
    );
    fn set_texture(&mut self, unit: TextureUnit, texture: Option<TextureId>, sampler: Option<SamplerId>);
    fn set_shader_parameter(&mut self, name: &str, value: &ShaderParameterValue);
    fn draw(&mut self, call: &DrawCall);
}

/// GPU-side objects that must be rebuilt after the device is lost.
pub trait GpuObject {
    fn on_device_reset(&mut self, device: &mut dyn RenderDevice);
    fn release(&mut self, device: &mut dyn RenderDevice);
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCall {
    CreateBuffer { id: BufferId, size: u64 },
    WriteBuffer { id: BufferId, offset: u64, len: usize },
    DestroyBuffer(BufferId),
    CreateDepthTexture { id: TextureId, size: UVec2 },
    DestroyTexture(TextureId),
    SetRenderTarget { color: Option<TextureId>, depth: Option<TextureId> },
    SetViewport(IntRect),
    Clear(ClearFlags),
    SetPipelineState(u64),
    SetVertexBuffers(Vec<BufferId>),
    SetIndexBuffer(Option<(BufferId, wgpu::IndexFormat)>),
    SetConstantBuffer { group: ShaderParameterGroup, buffer: BufferId, offset: u32, size: u32 },
    SetTexture { unit: TextureUnit, texture: Option<TextureId> },
    SetShaderParameter(String),
    Draw(DrawCall),
}

/// Headless device that records every call and keeps buffer contents in memory.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub calls: Vec<DeviceCall>,
    pub constant_buffers: bool,
    /// Fail every resource creation while set.
    pub fail_allocations: bool,
    buffers: HashMap<BufferId, Vec<u8>>,
    textures: HashMap<TextureId, UVec2>,
    next_id: u32,
}

impl RecordingDevice {
    pub fn new(constant_buffers: bool) -> Self {
        Self {
            constant_buffers,
            ..Self::default()
        }
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(Vec::as_slice)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn count(&self, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn draw_count(&self) -> usize {
        self.count(|call| matches!(call, DeviceCall::Draw(_)))
    }

    pub fn clear_count(&self) -> usize {
        self.count(|call| matches!(call, DeviceCall::Clear(_)))
    }

    /// Drop every GPU resource, as a lost device would.
    pub fn lose_device(&mut self) {
        self.buffers.clear();
        self.textures.clear();
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl RenderDevice for RecordingDevice {
    fn constant_buffers_enabled(&self) -> bool {
        self.constant_buffers
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Option<BufferId> {
        if self.fail_allocations || desc.size == 0 {
            return None;
        }
        let id = BufferId(self.allocate_id());
        self.buffers.insert(id, vec![0; desc.size as usize]);
        self.calls.push(DeviceCall::CreateBuffer { id, size: desc.size });
        Some(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        if let Some(contents) = self.buffers.get_mut(&buffer) {
            let start = offset as usize;
            let end = (start + data.len()).min(contents.len());
            if start < end {
                contents[start..end].copy_from_slice(&data[..end - start]);
            }
        }
        self.calls.push(DeviceCall::WriteBuffer {
            id: buffer,
            offset,
            len: data.len(),
        });
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.calls.push(DeviceCall::DestroyBuffer(buffer));
    }

    fn create_depth_texture(
        &mut self,
        _label: Option<&str>,
        size: UVec2,
        _format: wgpu::TextureFormat,
    ) -> Option<TextureId> {
        if self.fail_allocations {
            return None;
        }
        let id = TextureId(self.allocate_id());
        self.textures.insert(id, size);
        self.calls.push(DeviceCall::CreateDepthTexture { id, size });
        Some(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.calls.push(DeviceCall::DestroyTexture(texture));
    }

    fn set_render_target(&mut self, color: Option<TextureId>, depth: Option<TextureId>) {
        self.calls.push(DeviceCall::SetRenderTarget { color, depth });
    }

    fn set_viewport(&mut self, rect: IntRect) {
        self.calls.push(DeviceCall::SetViewport(rect));
    }

    fn clear(&mut self, flags: ClearFlags, _color: [f32; 4], _depth: f32, _stencil: u32) {
        self.calls.push(DeviceCall::Clear(flags));
    }

    fn set_pipeline_state(&mut self, state: &PipelineState) {
        self.calls.push(DeviceCall::SetPipelineState(state.id()));
    }

    fn set_vertex_buffers(&mut self, buffers: &[BufferId]) {
        self.calls.push(DeviceCall::SetVertexBuffers(buffers.to_vec()));
    }

    fn set_index_buffer(&mut self, buffer: Option<(BufferId, wgpu::IndexFormat)>) {
        self.calls.push(DeviceCall::SetIndexBuffer(buffer));
    }

    fn set_constant_buffer(
        &mut self,
        group: ShaderParameterGroup,
        buffer: BufferId,
        offset: u32,
        size: u32,
    ) {
        self.calls.push(DeviceCall::SetConstantBuffer {
            group,
            buffer,
            offset,
            size,
        });
    }

    fn set_texture(&mut self, unit: TextureUnit, texture: Option<TextureId>, _sampler: Option<SamplerId>) {
        self.calls.push(DeviceCall::SetTexture { unit, texture });
    }

    fn set_shader_parameter(&mut self, name: &str, _value: &ShaderParameterValue) {
        self.calls.push(DeviceCall::SetShaderParameter(name.to_owned()));
    }

    fn draw(&mut self, call: &DrawCall) {
        self.calls.push(DeviceCall::Draw(*call));
    }
}
