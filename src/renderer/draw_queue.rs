use std::collections::HashMap;
use std::sync::Arc;

use super::constant_buffer::ConstantBufferRange;
use super::device::{BufferId, DrawCall, RenderDevice, SamplerId, TextureId};
use super::pipeline_state::PipelineState;
use super::shader_params::{ShaderParameterGroup, ShaderParameterValue, TextureUnit};

#[derive(Clone, Debug)]
pub enum DrawCommand {
    SetPipelineState(Arc<PipelineState>),
    SetVertexBuffers(Vec<BufferId>),
    SetIndexBuffer(Option<(BufferId, wgpu::IndexFormat)>),
    SetConstantBuffer {
        group: ShaderParameterGroup,
        range: ConstantBufferRange,
    },
    SetTexture {
        unit: TextureUnit,
        texture: Option<TextureId>,
        sampler: Option<SamplerId>,
    },
    SetShaderParameter {
        name: String,
        value: ShaderParameterValue,
    },
    Draw(DrawCall),
}

/// Recorded draw commands for one pass, replayed on the device in order.
///
/// Setting a slot to the value it already holds records nothing.
#[derive(Default)]
pub struct DrawCommandQueue {
    commands: Vec<DrawCommand>,
    constant_buffers_enabled: bool,
    pipeline_state: Option<u64>,
    vertex_buffers: Option<Vec<BufferId>>,
    index_buffer: Option<Option<(BufferId, wgpu::IndexFormat)>>,
    constant_buffers: [Option<ConstantBufferRange>; ShaderParameterGroup::COUNT],
    textures: [Option<(Option<TextureId>, Option<SamplerId>)>; TextureUnit::COUNT],
    shader_parameters: HashMap<String, ShaderParameterValue>,
    num_draws: usize,
}

impl DrawCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop recorded commands and tracked state.
    pub fn reset(&mut self, device: &dyn RenderDevice) {
        self.commands.clear();
        self.constant_buffers_enabled = device.constant_buffers_enabled();
        self.pipeline_state = None;
        self.vertex_buffers = None;
        self.index_buffer = None;
        self.constant_buffers = [None; ShaderParameterGroup::COUNT];
        self.textures = [None; TextureUnit::COUNT];
        self.shader_parameters.clear();
        self.num_draws = 0;
    }

    pub fn constant_buffers_enabled(&self) -> bool {
        self.constant_buffers_enabled
    }

    pub fn set_pipeline_state(&mut self, state: &Arc<PipelineState>) {
        if self.pipeline_state == Some(state.id()) {
            return;
        }
        self.pipeline_state = Some(state.id());
        self.commands.push(DrawCommand::SetPipelineState(Arc::clone(state)));
    }

    pub fn set_vertex_buffers(&mut self, buffers: &[BufferId]) {
        if self.vertex_buffers.as_deref() == Some(buffers) {
            return;
        }
        self.vertex_buffers = Some(buffers.to_vec());
        self.commands.push(DrawCommand::SetVertexBuffers(buffers.to_vec()));
    }

    pub fn set_index_buffer(&mut self, buffer: Option<(BufferId, wgpu::IndexFormat)>) {
        if self.index_buffer == Some(buffer) {
            return;
        }
        self.index_buffer = Some(buffer);
        self.commands.push(DrawCommand::SetIndexBuffer(buffer));
    }

    pub fn set_constant_buffer(&mut self, group: ShaderParameterGroup, range: ConstantBufferRange) {
        let slot = &mut self.constant_buffers[group.index()];
        if *slot == Some(range) {
            return;
        }
        *slot = Some(range);
        self.commands.push(DrawCommand::SetConstantBuffer { group, range });
    }

    pub fn set_texture(&mut self, unit: TextureUnit, texture: Option<TextureId>, sampler: Option<SamplerId>) {
        let slot = &mut self.textures[unit.index()];
        if *slot == Some((texture, sampler)) {
            return;
        }
        *slot = Some((texture, sampler));
        self.commands.push(DrawCommand::SetTexture { unit, texture, sampler });
    }

    pub fn set_shader_parameter(&mut self, name: &str, value: ShaderParameterValue) {
        if self.shader_parameters.get(name) == Some(&value) {
            return;
        }
        self.shader_parameters.insert(name.to_owned(), value);
        self.commands.push(DrawCommand::SetShaderParameter {
            name: name.to_owned(),
            value,
        });
    }

    pub fn draw(&mut self, call: DrawCall) {
        if call.count == 0 {
            return;
        }
        self.num_draws += 1;
        self.commands.push(DrawCommand::Draw(call));
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn num_draws(&self) -> usize {
        self.num_draws
    }

    pub fn execute(&self, device: &mut dyn RenderDevice) {
        for command in &self.commands {
            match command {
                DrawCommand::SetPipelineState(state) => device.set_pipeline_state(state),
                DrawCommand::SetVertexBuffers(buffers) => device.set_vertex_buffers(buffers),
                DrawCommand::SetIndexBuffer(buffer) => device.set_index_buffer(*buffer),
                DrawCommand::SetConstantBuffer { group, range } => {
                    device.set_constant_buffer(*group, range.buffer, range.offset, range.size)
                }
                DrawCommand::SetTexture { unit, texture, sampler } => {
                    device.set_texture(*unit, *texture, *sampler)
                }
                DrawCommand::SetShaderParameter { name, value } => device.set_shader_parameter(name, value),
                DrawCommand::Draw(call) => device.draw(call),
            }
        }
    }
}
