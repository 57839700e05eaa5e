use glam::Vec3;
use log::warn;

use super::device::{BufferDesc, BufferId, GpuObject, RenderDevice};
use super::error::ConstantBufferError;
use super::shader_params::{ShaderParameterType, ShaderParameterValue};

/// Offsets handed to `SetConstantBuffer` must be multiples of this.
pub const CONSTANT_BUFFER_OFFSET_ALIGNMENT: u32 = 256;

fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// GPU uniform buffer with a CPU shadow copy.
///
/// Writes go to the shadow copy and mark the buffer dirty; `apply` uploads.
/// The shadow copy survives device loss and is re-uploaded on reset.
#[derive(Debug)]
pub struct ConstantBuffer {
    label: String,
    shadow: Vec<u8>,
    buffer: Option<BufferId>,
    dirty: bool,
}

impl ConstantBuffer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            shadow: Vec::new(),
            buffer: None,
            dirty: false,
        }
    }

    /// Resize, zero the shadow data and recreate the GPU buffer.
    ///
    /// The zeroed contents are uploaded by the next `apply`.
    pub fn set_size(&mut self, device: &mut dyn RenderDevice, size: u32) -> Result<(), ConstantBufferError> {
        if size == 0 {
            return Err(ConstantBufferError::ZeroSize);
        }
        self.release(device);
        self.shadow.clear();
        self.shadow.resize(size as usize, 0);
        self.dirty = true;
        self.create_gpu_buffer(device)
    }

    fn create_gpu_buffer(&mut self, device: &mut dyn RenderDevice) -> Result<(), ConstantBufferError> {
        let size = self.size();
        let desc = BufferDesc {
            label: Some(&self.label),
            size: u64::from(size),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        };
        self.buffer = device.create_buffer(&desc);
        if self.buffer.is_none() {
            warn!("Failed to create constant buffer '{}' of {} bytes", self.label, size);
            return Err(ConstantBufferError::AllocationFailed { size });
        }
        Ok(())
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, ConstantBufferError> {
        let start = offset as usize;
        let end = start.saturating_add(len);
        if end > self.shadow.len() {
            return Err(ConstantBufferError::OutOfRange {
                offset,
                len: len as u32,
                buffer_size: self.size(),
            });
        }
        Ok(start..end)
    }

    pub fn set_parameter(&mut self, offset: u32, data: &[u8]) -> Result<(), ConstantBufferError> {
        let range = self.check_range(offset, data.len())?;
        self.shadow[range].copy_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    pub fn set_value(&mut self, offset: u32, value: &ShaderParameterValue) -> Result<(), ConstantBufferError> {
        self.set_parameter(offset, &value.to_bytes())
    }

    /// Each `Vec3` takes a 16-byte row; the padding word is left untouched.
    pub fn set_vector3_array_parameter(&mut self, offset: u32, rows: &[Vec3]) -> Result<(), ConstantBufferError> {
        self.check_range(offset, rows.len() * 16)?;
        for (row, value) in rows.iter().enumerate() {
            let start = offset as usize + row * 16;
            let array = value.to_array();
            self.shadow[start..start + 12].copy_from_slice(bytemuck::cast_slice(&array));
        }
        self.dirty = true;
        Ok(())
    }

    /// Upload the shadow copy if it changed since the last upload.
    pub fn apply(&mut self, device: &mut dyn RenderDevice) {
        if !self.dirty {
            return;
        }
        if let Some(buffer) = self.buffer {
            device.write_buffer(buffer, 0, &self.shadow);
            self.dirty = false;
        }
    }

    /// Upload `data` directly, bypassing the shadow copy.
    pub fn set_gpu_data(&mut self, device: &mut dyn RenderDevice, data: &[u8]) -> Result<(), ConstantBufferError> {
        let range = self.check_range(0, data.len())?;
        let Some(buffer) = self.buffer else {
            return Err(ConstantBufferError::AllocationFailed { size: self.size() });
        };
        device.write_buffer(buffer, 0, &data[range]);
        Ok(())
    }

    pub fn size(&self) -> u32 {
        self.shadow.len() as u32
    }

    pub fn shadow_data(&self) -> &[u8] {
        &self.shadow
    }

    pub fn gpu_buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl GpuObject for ConstantBuffer {
    fn on_device_reset(&mut self, device: &mut dyn RenderDevice) {
        self.buffer = None;
        if self.shadow.is_empty() {
            return;
        }
        if self.create_gpu_buffer(device).is_ok() {
            self.dirty = true;
            self.apply(device);
        }
    }

    fn release(&mut self, device: &mut dyn RenderDevice) {
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
    }
}

/// std140 offsets of named parameters inside one block.
#[derive(Clone, Debug, Default)]
pub struct ConstantBufferLayout {
    parameters: Vec<(String, ShaderParameterType, u32)>,
    size: u32,
}

impl ConstantBufferLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, parameter_type: ShaderParameterType) -> Self {
        self.add(name, parameter_type);
        self
    }

    /// Append a parameter and return its offset.
    pub fn add(&mut self, name: &str, parameter_type: ShaderParameterType) -> u32 {
        let offset = align_up(self.size, parameter_type.alignment());
        self.size = offset + parameter_type.size();
        self.parameters.push((name.to_owned(), parameter_type, offset));
        offset
    }

    pub fn parameter(&self, name: &str) -> Option<(ShaderParameterType, u32)> {
        self.parameters
            .iter()
            .find(|(parameter, _, _)| parameter == name)
            .map(|(_, parameter_type, offset)| (*parameter_type, *offset))
    }

    /// Block size rounded up to a whole 16-byte row.
    pub fn size(&self) -> u32 {
        align_up(self.size.max(1), 16)
    }

    /// Pack values into a zeroed block of `size()` bytes. Unknown names and mismatched types are skipped.
    pub fn pack(&self, values: &[(&str, ShaderParameterValue)]) -> Vec<u8> {
        let mut block = vec![0u8; self.size() as usize];
        for (name, value) in values {
            let Some((parameter_type, offset)) = self.parameter(name) else {
                continue;
            };
            if parameter_type != value.parameter_type() {
                continue;
            }
            let bytes = value.to_bytes();
            let start = offset as usize;
            block[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        block
    }
}

/// Where a block written through the ring lives on the GPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantBufferRange {
    pub buffer: BufferId,
    pub offset: u32,
    pub size: u32,
}

/// Per-draw uniform blocks packed into paged constant buffers at aligned offsets.
pub struct ConstantBufferRing {
    page_size: u32,
    pages: Vec<ConstantBuffer>,
    current_page: usize,
    cursor: u32,
}

impl ConstantBufferRing {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: align_up(page_size.max(CONSTANT_BUFFER_OFFSET_ALIGNMENT), CONSTANT_BUFFER_OFFSET_ALIGNMENT),
            pages: Vec::new(),
            current_page: 0,
            cursor: 0,
        }
    }

    /// Start writing from the first page again.
    pub fn begin_frame(&mut self) {
        self.current_page = 0;
        self.cursor = 0;
    }

    pub fn add_block(
        &mut self,
        device: &mut dyn RenderDevice,
        data: &[u8],
    ) -> Result<ConstantBufferRange, ConstantBufferError> {
        let size = data.len() as u32;
        if size == 0 {
            return Err(ConstantBufferError::ZeroSize);
        }
        if size > self.page_size {
            return Err(ConstantBufferError::BlockTooLarge {
                size,
                page_size: self.page_size,
            });
        }

        if self.cursor + size > self.page_size {
            self.current_page += 1;
            self.cursor = 0;
        }
        if self.current_page >= self.pages.len() {
            let mut page = ConstantBuffer::new(format!("ConstantBufferRing page {}", self.pages.len()));
            page.set_size(device, self.page_size)?;
            self.pages.push(page);
        }

        let page = &mut self.pages[self.current_page];
        let Some(buffer) = page.gpu_buffer() else {
            return Err(ConstantBufferError::AllocationFailed { size: self.page_size });
        };
        let offset = self.cursor;
        page.set_parameter(offset, data)?;
        self.cursor = align_up(offset + size, CONSTANT_BUFFER_OFFSET_ALIGNMENT);
        Ok(ConstantBufferRange { buffer, offset, size })
    }

    /// Upload every page written since the last call.
    pub fn apply(&mut self, device: &mut dyn RenderDevice) {
        for page in &mut self.pages {
            page.apply(device);
        }
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }
}

impl GpuObject for ConstantBufferRing {
    fn on_device_reset(&mut self, device: &mut dyn RenderDevice) {
        for page in &mut self.pages {
            page.on_device_reset(device);
        }
        self.pages.retain(|page| page.gpu_buffer().is_some());
        self.begin_frame();
    }

    fn release(&mut self, device: &mut dyn RenderDevice) {
        for page in &mut self.pages {
            page.release(device);
        }
        self.pages.clear();
        self.begin_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::{DeviceCall, RecordingDevice};

    #[test]
    fn writes_mark_dirty_until_applied() {
        let mut device = RecordingDevice::new(true);
        let mut buffer = ConstantBuffer::new("test");
        buffer.set_size(&mut device, 64).expect("size");
        assert!(buffer.is_dirty());
        buffer.apply(&mut device);
        assert!(!buffer.is_dirty());

        buffer.set_value(16, &ShaderParameterValue::Float(2.0)).expect("write");
        assert!(buffer.is_dirty());
        buffer.apply(&mut device);
        assert!(!buffer.is_dirty());

        let gpu = buffer.gpu_buffer().and_then(|id| device.buffer_contents(id)).expect("buffer");
        assert_eq!(&gpu[16..20], &2.0f32.to_le_bytes());
    }

    #[test]
    fn resize_zeroes_contents_and_uploads_once() {
        let mut device = RecordingDevice::new(true);
        let mut buffer = ConstantBuffer::new("test");
        buffer.set_size(&mut device, 32).expect("size");
        buffer.set_parameter(0, &[9; 32]).expect("write");
        buffer.apply(&mut device);
        let old = buffer.gpu_buffer().expect("buffer");

        buffer.set_size(&mut device, 64).expect("resize");
        assert_eq!(buffer.shadow_data(), &[0; 64]);
        assert!(buffer.is_dirty());
        let new = buffer.gpu_buffer().expect("recreated buffer");
        assert_ne!(new, old);

        device.calls.clear();
        buffer.apply(&mut device);
        buffer.apply(&mut device);
        assert_eq!(device.count(|call| matches!(call, DeviceCall::WriteBuffer { .. })), 1);
        assert_eq!(device.buffer_contents(new), Some(&[0u8; 64][..]));
    }

    #[test]
    fn out_of_range_writes_are_rejected() {
        let mut device = RecordingDevice::new(true);
        let mut buffer = ConstantBuffer::new("test");
        assert_eq!(buffer.set_size(&mut device, 0), Err(ConstantBufferError::ZeroSize));
        buffer.set_size(&mut device, 16).expect("size");
        buffer.apply(&mut device);
        assert!(matches!(
            buffer.set_parameter(8, &[0; 16]),
            Err(ConstantBufferError::OutOfRange { offset: 8, len: 16, buffer_size: 16 })
        ));
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn vector3_rows_are_padded() {
        let mut device = RecordingDevice::new(true);
        let mut buffer = ConstantBuffer::new("test");
        buffer.set_size(&mut device, 48).expect("size");
        buffer
            .set_vector3_array_parameter(0, &[Vec3::ONE, Vec3::new(2.0, 3.0, 4.0)])
            .expect("rows");
        let floats: &[f32] = bytemuck::cast_slice(buffer.shadow_data());
        assert_eq!(&floats[..8], &[1.0, 1.0, 1.0, 0.0, 2.0, 3.0, 4.0, 0.0]);
    }

    #[test]
    fn gpu_data_bypasses_shadow() {
        let mut device = RecordingDevice::new(true);
        let mut buffer = ConstantBuffer::new("test");
        buffer.set_size(&mut device, 16).expect("size");
        buffer.set_gpu_data(&mut device, &[7; 16]).expect("upload");
        assert_eq!(buffer.shadow_data(), &[0; 16]);
        let gpu = buffer.gpu_buffer().and_then(|id| device.buffer_contents(id)).expect("buffer");
        assert_eq!(gpu, &[7; 16]);
    }

    #[test]
    fn layout_follows_std140() {
        let layout = ConstantBufferLayout::new()
            .with("Scale", ShaderParameterType::Float)
            .with("Offset", ShaderParameterType::Vec3)
            .with("Model", ShaderParameterType::Mat4)
            .with("Tint", ShaderParameterType::Vec2);
        assert_eq!(layout.parameter("Scale"), Some((ShaderParameterType::Float, 0)));
        assert_eq!(layout.parameter("Offset"), Some((ShaderParameterType::Vec3, 16)));
        assert_eq!(layout.parameter("Model"), Some((ShaderParameterType::Mat4, 32)));
        assert_eq!(layout.parameter("Tint"), Some((ShaderParameterType::Vec2, 96)));
        assert_eq!(layout.size(), 112);

        let block = layout.pack(&[("Scale", ShaderParameterValue::Float(1.5)), ("Missing", ShaderParameterValue::Int(1))]);
        assert_eq!(block.len(), 112);
        assert_eq!(&block[..4], &1.5f32.to_le_bytes());
    }

    #[test]
    fn ring_aligns_blocks_and_spills_to_new_pages() {
        let mut device = RecordingDevice::new(true);
        let mut ring = ConstantBufferRing::new(512);
        let first = ring.add_block(&mut device, &[1; 64]).expect("block");
        let second = ring.add_block(&mut device, &[2; 64]).expect("block");
        let third = ring.add_block(&mut device, &[3; 300]).expect("block");
        assert_eq!((first.offset, second.offset), (0, 256));
        assert_eq!(third.offset, 0);
        assert_ne!(third.buffer, first.buffer);
        assert_eq!(ring.num_pages(), 2);
        assert!(matches!(
            ring.add_block(&mut device, &[0; 1024]),
            Err(ConstantBufferError::BlockTooLarge { .. })
        ));

        ring.apply(&mut device);
        let page = device.buffer_contents(second.buffer).expect("page");
        assert_eq!(page[256], 2);

        ring.begin_frame();
        let reused = ring.add_block(&mut device, &[4; 16]).expect("block");
        assert_eq!(reused, ConstantBufferRange { buffer: first.buffer, offset: 0, size: 16 });
        assert_eq!(device.count(|call| matches!(call, DeviceCall::CreateBuffer { .. })), 2);
    }
}
