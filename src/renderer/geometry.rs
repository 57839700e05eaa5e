use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use super::device::{BufferDesc, BufferId, RenderDevice};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for geometries, materials and passes.
pub(crate) fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Fold a 64-bit id into the 32 bits used by sort keys.
pub(crate) fn fold_hash(value: u64) -> u32 {
    (value ^ (value >> 32)) as u32
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const ATTRS: [wgpu::VertexAttribute; 3] = wgpu::vertex_attr_array![
        0 => Float32x3,
        1 => Float32x3,
        2 => Float32x2
    ];

    pub fn elements() -> Vec<VertexElement> {
        let semantics = [
            VertexElementSemantic::Position,
            VertexElementSemantic::Normal,
            VertexElementSemantic::TexCoord,
        ];
        Self::ATTRS
            .iter()
            .zip(semantics)
            .map(|(attr, semantic)| VertexElement {
                semantic,
                index: 0,
                format: attr.format,
                offset: attr.offset as u32,
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexElementSemantic {
    Position,
    Normal,
    Binormal,
    Tangent,
    TexCoord,
    Color,
    BlendWeights,
    BlendIndices,
    ObjectIndex,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub semantic: VertexElementSemantic,
    pub index: u8,
    pub format: wgpu::VertexFormat,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexBufferBinding {
    pub buffer: Option<BufferId>,
    pub stride: u32,
    pub elements: Vec<VertexElement>,
}

#[derive(Clone, Debug)]
pub struct Geometry {
    id: u64,
    pub name: String,
    pub vertex_buffers: Vec<VertexBufferBinding>,
    pub index_buffer: Option<(BufferId, wgpu::IndexFormat)>,
    pub index_format: Option<wgpu::IndexFormat>,
    pub primitive: wgpu::PrimitiveTopology,
    pub index_start: u32,
    pub index_count: u32,
    pub vertex_start: u32,
    pub vertex_count: u32,
}

impl Geometry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_resource_id(),
            name: name.into(),
            vertex_buffers: Vec::new(),
            index_buffer: None,
            index_format: None,
            primitive: wgpu::PrimitiveTopology::TriangleList,
            index_start: 0,
            index_count: 0,
            vertex_start: 0,
            vertex_count: 0,
        }
    }

    /// Unit cube layout without GPU buffers; enough for batching and pipeline keys.
    pub fn cube(name: impl Into<String>) -> Self {
        let (vertices, indices) = cube_mesh();
        let mut geometry = Self::new(name);
        geometry.vertex_buffers.push(VertexBufferBinding {
            buffer: None,
            stride: mem::size_of::<Vertex>() as u32,
            elements: Vertex::elements(),
        });
        geometry.index_format = Some(wgpu::IndexFormat::Uint16);
        geometry.vertex_count = vertices.len() as u32;
        geometry.index_count = indices.len() as u32;
        geometry
    }

    /// Unit cube with vertex and index data uploaded to `device`.
    pub fn upload_cube(device: &mut dyn RenderDevice, name: impl Into<String>) -> Option<Self> {
        let (vertices, indices) = cube_mesh();
        let mut geometry = Self::cube(name);

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let vertex_buffer = device.create_buffer(&BufferDesc {
            label: Some("Cube Vertices"),
            size: vertex_bytes.len() as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        })?;
        device.write_buffer(vertex_buffer, 0, vertex_bytes);

        let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
        let index_buffer = device.create_buffer(&BufferDesc {
            label: Some("Cube Indices"),
            size: index_bytes.len() as u64,
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
        })?;
        device.write_buffer(index_buffer, 0, index_bytes);

        geometry.vertex_buffers[0].buffer = Some(vertex_buffer);
        geometry.index_buffer = Some((index_buffer, wgpu::IndexFormat::Uint16));
        Some(geometry)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hash32(&self) -> u32 {
        fold_hash(self.id)
    }

    pub fn vertex_elements(&self) -> Vec<VertexElement> {
        self.vertex_buffers
            .iter()
            .flat_map(|binding| binding.elements.iter().copied())
            .collect()
    }

    pub fn is_indexed(&self) -> bool {
        self.index_format.is_some() && self.index_count > 0
    }
}

fn cube_mesh() -> (Vec<Vertex>, Vec<u16>) {
    // (normal, u axis, v axis) per face
    let faces = [
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = vertices.len() as u16;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let pos = [
                0.5 * (normal[0] + su * u[0] + sv * v[0]),
                0.5 * (normal[1] + su * u[1] + sv * v[1]),
                0.5 * (normal[2] + su * u[2] + sv * v[2]),
            ];
            let uv = [(su + 1.0) * 0.5, (1.0 - sv) * 0.5];
            vertices.push(Vertex { pos, normal, uv });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::RecordingDevice;

    #[test]
    fn vertex_elements_match_attribute_offsets() {
        let elements = Vertex::elements();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[1].offset, 12);
        assert_eq!(elements[2].format, wgpu::VertexFormat::Float32x2);
    }

    #[test]
    fn uploaded_cube_binds_buffers() {
        let mut device = RecordingDevice::new(true);
        let cube = Geometry::upload_cube(&mut device, "cube").expect("cube upload");
        assert_eq!(cube.index_count, 36);
        assert!(cube.vertex_buffers[0].buffer.is_some());
        assert!(cube.index_buffer.is_some());
        assert_eq!(device.live_buffers(), 2);
    }

    #[test]
    fn geometry_ids_are_unique() {
        assert_ne!(Geometry::cube("a").id(), Geometry::cube("a").id());
    }
}
