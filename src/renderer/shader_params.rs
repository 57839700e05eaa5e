use glam::{Mat4, Vec2, Vec3, Vec4};

/// Constant-buffer slots, ordered from least to most frequently changing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderParameterGroup {
    Frame = 0,
    Camera = 1,
    Zone = 2,
    Light = 3,
    Material = 4,
    Object = 5,
    Custom = 6,
}

impl ShaderParameterGroup {
    pub const COUNT: usize = 7;

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextureUnit {
    Diffuse = 0,
    Normal = 1,
    Specular = 2,
    Emissive = 3,
    Environment = 4,
    LightRamp = 5,
    LightShape = 6,
    ShadowMap = 7,
}

impl TextureUnit {
    pub const COUNT: usize = 8;

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderParameterType {
    Float,
    Int,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    Vec3Array(u32),
    Vec4Array(u32),
    Mat4Array(u32),
}

impl ShaderParameterType {
    /// std140 base alignment in bytes.
    pub fn alignment(self) -> u32 {
        match self {
            ShaderParameterType::Float | ShaderParameterType::Int => 4,
            ShaderParameterType::Vec2 => 8,
            _ => 16,
        }
    }

    /// std140 size in bytes; array elements are padded to 16-byte strides.
    pub fn size(self) -> u32 {
        match self {
            ShaderParameterType::Float | ShaderParameterType::Int => 4,
            ShaderParameterType::Vec2 => 8,
            ShaderParameterType::Vec3 => 12,
            ShaderParameterType::Vec4 => 16,
            ShaderParameterType::Mat4 => 64,
            ShaderParameterType::Vec3Array(n) | ShaderParameterType::Vec4Array(n) => 16 * n,
            ShaderParameterType::Mat4Array(n) => 64 * n,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShaderParameterValue {
    Float(f32),
    Int(i32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl ShaderParameterValue {
    pub fn parameter_type(&self) -> ShaderParameterType {
        match self {
            ShaderParameterValue::Float(_) => ShaderParameterType::Float,
            ShaderParameterValue::Int(_) => ShaderParameterType::Int,
            ShaderParameterValue::Vec2(_) => ShaderParameterType::Vec2,
            ShaderParameterValue::Vec3(_) => ShaderParameterType::Vec3,
            ShaderParameterValue::Vec4(_) => ShaderParameterType::Vec4,
            ShaderParameterValue::Mat4(_) => ShaderParameterType::Mat4,
        }
    }

    /// Raw bytes as laid out in a constant buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ShaderParameterValue::Float(v) => bytemuck::bytes_of(v).to_vec(),
            ShaderParameterValue::Int(v) => bytemuck::bytes_of(v).to_vec(),
            ShaderParameterValue::Vec2(v) => bytemuck::cast_slice(&v.to_array()).to_vec(),
            ShaderParameterValue::Vec3(v) => bytemuck::cast_slice(&v.to_array()).to_vec(),
            ShaderParameterValue::Vec4(v) => bytemuck::cast_slice(&v.to_array()).to_vec(),
            ShaderParameterValue::Mat4(v) => bytemuck::cast_slice(&v.to_cols_array()).to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes_match_declared_types() {
        let values = [
            ShaderParameterValue::Float(1.0),
            ShaderParameterValue::Int(-3),
            ShaderParameterValue::Vec2(Vec2::ONE),
            ShaderParameterValue::Vec3(Vec3::ONE),
            ShaderParameterValue::Vec4(Vec4::ONE),
            ShaderParameterValue::Mat4(Mat4::IDENTITY),
        ];
        for value in values {
            assert_eq!(value.to_bytes().len() as u32, value.parameter_type().size());
        }
    }
}
