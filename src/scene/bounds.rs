use glam::{Mat4, UVec2, Vec3, Vec4};

/// Half-extent beyond which a box is treated as "infinite" (skyboxes, directional lights).
pub const LARGE_VALUE: f32 = 100_000_000.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::ZERO)
    }
}

impl BoundingBox {
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self::new(center - half_extents, center + half_extents)
    }

    pub fn infinite() -> Self {
        Self::from_center_half_extents(Vec3::ZERO, Vec3::splat(LARGE_VALUE))
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn is_infinite(&self) -> bool {
        self.half_extents().length_squared() >= LARGE_VALUE * LARGE_VALUE
    }

    /// Transform by an affine matrix, keeping the result axis-aligned.
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        let center = matrix.transform_point3(self.center());
        let half = self.half_extents();
        let x = matrix.x_axis.truncate().abs() * half.x;
        let y = matrix.y_axis.truncate().abs() * half.y;
        let z = matrix.z_axis.truncate().abs() * half.z;
        Self::from_center_half_extents(center, x + y + z)
    }

    pub fn merge(&mut self, other: &BoundingBox) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn closest_point(&self, point: Vec3) -> Vec3 {
        point.clamp(self.min, self.max)
    }

    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        (self.closest_point(point) - point).length()
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        (self.closest_point(center) - center).length_squared() <= radius * radius
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }
}

/// Plane in `dot(normal, p) + d = 0` form; the normal points to the inside of a frustum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    fn from_vec4(v: Vec4) -> Self {
        let length = v.truncate().length();
        if length <= f32::EPSILON {
            return Self {
                normal: Vec3::ZERO,
                d: 0.0,
            };
        }
        Self {
            normal: v.truncate() / length,
            d: v.w / length,
        }
    }

    pub fn distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract planes from a view-projection matrix with a `[0, 1]` depth range.
    pub fn from_view_proj(view_proj: Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);
        Self {
            planes: [
                Plane::from_vec4(r3 + r0),
                Plane::from_vec4(r3 - r0),
                Plane::from_vec4(r3 + r1),
                Plane::from_vec4(r3 - r1),
                Plane::from_vec4(r2),
                Plane::from_vec4(r3 - r2),
            ],
        }
    }

    pub fn intersects_box(&self, bounds: &BoundingBox) -> bool {
        if bounds.is_infinite() {
            return true;
        }
        self.planes.iter().all(|plane| {
            let positive = Vec3::select(plane.normal.cmpge(Vec3::ZERO), bounds.max, bounds.min);
            plane.distance(positive) >= 0.0
        })
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.distance(center) >= -radius)
    }
}

/// Integer rectangle, right/bottom exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IntRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl IntRect {
    pub const ZERO: Self = Self::new(0, 0, 0, 0);

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(size: UVec2) -> Self {
        Self::new(0, 0, size.x as i32, size.y as i32)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn size(&self) -> UVec2 {
        UVec2::new(self.width().max(0) as u32, self.height().max(0) as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn overlaps(&self, other: &IntRect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transformed_box_grows_under_rotation() {
        let unit = BoundingBox::from_center_half_extents(Vec3::ZERO, Vec3::ONE);
        let rotated = unit.transformed(&Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4));
        assert!(rotated.half_extents().x > 1.4);
        assert!((rotated.half_extents().y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn frustum_culls_boxes_behind_camera() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60_f32.to_radians(), 1.0, 0.1, 100.0);
        let frustum = Frustum::from_view_proj(proj * view);

        let in_front = BoundingBox::from_center_half_extents(Vec3::ZERO, Vec3::splat(0.5));
        let behind = BoundingBox::from_center_half_extents(Vec3::new(0.0, 0.0, 10.0), Vec3::splat(0.5));
        assert!(frustum.intersects_box(&in_front));
        assert!(!frustum.intersects_box(&behind));
        assert!(frustum.intersects_box(&BoundingBox::infinite()));
    }

    #[test]
    fn rect_overlap_is_exclusive_on_edges() {
        let a = IntRect::new(0, 0, 256, 256);
        let b = IntRect::new(256, 0, 512, 256);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&IntRect::new(255, 255, 300, 300)));
    }
}
