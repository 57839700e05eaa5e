use glam::{Mat4, UVec2, Vec3};

use super::bounds::{Frustum, IntRect};

#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_radians: f32,
    pub near: f32,
    pub far: f32,
    pub aspect_ratio: f32,
    pub orthographic: bool,
    /// Full height of the view volume when `orthographic` is set.
    pub ortho_size: f32,
    pub view_mask: u32,
    pub reverse_culling: bool,
    pub lod_bias: f32,
    pub low_material_quality: bool,
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    pub fn proj(&self) -> Mat4 {
        if self.orthographic {
            let half_height = self.ortho_size * 0.5;
            let half_width = half_height * self.aspect_ratio;
            Mat4::orthographic_rh(
                -half_width,
                half_width,
                -half_height,
                half_height,
                self.near,
                self.far,
            )
        } else {
            Mat4::perspective_rh(self.fov_y_radians, self.aspect_ratio, self.near, self.far)
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        self.proj() * self.view()
    }

    pub fn position(&self) -> Vec3 {
        self.eye
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.eye).normalize_or_zero()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_proj(self.view_proj())
    }

    /// Distance along the view direction; positive in front of the camera.
    pub fn view_depth(&self, point: Vec3) -> f32 {
        -self.view().transform_point3(point).z
    }

    pub fn distance(&self, point: Vec3) -> f32 {
        if self.orthographic {
            self.view_depth(point).abs()
        } else {
            (point - self.eye).length()
        }
    }

    pub fn lod_distance(&self, distance: f32) -> f32 {
        if self.lod_bias > 0.0 {
            distance / self.lod_bias
        } else {
            distance
        }
    }

    /// World-space corners of the view volume between two view depths:
    /// near quad first, counter-clockwise from bottom-left, then the far quad.
    pub fn frustum_corners(&self, near: f32, far: f32) -> [Vec3; 8] {
        let (near_half, far_half) = if self.orthographic {
            let h = self.ortho_size * 0.5;
            (
                glam::Vec2::new(h * self.aspect_ratio, h),
                glam::Vec2::new(h * self.aspect_ratio, h),
            )
        } else {
            let tan = (self.fov_y_radians * 0.5).tan();
            (
                glam::Vec2::new(tan * near * self.aspect_ratio, tan * near),
                glam::Vec2::new(tan * far * self.aspect_ratio, tan * far),
            )
        };
        let inv_view = self.view().inverse();
        let corner = |half: glam::Vec2, sx: f32, sy: f32, depth: f32| {
            inv_view.transform_point3(Vec3::new(half.x * sx, half.y * sy, -depth))
        };
        [
            corner(near_half, -1.0, -1.0, near),
            corner(near_half, 1.0, -1.0, near),
            corner(near_half, 1.0, 1.0, near),
            corner(near_half, -1.0, 1.0, near),
            corner(far_half, -1.0, -1.0, far),
            corner(far_half, 1.0, -1.0, far),
            corner(far_half, 1.0, 1.0, far),
            corner(far_half, -1.0, 1.0, far),
        ]
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 0.0, 3.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y_radians: 60f32.to_radians(),
            near: 0.1,
            far: 100.0,
            aspect_ratio: 16.0 / 9.0,
            orthographic: false,
            ortho_size: 20.0,
            view_mask: u32::MAX,
            reverse_culling: false,
            lod_bias: 1.0,
            low_material_quality: false,
        }
    }
}

/// Per-frame view description handed to the collector.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameInfo {
    pub frame_number: u32,
    pub time_step: f32,
    pub camera: Camera,
    pub view_size: UVec2,
    pub view_rect: IntRect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_proj_is_reasonable() {
        let cam = Camera::default();
        let vp = cam.view_proj();
        let inv = vp.inverse();
        let id = vp * inv;
        assert!(id.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn view_depth_is_positive_in_front() {
        let cam = Camera::default();
        assert!((cam.view_depth(Vec3::ZERO) - 3.0).abs() < 1e-5);
        assert!(cam.view_depth(Vec3::new(0.0, 0.0, 5.0)) < 0.0);
    }

    #[test]
    fn frustum_corners_lie_on_requested_depths() {
        let cam = Camera::default();
        let corners = cam.frustum_corners(1.0, 10.0);
        for corner in &corners[..4] {
            assert!((cam.view_depth(*corner) - 1.0).abs() < 1e-4);
        }
        for corner in &corners[4..] {
            assert!((cam.view_depth(*corner) - 10.0).abs() < 1e-3);
        }
    }
}
