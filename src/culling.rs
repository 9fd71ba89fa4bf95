// Frustum culling
//
// Planes are pulled straight out of the view-projection matrix
// (Gribb & Hartmann): with r0..r3 the matrix rows,
//   left/right   = r3 ± r0
//   bottom/top   = r3 ± r1
//   near/far     = r3 ± r2
// normalized so signed distances are in world units.
//
// AABBs are tested by transforming all eight corners, so rotated boxes stay
// correct. A plane rejects only when every corner is strictly behind it;
// anything touching a plane counts as inside.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    /// Unit length, or zero for a degenerate plane
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub const ZERO: Plane = Plane {
        normal: Vec3::ZERO,
        distance: 0.0,
    };

    /// Normalize `(a, b, c, d)` so `(a, b, c)` has unit length
    pub fn from_vec4(v: Vec4) -> Self {
        let length = v.xyz().length();
        if length <= f32::EPSILON || !length.is_finite() {
            // Never rejects anything
            return Self::ZERO;
        }
        Self {
            normal: v.xyz() / length,
            distance: v.w / length,
        }
    }

    /// Positive on the inner side
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Inside,
    Outside,
}

/// Local-space axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Corners in world space
    pub fn transformed_corners(&self, model: &Mat4) -> [Vec3; 8] {
        self.corners().map(|corner| model.transform_point3(corner))
    }
}

/// Plane indices into `Frustum::planes`
pub const LEFT: usize = 0;
pub const RIGHT: usize = 1;
pub const BOTTOM: usize = 2;
pub const TOP: usize = 3;
pub const NEAR: usize = 4;
pub const FAR: usize = 5;

/// Six planes of one frame's view volume.
///
/// Only obtainable from `FrustumCuller::extract_planes`, and borrowed from
/// it, so a frustum can never outlive the matrix it was built from.
#[derive(Debug)]
pub struct Frustum {
    planes: [Plane; 6],
}

impl Frustum {
    pub(crate) fn from_view_projection(view_proj: Mat4) -> Self {
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
                Plane::from_vec4(r3 + r2),
                Plane::from_vec4(r3 - r2),
            ],
        }
    }

    pub fn planes(&self) -> &[Plane; 6] {
        &self.planes
    }

    /// Test a local-space box placed in the world by `model`
    pub fn test_aabb(&self, min: Vec3, max: Vec3, model: &Mat4) -> Visibility {
        let corners = Aabb::new(min, max).transformed_corners(model);

        for plane in &self.planes {
            if corners.iter().all(|&corner| plane.signed_distance(corner) < 0.0) {
                return Visibility::Outside;
            }
        }
        Visibility::Inside
    }

    pub fn is_visible(&self, bounds: &Aabb, model: &Mat4) -> bool {
        self.test_aabb(bounds.min, bounds.max, model) == Visibility::Inside
    }

    /// World-space sphere test, same conservative policy as the box test
    pub fn test_sphere(&self, center: Vec3, radius: f32) -> Visibility {
        for plane in &self.planes {
            if plane.signed_distance(center) < -radius {
                return Visibility::Outside;
            }
        }
        Visibility::Inside
    }
}

/// Per-frame plane extraction. Holds no drawable state.
#[derive(Debug)]
pub struct FrustumCuller {
    frustum: Frustum,
}

impl FrustumCuller {
    pub fn new() -> Self {
        Self {
            frustum: Frustum {
                planes: [Plane::ZERO; 6],
            },
        }
    }

    /// Rebuild the planes for this frame's view-projection matrix
    pub fn extract_planes(&mut self, view_proj: Mat4) -> &Frustum {
        self.frustum = Frustum::from_view_projection(view_proj);
        &self.frustum
    }
}

impl Default for FrustumCuller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const FOV_90: f32 = std::f32::consts::FRAC_PI_2;

    fn assert_normal(plane: &Plane, expected: Vec3) {
        assert_abs_diff_eq!(plane.normal.x, expected.x, epsilon = 1e-4);
        assert_abs_diff_eq!(plane.normal.y, expected.y, epsilon = 1e-4);
        assert_abs_diff_eq!(plane.normal.z, expected.z, epsilon = 1e-4);
    }

    fn unit_cube_at(center: Vec3) -> (Vec3, Vec3, Mat4) {
        (Vec3::splat(-0.5), Vec3::splat(0.5), Mat4::from_translation(center))
    }

    #[test]
    fn planes_match_analytic_perspective_normals() {
        let fov_y = 60f32.to_radians();
        let aspect = 16.0 / 9.0;
        let proj = Mat4::perspective_lh(fov_y, aspect, 0.5, 200.0);

        let mut culler = FrustumCuller::new();
        let planes = *culler.extract_planes(proj).planes();

        let h = (aspect * (fov_y / 2.0).tan()).atan();
        let v = fov_y / 2.0;
        assert_normal(&planes[LEFT], Vec3::new(h.cos(), 0.0, h.sin()));
        assert_normal(&planes[RIGHT], Vec3::new(-h.cos(), 0.0, h.sin()));
        assert_normal(&planes[BOTTOM], Vec3::new(0.0, v.cos(), v.sin()));
        assert_normal(&planes[TOP], Vec3::new(0.0, -v.cos(), v.sin()));
        assert_normal(&planes[NEAR], Vec3::Z);
        assert_normal(&planes[FAR], Vec3::NEG_Z);
        assert_abs_diff_eq!(planes[FAR].distance, 200.0, epsilon = 0.05);

        for plane in &planes {
            assert_abs_diff_eq!(plane.normal.length(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn literal_culling_case() {
        let proj = Mat4::perspective_lh(FOV_90, 1.0, 0.1, 100.0);
        let view = Mat4::IDENTITY;
        let mut culler = FrustumCuller::new();
        let frustum = culler.extract_planes(proj * view);

        let (min, max, ahead) = unit_cube_at(Vec3::new(0.0, 0.0, 50.0));
        assert_eq!(frustum.test_aabb(min, max, &ahead), Visibility::Inside);

        let (min, max, behind) = unit_cube_at(Vec3::new(0.0, 0.0, -50.0));
        assert_eq!(frustum.test_aabb(min, max, &behind), Visibility::Outside);

        let (min, max, far_right) = unit_cube_at(Vec3::new(1000.0, 0.0, 50.0));
        assert_eq!(frustum.test_aabb(min, max, &far_right), Visibility::Outside);
    }

    #[test]
    fn box_straddling_a_plane_is_inside() {
        let proj = Mat4::perspective_lh(FOV_90, 1.0, 0.1, 100.0);
        let mut culler = FrustumCuller::new();
        let frustum = culler.extract_planes(proj);

        // Crosses the far plane at z = 100
        let bounds = Aabb::from_center_extents(Vec3::new(0.0, 0.0, 100.0), Vec3::splat(2.0));
        assert!(frustum.is_visible(&bounds, &Mat4::IDENTITY));

        // Crosses the right plane x = z
        let straddling = Aabb::new(Vec3::new(9.0, -1.0, 9.0), Vec3::new(11.0, 1.0, 10.0));
        assert!(frustum.is_visible(&straddling, &Mat4::IDENTITY));
    }

    #[test]
    fn box_touching_a_plane_is_inside() {
        // Side planes at x = -1 and x = 1, with exact coefficients
        let proj = Mat4::orthographic_lh(-1.0, 1.0, -1.0, 1.0, 0.0, 10.0);
        let mut culler = FrustumCuller::new();
        let frustum = culler.extract_planes(proj);

        // One face lies on the plane, every other corner is outside
        let right = Aabb::new(Vec3::new(1.0, -0.5, 1.0), Vec3::new(2.0, 0.5, 2.0));
        assert_eq!(frustum.planes()[RIGHT].signed_distance(right.min), 0.0);
        assert_eq!(frustum.test_aabb(right.min, right.max, &Mat4::IDENTITY), Visibility::Inside);

        let left = Aabb::new(Vec3::new(-2.0, -0.5, 1.0), Vec3::new(-1.0, 0.5, 2.0));
        assert_eq!(frustum.test_aabb(left.min, left.max, &Mat4::IDENTITY), Visibility::Inside);

        let clear = Aabb::new(Vec3::new(1.5, -0.5, 1.0), Vec3::new(2.0, 0.5, 2.0));
        assert_eq!(frustum.test_aabb(clear.min, clear.max, &Mat4::IDENTITY), Visibility::Outside);
    }

    /// Transforms only min and max, the shortcut the eight-corner test avoids
    fn naive_min_max_test(frustum: &Frustum, min: Vec3, max: Vec3, model: &Mat4) -> Visibility {
        let a = model.transform_point3(min);
        let b = model.transform_point3(max);
        let world = Aabb::new(a.min(b), a.max(b));
        frustum.test_aabb(world.min, world.max, &Mat4::IDENTITY)
    }

    #[test]
    fn rotated_box_uses_all_eight_corners() {
        let proj = Mat4::perspective_lh(FOV_90, 1.0, 0.1, 100.0);
        let mut culler = FrustumCuller::new();
        let frustum = culler.extract_planes(proj);

        // Flat slab turned 45 degrees about Y, centered behind the camera.
        // One corner swings forward to z = -5 + 10 * sqrt(2).
        let min = Vec3::new(-10.0, -0.1, -10.0);
        let max = Vec3::new(10.0, 0.1, 10.0);
        let model = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0))
            * Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4);

        assert_eq!(frustum.test_aabb(min, max, &model), Visibility::Inside);
        assert_eq!(naive_min_max_test(frustum, min, max, &model), Visibility::Outside);
    }

    #[test]
    fn degenerate_matrix_never_rejects() {
        let mut culler = FrustumCuller::new();
        let frustum = culler.extract_planes(Mat4::ZERO);

        assert!(frustum.planes().iter().all(|p| *p == Plane::ZERO));
        let (min, max, model) = unit_cube_at(Vec3::new(0.0, 0.0, -1.0e6));
        assert_eq!(frustum.test_aabb(min, max, &model), Visibility::Inside);
    }

    #[test]
    fn sphere_test_matches_plane_distances() {
        let proj = Mat4::perspective_lh(FOV_90, 1.0, 0.1, 100.0);
        let mut culler = FrustumCuller::new();
        let frustum = culler.extract_planes(proj);

        assert_eq!(frustum.test_sphere(Vec3::new(0.0, 0.0, 10.0), 1.0), Visibility::Inside);
        assert_eq!(frustum.test_sphere(Vec3::new(0.0, 0.0, -10.0), 1.0), Visibility::Outside);
        // Center behind the camera, radius reaches past the near plane
        assert_eq!(frustum.test_sphere(Vec3::new(0.0, 0.0, -1.0), 2.0), Visibility::Inside);
    }

    #[test]
    fn view_matrix_moves_the_frustum() {
        let proj = Mat4::perspective_lh(FOV_90, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_lh(Vec3::new(0.0, 0.0, 200.0), Vec3::new(0.0, 0.0, 300.0), Vec3::Y);
        let mut culler = FrustumCuller::new();
        let frustum = culler.extract_planes(proj * view);

        let (min, max, origin) = unit_cube_at(Vec3::ZERO);
        assert_eq!(frustum.test_aabb(min, max, &origin), Visibility::Outside);
        let (min, max, ahead) = unit_cube_at(Vec3::new(0.0, 0.0, 250.0));
        assert_eq!(frustum.test_aabb(min, max, &ahead), Visibility::Inside);
    }
}
