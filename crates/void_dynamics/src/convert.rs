//! Conversion between engine space and Rapier space
//!
//! The engine is left-handed, Rapier is right-handed; both are Y-up. The
//! mapping is a reflection across the XY plane (negate Z), which is its own
//! inverse. Vectors negate Z, quaternions negate their X and Y parts, and
//! matrices are conjugated by `diag(1, 1, -1, 1)`.

use crate::error::{PhysicsError, Result};
use glam::{Mat3, Mat4, Quat, Vec3, Vec4};
use rapier3d::na;
use rapier3d::parry::bounding_volume::Aabb;

const SCALE_EPSILON: f32 = 1.0e-6;
const ORTHOGONALITY_EPSILON: f32 = 1.0e-3;

/// Reflection matrix swapping handedness
pub const HANDEDNESS_FLIP: Mat4 = Mat4::from_cols(
    Vec4::new(1.0, 0.0, 0.0, 0.0),
    Vec4::new(0.0, 1.0, 0.0, 0.0),
    Vec4::new(0.0, 0.0, -1.0, 0.0),
    Vec4::new(0.0, 0.0, 0.0, 1.0),
);

/// Flip a vector between conventions
#[inline]
pub fn flip_vec3(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.y, -v.z)
}

/// Flip a rotation between conventions
#[inline]
pub fn flip_quat(q: Quat) -> Quat {
    Quat::from_xyzw(-q.x, -q.y, q.z, q.w)
}

/// Flip an affine matrix between conventions
#[inline]
pub fn flip_mat4(m: Mat4) -> Mat4 {
    HANDEDNESS_FLIP * m * HANDEDNESS_FLIP
}

/// Engine vector to Rapier vector
#[inline]
pub fn to_native_vec3(v: Vec3) -> na::Vector3<f32> {
    na::Vector3::new(v.x, v.y, -v.z)
}

/// Engine point to Rapier point
#[inline]
pub fn to_native_point(v: Vec3) -> na::Point3<f32> {
    na::Point3::new(v.x, v.y, -v.z)
}

/// Rapier vector to engine vector
#[inline]
pub fn from_native_vec3(v: &na::Vector3<f32>) -> Vec3 {
    Vec3::new(v.x, v.y, -v.z)
}

/// Rapier point to engine point
#[inline]
pub fn from_native_point(p: &na::Point3<f32>) -> Vec3 {
    Vec3::new(p.x, p.y, -p.z)
}

/// Engine angular vector (velocity, torque) to Rapier. Axial vectors pick
/// up the determinant of the reflection, so X and Y flip instead of Z.
#[inline]
pub fn to_native_angular(v: Vec3) -> na::Vector3<f32> {
    na::Vector3::new(-v.x, -v.y, v.z)
}

/// Rapier angular vector to engine
#[inline]
pub fn from_native_angular(v: &na::Vector3<f32>) -> Vec3 {
    Vec3::new(-v.x, -v.y, v.z)
}

/// Engine rotation to Rapier rotation
#[inline]
pub fn to_native_quat(q: Quat) -> na::UnitQuaternion<f32> {
    let q = flip_quat(q);
    na::UnitQuaternion::new_normalize(na::Quaternion::new(q.w, q.x, q.y, q.z))
}

/// Rapier rotation to engine rotation
#[inline]
pub fn from_native_quat(q: &na::UnitQuaternion<f32>) -> Quat {
    flip_quat(Quat::from_xyzw(q.i, q.j, q.k, q.w))
}

/// Engine position/rotation to a Rapier isometry
pub fn to_native_isometry(position: Vec3, rotation: Quat) -> na::Isometry3<f32> {
    na::Isometry3::from_parts(
        na::Translation3::from(to_native_vec3(position)),
        to_native_quat(rotation),
    )
}

/// Rapier isometry to engine position/rotation
pub fn from_native_isometry(iso: &na::Isometry3<f32>) -> (Vec3, Quat) {
    (
        from_native_vec3(&iso.translation.vector),
        from_native_quat(&iso.rotation),
    )
}

/// A world pose decomposed in Rapier space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsTransform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl PhysicsTransform {
    /// Pose of a Rapier isometry with the given scale
    pub fn from_isometry(iso: &na::Isometry3<f32>, scale: Vec3) -> Self {
        let t = iso.translation.vector;
        let r = iso.rotation;
        Self {
            position: Vec3::new(t.x, t.y, t.z),
            rotation: Quat::from_xyzw(r.i, r.j, r.k, r.w),
            scale,
        }
    }

    /// Rapier isometry of this pose (scale is carried by the shape)
    pub fn isometry(&self) -> na::Isometry3<f32> {
        na::Isometry3::from_parts(
            na::Translation3::new(self.position.x, self.position.y, self.position.z),
            na::UnitQuaternion::new_normalize(na::Quaternion::new(
                self.rotation.w,
                self.rotation.x,
                self.rotation.y,
                self.rotation.z,
            )),
        )
    }

    /// Back to an engine-space world matrix
    pub fn to_engine_matrix(&self) -> Mat4 {
        flip_mat4(Mat4::from_scale_rotation_translation(
            self.scale,
            self.rotation,
            self.position,
        ))
    }
}

/// Decompose an engine world matrix into a Rapier-space pose.
///
/// Fails on matrices the solver can't represent: non-finite entries,
/// projective rows, zero or mirrored scale, or shear. Callers retry once the
/// transform settles.
pub fn convert_transform(world: &Mat4) -> Result<PhysicsTransform> {
    if !world.is_finite() {
        return Err(PhysicsError::TransformConversion("matrix has non-finite entries".into()));
    }
    let row3 = world.row(3);
    if !row3.abs_diff_eq(Vec4::W, SCALE_EPSILON) {
        return Err(PhysicsError::TransformConversion(format!(
            "matrix is projective (bottom row {row3})"
        )));
    }

    let m = flip_mat4(*world);
    let axes = [
        m.x_axis.truncate(),
        m.y_axis.truncate(),
        m.z_axis.truncate(),
    ];
    let scale = Vec3::new(axes[0].length(), axes[1].length(), axes[2].length());
    if scale.min_element() < SCALE_EPSILON {
        return Err(PhysicsError::TransformConversion(format!("zero scale {scale}")));
    }
    if Mat3::from_cols(axes[0], axes[1], axes[2]).determinant() < 0.0 {
        return Err(PhysicsError::TransformConversion(format!(
            "negative scale (mirrored basis) {scale}"
        )));
    }

    let x = axes[0] / scale.x;
    let y = axes[1] / scale.y;
    let z = axes[2] / scale.z;
    let shear = x.dot(y).abs().max(y.dot(z).abs()).max(z.dot(x).abs());
    if shear > ORTHOGONALITY_EPSILON {
        return Err(PhysicsError::TransformConversion(format!(
            "rotation part is not orthogonal (shear {shear})"
        )));
    }

    Ok(PhysicsTransform {
        position: m.w_axis.truncate(),
        rotation: Quat::from_mat3(&Mat3::from_cols(x, y, z)).normalize(),
        scale,
    })
}

/// Axis-aligned bounds in engine space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Box centered at `center` with half extents
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self::new(center - half_extents, center + half_extents)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    pub(crate) fn to_native(self) -> Aabb {
        let a = to_native_point(self.min);
        let b = to_native_point(self.max);
        Aabb::new(
            na::Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            na::Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        )
    }

    pub(crate) fn from_native(aabb: &Aabb) -> Self {
        Self::new(from_native_point(&aabb.mins), from_native_point(&aabb.maxs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_vec_eq(a: Vec3, b: Vec3) {
        assert!(a.abs_diff_eq(b, 1.0e-5), "{a} != {b}");
    }

    #[test]
    fn test_vec_round_trip() {
        let v = Vec3::new(1.5, -2.0, 3.25);
        assert_vec_eq(flip_vec3(flip_vec3(v)), v);
        assert_vec_eq(from_native_vec3(&to_native_vec3(v)), v);
        assert_vec_eq(from_native_point(&to_native_point(v)), v);
        assert_relative_eq!(to_native_vec3(v).z, -3.25);
    }

    #[test]
    fn test_quat_round_trip() {
        let q = Quat::from_euler(glam::EulerRot::YXZ, 0.3, -1.1, 2.0);
        let back = flip_quat(flip_quat(q));
        assert!(back.abs_diff_eq(q, 1.0e-6));

        let native = from_native_quat(&to_native_quat(q));
        assert!(native.abs_diff_eq(q, 1.0e-5) || native.abs_diff_eq(-q, 1.0e-5));
    }

    #[test]
    fn test_flip_commutes_with_rotation() {
        let q = Quat::from_axis_angle(Vec3::new(1.0, 2.0, 3.0).normalize(), 0.7);
        let v = Vec3::new(0.4, -0.2, 5.0);
        assert_vec_eq(flip_quat(q) * flip_vec3(v), flip_vec3(q * v));
    }

    #[test]
    fn test_angular_velocity_matches_rotation() {
        // A small rotation about an axis must convert like the axis-angle
        // part of the quaternion.
        let omega = Vec3::new(0.3, -1.2, 0.8);
        let q = Quat::from_scaled_axis(omega * 0.01);
        let native_q = to_native_quat(q);
        let native_axis = native_q.scaled_axis() / 0.01;
        let converted = to_native_angular(omega);
        assert!((native_axis - converted).norm() < 1.0e-3);
        assert_vec_eq(from_native_angular(&converted), omega);
    }

    #[test]
    fn test_flip_reverses_handedness() {
        let a = Vec3::new(1.0, 0.5, 0.0);
        let b = Vec3::new(0.0, 2.0, 1.0);
        assert_vec_eq(flip_vec3(a).cross(flip_vec3(b)), -flip_vec3(a.cross(b)));
    }

    #[test]
    fn test_matrix_round_trip() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 2.0, 0.5),
            Quat::from_rotation_y(1.2),
            Vec3::new(3.0, 4.0, 5.0),
        );
        assert!(flip_mat4(flip_mat4(m)).abs_diff_eq(m, 1.0e-6));
    }

    #[test]
    fn test_convert_transform() {
        let rotation = Quat::from_rotation_x(0.5);
        let world = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 2.0, 2.0),
            rotation,
            Vec3::new(1.0, 2.0, 3.0),
        );
        let t = convert_transform(&world).unwrap();
        assert_vec_eq(t.position, Vec3::new(1.0, 2.0, -3.0));
        assert_vec_eq(t.scale, Vec3::splat(2.0));
        let expected = flip_quat(rotation);
        assert!(t.rotation.abs_diff_eq(expected, 1.0e-5) || t.rotation.abs_diff_eq(-expected, 1.0e-5));

        assert!(t.to_engine_matrix().abs_diff_eq(world, 1.0e-5));
    }

    #[test]
    fn test_convert_transform_failures() {
        let zero = Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0));
        assert!(matches!(
            convert_transform(&zero),
            Err(PhysicsError::TransformConversion(_))
        ));

        let mirrored = Mat4::from_scale(Vec3::new(1.0, 1.0, -1.0));
        assert!(convert_transform(&mirrored).is_err());

        let mut sheared = Mat4::IDENTITY;
        sheared.y_axis = Vec4::new(0.5, 1.0, 0.0, 0.0);
        assert!(convert_transform(&sheared).is_err());

        let mut nan = Mat4::IDENTITY;
        nan.w_axis.x = f32::NAN;
        assert!(convert_transform(&nan).is_err());

        let projective = Mat4::perspective_lh(1.0, 1.0, 0.1, 10.0);
        assert!(convert_transform(&projective).is_err());
    }

    #[test]
    fn test_bounds_round_trip() {
        let bounds = Bounds::new(Vec3::new(-1.0, 0.0, 2.0), Vec3::new(1.0, 3.0, 4.0));
        let native = bounds.to_native();
        assert_relative_eq!(native.mins.z, -4.0);
        assert_relative_eq!(native.maxs.z, -2.0);
        assert_eq!(Bounds::from_native(&native), bounds);
        assert!(bounds.contains(Vec3::new(0.0, 1.0, 3.0)));
        assert_vec_eq(bounds.center(), Vec3::new(0.0, 1.5, 3.0));
    }
}
