//! Shape descriptors and their conversion to Rapier shapes

use crate::convert::{flip_vec3, to_native_point};
use crate::error::{PhysicsError, Result};
use glam::Vec3;
use rapier3d::na;
use rapier3d::prelude as rapier;
use serde::{Deserialize, Serialize};

/// Convex radius used for rounded primitives large enough to afford it
pub const DEFAULT_CONVEX_RADIUS: f32 = 0.05;

/// Engine-side collision shape description, in entity-local units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShapeDesc {
    /// Sphere with radius
    Sphere { radius: f32 },
    /// Box with half-extents
    Box { half_extents: [f32; 3] },
    /// Capsule aligned along Y
    Capsule { half_height: f32, radius: f32 },
    /// Cylinder aligned along Y
    Cylinder { half_height: f32, radius: f32 },
    /// Cone aligned along Y
    Cone { half_height: f32, radius: f32 },
    /// Horizontal ground slab whose top face sits at local Y = 0
    Plane { half_extent: Option<f32> },
    /// Convex hull of points
    ConvexHull { points: Vec<[f32; 3]> },
    /// Heightfield terrain, row-major, rows along Z
    HeightField {
        heights: Vec<f32>,
        rows: usize,
        cols: usize,
        scale: [f32; 3],
    },
}

impl Default for ShapeDesc {
    fn default() -> Self {
        Self::Box {
            half_extents: [0.5, 0.5, 0.5],
        }
    }
}

impl ShapeDesc {
    pub fn sphere(radius: f32) -> Self {
        Self::Sphere { radius }
    }

    pub fn cuboid(hx: f32, hy: f32, hz: f32) -> Self {
        Self::Box {
            half_extents: [hx, hy, hz],
        }
    }

    pub fn capsule(half_height: f32, radius: f32) -> Self {
        Self::Capsule { half_height, radius }
    }

    pub fn cylinder(half_height: f32, radius: f32) -> Self {
        Self::Cylinder { half_height, radius }
    }

    /// Plane using the configured default extent
    pub fn plane() -> Self {
        Self::Plane { half_extent: None }
    }

    /// Whether the shape may back a dynamic or kinematic body
    pub fn supports_motion(&self) -> bool {
        !matches!(self, Self::Plane { .. } | Self::HeightField { .. })
    }

    /// Short name for log and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sphere { .. } => "sphere",
            Self::Box { .. } => "box",
            Self::Capsule { .. } => "capsule",
            Self::Cylinder { .. } => "cylinder",
            Self::Cone { .. } => "cone",
            Self::Plane { .. } => "plane",
            Self::ConvexHull { .. } => "convex hull",
            Self::HeightField { .. } => "heightfield",
        }
    }
}

/// Settings the conversion reads from the world configuration
#[derive(Debug, Clone, Copy)]
pub struct ShapeSettings {
    pub plane_half_extent: f32,
    pub plane_thickness: f32,
}

impl Default for ShapeSettings {
    fn default() -> Self {
        Self {
            plane_half_extent: 1000.0,
            plane_thickness: 1.0,
        }
    }
}

/// A converted Rapier shape plus its offset inside the body frame
#[derive(Clone)]
pub struct NativeShape {
    pub shape: rapier::SharedShape,
    pub offset: na::Vector3<f32>,
}

impl std::fmt::Debug for NativeShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeShape")
            .field("shape_type", &self.shape.shape_type())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Convex radius for a rounded primitive whose smallest half dimension is `min_half`
pub fn convex_radius(min_half: f32) -> f32 {
    DEFAULT_CONVEX_RADIUS.min(0.2 * min_half).max(0.0)
}

fn positive(kind: &str, name: &str, value: f32) -> Result<f32> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(PhysicsError::ShapeConversion(format!(
            "{kind} {name} must be positive, got {value}"
        )))
    }
}

/// Convert a shape descriptor, scaled by the entity's world scale, into a
/// Rapier shape.
pub fn convert_shape(desc: &ShapeDesc, scale: Vec3, settings: &ShapeSettings) -> Result<NativeShape> {
    let kind = desc.kind();
    let scale = scale.abs();
    positive(kind, "scale", scale.min_element())?;
    let centered = |shape| NativeShape {
        shape,
        offset: na::Vector3::zeros(),
    };

    let native = match desc {
        ShapeDesc::Sphere { radius } => {
            if (scale.max_element() - scale.min_element()).abs() > 1.0e-4 {
                log::debug!("Non-uniform scale {scale} on sphere, using largest axis");
            }
            let r = positive(kind, "radius", radius * scale.max_element())?;
            centered(rapier::SharedShape::ball(r))
        }
        ShapeDesc::Box { half_extents } => {
            let h = Vec3::from_array(*half_extents) * scale;
            positive(kind, "half extent", h.min_element())?;
            let r = convex_radius(h.min_element());
            centered(rapier::SharedShape::round_cuboid(h.x - r, h.y - r, h.z - r, r))
        }
        ShapeDesc::Capsule { half_height, radius } => {
            let hh = positive(kind, "half height", half_height * scale.y)?;
            let r = positive(kind, "radius", radius * scale.x.max(scale.z))?;
            centered(rapier::SharedShape::capsule_y(hh, r))
        }
        ShapeDesc::Cylinder { half_height, radius } => {
            let hh = positive(kind, "half height", half_height * scale.y)?;
            let r = positive(kind, "radius", radius * scale.x.max(scale.z))?;
            let cr = convex_radius(hh.min(r));
            centered(rapier::SharedShape::round_cylinder(hh - cr, r - cr, cr))
        }
        ShapeDesc::Cone { half_height, radius } => {
            let hh = positive(kind, "half height", half_height * scale.y)?;
            let r = positive(kind, "radius", radius * scale.x.max(scale.z))?;
            let cr = convex_radius(hh.min(r));
            centered(rapier::SharedShape::round_cone(hh - cr, r - cr, cr))
        }
        ShapeDesc::Plane { half_extent } => {
            let extent = half_extent.unwrap_or(settings.plane_half_extent) * scale.x.max(scale.z);
            let extent = positive(kind, "half extent", extent)?;
            let half_thickness = positive(kind, "thickness", settings.plane_thickness)? * 0.5;
            NativeShape {
                shape: rapier::SharedShape::cuboid(extent, half_thickness, extent),
                offset: na::Vector3::new(0.0, -half_thickness, 0.0),
            }
        }
        ShapeDesc::ConvexHull { points } => {
            if points.len() < 4 {
                return Err(PhysicsError::ShapeConversion(format!(
                    "convex hull needs at least 4 points, got {}",
                    points.len()
                )));
            }
            let native_points: Vec<_> = points
                .iter()
                .map(|p| to_native_point(Vec3::from_array(*p) * scale))
                .collect();
            let shape = rapier::SharedShape::convex_hull(&native_points).ok_or_else(|| {
                PhysicsError::ShapeConversion("convex hull is degenerate (coplanar points?)".into())
            })?;
            centered(shape)
        }
        ShapeDesc::HeightField {
            heights,
            rows,
            cols,
            scale: field_scale,
        } => {
            let (rows, cols) = (*rows, *cols);
            let samples = rows.checked_mul(cols).ok_or_else(|| {
                PhysicsError::ShapeConversion(format!("heightfield grid {rows}x{cols} is too large"))
            })?;
            if rows < 2 || cols < 2 || heights.len() < samples {
                return Err(PhysicsError::ShapeConversion(format!(
                    "heightfield needs a {rows}x{cols} grid of at least 2x2, got {} samples",
                    heights.len()
                )));
            }
            let s = flip_vec3(Vec3::from_array(*field_scale) * scale).abs();
            positive(kind, "scale", s.min_element())?;
            // Rows run along Z, so the handedness flip reverses row order.
            let matrix = na::DMatrix::from_fn(rows, cols, |i, j| heights[(rows - 1 - i) * cols + j]);
            centered(rapier::SharedShape::heightfield(matrix, na::Vector3::new(s.x, s.y, s.z)))
        }
    };

    Ok(native)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn settings() -> ShapeSettings {
        ShapeSettings::default()
    }

    #[test]
    fn test_sphere_scaled() {
        let native = convert_shape(&ShapeDesc::sphere(0.5), Vec3::splat(2.0), &settings()).unwrap();
        let ball = native.shape.as_ball().unwrap();
        assert_relative_eq!(ball.radius, 1.0);
    }

    #[test]
    fn test_box_uses_convex_radius() {
        let native = convert_shape(&ShapeDesc::cuboid(1.0, 2.0, 3.0), Vec3::ONE, &settings()).unwrap();
        let round = native.shape.as_round_cuboid().unwrap();
        assert_relative_eq!(round.border_radius, DEFAULT_CONVEX_RADIUS);
        assert_relative_eq!(round.inner_shape.half_extents.x + round.border_radius, 1.0);
    }

    #[test]
    fn test_convex_radius_heuristic() {
        assert_relative_eq!(convex_radius(10.0), DEFAULT_CONVEX_RADIUS);
        assert_relative_eq!(convex_radius(0.1), 0.02);
        assert!(convex_radius(0.1) < 0.1);
    }

    #[test]
    fn test_rejects_non_positive_dimensions() {
        for desc in [
            ShapeDesc::sphere(0.0),
            ShapeDesc::cuboid(1.0, -1.0, 1.0),
            ShapeDesc::capsule(0.5, 0.0),
            ShapeDesc::cylinder(f32::NAN, 1.0),
        ] {
            assert!(matches!(
                convert_shape(&desc, Vec3::ONE, &settings()),
                Err(PhysicsError::ShapeConversion(_))
            ));
        }
        assert!(convert_shape(&ShapeDesc::sphere(1.0), Vec3::new(1.0, 0.0, 1.0), &settings()).is_err());
    }

    #[test]
    fn test_plane_top_face_at_origin() {
        let native = convert_shape(&ShapeDesc::plane(), Vec3::ONE, &settings()).unwrap();
        let cuboid = native.shape.as_cuboid().unwrap();
        assert_relative_eq!(cuboid.half_extents.x, 1000.0);
        assert_relative_eq!(native.offset.y + cuboid.half_extents.y, 0.0);
        assert!(!ShapeDesc::plane().supports_motion());
    }

    #[test]
    fn test_convex_hull() {
        let points = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        assert!(convert_shape(&ShapeDesc::ConvexHull { points }, Vec3::ONE, &settings()).is_ok());

        assert!(convert_shape(&ShapeDesc::ConvexHull { points: vec![] }, Vec3::ONE, &settings()).is_err());
    }

    #[test]
    fn test_heightfield_grid_checked() {
        let desc = ShapeDesc::HeightField {
            heights: vec![0.0; 3],
            rows: 2,
            cols: 2,
            scale: [10.0, 1.0, 10.0],
        };
        assert!(convert_shape(&desc, Vec3::ONE, &settings()).is_err());

        let desc = ShapeDesc::HeightField {
            heights: vec![0.0, 1.0, 2.0, 3.0],
            rows: 2,
            cols: 2,
            scale: [10.0, 1.0, 10.0],
        };
        assert!(convert_shape(&desc, Vec3::ONE, &settings()).is_ok());

        let desc = ShapeDesc::HeightField {
            heights: vec![0.0; 4],
            rows: usize::MAX,
            cols: 2,
            scale: [1.0, 1.0, 1.0],
        };
        assert!(matches!(
            convert_shape(&desc, Vec3::ONE, &settings()),
            Err(PhysicsError::ShapeConversion(_))
        ));
    }
}
