//! Physics queries (raycasting, overlap tests)
//!
//! Inputs and results are in engine space. Every query takes a
//! [`LayerMask`]; colliders on layers outside the mask are skipped.

use crate::convert::{from_native_point, from_native_vec3, to_native_isometry, to_native_point, to_native_vec3};
use crate::error::Result;
use crate::layers::{LayerMask, ObjectLayer};
use crate::shape::{convert_shape, ShapeDesc, ShapeSettings};
use crate::world::{BodyId, ColliderTag};
use glam::{Quat, Vec3};
use hecs::Entity;
use rapier3d::prelude as rapier;

/// Result of a raycast query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    /// Body owning the hit collider
    pub body: Option<BodyId>,
    /// Entity owning the body
    pub entity: Option<Entity>,
    pub layer: ObjectLayer,
    /// Hit point in world space
    pub point: Vec3,
    /// Surface normal at hit point
    pub normal: Vec3,
    /// Distance from ray origin
    pub distance: f32,
}

/// Options for raycast queries
#[derive(Debug, Clone)]
pub struct RaycastOptions {
    /// Maximum distance for the ray
    pub max_distance: f32,
    /// Layers the ray can hit
    pub mask: LayerMask,
    /// Hit sensor colliders too
    pub include_sensors: bool,
    /// Bodies to ignore
    pub exclude: Vec<BodyId>,
}

impl Default for RaycastOptions {
    fn default() -> Self {
        Self {
            max_distance: f32::MAX,
            mask: LayerMask::ALL,
            include_sensors: false,
            exclude: Vec::new(),
        }
    }
}

impl RaycastOptions {
    pub fn new(max_distance: f32, mask: LayerMask) -> Self {
        Self {
            max_distance,
            mask,
            ..Default::default()
        }
    }

    pub fn with_max_distance(mut self, distance: f32) -> Self {
        self.max_distance = distance;
        self
    }

    pub fn with_sensors(mut self, include_sensors: bool) -> Self {
        self.include_sensors = include_sensors;
        self
    }

    pub fn with_mask(mut self, mask: LayerMask) -> Self {
        self.mask = mask;
        self
    }

    /// Add a body to exclude
    pub fn exclude(mut self, body: BodyId) -> Self {
        self.exclude.push(body);
        self
    }
}

/// Read-only query view over the native world
pub struct PhysicsQuery<'a> {
    pub(crate) query_pipeline: &'a rapier::QueryPipeline,
    pub(crate) colliders: &'a rapier::ColliderSet,
    pub(crate) bodies: &'a rapier::RigidBodySet,
    pub(crate) shape_settings: ShapeSettings,
}

fn layer_of(collider: &rapier::Collider) -> ObjectLayer {
    ColliderTag::from_user_data(collider.user_data).layer
}

impl<'a> PhysicsQuery<'a> {
    fn hit(&self, handle: rapier::ColliderHandle, point: Vec3, normal: Vec3, distance: f32) -> Option<RaycastHit> {
        let collider = self.colliders.get(handle)?;
        let tag = ColliderTag::from_user_data(collider.user_data);
        Some(RaycastHit {
            body: collider.parent().map(BodyId),
            entity: tag.entity(),
            layer: tag.layer,
            point,
            normal,
            distance,
        })
    }

    /// Build the ray, `None` for a zero direction
    fn ray(origin: Vec3, direction: Vec3) -> Option<rapier::Ray> {
        let direction = direction.try_normalize()?;
        Some(rapier::Ray::new(to_native_point(origin), to_native_vec3(direction)))
    }

    /// Cast a ray and get the closest hit
    pub fn raycast(&self, origin: Vec3, direction: Vec3, options: &RaycastOptions) -> Option<RaycastHit> {
        let ray = Self::ray(origin, direction)?;
        let predicate = |_: rapier::ColliderHandle, c: &rapier::Collider| {
            options.mask.contains(layer_of(c)) && !c.parent().is_some_and(|p| options.exclude.contains(&BodyId(p)))
        };
        let mut filter = rapier::QueryFilter::default().predicate(&predicate);
        if !options.include_sensors {
            filter = filter.exclude_sensors();
        }

        let (handle, intersection) = self.query_pipeline.cast_ray_and_get_normal(
            self.bodies,
            self.colliders,
            &ray,
            options.max_distance,
            true,
            filter,
        )?;
        let point = from_native_point(&ray.point_at(intersection.time_of_impact));
        self.hit(
            handle,
            point,
            from_native_vec3(&intersection.normal),
            intersection.time_of_impact,
        )
    }

    /// Cast a ray and get every hit, closest first
    pub fn raycast_all(&self, origin: Vec3, direction: Vec3, options: &RaycastOptions) -> Vec<RaycastHit> {
        let Some(ray) = Self::ray(origin, direction) else {
            return Vec::new();
        };
        let predicate = |_: rapier::ColliderHandle, c: &rapier::Collider| {
            options.mask.contains(layer_of(c)) && !c.parent().is_some_and(|p| options.exclude.contains(&BodyId(p)))
        };
        let mut filter = rapier::QueryFilter::default().predicate(&predicate);
        if !options.include_sensors {
            filter = filter.exclude_sensors();
        }

        let mut hits = Vec::new();
        self.query_pipeline.intersections_with_ray(
            self.bodies,
            self.colliders,
            &ray,
            options.max_distance,
            true,
            filter,
            |handle, intersection| {
                let point = from_native_point(&ray.point_at(intersection.time_of_impact));
                hits.extend(self.hit(
                    handle,
                    point,
                    from_native_vec3(&intersection.normal),
                    intersection.time_of_impact,
                ));
                true
            },
        );

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits
    }

    /// Bodies whose collider contains a point
    pub fn bodies_at_point(&self, point: Vec3, mask: LayerMask) -> Vec<BodyId> {
        let predicate = |_: rapier::ColliderHandle, c: &rapier::Collider| mask.contains(layer_of(c));
        let filter = rapier::QueryFilter::default().predicate(&predicate);

        let mut results = Vec::new();
        self.query_pipeline.intersections_with_point(
            self.bodies,
            self.colliders,
            &to_native_point(point),
            filter,
            |handle| {
                if let Some(parent) = self.colliders.get(handle).and_then(|c| c.parent()) {
                    results.push(BodyId(parent));
                }
                true
            },
        );
        results.sort();
        results.dedup();
        results
    }

    /// Bodies overlapping a shape placed at a pose
    pub fn overlap_shape(
        &self,
        shape: &ShapeDesc,
        position: Vec3,
        rotation: Quat,
        mask: LayerMask,
    ) -> Result<Vec<BodyId>> {
        let native = convert_shape(shape, Vec3::ONE, &self.shape_settings)?;
        let mut pose = to_native_isometry(position, rotation);
        pose.translation.vector += pose.rotation * native.offset;

        let predicate = |_: rapier::ColliderHandle, c: &rapier::Collider| mask.contains(layer_of(c));
        let filter = rapier::QueryFilter::default().predicate(&predicate);

        let mut results = Vec::new();
        self.query_pipeline.intersections_with_shape(
            self.bodies,
            self.colliders,
            &pose,
            &*native.shape,
            filter,
            |handle| {
                if let Some(parent) = self.colliders.get(handle).and_then(|c| c.parent()) {
                    results.push(BodyId(parent));
                }
                true
            },
        );
        results.sort();
        results.dedup();
        Ok(results)
    }
}
