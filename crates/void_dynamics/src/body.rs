//! Rigid body component
//!
//! A [`PhysicsBody`] is attached to an entity and owns one native body.
//! The native body is created lazily, on the first update at which the
//! entity's world transform converts cleanly; until then every setter is a
//! no-op and every getter returns a default.

use crate::convert::{
    convert_transform, from_native_angular, from_native_isometry, from_native_vec3, to_native_angular,
    to_native_isometry, to_native_point, to_native_vec3, Bounds, PhysicsTransform,
};
use crate::error::{PhysicsError, Result};
use crate::layers::ObjectLayer;
use crate::material::PhysicsMaterial;
use crate::scene::EntityTransform;
use crate::shape::{convert_shape, ShapeDesc};
use crate::system::PhysicsSystem;
use crate::world::{BodyId, ColliderTag, PhysicsWorld, WorldRef};
use glam::{Mat4, Quat, Vec3};
use rapier3d::na;
use rapier3d::prelude as rapier;
use serde::{Deserialize, Serialize};

/// How a body moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotionType {
    /// Never moves
    Static,
    /// Driven by the solver
    #[default]
    Dynamic,
    /// Moved by gameplay code; pushes dynamic bodies
    Kinematic,
}

impl MotionType {
    fn builder(self) -> rapier::RigidBodyBuilder {
        match self {
            Self::Static => rapier::RigidBodyBuilder::fixed(),
            Self::Dynamic => rapier::RigidBodyBuilder::dynamic(),
            Self::Kinematic => rapier::RigidBodyBuilder::kinematic_position_based(),
        }
    }
}

/// Per-axis motion locks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisLocks {
    pub translation: [bool; 3],
    pub rotation: [bool; 3],
}

impl AxisLocks {
    pub const NONE: Self = Self {
        translation: [false; 3],
        rotation: [false; 3],
    };

    /// Rotation locked on every axis
    pub const ROTATION: Self = Self {
        translation: [false; 3],
        rotation: [true; 3],
    };

    fn to_native(self) -> rapier::LockedAxes {
        let flags = [
            (self.translation[0], rapier::LockedAxes::TRANSLATION_LOCKED_X),
            (self.translation[1], rapier::LockedAxes::TRANSLATION_LOCKED_Y),
            (self.translation[2], rapier::LockedAxes::TRANSLATION_LOCKED_Z),
            (self.rotation[0], rapier::LockedAxes::ROTATION_LOCKED_X),
            (self.rotation[1], rapier::LockedAxes::ROTATION_LOCKED_Y),
            (self.rotation[2], rapier::LockedAxes::ROTATION_LOCKED_Z),
        ];
        flags
            .into_iter()
            .filter(|(locked, _)| *locked)
            .fold(rapier::LockedAxes::empty(), |acc, (_, flag)| acc | flag)
    }
}

/// Definition of a plain rigid body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigidBodyDef {
    pub shape: ShapeDesc,
    pub motion_type: MotionType,
    pub layer: ObjectLayer,
    pub material: PhysicsMaterial,
    /// Multiplier on world gravity
    pub gravity_factor: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    /// Reports overlaps but generates no contact response
    pub sensor: bool,
    pub ccd: bool,
    /// Mass override; derived from density when `None`
    pub mass: Option<f32>,
    pub locks: AxisLocks,
    /// Whether the body starts awake
    pub start_active: bool,
}

impl Default for RigidBodyDef {
    fn default() -> Self {
        Self {
            shape: ShapeDesc::default(),
            motion_type: MotionType::Dynamic,
            layer: ObjectLayer::MOVING,
            material: PhysicsMaterial::default(),
            gravity_factor: 1.0,
            linear_damping: 0.05,
            angular_damping: 0.05,
            sensor: false,
            ccd: false,
            mass: None,
            locks: AxisLocks::NONE,
            start_active: true,
        }
    }
}

impl RigidBodyDef {
    pub fn new(shape: ShapeDesc, motion_type: MotionType) -> Self {
        let layer = if motion_type == MotionType::Static {
            ObjectLayer::NON_MOVING
        } else {
            ObjectLayer::MOVING
        };
        Self {
            shape,
            motion_type,
            layer,
            ..Default::default()
        }
    }

    /// Static body on the non-moving layer
    pub fn fixed(shape: ShapeDesc) -> Self {
        Self::new(shape, MotionType::Static)
    }

    pub fn dynamic(shape: ShapeDesc) -> Self {
        Self::new(shape, MotionType::Dynamic)
    }

    pub fn kinematic(shape: ShapeDesc) -> Self {
        Self::new(shape, MotionType::Kinematic)
    }

    pub fn with_layer(mut self, layer: ObjectLayer) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_material(mut self, material: PhysicsMaterial) -> Self {
        self.material = material;
        self
    }

    pub fn with_gravity_factor(mut self, factor: f32) -> Self {
        self.gravity_factor = factor;
        self
    }

    pub fn with_sensor(mut self, sensor: bool) -> Self {
        self.sensor = sensor;
        self
    }

    pub fn with_mass(mut self, mass: f32) -> Self {
        self.mass = Some(mass);
        self
    }

    pub fn with_locks(mut self, locks: AxisLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_ccd(mut self, ccd: bool) -> Self {
        self.ccd = ccd;
        self
    }
}

/// Definition of a body that stands in for a character: dynamic, upright,
/// never rotated by contacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterBodyDef {
    pub shape: ShapeDesc,
    pub layer: ObjectLayer,
    pub mass: f32,
    pub friction: f32,
    pub gravity_factor: f32,
}

impl Default for CharacterBodyDef {
    fn default() -> Self {
        Self {
            shape: ShapeDesc::capsule(0.9, 0.3),
            layer: ObjectLayer::MOVING,
            mass: 80.0,
            friction: 0.2,
            gravity_factor: 1.0,
        }
    }
}

/// What a [`PhysicsBody`] is built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BodyDefinition {
    Rigid(RigidBodyDef),
    Character(CharacterBodyDef),
}

impl BodyDefinition {
    pub fn shape(&self) -> &ShapeDesc {
        match self {
            Self::Rigid(def) => &def.shape,
            Self::Character(def) => &def.shape,
        }
    }

    pub fn motion_type(&self) -> MotionType {
        match self {
            Self::Rigid(def) => def.motion_type,
            Self::Character(_) => MotionType::Dynamic,
        }
    }

    pub fn layer(&self) -> ObjectLayer {
        match self {
            Self::Rigid(def) => def.layer,
            Self::Character(def) => def.layer,
        }
    }

    fn native_builders(
        &self,
        world: &PhysicsWorld,
        pose: &PhysicsTransform,
    ) -> Result<(rapier::RigidBodyBuilder, rapier::ColliderBuilder)> {
        let shape = self.shape();
        if self.motion_type() != MotionType::Static && !shape.supports_motion() {
            return Err(PhysicsError::ShapeConversion(format!(
                "a {} cannot back a moving body",
                shape.kind()
            )));
        }
        let native = convert_shape(shape, pose.scale, &world.shape_settings())?;
        let collider = rapier::ColliderBuilder::new(native.shape)
            .position(na::Isometry3::translation(native.offset.x, native.offset.y, native.offset.z));

        let body = self.motion_type().builder().position(pose.isometry());
        match self {
            Self::Rigid(def) => {
                let mut body = body
                    .gravity_scale(def.gravity_factor)
                    .linear_damping(def.linear_damping)
                    .angular_damping(def.angular_damping)
                    .locked_axes(def.locks.to_native())
                    .sleeping(!def.start_active);
                if def.motion_type == MotionType::Dynamic {
                    body = body.ccd_enabled(def.ccd || world.config().ccd_enabled);
                }
                let mut collider = def.material.apply(collider).sensor(def.sensor);
                if let Some(mass) = def.mass {
                    collider = collider.mass(mass);
                }
                Ok((body, collider))
            }
            Self::Character(def) => Ok((
                body.gravity_scale(def.gravity_factor)
                    .locked_axes(AxisLocks::ROTATION.to_native())
                    .ccd_enabled(world.config().ccd_enabled),
                collider.friction(def.friction).mass(def.mass),
            )),
        }
    }
}

/// Lifecycle of a [`PhysicsBody`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    /// Waiting for a convertible transform
    Uninitialized,
    /// Native body exists
    Created,
    /// Native body released; terminal
    Destroyed,
}

/// Rigid body component
pub struct PhysicsBody {
    definition: BodyDefinition,
    world: Option<WorldRef>,
    id: Option<BodyId>,
    state: BodyState,
    /// Largest distance from the body origin to its surface
    max_separation: f32,
    scale: Vec3,
    /// Last world matrix pushed into a kinematic body
    synced: Option<Mat4>,
}

impl std::fmt::Debug for PhysicsBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsBody")
            .field("definition", &self.definition)
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl PhysicsBody {
    pub fn new(definition: BodyDefinition) -> Self {
        Self {
            definition,
            world: None,
            id: None,
            state: BodyState::Uninitialized,
            max_separation: 0.0,
            scale: Vec3::ONE,
            synced: None,
        }
    }

    pub fn rigid(def: RigidBodyDef) -> Self {
        Self::new(BodyDefinition::Rigid(def))
    }

    pub fn character(def: CharacterBodyDef) -> Self {
        Self::new(BodyDefinition::Character(def))
    }

    /// Bind to a driver. The native body is still created lazily.
    pub fn init(&mut self, system: &PhysicsSystem) -> Result<()> {
        self.bind(system.world_ref()?);
        Ok(())
    }

    pub(crate) fn bind(&mut self, world: WorldRef) {
        if self.state == BodyState::Uninitialized {
            self.world = Some(world);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.world.is_some()
    }

    // ==================== Lifecycle ====================

    /// Create the native body if needed, then sync it with the entity.
    ///
    /// An unconvertible transform defers creation to a later update and is
    /// not an error. A shape that can't be converted is.
    pub fn update(&mut self, transform: &mut EntityTransform, _delta_time: f32) -> Result<()> {
        match self.state {
            BodyState::Destroyed => return Ok(()),
            BodyState::Uninitialized => {
                if !self.try_create(transform)? {
                    return Ok(());
                }
            }
            BodyState::Created => {}
        }

        let world = self.upgrade()?;
        let mut world = world.lock();
        let Some(id) = self.id else {
            return Ok(());
        };
        let Some(body) = world.body(id) else {
            return Err(PhysicsError::BodyNotFound);
        };

        match self.definition.motion_type() {
            MotionType::Dynamic => {
                if !body.is_sleeping() {
                    let pose = PhysicsTransform::from_isometry(body.position(), self.scale);
                    transform.set_world_matrix(pose.to_engine_matrix());
                }
            }
            MotionType::Kinematic => {
                let current = transform.world_matrix();
                if self.synced != Some(current) {
                    match convert_transform(&current) {
                        Ok(pose) => {
                            if let Some(body) = world.body_mut(id) {
                                body.set_next_kinematic_position(pose.isometry());
                            }
                            self.synced = Some(current);
                        }
                        Err(e) => log::debug!("Kinematic body {:?} keeps its pose: {e}", transform.entity),
                    }
                }
            }
            MotionType::Static => {}
        }
        Ok(())
    }

    /// Returns whether the native body now exists
    fn try_create(&mut self, transform: &EntityTransform) -> Result<bool> {
        let world = self.upgrade()?;
        let pose = match convert_transform(&transform.world_matrix()) {
            Ok(pose) => pose,
            Err(e) => {
                log::debug!("Deferring body creation for {:?}: {e}", transform.entity);
                return Ok(false);
            }
        };

        let mut world = world.lock();
        let (body, collider) = self.definition.native_builders(&world, &pose)?;
        let tag = ColliderTag::new(Some(transform.entity), self.definition.layer());
        let id = world.insert_body(body, collider, tag)?;

        self.max_separation = world
            .body_collider(id)
            .map(|c| {
                let offset = c.position_wrt_parent().map_or(0.0, |p| p.translation.vector.norm());
                c.shape().compute_local_bounding_sphere().radius + offset
            })
            .unwrap_or(0.0);
        self.id = Some(id);
        self.scale = pose.scale;
        self.synced = Some(transform.world_matrix());
        self.state = BodyState::Created;
        log::debug!(
            "Created {:?} body {:?} for {:?}",
            self.definition.motion_type(),
            id,
            transform.entity
        );
        Ok(true)
    }

    fn upgrade(&self) -> Result<std::sync::Arc<parking_lot::Mutex<PhysicsWorld>>> {
        self.world
            .as_ref()
            .ok_or(PhysicsError::MissingDependency("physics system"))?
            .upgrade()
            .ok_or(PhysicsError::MissingDependency("physics world"))
    }

    /// Destroy the native body. Idempotent; the body can't be recreated.
    pub fn release(&mut self) {
        if self.state == BodyState::Destroyed {
            return;
        }
        self.remove_native();
        self.state = BodyState::Destroyed;
    }

    /// Remove the native body and forget the world. The component goes back
    /// to `Uninitialized` and is recreated once bound to a new world.
    pub(crate) fn detach(&mut self) {
        if self.state != BodyState::Destroyed {
            self.remove_native();
            self.state = BodyState::Uninitialized;
        }
        self.world = None;
        self.synced = None;
    }

    fn remove_native(&mut self) {
        if let (Some(id), Ok(world)) = (self.id.take(), self.upgrade()) {
            world.lock().remove_body(id);
            log::debug!("Released body {:?}", id);
        }
    }

    pub fn state(&self) -> BodyState {
        self.state
    }

    pub fn is_created(&self) -> bool {
        self.state == BodyState::Created
    }

    pub fn body_id(&self) -> Option<BodyId> {
        self.id
    }

    pub fn definition(&self) -> &BodyDefinition {
        &self.definition
    }

    pub fn motion_type(&self) -> MotionType {
        self.definition.motion_type()
    }

    pub fn shape(&self) -> &ShapeDesc {
        self.definition.shape()
    }

    pub fn layer(&self) -> ObjectLayer {
        self.definition.layer()
    }

    /// Largest distance from the body origin to its surface (0 until created)
    pub fn max_separation_distance(&self) -> f32 {
        self.max_separation
    }

    // ==================== Native access ====================

    fn with_body<R>(&self, f: impl FnOnce(&rapier::RigidBody) -> R) -> Option<R> {
        let id = self.id?;
        let world = self.world.as_ref()?.upgrade()?;
        let world = world.lock();
        world.body(id).map(f)
    }

    fn with_body_mut(&self, f: impl FnOnce(&mut rapier::RigidBody)) {
        let Some(id) = self.id else {
            return;
        };
        let Some(world) = self.world.as_ref().and_then(|w| w.upgrade()) else {
            return;
        };
        let mut world = world.lock();
        if let Some(body) = world.body_mut(id) {
            f(body);
        }
    }

    // ==================== State ====================

    pub fn position(&self) -> Vec3 {
        self.with_body(|b| from_native_vec3(b.translation()))
            .unwrap_or(Vec3::ZERO)
    }

    pub fn rotation(&self) -> Quat {
        self.with_body(|b| from_native_isometry(b.position()).1)
            .unwrap_or(Quat::IDENTITY)
    }

    pub fn linear_velocity(&self) -> Vec3 {
        self.with_body(|b| from_native_vec3(b.linvel()))
            .unwrap_or(Vec3::ZERO)
    }

    pub fn angular_velocity(&self) -> Vec3 {
        self.with_body(|b| from_native_angular(b.angvel()))
            .unwrap_or(Vec3::ZERO)
    }

    /// Inverse mass; zero for static and kinematic bodies
    pub fn inverse_mass(&self) -> f32 {
        self.with_body(|b| {
            if b.is_dynamic() && b.mass() > 0.0 {
                1.0 / b.mass()
            } else {
                0.0
            }
        })
        .unwrap_or(0.0)
    }

    pub fn gravity_factor(&self) -> f32 {
        self.with_body(|b| b.gravity_scale()).unwrap_or(match &self.definition {
            BodyDefinition::Rigid(def) => def.gravity_factor,
            BodyDefinition::Character(def) => def.gravity_factor,
        })
    }

    /// Awake and simulated
    pub fn is_active(&self) -> bool {
        self.with_body(|b| b.is_enabled() && !b.is_fixed() && !b.is_sleeping())
            .unwrap_or(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.with_body(|b| b.is_enabled()).unwrap_or(false)
    }

    pub fn is_sleeping(&self) -> bool {
        self.with_body(|b| b.is_sleeping()).unwrap_or(false)
    }

    pub fn local_bounds(&self) -> Bounds {
        self.with_native_collider(|c| {
            let local = c.position_wrt_parent().copied().unwrap_or_else(na::Isometry3::identity);
            Bounds::from_native(&c.shape().compute_aabb(&local))
        })
        .unwrap_or_default()
    }

    pub fn world_bounds(&self) -> Bounds {
        self.with_native_collider(|c| Bounds::from_native(&c.compute_aabb()))
            .unwrap_or_default()
    }

    fn with_native_collider<R>(&self, f: impl FnOnce(&rapier::Collider) -> R) -> Option<R> {
        let id = self.id?;
        let world = self.world.as_ref()?.upgrade()?;
        let world = world.lock();
        world.body_collider(id).map(f)
    }

    // ==================== Mutators ====================

    pub fn set_position(&self, position: Vec3) {
        self.with_body_mut(|b| b.set_translation(to_native_vec3(position), true));
    }

    pub fn set_rotation(&self, rotation: Quat) {
        self.with_body_mut(|b| b.set_rotation(to_native_isometry(Vec3::ZERO, rotation).rotation, true));
    }

    pub fn set_linear_velocity(&self, velocity: Vec3) {
        self.with_body_mut(|b| b.set_linvel(to_native_vec3(velocity), true));
    }

    pub fn set_angular_velocity(&self, velocity: Vec3) {
        self.with_body_mut(|b| b.set_angvel(to_native_angular(velocity), true));
    }

    pub fn set_gravity_factor(&self, factor: f32) {
        self.with_body_mut(|b| b.set_gravity_scale(factor, true));
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.with_body_mut(|b| b.set_enabled(enabled));
    }

    pub fn wake_up(&self) {
        self.with_body_mut(|b| b.wake_up(true));
    }

    pub fn sleep(&self) {
        self.with_body_mut(|b| b.sleep());
    }

    /// Continuous force, applied until the next step
    pub fn add_force(&self, force: Vec3) {
        self.with_body_mut(|b| b.add_force(to_native_vec3(force), true));
    }

    pub fn add_torque(&self, torque: Vec3) {
        self.with_body_mut(|b| b.add_torque(to_native_angular(torque), true));
    }

    pub fn add_impulse(&self, impulse: Vec3) {
        self.with_body_mut(|b| b.apply_impulse(to_native_vec3(impulse), true));
    }

    pub fn add_impulse_at_point(&self, impulse: Vec3, point: Vec3) {
        self.with_body_mut(|b| b.apply_impulse_at_point(to_native_vec3(impulse), to_native_point(point), true));
    }

    pub fn add_angular_impulse(&self, impulse: Vec3) {
        self.with_body_mut(|b| b.apply_torque_impulse(to_native_angular(impulse), true));
    }

    /// Move towards a target pose so it is reached after `delta_time`.
    /// Kinematic bodies are scheduled to the pose; dynamic bodies get the
    /// velocities that carry them there.
    pub fn move_kinematic(&self, position: Vec3, rotation: Quat, delta_time: f32) {
        if delta_time <= 0.0 {
            return;
        }
        let target = to_native_isometry(position, rotation);
        self.with_body_mut(|b| {
            if b.is_kinematic() {
                b.set_next_kinematic_position(target);
            } else if b.is_dynamic() {
                let linear = (target.translation.vector - b.translation()) / delta_time;
                let angular = (target.rotation * b.rotation().inverse()).scaled_axis() / delta_time;
                b.set_linvel(linear, true);
                b.set_angvel(angular, true);
            }
        });
    }

    /// Teleport to a pose
    pub fn move_position(&self, position: Vec3, rotation: Quat) {
        let target = to_native_isometry(position, rotation);
        self.with_body_mut(|b| {
            if b.is_kinematic() {
                b.set_next_kinematic_position(target);
            } else {
                b.set_position(target, true);
            }
        });
    }
}

impl Drop for PhysicsBody {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhysicsConfig;
    use approx::assert_relative_eq;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn setup() -> (Arc<Mutex<PhysicsWorld>>, hecs::Entity) {
        let world = Arc::new(Mutex::new(PhysicsWorld::new(&PhysicsConfig::default()).unwrap()));
        let entity = hecs::World::new().spawn(());
        (world, entity)
    }

    fn transform_at(entity: hecs::Entity, position: Vec3) -> EntityTransform {
        EntityTransform::new(entity, Mat4::from_translation(position))
    }

    #[test]
    fn test_uninitialized_defaults_and_noops() {
        let body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5)));
        body.set_linear_velocity(Vec3::X);
        body.add_impulse(Vec3::Y);
        assert_eq!(body.position(), Vec3::ZERO);
        assert_eq!(body.rotation(), Quat::IDENTITY);
        assert_eq!(body.inverse_mass(), 0.0);
        assert_eq!(body.world_bounds(), Bounds::default());
        assert!(!body.is_active());
        assert_eq!(body.shape(), &ShapeDesc::sphere(0.5));
        assert_eq!(body.state(), BodyState::Uninitialized);
    }

    #[test]
    fn test_update_without_driver_is_missing_dependency() {
        let (_, entity) = setup();
        let mut body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5)));
        let mut t = transform_at(entity, Vec3::ZERO);
        assert!(matches!(
            body.update(&mut t, 0.016),
            Err(PhysicsError::MissingDependency(_))
        ));
    }

    #[test]
    fn test_creation_deferred_until_transform_converts() {
        let (world, entity) = setup();
        let mut body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5)));
        body.bind(Arc::downgrade(&world));

        let mut degenerate = EntityTransform::new(entity, Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0)));
        for _ in 0..3 {
            body.update(&mut degenerate, 0.016).unwrap();
        }
        assert_eq!(world.lock().body_count(), 0);
        assert!(!body.is_created());

        let mut t = transform_at(entity, Vec3::new(0.0, 2.0, 3.0));
        body.update(&mut t, 0.016).unwrap();
        let id = body.body_id().unwrap();
        body.update(&mut t, 0.016).unwrap();
        assert_eq!(body.body_id(), Some(id));
        assert_eq!(world.lock().body_count(), 1);
        assert_eq!(world.lock().entity_for_body(id), Some(entity));

        let p = body.position();
        assert!(p.abs_diff_eq(Vec3::new(0.0, 2.0, 3.0), 1.0e-5));
        assert_relative_eq!(body.max_separation_distance(), 0.5, epsilon = 1.0e-5);
    }

    #[test]
    fn test_bad_shape_is_an_error() {
        let (world, entity) = setup();
        let mut body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::plane()));
        body.bind(Arc::downgrade(&world));
        let mut t = transform_at(entity, Vec3::ZERO);
        assert!(matches!(
            body.update(&mut t, 0.016),
            Err(PhysicsError::ShapeConversion(_))
        ));

        let mut body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(-1.0)));
        body.bind(Arc::downgrade(&world));
        assert!(body.update(&mut t, 0.016).is_err());
        assert_eq!(world.lock().body_count(), 0);
    }

    #[test]
    fn test_dynamic_body_writes_entity_pose() {
        let (world, entity) = setup();
        let mut body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5)));
        body.bind(Arc::downgrade(&world));
        let mut t = transform_at(entity, Vec3::new(1.0, 0.0, 4.0));
        body.update(&mut t, 0.016).unwrap();

        body.set_position(Vec3::new(1.0, 3.0, 4.0));
        let mut t = transform_at(entity, Vec3::new(1.0, 0.0, 4.0));
        body.update(&mut t, 0.016).unwrap();
        assert!(t.is_dirty());
        let written = t.world_matrix().w_axis.truncate();
        assert!(written.abs_diff_eq(Vec3::new(1.0, 3.0, 4.0), 1.0e-5));
    }

    #[test]
    fn test_velocity_round_trips_through_native_space() {
        let (world, entity) = setup();
        let mut body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5)).with_mass(2.0));
        body.bind(Arc::downgrade(&world));
        body.update(&mut transform_at(entity, Vec3::ZERO), 0.016).unwrap();

        body.set_linear_velocity(Vec3::new(1.0, 2.0, 3.0));
        body.set_angular_velocity(Vec3::new(0.1, 0.2, 0.3));
        assert!(body.linear_velocity().abs_diff_eq(Vec3::new(1.0, 2.0, 3.0), 1.0e-5));
        assert!(body.angular_velocity().abs_diff_eq(Vec3::new(0.1, 0.2, 0.3), 1.0e-5));
        assert_relative_eq!(body.inverse_mass(), 0.5, epsilon = 1.0e-4);
    }

    #[test]
    fn test_static_body_has_zero_inverse_mass() {
        let (world, entity) = setup();
        let mut body = PhysicsBody::rigid(RigidBodyDef::fixed(ShapeDesc::cuboid(1.0, 1.0, 1.0)));
        body.bind(Arc::downgrade(&world));
        body.update(&mut transform_at(entity, Vec3::ZERO), 0.016).unwrap();
        assert!(body.is_created());
        assert_eq!(body.inverse_mass(), 0.0);
        assert!(!body.is_active());
        let bounds = body.local_bounds();
        assert!(bounds.max.abs_diff_eq(Vec3::ONE, 1.0e-4));
    }

    #[test]
    fn test_release_is_idempotent_and_final() {
        let (world, entity) = setup();
        let mut body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5)));
        body.bind(Arc::downgrade(&world));
        let mut t = transform_at(entity, Vec3::ZERO);
        body.update(&mut t, 0.016).unwrap();
        assert_eq!(world.lock().body_count(), 1);

        body.release();
        body.release();
        assert_eq!(body.state(), BodyState::Destroyed);
        assert_eq!(world.lock().body_count(), 0);

        body.update(&mut t, 0.016).unwrap();
        assert_eq!(world.lock().body_count(), 0);
    }

    #[test]
    fn test_dropped_world_degrades_to_defaults() {
        let (world, entity) = setup();
        let mut body = PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5)));
        body.bind(Arc::downgrade(&world));
        body.update(&mut transform_at(entity, Vec3::new(0.0, 5.0, 0.0)), 0.016).unwrap();
        drop(world);

        assert_eq!(body.position(), Vec3::ZERO);
        body.add_force(Vec3::Y);
        assert!(matches!(
            body.update(&mut transform_at(entity, Vec3::ZERO), 0.016),
            Err(PhysicsError::MissingDependency(_))
        ));
    }

    #[test]
    fn test_character_body_locks_rotation() {
        let (world, entity) = setup();
        let mut body = PhysicsBody::character(CharacterBodyDef::default());
        body.bind(Arc::downgrade(&world));
        body.update(&mut transform_at(entity, Vec3::ZERO), 0.016).unwrap();
        assert_eq!(body.motion_type(), MotionType::Dynamic);
        let id = body.body_id().unwrap();
        let locked = world.lock().body(id).unwrap().locked_axes();
        assert!(locked.contains(rapier::LockedAxes::ROTATION_LOCKED));
    }
}
