//! Virtual character controller
//!
//! A [`CharacterController`] owns a native character record inside the
//! physics world, addressed by a generational [`CharacterHandle`]. Each
//! update sweeps the character shape through the world with Rapier's
//! kinematic controller, resolves penetration, refreshes ground state and
//! reports contacts to an optional [`CharacterContactDelegate`].
//!
//! Delegate callbacks never run while the world is locked, so a delegate
//! may freely query the driver.

use crate::body::PhysicsBody;
use crate::convert::{
    convert_transform, from_native_angular, from_native_point, from_native_quat, from_native_vec3,
    to_native_isometry, to_native_point, to_native_vec3, PhysicsTransform,
};
use crate::error::{DelegateResult, PhysicsError, Result};
use crate::layers::ObjectLayer;
use crate::scene::EntityTransform;
use crate::shape::{convert_shape, ShapeDesc};
use crate::system::PhysicsSystem;
use crate::world::{BodyId, CharacterContext, CharacterHandle, ColliderTag, PhysicsWorld, WorldRef};
use glam::{Quat, Vec3, Vec4};
use hecs::Entity;
use parking_lot::Mutex;
use rapier3d::control::{CharacterLength, KinematicCharacterController};
use rapier3d::na;
use rapier3d::parry::bounding_volume::BoundingVolume;
use rapier3d::parry::query;
use rapier3d::prelude as rapier;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Character definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterDef {
    pub shape: ShapeDesc,
    /// Up direction in engine space
    pub up: [f32; 3],
    /// Steepest walkable slope, radians
    pub max_slope_angle: f32,
    /// Skin kept between the shape and the world
    pub padding: f32,
    /// Fraction of penetration resolved per update, 0..=1
    pub penetration_recovery_speed: f32,
    /// Distance at which contacts are picked up ahead of touching
    pub predictive_contact_distance: f32,
    /// Plane in character-local space (normal xyz, constant w). Contacts
    /// behind it can support the character.
    pub supporting_plane: [f32; 4],
    pub layer: ObjectLayer,
    /// Mass used when pushing dynamic bodies
    pub mass: f32,
    /// Maximum force the character can push with
    pub max_strength: f32,
}

impl Default for CharacterDef {
    fn default() -> Self {
        Self {
            shape: ShapeDesc::capsule(0.9, 0.3),
            up: [0.0, 1.0, 0.0],
            max_slope_angle: 50.0_f32.to_radians(),
            padding: 0.02,
            penetration_recovery_speed: 1.0,
            predictive_contact_distance: 0.1,
            supporting_plane: [0.0, 1.0, 0.0, -1.0e10],
            layer: ObjectLayer::MOVING,
            mass: 70.0,
            max_strength: 100.0,
        }
    }
}

impl CharacterDef {
    pub fn new(shape: ShapeDesc) -> Self {
        Self {
            shape,
            ..Default::default()
        }
    }

    pub fn with_layer(mut self, layer: ObjectLayer) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_max_slope_angle(mut self, radians: f32) -> Self {
        self.max_slope_angle = radians;
        self
    }

    pub fn with_up(mut self, up: Vec3) -> Self {
        self.up = up.to_array();
        self
    }

    pub fn with_supporting_plane(mut self, normal: Vec3, constant: f32) -> Self {
        self.supporting_plane = [normal.x, normal.y, normal.z, constant];
        self
    }

    pub fn with_mass(mut self, mass: f32, max_strength: f32) -> Self {
        self.mass = mass;
        self.max_strength = max_strength;
        self
    }

    fn up_vector(&self) -> Vec3 {
        Vec3::from_array(self.up).try_normalize().unwrap_or(Vec3::Y)
    }
}

/// How the character is standing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroundState {
    /// On walkable ground
    Grounded,
    /// On ground too steep to stand on
    Sliding,
    /// Touching something that can't support it
    NotSupported,
    /// In the air
    #[default]
    NotGrounded,
}

/// Ground the character stands on, engine space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GroundInfo {
    pub state: GroundState,
    pub normal: Vec3,
    pub position: Vec3,
    pub velocity: Vec3,
    pub body: Option<BodyId>,
    pub entity: Option<Entity>,
}

/// A contact between the character and a body, engine space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacterContact {
    pub body: Option<BodyId>,
    pub entity: Option<Entity>,
    /// Contact point on the other body
    pub position: Vec3,
    /// Surface normal pointing towards the character
    pub normal: Vec3,
    /// Separation; negative when penetrating
    pub distance: f32,
    /// Velocity of the other body at the contact point
    pub body_velocity: Vec3,
    /// Whether the other body is simulated
    pub dynamic: bool,
    pub(crate) collider: rapier::ColliderHandle,
}

/// Per-contact behaviour a delegate can change in `on_contact_added`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactSettings {
    /// The contact blocks the character
    pub can_push_character: bool,
    /// The character applies push impulses to the body
    pub can_receive_impulses: bool,
}

impl Default for ContactSettings {
    fn default() -> Self {
        Self {
            can_push_character: true,
            can_receive_impulses: true,
        }
    }
}

/// Receives character contact callbacks.
///
/// Errors are collected and returned from [`CharacterController::update`]
/// after the update has been applied.
pub trait CharacterContactDelegate: Send + Sync {
    /// Adjust the velocity the character sees for a body, e.g. a conveyor
    fn on_adjust_body_velocity(
        &mut self,
        _body: BodyId,
        _linear: &mut Vec3,
        _angular: &mut Vec3,
    ) -> DelegateResult<()> {
        Ok(())
    }

    /// Return false to let the character pass through
    fn on_contact_validate(&mut self, _contact: &CharacterContact) -> DelegateResult<bool> {
        Ok(true)
    }

    /// A contact that wasn't there last update
    fn on_contact_added(
        &mut self,
        _contact: &CharacterContact,
        _settings: &mut ContactSettings,
    ) -> DelegateResult<()> {
        Ok(())
    }

    /// Adjust the character velocity for a contact
    fn on_contact_solve(&mut self, _contact: &CharacterContact, _velocity: &mut Vec3) -> DelegateResult<()> {
        Ok(())
    }
}

/// Delegate slot: owned by the controller or shared with other code
pub enum ContactDelegate {
    Owned(Box<dyn CharacterContactDelegate>),
    Shared(Arc<Mutex<dyn CharacterContactDelegate>>),
}

impl ContactDelegate {
    fn with<R>(&mut self, f: impl FnOnce(&mut dyn CharacterContactDelegate) -> R) -> R {
        match self {
            Self::Owned(delegate) => f(delegate.as_mut()),
            Self::Shared(delegate) => f(&mut *delegate.lock()),
        }
    }
}

fn collect<T>(errors: &mut Vec<String>, result: DelegateResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            errors.push(e.to_string());
            None
        }
    }
}

// ==================== Native record ====================

/// Character state stored in the physics world
pub(crate) struct NativeCharacter {
    def: CharacterDef,
    shape: rapier::SharedShape,
    scale: Vec3,
    position: na::Isometry3<f32>,
    velocity: na::Vector3<f32>,
    controller: KinematicCharacterController,
    ground: GroundInfo,
    contacts: Vec<CharacterContact>,
    settings: HashMap<rapier::ColliderHandle, ContactSettings>,
}

impl NativeCharacter {
    fn new(def: &CharacterDef, shape: rapier::SharedShape, pose: &PhysicsTransform) -> Self {
        let up = to_native_vec3(def.up_vector());
        let controller = KinematicCharacterController {
            up: na::Unit::try_new(up, 1.0e-6).unwrap_or_else(na::Vector3::y_axis),
            offset: CharacterLength::Absolute(def.padding),
            slide: true,
            autostep: None,
            max_slope_climb_angle: def.max_slope_angle,
            min_slope_slide_angle: def.max_slope_angle,
            snap_to_ground: Some(CharacterLength::Absolute(def.predictive_contact_distance)),
            ..Default::default()
        };
        Self {
            def: def.clone(),
            shape,
            scale: pose.scale,
            position: pose.isometry(),
            velocity: na::Vector3::zeros(),
            controller,
            ground: GroundInfo::default(),
            contacts: Vec::new(),
            settings: HashMap::new(),
        }
    }

    fn up(&self) -> Vec3 {
        self.def.up_vector()
    }

    fn prediction(&self) -> f32 {
        self.def.padding + self.def.predictive_contact_distance
    }

    fn engine_position(&self) -> Vec3 {
        from_native_vec3(&self.position.translation.vector)
    }

    fn engine_rotation(&self) -> Quat {
        from_native_quat(&self.position.rotation)
    }

    fn is_supporting(&self, point: Vec3) -> bool {
        let plane = Vec4::from_array(self.def.supporting_plane);
        let local = self.engine_rotation().inverse() * (point - self.engine_position());
        plane.truncate().dot(local) + plane.w < 0.0
    }

    /// Whether the character may collide with a collider at all
    fn allows(
        &self,
        ctx: &CharacterContext<'_>,
        collider: &rapier::Collider,
        coupled: Option<BodyId>,
        rejected: &HashSet<rapier::ColliderHandle>,
        handle: rapier::ColliderHandle,
    ) -> bool {
        if collider.is_sensor() || rejected.contains(&handle) {
            return false;
        }
        if coupled.is_some() && collider.parent() == coupled.map(|b| b.0) {
            return false;
        }
        let other = ColliderTag::from_user_data(collider.user_data).layer;
        ctx.hooks.filter.should_collide(self.def.layer, other)
    }

    /// Contacts within `prediction` of the shape at its current pose
    fn probe(
        &self,
        ctx: &CharacterContext<'_>,
        prediction: f32,
        coupled: Option<BodyId>,
        rejected: &HashSet<rapier::ColliderHandle>,
    ) -> Vec<CharacterContact> {
        let aabb = self.shape.compute_aabb(&self.position).loosened(prediction);
        let mut handles = Vec::new();
        ctx.query_pipeline
            .colliders_with_aabb_intersecting_aabb(&aabb, |handle| {
                handles.push(*handle);
                true
            });
        handles.sort_by_key(|h| h.into_raw_parts());

        handles
            .into_iter()
            .filter_map(|handle| {
                let collider = ctx.colliders.get(handle)?;
                if !self.allows(ctx, collider, coupled, rejected, handle) {
                    return None;
                }
                let contact = query::contact(
                    &self.position,
                    &*self.shape,
                    collider.position(),
                    collider.shape(),
                    prediction,
                )
                .ok()
                .flatten()?;
                let parent = collider.parent().and_then(|h| ctx.bodies.get(h).map(|b| (h, b)));
                let tag = ColliderTag::from_user_data(collider.user_data);
                Some(CharacterContact {
                    body: parent.map(|(h, _)| BodyId(h)),
                    entity: tag.entity(),
                    position: from_native_point(&contact.point2),
                    normal: from_native_vec3(&contact.normal2),
                    distance: contact.dist,
                    body_velocity: parent
                        .map(|(_, b)| from_native_vec3(&b.velocity_at_point(&contact.point2)))
                        .unwrap_or(Vec3::ZERO),
                    dynamic: parent.is_some_and(|(_, b)| b.is_dynamic()),
                    collider: handle,
                })
            })
            .collect()
    }

    fn sync_from_body(&mut self, bodies: &rapier::RigidBodySet, body: BodyId) -> Result<()> {
        let body = bodies.get(body.0).ok_or(PhysicsError::BodyNotFound)?;
        self.position = *body.position();
        self.velocity = *body.linvel();
        Ok(())
    }

    /// Gravity along up; cancelled while standing on walkable ground
    fn apply_gravity(&mut self, gravity: Vec3, delta_time: f32) {
        let up = self.up();
        let mut velocity = from_native_vec3(&self.velocity);
        let vertical = velocity.dot(up);
        if self.ground.state == GroundState::Grounded && vertical <= 0.0 {
            velocity -= up * vertical;
        } else {
            velocity += up * gravity.dot(up) * delta_time;
        }
        self.velocity = to_native_vec3(velocity);
    }

    /// Velocity along the ground the character rides with, e.g. a
    /// conveyor or a moving platform
    fn ground_carry(&self, adjusted: &HashMap<BodyId, Vec3>) -> Vec3 {
        if !matches!(self.ground.state, GroundState::Grounded | GroundState::Sliding) {
            return Vec3::ZERO;
        }
        let velocity = self
            .ground
            .body
            .and_then(|b| adjusted.get(&b).copied())
            .unwrap_or(self.ground.velocity);
        let up = self.up();
        velocity - up * velocity.dot(up)
    }

    /// Sweep-and-slide along the desired translation plus the ground carry
    fn sweep(
        &mut self,
        ctx: &CharacterContext<'_>,
        delta_time: f32,
        carry: Vec3,
        coupled: Option<BodyId>,
        rejected: &HashSet<rapier::ColliderHandle>,
    ) {
        let desired = (self.velocity + to_native_vec3(carry)) * delta_time;
        let predicate = |handle: rapier::ColliderHandle, collider: &rapier::Collider| {
            self.allows(ctx, collider, coupled, rejected, handle)
        };
        let mut filter = rapier::QueryFilter::default()
            .exclude_sensors()
            .groups(ctx.layers.interaction_groups(self.def.layer))
            .predicate(&predicate);
        if let Some(body) = coupled {
            filter = filter.exclude_rigid_body(body.0);
        }
        let movement = self.controller.move_shape(
            delta_time,
            &*ctx.bodies,
            ctx.colliders,
            ctx.query_pipeline,
            &*self.shape,
            &self.position,
            desired,
            filter,
            |_| {},
        );
        self.position.translation.vector += movement.translation;
    }

    /// Push out of penetrating contacts by the recovery fraction
    fn recover(&mut self, contacts: &[CharacterContact]) {
        let speed = self.def.penetration_recovery_speed.clamp(0.0, 1.0);
        let correction: Vec3 = contacts
            .iter()
            .filter(|c| c.distance < 0.0 && self.settings_for(c.collider).can_push_character)
            .map(|c| c.normal * (-c.distance * speed))
            .sum();
        if correction != Vec3::ZERO {
            self.position.translation.vector += to_native_vec3(correction);
        }
    }

    fn settings_for(&self, collider: rapier::ColliderHandle) -> ContactSettings {
        self.settings.get(&collider).copied().unwrap_or_default()
    }

    fn refresh_ground(&mut self, adjusted: &HashMap<BodyId, Vec3>) {
        let up = self.up();
        let supporting = self
            .contacts
            .iter()
            .filter(|c| self.is_supporting(c.position))
            .max_by(|a, b| a.normal.dot(up).total_cmp(&b.normal.dot(up)));

        self.ground = match supporting {
            Some(contact) => {
                let slope = contact.normal.dot(up).clamp(-1.0, 1.0).acos();
                GroundInfo {
                    state: if slope <= self.def.max_slope_angle {
                        GroundState::Grounded
                    } else {
                        GroundState::Sliding
                    },
                    normal: contact.normal,
                    position: contact.position,
                    velocity: contact
                        .body
                        .and_then(|b| adjusted.get(&b).copied())
                        .unwrap_or(contact.body_velocity),
                    body: contact.body,
                    entity: contact.entity,
                }
            }
            None if !self.contacts.is_empty() => GroundInfo {
                state: GroundState::NotSupported,
                ..Default::default()
            },
            None => GroundInfo::default(),
        };
    }

    /// Push dynamic bodies the character walks into
    fn push_bodies(&self, bodies: &mut rapier::RigidBodySet, adjusted: &HashMap<BodyId, Vec3>, delta_time: f32) {
        let velocity = from_native_vec3(&self.velocity);
        for contact in &self.contacts {
            let Some(body) = contact.body.filter(|_| contact.dynamic) else {
                continue;
            };
            if !self.settings_for(contact.collider).can_receive_impulses {
                continue;
            }
            let body_velocity = adjusted.get(&body).copied().unwrap_or(contact.body_velocity);
            let approach = (velocity - body_velocity).dot(-contact.normal);
            if approach <= 0.0 {
                continue;
            }
            let magnitude = (self.def.mass * approach).min(self.def.max_strength * delta_time);
            if let Some(native) = bodies.get_mut(body.0) {
                native.apply_impulse_at_point(
                    to_native_vec3(-contact.normal * magnitude),
                    to_native_point(contact.position),
                    true,
                );
            }
        }
    }
}

// ==================== Component ====================

/// Virtual character component
pub struct CharacterController {
    def: CharacterDef,
    world: Option<WorldRef>,
    handle: Option<CharacterHandle>,
    delegate: Option<ContactDelegate>,
    released: bool,
}

impl std::fmt::Debug for CharacterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacterController")
            .field("def", &self.def)
            .field("handle", &self.handle)
            .field("has_delegate", &self.delegate.is_some())
            .finish()
    }
}

impl CharacterController {
    pub fn new(def: CharacterDef) -> Self {
        Self {
            def,
            world: None,
            handle: None,
            delegate: None,
            released: false,
        }
    }

    pub fn with_delegate(mut self, delegate: Box<dyn CharacterContactDelegate>) -> Self {
        self.delegate = Some(ContactDelegate::Owned(delegate));
        self
    }

    pub fn with_shared_delegate(mut self, delegate: Arc<Mutex<dyn CharacterContactDelegate>>) -> Self {
        self.delegate = Some(ContactDelegate::Shared(delegate));
        self
    }

    pub fn set_delegate(&mut self, delegate: Option<ContactDelegate>) {
        self.delegate = delegate;
    }

    pub fn has_delegate(&self) -> bool {
        self.delegate.is_some()
    }

    /// Bind to a driver. The native character is still created lazily.
    pub fn init(&mut self, system: &PhysicsSystem) -> Result<()> {
        self.bind(system.world_ref()?);
        Ok(())
    }

    pub(crate) fn bind(&mut self, world: WorldRef) {
        if self.handle.is_none() {
            self.world = Some(world);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.world.is_some()
    }

    pub fn is_created(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<CharacterHandle> {
        self.handle
    }

    pub fn definition(&self) -> &CharacterDef {
        &self.def
    }

    fn upgrade(&self) -> Result<Arc<Mutex<PhysicsWorld>>> {
        self.world
            .as_ref()
            .ok_or(PhysicsError::MissingDependency("physics system"))?
            .upgrade()
            .ok_or(PhysicsError::MissingDependency("physics world"))
    }

    // ==================== Lifecycle ====================

    /// Create the native character if needed, then move it.
    ///
    /// `body` is the entity's rigid body, if it has one. A created body
    /// couples the character to it and the update is reduced to a contact
    /// refresh: the character mirrors the body's pose and velocity, skips
    /// the sweep, ignores its own body when gathering contacts and leaves
    /// the entity transform to the body.
    pub fn update(
        &mut self,
        transform: &mut EntityTransform,
        body: Option<&PhysicsBody>,
        delta_time: f32,
    ) -> Result<()> {
        if self.released {
            return Ok(());
        }
        let world = self.upgrade()?;
        let coupled = body.and_then(PhysicsBody::body_id);
        let handle = match self.handle {
            Some(handle) => handle,
            None => self.create(&world, transform, coupled)?,
        };
        let mut errors = Vec::new();

        // Sync with the body, integrate gravity and collect contact
        // candidates for validation.
        let candidates = {
            let mut world = world.lock();
            world.refresh_queries();
            let (ctx, character) = world
                .character_context(handle)
                .ok_or(PhysicsError::CharacterNotFound)?;
            match coupled {
                Some(id) => character.sync_from_body(&*ctx.bodies, id)?,
                None => character.apply_gravity(from_native_vec3(&ctx.gravity), delta_time),
            }
            if self.delegate.is_some() {
                let reach = character.prediction() + character.velocity.norm() * delta_time;
                character.probe(&ctx, reach, coupled, &HashSet::new())
            } else {
                Vec::new()
            }
        };

        let mut rejected = HashSet::new();
        let mut adjusted = HashMap::new();
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.with(|d| {
                for contact in &candidates {
                    if let Some(body) = contact.body {
                        if let std::collections::hash_map::Entry::Vacant(entry) = adjusted.entry(body) {
                            if let Some(velocity) = adjust_velocity(&world, d, body, contact, &mut errors) {
                                entry.insert(velocity);
                            }
                        }
                    }
                    if collect(&mut errors, d.on_contact_validate(contact)) == Some(false) {
                        rejected.insert(contact.collider);
                    }
                }
            });
        }

        // Sweep, resolve penetration, refresh contacts and ground.
        let (contacts, added, mut velocity) = {
            let mut world = world.lock();
            let (ctx, character) = world
                .character_context(handle)
                .ok_or(PhysicsError::CharacterNotFound)?;
            let start = character.position.translation.vector;
            let carry = character.ground_carry(&adjusted);
            if coupled.is_none() && delta_time > 0.0 {
                character.sweep(&ctx, delta_time, carry, coupled, &rejected);
            }
            let prediction = character.prediction();
            let contacts = character.probe(&ctx, prediction, coupled, &rejected);
            character.recover(&contacts);
            if coupled.is_none() && delta_time > 0.0 {
                character.velocity =
                    (character.position.translation.vector - start) / delta_time - to_native_vec3(carry);
            }

            let previous: HashSet<_> = character.contacts.iter().map(|c| c.collider).collect();
            let added: Vec<bool> = contacts.iter().map(|c| !previous.contains(&c.collider)).collect();
            character.settings.retain(|h, _| contacts.iter().any(|c| c.collider == *h));
            character.contacts = contacts.clone();
            character.refresh_ground(&adjusted);
            (contacts, added, from_native_vec3(&character.velocity))
        };

        let mut settings = HashMap::new();
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.with(|d| {
                for (contact, is_new) in contacts.iter().zip(&added) {
                    if *is_new {
                        let mut s = ContactSettings::default();
                        collect(&mut errors, d.on_contact_added(contact, &mut s));
                        settings.insert(contact.collider, s);
                    }
                    collect(&mut errors, d.on_contact_solve(contact, &mut velocity));
                }
            });
        }

        // Commit.
        {
            let mut world = world.lock();
            let (ctx, character) = world
                .character_context(handle)
                .ok_or(PhysicsError::CharacterNotFound)?;
            character.settings.extend(settings);
            if coupled.is_none() {
                character.velocity = to_native_vec3(velocity);
                character.push_bodies(ctx.bodies, &adjusted, delta_time);
                let pose = PhysicsTransform::from_isometry(&character.position, character.scale);
                transform.set_world_matrix(pose.to_engine_matrix());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            log::warn!("Character delegate reported {} error(s)", errors.len());
            Err(PhysicsError::Delegate(errors))
        }
    }

    fn create(
        &mut self,
        world: &Arc<Mutex<PhysicsWorld>>,
        transform: &EntityTransform,
        coupled: Option<BodyId>,
    ) -> Result<CharacterHandle> {
        let pose = convert_transform(&transform.world_matrix())?;
        if !self.def.shape.supports_motion() {
            return Err(PhysicsError::ShapeConversion(format!(
                "a {} cannot back a character",
                self.def.shape.kind()
            )));
        }
        let mut world = world.lock();
        let shape = convert_shape(&self.def.shape, pose.scale, &world.shape_settings())?;
        let mut native = NativeCharacter::new(&self.def, shape.shape, &pose);
        if let Some(id) = coupled {
            let bodies = world.bodies();
            native.sync_from_body(bodies, id)?;
        }
        let handle = world.insert_character(native);
        self.handle = Some(handle);
        log::debug!("Created character {:?} for {:?}", handle, transform.entity);
        Ok(handle)
    }

    /// Destroy the native character. Idempotent.
    pub fn release(&mut self) {
        self.released = true;
        self.remove_native();
    }

    /// Remove the native character and forget the world. The component is
    /// recreated lazily once bound to a new world.
    pub(crate) fn detach(&mut self) {
        if !self.released {
            self.remove_native();
        }
        self.world = None;
    }

    fn remove_native(&mut self) {
        if let (Some(handle), Ok(world)) = (self.handle.take(), self.upgrade()) {
            world.lock().remove_character(handle);
            log::debug!("Released character {:?}", handle);
        }
    }

    // ==================== Native access ====================

    fn with_native<R>(&self, f: impl FnOnce(&NativeCharacter) -> R) -> Option<R> {
        let handle = self.handle?;
        let world = self.world.as_ref()?.upgrade()?;
        let world = world.lock();
        world.character(handle).map(f)
    }

    fn with_native_mut(&self, f: impl FnOnce(&mut NativeCharacter)) {
        let Some(handle) = self.handle else {
            return;
        };
        let Some(world) = self.world.as_ref().and_then(|w| w.upgrade()) else {
            return;
        };
        let mut world = world.lock();
        if let Some(character) = world.character_mut(handle) {
            f(character);
        }
    }

    pub fn position(&self) -> Vec3 {
        self.with_native(NativeCharacter::engine_position)
            .unwrap_or(Vec3::ZERO)
    }

    pub fn rotation(&self) -> Quat {
        self.with_native(NativeCharacter::engine_rotation)
            .unwrap_or(Quat::IDENTITY)
    }

    pub fn linear_velocity(&self) -> Vec3 {
        self.with_native(|c| from_native_vec3(&c.velocity))
            .unwrap_or(Vec3::ZERO)
    }

    pub fn set_position(&self, position: Vec3) {
        self.with_native_mut(|c| c.position.translation.vector = to_native_vec3(position));
    }

    pub fn set_rotation(&self, rotation: Quat) {
        self.with_native_mut(|c| c.position.rotation = to_native_isometry(Vec3::ZERO, rotation).rotation);
    }

    pub fn set_linear_velocity(&self, velocity: Vec3) {
        self.with_native_mut(|c| c.velocity = to_native_vec3(velocity));
    }

    pub fn set_max_slope_angle(&mut self, radians: f32) {
        self.def.max_slope_angle = radians;
        self.with_native_mut(|c| {
            c.def.max_slope_angle = radians;
            c.controller.max_slope_climb_angle = radians;
            c.controller.min_slope_slide_angle = radians;
        });
    }

    pub fn set_penetration_recovery_speed(&mut self, speed: f32) {
        self.def.penetration_recovery_speed = speed;
        self.with_native_mut(|c| c.def.penetration_recovery_speed = speed);
    }

    pub fn set_max_strength(&mut self, max_strength: f32) {
        self.def.max_strength = max_strength;
        self.with_native_mut(|c| c.def.max_strength = max_strength);
    }

    // ==================== Ground ====================

    pub fn ground(&self) -> GroundInfo {
        self.with_native(|c| c.ground).unwrap_or_default()
    }

    pub fn ground_state(&self) -> GroundState {
        self.ground().state
    }

    pub fn ground_normal(&self) -> Vec3 {
        self.ground().normal
    }

    pub fn ground_position(&self) -> Vec3 {
        self.ground().position
    }

    pub fn ground_velocity(&self) -> Vec3 {
        self.ground().velocity
    }

    pub fn ground_body(&self) -> Option<BodyId> {
        self.ground().body
    }

    /// Standing on something, walkable or not
    pub fn is_supported(&self) -> bool {
        matches!(self.ground_state(), GroundState::Grounded | GroundState::Sliding)
    }

    /// Contacts found by the last update
    pub fn active_contacts(&self) -> Vec<CharacterContact> {
        self.with_native(|c| c.contacts.clone()).unwrap_or_default()
    }
}

impl Drop for CharacterController {
    fn drop(&mut self) {
        self.release();
    }
}

/// Ask the delegate for a body's effective velocity at a contact
fn adjust_velocity(
    world: &Arc<Mutex<PhysicsWorld>>,
    delegate: &mut dyn CharacterContactDelegate,
    body: BodyId,
    contact: &CharacterContact,
    errors: &mut Vec<String>,
) -> Option<Vec3> {
    let (mut linear, mut angular, center) = {
        let world = world.lock();
        let native = world.body(body)?;
        (
            from_native_vec3(native.linvel()),
            from_native_angular(native.angvel()),
            from_native_point(native.center_of_mass()),
        )
    };
    collect(errors, delegate.on_adjust_body_velocity(body, &mut linear, &mut angular))?;
    Some(linear + angular.cross(contact.position - center))
}
