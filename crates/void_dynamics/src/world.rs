//! Native simulation world
//!
//! Owns every Rapier set and pipeline. The driver keeps it behind an
//! `Arc<Mutex<_>>`; bodies and characters only hold a [`WorldRef`] and an
//! id into it.

use crate::character::NativeCharacter;
use crate::config::PhysicsConfig;
use crate::convert::{from_native_vec3, to_native_vec3, Bounds};
use crate::error::{CapacityKind, PhysicsError, Result};
use crate::events::{ColliderPair, ContactEventSink, RawContact, RawContactKind, RawContactQueue};
use crate::layers::{LayerMask, LayerPairHooks, ObjectLayer};
use crate::query::PhysicsQuery;
use crate::shape::ShapeSettings;
use glam::Vec3;
use hecs::Entity;
use parking_lot::Mutex;
use rapier3d::parry::bounding_volume::BoundingVolume;
use rapier3d::prelude as rapier;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

/// Shared ownership of the native world, held by the driver
pub type SharedWorld = Arc<Mutex<PhysicsWorld>>;

/// Non-owning reference bodies and characters keep into the native world
pub type WorldRef = Weak<Mutex<PhysicsWorld>>;

/// Stable id of a native body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyId(pub(crate) rapier::RigidBodyHandle);

impl BodyId {
    /// The underlying Rapier handle
    pub fn raw(&self) -> rapier::RigidBodyHandle {
        self.0
    }
}

impl PartialOrd for BodyId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BodyId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.into_raw_parts().cmp(&other.0.into_raw_parts())
    }
}

/// Entity and object layer packed into Rapier `user_data`.
///
/// Low 64 bits hold the entity bits (0 = no entity), the next 16 the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColliderTag {
    pub entity_bits: u64,
    pub layer: ObjectLayer,
}

impl ColliderTag {
    pub fn new(entity: Option<Entity>, layer: ObjectLayer) -> Self {
        Self {
            entity_bits: entity.map_or(0, |e| e.to_bits().get()),
            layer,
        }
    }

    pub fn entity(&self) -> Option<Entity> {
        Entity::from_bits(self.entity_bits)
    }

    pub fn to_user_data(self) -> u128 {
        (u128::from(self.layer.0) << 64) | u128::from(self.entity_bits)
    }

    pub fn from_user_data(data: u128) -> Self {
        Self {
            entity_bits: data as u64,
            layer: ObjectLayer((data >> 64) as u16),
        }
    }
}

/// Generational handle to a native character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacterHandle {
    index: u32,
    generation: u32,
}

struct CharacterSlot {
    generation: u32,
    character: Option<NativeCharacter>,
}

/// Per-step counters, refreshed by the capacity check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldStats {
    pub bodies: usize,
    pub active_bodies: usize,
    pub colliders: usize,
    pub body_pairs: usize,
    pub contact_constraints: usize,
    pub characters: usize,
}

/// The native simulation world
pub struct PhysicsWorld {
    config: PhysicsConfig,
    gravity: rapier::Vector<f32>,
    integration_params: rapier::IntegrationParameters,
    pipeline: rapier::PhysicsPipeline,
    islands: rapier::IslandManager,
    broad_phase: rapier::DefaultBroadPhase,
    narrow_phase: rapier::NarrowPhase,
    impulse_joints: rapier::ImpulseJointSet,
    multibody_joints: rapier::MultibodyJointSet,
    ccd_solver: rapier::CCDSolver,
    query_pipeline: rapier::QueryPipeline,
    query_dirty: bool,
    bodies: rapier::RigidBodySet,
    colliders: rapier::ColliderSet,
    hooks: LayerPairHooks,
    characters: Vec<CharacterSlot>,
    free_characters: Vec<u32>,
    stats: WorldStats,
}

impl PhysicsWorld {
    /// Create a world with the configured limits and layer filters
    pub fn new(config: &PhysicsConfig) -> Result<Self> {
        config.validate()?;

        let mut integration_params = rapier::IntegrationParameters::default();
        integration_params.dt = config.fixed_step / config.collision_steps as f32;
        integration_params.num_solver_iterations =
            NonZeroUsize::new(config.velocity_iterations).unwrap_or(NonZeroUsize::MIN);

        log::debug!(
            "Creating physics world: {} bodies, {} pairs, {} constraints, {} layers",
            config.max_bodies,
            config.max_body_pairs,
            config.max_contact_constraints,
            config.layers.layer_count()
        );

        Ok(Self {
            gravity: to_native_vec3(Vec3::from_array(config.gravity)),
            integration_params,
            pipeline: rapier::PhysicsPipeline::new(),
            islands: rapier::IslandManager::new(),
            broad_phase: rapier::DefaultBroadPhase::new(),
            narrow_phase: rapier::NarrowPhase::new(),
            impulse_joints: rapier::ImpulseJointSet::new(),
            multibody_joints: rapier::MultibodyJointSet::new(),
            ccd_solver: rapier::CCDSolver::new(),
            query_pipeline: rapier::QueryPipeline::new(),
            query_dirty: false,
            bodies: rapier::RigidBodySet::new(),
            colliders: rapier::ColliderSet::new(),
            hooks: LayerPairHooks {
                filter: config.layers.pair_filter(),
            },
            characters: Vec::new(),
            free_characters: Vec::new(),
            stats: WorldStats::default(),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub(crate) fn shape_settings(&self) -> ShapeSettings {
        ShapeSettings {
            plane_half_extent: self.config.default_plane_half_extent,
            plane_thickness: self.config.default_plane_thickness,
        }
    }

    /// Gravity in engine space
    pub fn gravity(&self) -> Vec3 {
        from_native_vec3(&self.gravity)
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = to_native_vec3(gravity);
    }

    // ==================== Bodies ====================

    /// Insert a body with its single collider, tagged with entity and layer
    pub(crate) fn insert_body(
        &mut self,
        body: rapier::RigidBodyBuilder,
        collider: rapier::ColliderBuilder,
        tag: ColliderTag,
    ) -> Result<BodyId> {
        if self.bodies.len() >= self.config.max_bodies {
            return Err(PhysicsError::CapacityExceeded {
                kind: CapacityKind::Bodies,
                limit: self.config.max_bodies,
                actual: self.bodies.len() + 1,
            });
        }
        if !self.config.layers.contains(tag.layer) {
            return Err(PhysicsError::InvalidConfig(format!(
                "object layer {} is not in the layer table",
                tag.layer.0
            )));
        }

        let user_data = tag.to_user_data();
        let body = body
            .user_data(user_data)
            .can_sleep(self.config.sleeping_enabled);
        let handle = self.bodies.insert(body);
        let collider = collider
            .user_data(user_data)
            .collision_groups(self.config.layers.interaction_groups(tag.layer))
            .active_events(rapier::ActiveEvents::COLLISION_EVENTS)
            .active_hooks(
                rapier::ActiveHooks::FILTER_CONTACT_PAIRS | rapier::ActiveHooks::FILTER_INTERSECTION_PAIR,
            );
        self.colliders
            .insert_with_parent(collider, handle, &mut self.bodies);
        self.query_dirty = true;
        Ok(BodyId(handle))
    }

    /// Remove a body and its colliders. Returns false if it was already gone.
    pub fn remove_body(&mut self, id: BodyId) -> bool {
        let removed = self
            .bodies
            .remove(
                id.0,
                &mut self.islands,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            )
            .is_some();
        self.query_dirty |= removed;
        removed
    }

    pub fn contains_body(&self, id: BodyId) -> bool {
        self.bodies.contains(id.0)
    }

    pub fn body(&self, id: BodyId) -> Option<&rapier::RigidBody> {
        self.bodies.get(id.0)
    }

    /// Mutable body access; marks the query structure stale
    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut rapier::RigidBody> {
        self.query_dirty = true;
        self.bodies.get_mut(id.0)
    }

    /// The collider attached to a body
    pub fn body_collider(&self, id: BodyId) -> Option<&rapier::Collider> {
        let body = self.bodies.get(id.0)?;
        body.colliders().first().and_then(|h| self.colliders.get(*h))
    }

    /// Entity that owns a body
    pub fn entity_for_body(&self, id: BodyId) -> Option<Entity> {
        self.bodies
            .get(id.0)
            .and_then(|b| ColliderTag::from_user_data(b.user_data).entity())
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Wake every sleeping body whose collider overlaps `bounds` and whose
    /// layer is in `mask`. Returns how many were woken.
    pub fn activate_bodies(&mut self, bounds: Bounds, mask: LayerMask) -> usize {
        let aabb = bounds.to_native();
        let targets: Vec<rapier::RigidBodyHandle> = self
            .colliders
            .iter()
            .filter(|(_, c)| mask.contains(ColliderTag::from_user_data(c.user_data).layer))
            .filter(|(_, c)| c.compute_aabb().intersects(&aabb))
            .filter_map(|(_, c)| c.parent())
            .collect();

        let mut woken = 0;
        for handle in targets {
            if let Some(body) = self.bodies.get_mut(handle) {
                if body.is_dynamic() && body.is_sleeping() {
                    body.wake_up(true);
                    woken += 1;
                }
            }
        }
        woken
    }

    // ==================== Characters ====================

    pub(crate) fn insert_character(&mut self, character: NativeCharacter) -> CharacterHandle {
        if let Some(index) = self.free_characters.pop() {
            let slot = &mut self.characters[index as usize];
            slot.character = Some(character);
            return CharacterHandle {
                index,
                generation: slot.generation,
            };
        }
        self.characters.push(CharacterSlot {
            generation: 0,
            character: Some(character),
        });
        CharacterHandle {
            index: (self.characters.len() - 1) as u32,
            generation: 0,
        }
    }

    pub(crate) fn remove_character(&mut self, handle: CharacterHandle) -> bool {
        match self.characters.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.character.is_some() => {
                slot.character = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free_characters.push(handle.index);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn character(&self, handle: CharacterHandle) -> Option<&NativeCharacter> {
        self.characters
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.character.as_ref())
    }

    pub(crate) fn character_mut(&mut self, handle: CharacterHandle) -> Option<&mut NativeCharacter> {
        self.characters
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.character.as_mut())
    }

    pub fn character_count(&self) -> usize {
        self.characters.iter().filter(|s| s.character.is_some()).count()
    }

    // ==================== Simulation ====================

    /// Advance one fixed step, split into `collision_steps` native steps.
    /// Contact reports go to `queue`; returns the pairs that started.
    pub(crate) fn step(&mut self, queue: &RawContactQueue) -> HashSet<ColliderPair> {
        let sink = ContactEventSink::new(Arc::clone(queue));
        for _ in 0..self.config.collision_steps {
            self.pipeline.step(
                &self.gravity,
                &self.integration_params,
                &mut self.islands,
                &mut self.broad_phase,
                &mut self.narrow_phase,
                &mut self.bodies,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                &mut self.ccd_solver,
                None,
                &self.hooks,
                &sink,
            );
        }
        self.query_dirty = true;
        sink.into_started()
    }

    /// Report every pair still touching that didn't start this step
    pub(crate) fn queue_persisted(&self, started: &HashSet<ColliderPair>, queue: &RawContactQueue) {
        let mut raw = Vec::new();
        for pair in self.narrow_phase.contact_pairs() {
            if !pair.has_any_active_contact || started.contains(&ColliderPair::new(pair.collider1, pair.collider2)) {
                continue;
            }
            raw.push(RawContact::new(
                RawContactKind::Persisted,
                &self.colliders,
                pair.collider1,
                pair.collider2,
                Some(pair),
            ));
        }
        for (h1, h2, intersecting) in self.narrow_phase.intersection_pairs() {
            if intersecting && !started.contains(&ColliderPair::new(h1, h2)) {
                raw.push(RawContact::new(RawContactKind::Persisted, &self.colliders, h1, h2, None));
            }
        }
        if !raw.is_empty() {
            queue.lock().extend(raw);
        }
    }

    /// Compare the world against its capacity limits and refresh stats
    pub(crate) fn check_capacity(&mut self) -> Result<()> {
        let mut body_pairs = 0;
        let mut contact_constraints = 0;
        for pair in self.narrow_phase.contact_pairs() {
            body_pairs += 1;
            if pair.has_any_active_contact {
                contact_constraints += pair.manifolds.iter().filter(|m| !m.points.is_empty()).count();
            }
        }
        body_pairs += self.narrow_phase.intersection_pairs().count();

        self.stats = WorldStats {
            bodies: self.bodies.len(),
            active_bodies: self.islands.active_dynamic_bodies().len(),
            colliders: self.colliders.len(),
            body_pairs,
            contact_constraints,
            characters: self.character_count(),
        };

        let limits = [
            (CapacityKind::Bodies, self.config.max_bodies, self.stats.bodies),
            (CapacityKind::BodyPairs, self.config.max_body_pairs, body_pairs),
            (
                CapacityKind::ContactConstraints,
                self.config.max_contact_constraints,
                contact_constraints,
            ),
        ];
        for (kind, limit, actual) in limits {
            if actual > limit {
                return Err(PhysicsError::CapacityExceeded { kind, limit, actual });
            }
        }
        Ok(())
    }

    /// Bring the query structure in line with moved/added/removed colliders
    pub fn refresh_queries(&mut self) {
        if self.query_dirty {
            self.query_pipeline.update(&self.colliders);
            self.query_dirty = false;
        }
    }

    pub fn stats(&self) -> WorldStats {
        self.stats
    }

    /// Query view; results reflect the last [`refresh_queries`](Self::refresh_queries)
    pub fn queries(&self) -> PhysicsQuery<'_> {
        PhysicsQuery {
            query_pipeline: &self.query_pipeline,
            colliders: &self.colliders,
            bodies: &self.bodies,
            shape_settings: self.shape_settings(),
        }
    }

    // ==================== Internals ====================

    pub(crate) fn bodies(&self) -> &rapier::RigidBodySet {
        &self.bodies
    }

    /// Split borrow for character sweeps: read-only sets plus one character
    pub(crate) fn character_context(
        &mut self,
        handle: CharacterHandle,
    ) -> Option<(CharacterContext<'_>, &mut NativeCharacter)> {
        let slot = self
            .characters
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let character = slot.character.as_mut()?;
        Some((
            CharacterContext {
                bodies: &mut self.bodies,
                colliders: &self.colliders,
                query_pipeline: &self.query_pipeline,
                hooks: &self.hooks,
                gravity: self.gravity,
                layers: &self.config.layers,
            },
            character,
        ))
    }
}

/// Borrowed world state a character update needs alongside its own record
pub(crate) struct CharacterContext<'a> {
    pub(crate) bodies: &'a mut rapier::RigidBodySet,
    pub(crate) colliders: &'a rapier::ColliderSet,
    pub(crate) query_pipeline: &'a rapier::QueryPipeline,
    pub(crate) hooks: &'a LayerPairHooks,
    pub(crate) gravity: rapier::Vector<f32>,
    pub(crate) layers: &'a crate::layers::LayerTable,
}
