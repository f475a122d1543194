//! Minimal scene container
//!
//! A `hecs::World` plus the two things the physics layer needs from an
//! engine scene: per-component construct/destroy hooks, and parent-relative
//! transforms that resolve to world matrices.

use crate::error::{PhysicsError, Result};
use glam::{Mat4, Quat, Vec3};
use hecs::{Component, DynamicBundle, Entity};
use std::any::TypeId;
use std::collections::HashMap;

/// Parent-relative transform of an entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub local: Mat4,
}

impl Default for Transform {
    fn default() -> Self {
        Self { local: Mat4::IDENTITY }
    }
}

impl Transform {
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            local: Mat4::from_translation(translation),
        }
    }

    pub fn from_scale_rotation_translation(scale: Vec3, rotation: Quat, translation: Vec3) -> Self {
        Self {
            local: Mat4::from_scale_rotation_translation(scale, rotation, translation),
        }
    }

    pub fn set_local_matrix(&mut self, local: Mat4) {
        self.local = local;
    }

    pub fn translation(&self) -> Vec3 {
        self.local.w_axis.truncate()
    }
}

/// Hierarchy link to the parent entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parent(pub Entity);

/// Resolved world transform of an entity, handed to component updates.
/// Writes are buffered and applied back by [`Scene::apply_transform`].
#[derive(Debug, Clone, Copy)]
pub struct EntityTransform {
    pub entity: Entity,
    world: Mat4,
    parent_world: Mat4,
    dirty: bool,
}

impl EntityTransform {
    pub fn new(entity: Entity, world: Mat4) -> Self {
        Self {
            entity,
            world,
            parent_world: Mat4::IDENTITY,
            dirty: false,
        }
    }

    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }

    pub fn set_world_matrix(&mut self, world: Mat4) {
        self.world = world;
        self.dirty = true;
    }

    /// Whether a component wrote a new world matrix
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Local matrix that produces the current world matrix under the parent
    pub fn local_matrix(&self) -> Mat4 {
        self.parent_world.inverse() * self.world
    }
}

/// Id of a registered hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Called with the scene's world and the entity whose component changed
pub type ComponentHook = Box<dyn FnMut(&mut hecs::World, Entity) + Send + Sync>;

const MAX_HIERARCHY_DEPTH: usize = 64;

/// Entity container with component lifecycle hooks
#[derive(Default)]
pub struct Scene {
    world: hecs::World,
    construct_hooks: HashMap<TypeId, Vec<(HookId, ComponentHook)>>,
    destroy_hooks: HashMap<TypeId, Vec<(HookId, ComponentHook)>>,
    next_hook: u64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn world(&self) -> &hecs::World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut hecs::World {
        &mut self.world
    }

    // ==================== Hooks ====================

    /// Run `hook` after a `T` is added to an entity
    pub fn on_construct<T: Component>(&mut self, hook: ComponentHook) -> HookId {
        let id = self.next_hook_id();
        self.construct_hooks
            .entry(TypeId::of::<T>())
            .or_default()
            .push((id, hook));
        id
    }

    /// Run `hook` before a `T` is removed from an entity
    pub fn on_destroy<T: Component>(&mut self, hook: ComponentHook) -> HookId {
        let id = self.next_hook_id();
        self.destroy_hooks
            .entry(TypeId::of::<T>())
            .or_default()
            .push((id, hook));
        id
    }

    /// Unregister a hook. Returns false if it was not registered.
    pub fn remove_hook(&mut self, id: HookId) -> bool {
        let mut removed = false;
        for hooks in self
            .construct_hooks
            .values_mut()
            .chain(self.destroy_hooks.values_mut())
        {
            let before = hooks.len();
            hooks.retain(|(hook_id, _)| *hook_id != id);
            removed |= hooks.len() != before;
        }
        removed
    }

    pub fn hook_count(&self) -> usize {
        self.construct_hooks
            .values()
            .chain(self.destroy_hooks.values())
            .map(Vec::len)
            .sum()
    }

    fn next_hook_id(&mut self) -> HookId {
        self.next_hook += 1;
        HookId(self.next_hook)
    }

    fn fire(hooks: &mut HashMap<TypeId, Vec<(HookId, ComponentHook)>>, world: &mut hecs::World, ty: TypeId, entity: Entity) {
        if let Some(list) = hooks.get_mut(&ty) {
            for (_, hook) in list.iter_mut() {
                hook(world, entity);
            }
        }
    }

    fn component_types(&self, entity: Entity) -> Vec<TypeId> {
        self.world
            .entity(entity)
            .map(|e| e.component_types().collect())
            .unwrap_or_default()
    }

    // ==================== Entities ====================

    /// Spawn an entity; construct hooks run for every component in the bundle
    pub fn spawn(&mut self, components: impl DynamicBundle) -> Entity {
        let entity = self.world.spawn(components);
        for ty in self.component_types(entity) {
            Self::fire(&mut self.construct_hooks, &mut self.world, ty, entity);
        }
        entity
    }

    /// Despawn an entity; destroy hooks run while its components still exist
    pub fn despawn(&mut self, entity: Entity) -> Result<()> {
        for ty in self.component_types(entity) {
            Self::fire(&mut self.destroy_hooks, &mut self.world, ty, entity);
        }
        self.world
            .despawn(entity)
            .map_err(|_| PhysicsError::MissingDependency("entity"))
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.world.contains(entity)
    }

    /// Add or replace a component, then run its construct hooks
    pub fn insert<T: Component>(&mut self, entity: Entity, component: T) -> Result<()> {
        if self.world.get::<&T>(entity).is_ok() {
            Self::fire(&mut self.destroy_hooks, &mut self.world, TypeId::of::<T>(), entity);
        }
        self.world
            .insert_one(entity, component)
            .map_err(|_| PhysicsError::MissingDependency("entity"))?;
        Self::fire(&mut self.construct_hooks, &mut self.world, TypeId::of::<T>(), entity);
        Ok(())
    }

    /// Run destroy hooks, then remove the component
    pub fn remove<T: Component>(&mut self, entity: Entity) -> Option<T> {
        self.world.get::<&T>(entity).ok()?;
        Self::fire(&mut self.destroy_hooks, &mut self.world, TypeId::of::<T>(), entity);
        self.world.remove_one::<T>(entity).ok()
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<hecs::Ref<'_, T>> {
        self.world.get::<&T>(entity).ok()
    }

    pub fn get_mut<T: Component>(&self, entity: Entity) -> Option<hecs::RefMut<'_, T>> {
        self.world.get::<&mut T>(entity).ok()
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.world.get::<&T>(entity).is_ok()
    }

    /// Entities that have a `T`
    pub fn entities_with<T: Component>(&self) -> Vec<Entity> {
        self.world
            .query::<&T>()
            .iter()
            .map(|(entity, _)| entity)
            .collect()
    }

    // ==================== Transforms ====================

    /// The entity's transform, adding an identity one if it has none
    pub fn get_or_add_transform(&mut self, entity: Entity) -> Result<Transform> {
        if let Some(transform) = self.get::<Transform>(entity) {
            return Ok(*transform);
        }
        self.insert(entity, Transform::default())?;
        Ok(Transform::default())
    }

    /// World matrix from the parent chain
    pub fn world_matrix(&self, entity: Entity) -> Mat4 {
        let mut matrix = Mat4::IDENTITY;
        let mut current = Some(entity);
        let mut depth = 0;
        while let Some(e) = current {
            if depth == MAX_HIERARCHY_DEPTH {
                log::warn!("Hierarchy above {:?} is deeper than {MAX_HIERARCHY_DEPTH}, truncating", entity);
                break;
            }
            if let Some(t) = self.get::<Transform>(e) {
                matrix = t.local * matrix;
            }
            current = self.get::<Parent>(e).map(|p| p.0);
            depth += 1;
        }
        matrix
    }

    /// Snapshot an entity's world transform for a component update
    pub fn resolve_transform(&mut self, entity: Entity) -> Result<EntityTransform> {
        self.get_or_add_transform(entity)?;
        let parent_world = self
            .get::<Parent>(entity)
            .map(|p| p.0)
            .map_or(Mat4::IDENTITY, |p| self.world_matrix(p));
        Ok(EntityTransform {
            entity,
            world: self.world_matrix(entity),
            parent_world,
            dirty: false,
        })
    }

    /// Write back a transform a component changed
    pub fn apply_transform(&mut self, transform: &EntityTransform) {
        if !transform.dirty {
            return;
        }
        if let Some(mut t) = self.get_mut::<Transform>(transform.entity) {
            t.set_local_matrix(transform.local_matrix());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn test_hooks_fire_on_insert_and_remove() {
        let mut scene = Scene::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        scene.on_construct::<Marker>(Box::new(move |world, e| {
            let value = world.get::<&Marker>(e).map(|m| m.0).unwrap_or(0);
            l.lock().push(("construct", value));
        }));
        let l = Arc::clone(&log);
        scene.on_destroy::<Marker>(Box::new(move |world, e| {
            // Component is still present when the destroy hook runs
            let value = world.get::<&Marker>(e).map(|m| m.0).unwrap_or(0);
            l.lock().push(("destroy", value));
        }));

        let e = scene.spawn((Marker(1),));
        scene.insert(e, Marker(2)).unwrap();
        assert_eq!(scene.remove::<Marker>(e), Some(Marker(2)));
        assert!(scene.remove::<Marker>(e).is_none());

        assert_eq!(
            *log.lock(),
            vec![("construct", 1), ("destroy", 1), ("construct", 2), ("destroy", 2)]
        );
    }

    #[test]
    fn test_despawn_fires_destroy_hooks() {
        let mut scene = Scene::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let id = scene.on_destroy::<Marker>(Box::new(move |_, _| *c.lock() += 1));

        let e = scene.spawn((Marker(0), Transform::default()));
        scene.despawn(e).unwrap();
        assert_eq!(*count.lock(), 1);
        assert!(scene.despawn(e).is_err());

        assert!(scene.remove_hook(id));
        assert!(!scene.remove_hook(id));
        assert_eq!(scene.hook_count(), 0);
    }

    #[test]
    fn test_world_matrix_follows_parents() {
        let mut scene = Scene::new();
        let parent = scene.spawn((Transform::from_translation(Vec3::new(0.0, 5.0, 0.0)),));
        let child = scene.spawn((
            Transform::from_translation(Vec3::new(1.0, 0.0, 0.0)),
            Parent(parent),
        ));
        let world = scene.world_matrix(child);
        assert!(world.w_axis.truncate().abs_diff_eq(Vec3::new(1.0, 5.0, 0.0), 1.0e-6));
    }

    #[test]
    fn test_apply_transform_keeps_parent_relative_local() {
        let mut scene = Scene::new();
        let parent = scene.spawn((Transform::from_translation(Vec3::new(0.0, 5.0, 0.0)),));
        let child = scene.spawn((Transform::default(), Parent(parent)));

        let mut t = scene.resolve_transform(child).unwrap();
        assert!(!t.is_dirty());
        t.set_world_matrix(Mat4::from_translation(Vec3::new(0.0, 7.0, 0.0)));
        scene.apply_transform(&t);

        let local = scene.get::<Transform>(child).unwrap().translation();
        assert!(local.abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1.0e-6));
        let world = scene.world_matrix(child).w_axis.truncate();
        assert!(world.abs_diff_eq(Vec3::new(0.0, 7.0, 0.0), 1.0e-6));
    }

    #[test]
    fn test_get_or_add_transform() {
        let mut scene = Scene::new();
        let e = scene.spawn((Marker(3),));
        assert!(!scene.has::<Transform>(e));
        assert_eq!(scene.get_or_add_transform(e).unwrap(), Transform::default());
        assert!(scene.has::<Transform>(e));
    }
}
