//! Physics driver
//!
//! [`PhysicsSystem`] owns the native world and steps it at a fixed rate.
//! Each fixed step runs as a small job graph on the task executor:
//!
//! ```text
//! step ──┬── persisted contact scan
//!        ├── capacity check
//!        └── query structure refresh
//! ```
//!
//! The engine thread waits on a barrier for the graph without holding the
//! world lock. After stepping, queued contact reports are turned into
//! Enter/Stay/Exit events for the listeners, then every body and character
//! component in the scene is updated.

use crate::body::PhysicsBody;
use crate::character::CharacterController;
use crate::config::PhysicsConfig;
use crate::convert::Bounds;
use crate::error::{PhysicsError, Result};
use crate::events::{dispatch, ColliderPair, CollisionListener, ContactTracker, RawContactQueue};
use crate::jobs::{JobColor, JobSystem, RayonExecutor, TaskExecutor};
use crate::layers::LayerMask;
use crate::query::{RaycastHit, RaycastOptions};
use crate::scene::{HookId, Scene};
use crate::world::{BodyId, PhysicsWorld, SharedWorld, WorldRef, WorldStats};
use glam::Vec3;
use hecs::Entity;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Slack when comparing the accumulator against the fixed step, so float
/// noise in frame times doesn't drop a step
const STEP_EPSILON: f64 = 1.0e-6;

/// Runs once per fixed step, after the native world advanced
pub trait PhysicsUpdater: Send {
    fn fixed_update(&mut self, world: &mut PhysicsWorld, fixed_step: f32);

    /// Name used when filtering registered updaters
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> PhysicsUpdater for F
where
    F: FnMut(&mut PhysicsWorld, f32) + Send,
{
    fn fixed_update(&mut self, world: &mut PhysicsWorld, fixed_step: f32) {
        self(world, fixed_step)
    }
}

/// Id of a registered updater
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdaterId(u64);

/// Id of a registered collision listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Entry<T: ?Sized> {
    Owned(Box<T>),
    Shared(Arc<Mutex<T>>),
}

/// Ordered set of callbacks, owned or shared with the caller
struct Registry<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Entry<T>)>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    fn add(&mut self, entry: Entry<T>) -> u64 {
        self.next_id += 1;
        self.entries.push((self.next_id, entry));
        self.next_id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn remove_shared(&mut self, target: &Arc<Mutex<T>>) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(_, entry)| !matches!(entry, Entry::Shared(shared) if Arc::ptr_eq(shared, target)));
        self.entries.len() != before
    }

    /// Remove every entry matching `predicate`; returns how many went
    fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(_, entry)| match entry {
            Entry::Owned(owned) => !predicate(owned.as_ref()),
            Entry::Shared(shared) => !predicate(&*shared.lock()),
        });
        before - self.entries.len()
    }

    fn for_each(&mut self, mut f: impl FnMut(&mut T)) {
        for (_, entry) in &mut self.entries {
            match entry {
                Entry::Owned(owned) => f(owned.as_mut()),
                Entry::Shared(shared) => f(&mut *shared.lock()),
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What the last `update` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Fixed steps taken
    pub steps: u32,
    /// Collision events dispatched
    pub events: usize,
    /// World counters after the last step
    pub world: WorldStats,
}

/// Fixed-step physics driver
pub struct PhysicsSystem {
    config: PhysicsConfig,
    executor: Option<Arc<dyn TaskExecutor>>,
    world: Option<SharedWorld>,
    jobs: JobSystem,
    /// Time not yet consumed by fixed steps
    delta_time_rest: f64,
    step_count: u64,
    paused: bool,
    contacts: RawContactQueue,
    tracker: ContactTracker,
    updaters: Registry<dyn PhysicsUpdater>,
    listeners: Registry<dyn CollisionListener>,
    hooks: Vec<HookId>,
    last_frame: FrameStats,
}

impl PhysicsSystem {
    /// Driver using a rayon pool sized by `config.worker_threads`
    pub fn new(config: PhysicsConfig) -> Self {
        Self {
            config,
            executor: None,
            world: None,
            jobs: JobSystem::new(),
            delta_time_rest: 0.0,
            step_count: 0,
            paused: false,
            contacts: RawContactQueue::default(),
            tracker: ContactTracker::new(),
            updaters: Registry::default(),
            listeners: Registry::default(),
            hooks: Vec::new(),
            last_frame: FrameStats::default(),
        }
    }

    /// Driver running its step jobs on `executor`
    pub fn with_executor(config: PhysicsConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor: Some(executor),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.world.is_some()
    }

    // ==================== Lifecycle ====================

    /// Create the native world, bind the job system and hook body and
    /// character components of `scene`.
    pub fn init(&mut self, scene: &mut Scene) -> Result<()> {
        if self.world.is_some() {
            return Err(PhysicsError::AlreadyInitialized("physics system"));
        }
        let world: SharedWorld = Arc::new(Mutex::new(PhysicsWorld::new(&self.config)?));

        let executor = match self.executor.clone() {
            Some(executor) => executor,
            None => Arc::new(RayonExecutor::new(self.config.worker_threads)?),
        };
        self.jobs.init(executor, self.config.max_barriers)?;

        let weak = Arc::downgrade(&world);
        self.register_hooks(scene, &weak);
        for (_, body) in scene.world_mut().query_mut::<&mut PhysicsBody>() {
            body.bind(weak.clone());
        }
        for (_, character) in scene.world_mut().query_mut::<&mut CharacterController>() {
            character.bind(weak.clone());
        }

        self.world = Some(world);
        log::info!(
            "Physics initialized: step {:.4}s x{}, {} workers",
            self.config.fixed_step,
            self.config.collision_steps,
            self.jobs.max_concurrency()
        );
        Ok(())
    }

    fn register_hooks(&mut self, scene: &mut Scene, world: &WorldRef) {
        let bind = world.clone();
        self.hooks.push(scene.on_construct::<PhysicsBody>(Box::new(move |w, e| {
            if let Ok(mut body) = w.get::<&mut PhysicsBody>(e) {
                body.bind(bind.clone());
            }
        })));
        self.hooks.push(scene.on_destroy::<PhysicsBody>(Box::new(|w, e| {
            if let Ok(mut body) = w.get::<&mut PhysicsBody>(e) {
                body.release();
            }
        })));
        let bind = world.clone();
        self.hooks
            .push(scene.on_construct::<CharacterController>(Box::new(move |w, e| {
                if let Ok(mut character) = w.get::<&mut CharacterController>(e) {
                    character.bind(bind.clone());
                }
            })));
        self.hooks
            .push(scene.on_destroy::<CharacterController>(Box::new(|w, e| {
                if let Ok(mut character) = w.get::<&mut CharacterController>(e) {
                    character.release();
                }
            })));
    }

    /// Unhook the scene, release every native object, drain in-flight jobs
    /// and drop the native world.
    pub fn shutdown(&mut self, scene: &mut Scene) {
        for id in self.hooks.drain(..) {
            scene.remove_hook(id);
        }
        for (_, character) in scene.world_mut().query_mut::<&mut CharacterController>() {
            character.detach();
        }
        for (_, body) in scene.world_mut().query_mut::<&mut PhysicsBody>() {
            body.detach();
        }
        self.jobs.shutdown();
        self.contacts.lock().clear();
        self.tracker.clear();
        self.delta_time_rest = 0.0;
        if self.world.take().is_some() {
            log::info!("Physics shut down after {} steps", self.step_count);
        }
    }

    /// Weak handle to the native world for components
    pub fn world_ref(&self) -> Result<WorldRef> {
        self.shared_world().map(Arc::downgrade)
    }

    fn shared_world(&self) -> Result<&SharedWorld> {
        self.world
            .as_ref()
            .ok_or(PhysicsError::MissingDependency("physics world"))
    }

    // ==================== Frame ====================

    /// Advance the simulation by `delta_time` seconds of frame time.
    ///
    /// Takes as many fixed steps as the accumulated time allows, dispatches
    /// collision events, then updates every body and character. While
    /// paused only the event queue is drained.
    pub fn update(&mut self, scene: &mut Scene, delta_time: f32) -> Result<()> {
        let world = Arc::clone(self.shared_world()?);
        let mut frame = FrameStats::default();

        if !self.paused {
            self.delta_time_rest += f64::from(delta_time.max(0.0));
            let fixed_step = f64::from(self.config.fixed_step);
            while self.delta_time_rest + STEP_EPSILON >= fixed_step {
                if let Err(e) = self.step(&world) {
                    log::error!("Physics step {} failed: {e}", self.step_count);
                    self.delta_time_rest = 0.0;
                    return Err(e);
                }
                let mut native = world.lock();
                self.updaters
                    .for_each(|u| u.fixed_update(&mut native, self.config.fixed_step));
                drop(native);
                self.delta_time_rest = (self.delta_time_rest - fixed_step).max(0.0);
                frame.steps += 1;
            }
        }

        frame.events = self.dispatch_events();
        frame.world = world.lock().stats();
        self.last_frame = frame;

        if self.paused {
            return Ok(());
        }
        self.update_components(scene, &world, delta_time)
    }

    /// One fixed step as a job graph
    fn step(&mut self, world: &SharedWorld) -> Result<()> {
        let started: Arc<Mutex<HashSet<ColliderPair>>> = Arc::default();
        let overflow: Arc<Mutex<Option<PhysicsError>>> = Arc::default();

        let step = {
            let (world, queue, started) = (Arc::clone(world), Arc::clone(&self.contacts), Arc::clone(&started));
            self.jobs.create_job(
                "physics step",
                JobColor::STEP,
                move || *started.lock() = world.lock().step(&queue),
                0,
            )?
        };
        let persisted = {
            let (world, queue, started) = (Arc::clone(world), Arc::clone(&self.contacts), Arc::clone(&started));
            self.jobs.create_job(
                "persisted contacts",
                JobColor::CONTACTS,
                move || world.lock().queue_persisted(&started.lock(), &queue),
                1,
            )?
        };
        let capacity = {
            let (world, overflow) = (Arc::clone(world), Arc::clone(&overflow));
            self.jobs.create_job(
                "capacity check",
                JobColor::CONTACTS,
                move || {
                    if let Err(e) = world.lock().check_capacity() {
                        *overflow.lock() = Some(e);
                    }
                },
                1,
            )?
        };
        let refresh = {
            let world = Arc::clone(world);
            self.jobs.create_job(
                "query refresh",
                JobColor::QUERIES,
                move || world.lock().refresh_queries(),
                1,
            )?
        };

        let barrier = self.jobs.create_barrier()?;
        for dependent in [&persisted, &capacity, &refresh] {
            step.add_dependent(dependent);
        }
        barrier.add_jobs(&[step, persisted, capacity, refresh]);
        barrier.wait()?;

        self.step_count += 1;
        let overflow = overflow.lock().take();
        match overflow {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drain queued contact reports into events; returns how many went out
    fn dispatch_events(&mut self) -> usize {
        let raw = std::mem::take(&mut *self.contacts.lock());
        if raw.is_empty() {
            return 0;
        }
        let events = self.tracker.process(raw);
        for event in &events {
            log::trace!("{:?} {:?} <-> {:?}", event.kind, event.body_a, event.body_b);
            self.listeners.for_each(|l| dispatch(l, event));
        }
        events.len()
    }

    /// Update bodies, then characters. Transient failures are logged and
    /// retried next frame; the first other failure is returned once every
    /// component had its turn.
    fn update_components(&mut self, scene: &mut Scene, world: &SharedWorld, delta_time: f32) -> Result<()> {
        let weak = Arc::downgrade(world);
        let mut first_error = None;

        for entity in scene.entities_with::<PhysicsBody>() {
            let mut transform = scene.resolve_transform(entity)?;
            let result = match scene.get_mut::<PhysicsBody>(entity) {
                Some(mut body) => {
                    if !body.is_bound() {
                        body.bind(weak.clone());
                    }
                    body.update(&mut transform, delta_time)
                }
                None => continue,
            };
            scene.apply_transform(&transform);
            record(result, entity, "body", &mut first_error);
        }

        for entity in scene.entities_with::<CharacterController>() {
            let mut transform = scene.resolve_transform(entity)?;
            let result = {
                let body = scene.get::<PhysicsBody>(entity);
                match scene.get_mut::<CharacterController>(entity) {
                    Some(mut character) => {
                        if !character.is_bound() {
                            character.bind(weak.clone());
                        }
                        character.update(&mut transform, body.as_deref(), delta_time)
                    }
                    None => continue,
                }
            };
            scene.apply_transform(&transform);
            record(result, entity, "character", &mut first_error);
        }

        first_error.map_or(Ok(()), Err)
    }

    // ==================== Control ====================

    pub fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            log::debug!("Physics {}", if paused { "paused" } else { "resumed" });
        }
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn fixed_step(&self) -> f32 {
        self.config.fixed_step
    }

    /// Frame time accumulated but not yet stepped
    pub fn time_rest(&self) -> f64 {
        self.delta_time_rest
    }

    /// Fixed steps taken since init
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn last_frame(&self) -> FrameStats {
        self.last_frame
    }

    pub fn gravity(&self) -> Vec3 {
        self.world
            .as_ref()
            .map(|w| w.lock().gravity())
            .unwrap_or_else(|| Vec3::from_array(self.config.gravity))
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.config.gravity = gravity.to_array();
        if let Some(world) = &self.world {
            world.lock().set_gravity(gravity);
        }
    }

    pub fn stats(&self) -> WorldStats {
        self.world
            .as_ref()
            .map(|w| w.lock().stats())
            .unwrap_or_default()
    }

    pub fn body_count(&self) -> usize {
        self.world.as_ref().map_or(0, |w| w.lock().body_count())
    }

    pub fn character_count(&self) -> usize {
        self.world.as_ref().map_or(0, |w| w.lock().character_count())
    }

    pub fn entity_for_body(&self, body: BodyId) -> Option<Entity> {
        self.world.as_ref()?.lock().entity_for_body(body)
    }

    /// How many step jobs can run in parallel
    pub fn max_concurrency(&self) -> usize {
        self.jobs.max_concurrency()
    }

    /// Rebuild the query structure now instead of after the next step
    pub fn optimize_broad_phase(&self) {
        if let Some(world) = &self.world {
            world.lock().refresh_queries();
        }
    }

    // ==================== Queries ====================

    /// Closest hit along a ray, against layers in `mask`
    pub fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32, mask: LayerMask) -> Option<RaycastHit> {
        self.raycast_with(origin, direction, &RaycastOptions::new(max_distance, mask))
    }

    pub fn raycast_with(&self, origin: Vec3, direction: Vec3, options: &RaycastOptions) -> Option<RaycastHit> {
        let mut world = self.world.as_ref()?.lock();
        world.refresh_queries();
        world.queries().raycast(origin, direction, options)
    }

    /// Every hit along a ray, closest first
    pub fn raycast_all(&self, origin: Vec3, direction: Vec3, max_distance: f32, mask: LayerMask) -> Vec<RaycastHit> {
        let Some(world) = &self.world else {
            return Vec::new();
        };
        let mut world = world.lock();
        world.refresh_queries();
        world
            .queries()
            .raycast_all(origin, direction, &RaycastOptions::new(max_distance, mask))
    }

    /// Wake sleeping bodies overlapping `bounds` on layers in `mask`
    pub fn activate_bodies(&self, bounds: Bounds, mask: LayerMask) -> usize {
        self.world
            .as_ref()
            .map_or(0, |w| w.lock().activate_bodies(bounds, mask))
    }

    // ==================== Registries ====================

    pub fn add_updater(&mut self, updater: Box<dyn PhysicsUpdater>) -> UpdaterId {
        UpdaterId(self.updaters.add(Entry::Owned(updater)))
    }

    pub fn add_shared_updater(&mut self, updater: Arc<Mutex<dyn PhysicsUpdater>>) -> UpdaterId {
        UpdaterId(self.updaters.add(Entry::Shared(updater)))
    }

    pub fn remove_updater(&mut self, id: UpdaterId) -> bool {
        self.updaters.remove(id.0)
    }

    pub fn remove_shared_updater(&mut self, updater: &Arc<Mutex<dyn PhysicsUpdater>>) -> bool {
        self.updaters.remove_shared(updater)
    }

    /// Remove updaters matching `predicate`; returns how many were removed
    pub fn remove_updaters(&mut self, mut predicate: impl FnMut(&dyn PhysicsUpdater) -> bool) -> usize {
        self.updaters.remove_where(|updater| predicate(updater))
    }

    pub fn updater_count(&self) -> usize {
        self.updaters.len()
    }

    pub fn add_listener(&mut self, listener: Box<dyn CollisionListener>) -> ListenerId {
        ListenerId(self.listeners.add(Entry::Owned(listener)))
    }

    pub fn add_shared_listener(&mut self, listener: Arc<Mutex<dyn CollisionListener>>) -> ListenerId {
        ListenerId(self.listeners.add(Entry::Shared(listener)))
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id.0)
    }

    pub fn remove_shared_listener(&mut self, listener: &Arc<Mutex<dyn CollisionListener>>) -> bool {
        self.listeners.remove_shared(listener)
    }

    /// Remove listeners matching `predicate`; returns how many were removed
    pub fn remove_listeners(&mut self, mut predicate: impl FnMut(&dyn CollisionListener) -> bool) -> usize {
        self.listeners.remove_where(|listener| predicate(listener))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

fn record(result: Result<()>, entity: Entity, what: &str, first_error: &mut Option<PhysicsError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_transient() => log::debug!("Retrying {what} {:?} next frame: {e}", entity),
        Err(e) => {
            log::warn!("Updating {what} {:?} failed: {e}", entity);
            first_error.get_or_insert(e);
        }
    }
}
