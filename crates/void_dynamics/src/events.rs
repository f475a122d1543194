//! Collision events
//!
//! Rapier reports contact starts and stops from inside the step, possibly on
//! worker threads. Those raw reports are appended to a mutex-guarded queue,
//! together with a "persisted" report for every pair still touching after
//! the step. The engine thread drains the queue and a [`ContactTracker`]
//! turns it into per-body-pair Enter/Stay/Exit events.

use crate::convert::{from_native_point, from_native_vec3};
use crate::world::{BodyId, ColliderTag};
use glam::Vec3;
use hecs::Entity;
use parking_lot::Mutex;
use rapier3d::prelude as rapier;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Phase of a body pair's contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollisionEventKind {
    /// The pair started touching
    Enter,
    /// The pair is still touching
    Stay,
    /// The pair stopped touching
    Exit,
}

/// One contact point, engine space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactPoint {
    pub position: Vec3,
    /// Penetration depth (positive when overlapping)
    pub depth: f32,
}

/// Contact geometry of a body pair, engine space
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollisionManifold {
    /// Normal pointing from body A towards body B
    pub normal: Vec3,
    pub points: Vec<ContactPoint>,
}

impl CollisionManifold {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Largest penetration depth over all points
    pub fn max_depth(&self) -> f32 {
        self.points.iter().map(|p| p.depth).fold(0.0, f32::max)
    }

    /// Mean contact position
    pub fn average_point(&self) -> Option<Vec3> {
        if self.points.is_empty() {
            return None;
        }
        let sum: Vec3 = self.points.iter().map(|p| p.position).sum();
        Some(sum / self.points.len() as f32)
    }

    fn flipped(mut self) -> Self {
        self.normal = -self.normal;
        self
    }

    /// Build from a Rapier contact pair
    pub(crate) fn from_contact_pair(pair: &rapier::ContactPair, colliders: &rapier::ColliderSet) -> Self {
        let Some(pose) = colliders.get(pair.collider1).map(|c| *c.position()) else {
            return Self::default();
        };
        let mut manifold = Self::default();
        for m in &pair.manifolds {
            if manifold.points.is_empty() {
                manifold.normal = from_native_vec3(&m.data.normal);
            }
            manifold.points.extend(m.points.iter().map(|p| ContactPoint {
                position: from_native_point(&(pose * p.local_p1)),
                depth: (-p.dist).max(0.0),
            }));
        }
        manifold
    }
}

/// An Enter, Stay or Exit between two bodies
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionEvent {
    pub kind: CollisionEventKind,
    pub body_a: BodyId,
    pub body_b: BodyId,
    pub entity_a: Option<Entity>,
    pub entity_b: Option<Entity>,
    /// At least one side is a sensor
    pub sensor: bool,
    /// Empty for sensors and Exit events
    pub manifold: CollisionManifold,
}

impl CollisionEvent {
    pub fn involves(&self, body: BodyId) -> bool {
        self.body_a == body || self.body_b == body
    }

    /// The body on the other side of the pair
    pub fn other(&self, body: BodyId) -> Option<BodyId> {
        if self.body_a == body {
            Some(self.body_b)
        } else if self.body_b == body {
            Some(self.body_a)
        } else {
            None
        }
    }
}

/// Receives collision events on the engine thread
pub trait CollisionListener: Send {
    fn on_collision_enter(&mut self, _event: &CollisionEvent) {}
    fn on_collision_stay(&mut self, _event: &CollisionEvent) {}
    fn on_collision_exit(&mut self, _event: &CollisionEvent) {}
}

/// Route an event to the matching listener callback
pub fn dispatch(listener: &mut dyn CollisionListener, event: &CollisionEvent) {
    match event.kind {
        CollisionEventKind::Enter => listener.on_collision_enter(event),
        CollisionEventKind::Stay => listener.on_collision_stay(event),
        CollisionEventKind::Exit => listener.on_collision_exit(event),
    }
}

/// Listener that keeps every event it receives
#[derive(Debug, Default)]
pub struct EventCollector {
    pub events: Vec<CollisionEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn of_kind(&self, kind: CollisionEventKind) -> impl Iterator<Item = &CollisionEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    /// Event kinds seen for one body pair, in order
    pub fn history(&self, a: BodyId, b: BodyId) -> Vec<CollisionEventKind> {
        self.events
            .iter()
            .filter(|e| e.involves(a) && e.involves(b))
            .map(|e| e.kind)
            .collect()
    }
}

impl CollisionListener for EventCollector {
    fn on_collision_enter(&mut self, event: &CollisionEvent) {
        self.events.push(event.clone());
    }

    fn on_collision_stay(&mut self, event: &CollisionEvent) {
        self.events.push(event.clone());
    }

    fn on_collision_exit(&mut self, event: &CollisionEvent) {
        self.events.push(event.clone());
    }
}

// ==================== Raw Contacts ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawContactKind {
    Added,
    Persisted,
    Removed,
}

/// Unordered collider pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ColliderPair(rapier::ColliderHandle, rapier::ColliderHandle);

impl ColliderPair {
    pub(crate) fn new(a: rapier::ColliderHandle, b: rapier::ColliderHandle) -> Self {
        if a.into_raw_parts() <= b.into_raw_parts() {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ContactSide {
    pub(crate) body: BodyId,
    pub(crate) entity: Option<Entity>,
}

impl ContactSide {
    pub(crate) fn resolve(colliders: &rapier::ColliderSet, handle: rapier::ColliderHandle) -> Option<Self> {
        let collider = colliders.get(handle)?;
        Some(Self {
            body: BodyId(collider.parent()?),
            entity: ColliderTag::from_user_data(collider.user_data).entity(),
        })
    }
}

/// A contact report as the native step produced it
#[derive(Debug, Clone)]
pub(crate) struct RawContact {
    pub(crate) kind: RawContactKind,
    pub(crate) pair: ColliderPair,
    /// Sides in collider-handle order; absent once a collider was removed
    pub(crate) sides: Option<(ContactSide, ContactSide)>,
    pub(crate) sensor: bool,
    pub(crate) manifold: CollisionManifold,
}

impl RawContact {
    pub(crate) fn new(
        kind: RawContactKind,
        colliders: &rapier::ColliderSet,
        h1: rapier::ColliderHandle,
        h2: rapier::ColliderHandle,
        contact: Option<&rapier::ContactPair>,
    ) -> Self {
        let pair = ColliderPair::new(h1, h2);
        let sides = ContactSide::resolve(colliders, pair.0).zip(ContactSide::resolve(colliders, pair.1));
        let sensor = [h1, h2]
            .iter()
            .any(|h| colliders.get(*h).map_or(false, |c| c.is_sensor()));
        let mut manifold = contact
            .map(|c| CollisionManifold::from_contact_pair(c, colliders))
            .unwrap_or_default();
        if contact.map_or(false, |c| c.collider1 != pair.0) {
            manifold = manifold.flipped();
        }
        Self {
            kind,
            pair,
            sides,
            sensor,
            manifold,
        }
    }
}

/// Queue shared between the native callbacks and the engine-thread drain
pub(crate) type RawContactQueue = Arc<Mutex<Vec<RawContact>>>;

/// Rapier event handler for one step. Appends to the shared queue and
/// remembers which pairs started during this step.
pub(crate) struct ContactEventSink {
    queue: RawContactQueue,
    started: Mutex<HashSet<ColliderPair>>,
}

impl ContactEventSink {
    pub(crate) fn new(queue: RawContactQueue) -> Self {
        Self {
            queue,
            started: Mutex::new(HashSet::new()),
        }
    }

    /// Pairs that started touching during the step
    pub(crate) fn into_started(self) -> HashSet<ColliderPair> {
        self.started.into_inner()
    }
}

impl rapier::EventHandler for ContactEventSink {
    fn handle_collision_event(
        &self,
        _bodies: &rapier::RigidBodySet,
        colliders: &rapier::ColliderSet,
        event: rapier::CollisionEvent,
        contact_pair: Option<&rapier::ContactPair>,
    ) {
        let (h1, h2, kind) = match event {
            rapier::CollisionEvent::Started(h1, h2, _) => (h1, h2, RawContactKind::Added),
            rapier::CollisionEvent::Stopped(h1, h2, _) => (h1, h2, RawContactKind::Removed),
        };
        if kind == RawContactKind::Added {
            self.started.lock().insert(ColliderPair::new(h1, h2));
        }
        let raw = RawContact::new(kind, colliders, h1, h2, contact_pair);
        self.queue.lock().push(raw);
    }

    fn handle_contact_force_event(
        &self,
        _dt: f32,
        _bodies: &rapier::RigidBodySet,
        _colliders: &rapier::ColliderSet,
        _contact_pair: &rapier::ContactPair,
        _total_force_magnitude: f32,
    ) {
    }
}

// ==================== Tracker ====================

/// Unordered body pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BodyPair(BodyId, BodyId);

struct PairState {
    colliders: usize,
    /// Sides in body order
    a: ContactSide,
    b: ContactSide,
    sensor: bool,
}

/// Folds raw collider-pair reports into monotonic body-pair events.
///
/// Per body pair: Enter when the first collider pair starts touching, Stay
/// at most once per drain while touching, Exit when the last collider pair
/// stops. Reports that would break that order are dropped.
#[derive(Default)]
pub struct ContactTracker {
    colliders: HashMap<ColliderPair, BodyPair>,
    bodies: HashMap<BodyPair, PairState>,
}

impl ContactTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Body pairs currently touching
    pub fn touching_pairs(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_touching(&self, a: BodyId, b: BodyId) -> bool {
        self.bodies.contains_key(&Self::body_pair(a, b))
    }

    fn body_pair(a: BodyId, b: BodyId) -> BodyPair {
        if a <= b {
            BodyPair(a, b)
        } else {
            BodyPair(b, a)
        }
    }

    /// Convert one drained batch, preserving queue order
    pub(crate) fn process(&mut self, raw: Vec<RawContact>) -> Vec<CollisionEvent> {
        let mut events = Vec::new();
        let mut stayed: HashSet<BodyPair> = HashSet::new();

        for contact in raw {
            match contact.kind {
                RawContactKind::Added => self.add(contact, &mut events),
                RawContactKind::Persisted => {
                    let Some(body_pair) = self.colliders.get(&contact.pair).copied() else {
                        // Never saw it start; open it now so the pair stays ordered
                        self.add(contact, &mut events);
                        continue;
                    };
                    if stayed.insert(body_pair) {
                        if let Some(state) = self.bodies.get(&body_pair) {
                            let manifold = Self::orient(&contact, state);
                            events.push(Self::event(CollisionEventKind::Stay, state, manifold));
                        }
                    }
                }
                RawContactKind::Removed => {
                    let Some(body_pair) = self.colliders.remove(&contact.pair) else {
                        log::trace!("Dropping stop report for unknown pair {:?}", contact.pair);
                        continue;
                    };
                    let closed = match self.bodies.get_mut(&body_pair) {
                        Some(state) => {
                            state.colliders = state.colliders.saturating_sub(1);
                            state.colliders == 0
                        }
                        None => false,
                    };
                    if closed {
                        if let Some(state) = self.bodies.remove(&body_pair) {
                            events.push(Self::event(
                                CollisionEventKind::Exit,
                                &state,
                                CollisionManifold::default(),
                            ));
                        }
                    }
                }
            }
        }
        events
    }

    fn add(&mut self, contact: RawContact, events: &mut Vec<CollisionEvent>) {
        if self.colliders.contains_key(&contact.pair) {
            log::trace!("Dropping repeated start report for {:?}", contact.pair);
            return;
        }
        let Some((s1, s2)) = contact.sides else {
            return;
        };
        if s1.body == s2.body {
            return;
        }
        let body_pair = Self::body_pair(s1.body, s2.body);
        self.colliders.insert(contact.pair, body_pair);

        if let Some(state) = self.bodies.get_mut(&body_pair) {
            state.colliders += 1;
            return;
        }
        let (a, b) = if s1.body == body_pair.0 { (s1, s2) } else { (s2, s1) };
        let state = PairState {
            colliders: 1,
            a,
            b,
            sensor: contact.sensor,
        };
        let manifold = Self::orient(&contact, &state);
        events.push(Self::event(CollisionEventKind::Enter, &state, manifold));
        self.bodies.insert(body_pair, state);
    }

    /// Raw manifolds point from the first collider's body; events point from A to B
    fn orient(contact: &RawContact, state: &PairState) -> CollisionManifold {
        match contact.sides {
            Some((s1, _)) if s1.body != state.a.body => contact.manifold.clone().flipped(),
            _ => contact.manifold.clone(),
        }
    }

    fn event(kind: CollisionEventKind, state: &PairState, manifold: CollisionManifold) -> CollisionEvent {
        CollisionEvent {
            kind,
            body_a: state.a.body,
            body_b: state.b.body,
            entity_a: state.a.entity,
            entity_b: state.b.entity,
            sensor: state.sensor,
            manifold,
        }
    }

    /// Forget everything, e.g. when the native world is released
    pub fn clear(&mut self) {
        self.colliders.clear();
        self.bodies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collider(i: u32) -> rapier::ColliderHandle {
        rapier::ColliderHandle::from_raw_parts(i, 0)
    }

    fn body(i: u32) -> BodyId {
        BodyId(rapier::RigidBodyHandle::from_raw_parts(i, 0))
    }

    fn raw(kind: RawContactKind, c1: u32, c2: u32, b1: u32, b2: u32) -> RawContact {
        RawContact {
            kind,
            pair: ColliderPair::new(collider(c1), collider(c2)),
            sides: Some((
                ContactSide { body: body(b1), entity: None },
                ContactSide { body: body(b2), entity: None },
            )),
            sensor: false,
            manifold: CollisionManifold {
                normal: Vec3::Y,
                points: vec![ContactPoint {
                    position: Vec3::ZERO,
                    depth: 0.01,
                }],
            },
        }
    }

    fn kinds(events: &[CollisionEvent]) -> Vec<CollisionEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    use CollisionEventKind::*;
    use RawContactKind::*;

    #[test]
    fn test_enter_stay_exit() {
        let mut tracker = ContactTracker::new();
        let events = tracker.process(vec![raw(Added, 0, 1, 0, 1)]);
        assert_eq!(kinds(&events), vec![Enter]);
        assert!(tracker.is_touching(body(1), body(0)));

        let events = tracker.process(vec![raw(Persisted, 0, 1, 0, 1)]);
        assert_eq!(kinds(&events), vec![Stay]);

        let events = tracker.process(vec![raw(Removed, 0, 1, 0, 1)]);
        assert_eq!(kinds(&events), vec![Exit]);
        assert_eq!(tracker.touching_pairs(), 0);
    }

    #[test]
    fn test_stray_reports_are_dropped() {
        let mut tracker = ContactTracker::new();
        assert!(tracker.process(vec![raw(Removed, 0, 1, 0, 1)]).is_empty());

        let events = tracker.process(vec![raw(Added, 0, 1, 0, 1), raw(Added, 1, 0, 1, 0)]);
        assert_eq!(kinds(&events), vec![Enter]);
    }

    #[test]
    fn test_persisted_without_start_opens_pair() {
        let mut tracker = ContactTracker::new();
        let events = tracker.process(vec![raw(Persisted, 0, 1, 0, 1), raw(Persisted, 0, 1, 0, 1)]);
        assert_eq!(kinds(&events), vec![Enter, Stay]);
    }

    #[test]
    fn test_stay_once_per_drain() {
        let mut tracker = ContactTracker::new();
        tracker.process(vec![raw(Added, 0, 1, 0, 1)]);
        let events = tracker.process(vec![
            raw(Persisted, 0, 1, 0, 1),
            raw(Persisted, 0, 1, 0, 1),
            raw(Persisted, 0, 1, 0, 1),
        ]);
        assert_eq!(kinds(&events), vec![Stay]);
    }

    #[test]
    fn test_body_pair_refcounts_collider_pairs() {
        let mut tracker = ContactTracker::new();
        let events = tracker.process(vec![raw(Added, 0, 2, 0, 1), raw(Added, 1, 2, 0, 1)]);
        assert_eq!(kinds(&events), vec![Enter]);

        assert!(tracker.process(vec![raw(Removed, 0, 2, 0, 1)]).is_empty());
        let events = tracker.process(vec![raw(Removed, 1, 2, 0, 1)]);
        assert_eq!(kinds(&events), vec![Exit]);
    }

    #[test]
    fn test_normal_points_from_a_to_b() {
        let mut tracker = ContactTracker::new();
        // Collider order puts body 1 first
        let mut contact = raw(Added, 0, 1, 1, 0);
        contact.manifold.normal = Vec3::Y;
        let events = tracker.process(vec![contact]);
        assert_eq!(events[0].body_a, body(0));
        assert_eq!(events[0].manifold.normal, -Vec3::Y);
    }

    #[test]
    fn test_collector_history() {
        let mut tracker = ContactTracker::new();
        let mut collector = EventCollector::new();
        for batch in [
            vec![raw(Added, 0, 1, 0, 1)],
            vec![raw(Persisted, 0, 1, 0, 1)],
            vec![raw(Removed, 0, 1, 0, 1)],
        ] {
            for event in tracker.process(batch) {
                dispatch(&mut collector, &event);
            }
        }
        assert_eq!(collector.history(body(0), body(1)), vec![Enter, Stay, Exit]);
        assert_eq!(collector.of_kind(Stay).count(), 1);
    }

    #[test]
    fn test_manifold_helpers() {
        let manifold = CollisionManifold {
            normal: Vec3::Y,
            points: vec![
                ContactPoint { position: Vec3::new(1.0, 0.0, 0.0), depth: 0.1 },
                ContactPoint { position: Vec3::new(-1.0, 0.0, 0.0), depth: 0.3 },
            ],
        };
        assert_eq!(manifold.average_point(), Some(Vec3::ZERO));
        assert!((manifold.max_depth() - 0.3).abs() < 1.0e-6);
        assert!(CollisionManifold::default().average_point().is_none());
    }
}
