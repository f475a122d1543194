//! Collision layers and filtering
//!
//! Every collider belongs to one object layer. Object layers are grouped
//! into broad-phase layers, which become the collider's Rapier
//! `InteractionGroups`; the finer object-layer pair test runs as a
//! `PhysicsHooks` filter on every contact and intersection pair.

use crate::error::{PhysicsError, Result};
use rapier3d::prelude as rapier;
use serde::{Deserialize, Serialize};

/// Maximum number of object layers (one bit each in the collision matrix)
pub const MAX_OBJECT_LAYERS: usize = 32;

/// Maximum number of broad-phase layers (one Rapier group bit each)
pub const MAX_BROAD_PHASE_LAYERS: usize = 32;

/// A fine-grained collision layer assigned to bodies and characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectLayer(pub u16);

impl ObjectLayer {
    /// Static geometry
    pub const NON_MOVING: Self = Self(0);
    /// Everything that moves
    pub const MOVING: Self = Self(1);

    /// Index into per-layer tables
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for ObjectLayer {
    fn default() -> Self {
        Self::MOVING
    }
}

/// A coarse collision category used to prune pairs before the narrow phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadPhaseLayer(pub u8);

impl BroadPhaseLayer {
    pub const NON_MOVING: Self = Self(0);
    pub const MOVING: Self = Self(1);

    fn bit(self) -> u32 {
        1 << self.0
    }
}

/// Bitmask over object layers, used to filter queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerMask(pub u32);

impl LayerMask {
    pub const ALL: Self = Self(u32::MAX);
    pub const NONE: Self = Self(0);

    /// Mask containing exactly the given layers
    pub fn from_layers(layers: &[ObjectLayer]) -> Self {
        layers.iter().fold(Self::NONE, |mask, l| mask.with(*l))
    }

    /// Add a layer to the mask
    pub fn with(mut self, layer: ObjectLayer) -> Self {
        if layer.index() < MAX_OBJECT_LAYERS {
            self.0 |= 1 << layer.0;
        }
        self
    }

    /// Whether the mask selects a layer
    pub fn contains(&self, layer: ObjectLayer) -> bool {
        (layer.0 as usize) < MAX_OBJECT_LAYERS && self.0 & (1 << layer.0) != 0
    }
}

impl Default for LayerMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Per-world layer configuration: names, broad-phase mapping and the
/// symmetric object-layer collision matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerTable {
    names: Vec<String>,
    broad_phase: Vec<BroadPhaseLayer>,
    collides: Vec<u32>,
}

impl Default for LayerTable {
    /// Two layers: static geometry, and moving bodies that collide with
    /// everything
    fn default() -> Self {
        let mut table = Self {
            names: vec!["non_moving".to_string(), "moving".to_string()],
            broad_phase: vec![BroadPhaseLayer::NON_MOVING, BroadPhaseLayer::MOVING],
            collides: vec![0, 0],
        };
        table.set_collides(ObjectLayer::MOVING, ObjectLayer::MOVING, true);
        table.set_collides(ObjectLayer::MOVING, ObjectLayer::NON_MOVING, true);
        table
    }
}

impl LayerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            broad_phase: Vec::new(),
            collides: Vec::new(),
        }
    }

    /// Register a named object layer mapped to a broad-phase layer
    pub fn add_layer(&mut self, name: &str, broad_phase: BroadPhaseLayer) -> Result<ObjectLayer> {
        if self.names.len() >= MAX_OBJECT_LAYERS {
            return Err(PhysicsError::InvalidConfig(format!(
                "at most {MAX_OBJECT_LAYERS} object layers are supported"
            )));
        }
        if broad_phase.0 as usize >= MAX_BROAD_PHASE_LAYERS {
            return Err(PhysicsError::InvalidConfig(format!(
                "broad-phase layer {} out of range",
                broad_phase.0
            )));
        }
        let layer = ObjectLayer(self.names.len() as u16);
        self.names.push(name.to_string());
        self.broad_phase.push(broad_phase);
        self.collides.push(0);
        Ok(layer)
    }

    /// Set whether two object layers collide (symmetric)
    pub fn set_collides(&mut self, a: ObjectLayer, b: ObjectLayer, collide: bool) {
        let (ia, ib) = (a.index(), b.index());
        if ia >= self.collides.len() || ib >= self.collides.len() {
            log::warn!("Ignoring collision rule for unknown layers {:?}/{:?}", a, b);
            return;
        }
        if collide {
            self.collides[ia] |= 1 << ib;
            self.collides[ib] |= 1 << ia;
        } else {
            self.collides[ia] &= !(1 << ib);
            self.collides[ib] &= !(1 << ia);
        }
    }

    /// Look up a layer by name
    pub fn layer(&self, name: &str) -> Option<ObjectLayer> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| ObjectLayer(i as u16))
    }

    /// Name of a layer
    pub fn name(&self, layer: ObjectLayer) -> Option<&str> {
        self.names.get(layer.index()).map(String::as_str)
    }

    /// Number of object layers
    pub fn layer_count(&self) -> usize {
        self.names.len()
    }

    /// Whether the layer exists in this table
    pub fn contains(&self, layer: ObjectLayer) -> bool {
        layer.index() < self.names.len()
    }

    /// Broad-phase layer of an object layer
    pub fn broad_phase_layer(&self, layer: ObjectLayer) -> Option<BroadPhaseLayer> {
        self.broad_phase.get(layer.index()).copied()
    }

    /// Check table consistency
    pub fn validate(&self) -> Result<()> {
        if self.names.is_empty() {
            return Err(PhysicsError::InvalidConfig("layer table has no layers".into()));
        }
        if self.names.len() != self.broad_phase.len() || self.names.len() != self.collides.len() {
            return Err(PhysicsError::InvalidConfig("layer table columns differ in length".into()));
        }
        for (i, row) in self.collides.iter().enumerate() {
            for j in 0..self.collides.len() {
                let ij = row & (1 << j) != 0;
                let ji = self.collides[j] & (1 << i) != 0;
                if ij != ji {
                    return Err(PhysicsError::InvalidConfig(format!(
                        "collision matrix is not symmetric for layers {i} and {j}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Snapshot the object-layer pair predicate
    pub fn pair_filter(&self) -> ObjectLayerPairFilter {
        ObjectLayerPairFilter {
            collides: self.collides.clone(),
        }
    }

    /// Snapshot the object-vs-broad-phase predicate
    pub fn broad_phase_filter(&self) -> ObjectVsBroadPhaseLayerFilter {
        let masks = self
            .collides
            .iter()
            .map(|row| {
                self.broad_phase
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| row & (1 << j) != 0)
                    .fold(0u32, |acc, (_, bp)| acc | bp.bit())
            })
            .collect();
        ObjectVsBroadPhaseLayerFilter { masks }
    }

    /// Rapier interaction groups for colliders on an object layer
    pub(crate) fn interaction_groups(&self, layer: ObjectLayer) -> rapier::InteractionGroups {
        let membership = self
            .broad_phase_layer(layer)
            .map(BroadPhaseLayer::bit)
            .unwrap_or(0);
        let filter = self
            .broad_phase_filter()
            .masks
            .get(layer.index())
            .copied()
            .unwrap_or(0);
        rapier::InteractionGroups::new(
            rapier::Group::from_bits_truncate(membership),
            rapier::Group::from_bits_truncate(filter),
        )
    }
}

/// Answers "can object layer A collide with object layer B?"
#[derive(Debug, Clone)]
pub struct ObjectLayerPairFilter {
    collides: Vec<u32>,
}

impl ObjectLayerPairFilter {
    pub fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
        self.collides
            .get(a.index())
            .map(|row| (b.index()) < MAX_OBJECT_LAYERS && row & (1 << b.0) != 0)
            .unwrap_or(false)
    }
}

/// Answers "can object layer A collide with anything in broad-phase layer B?"
#[derive(Debug, Clone)]
pub struct ObjectVsBroadPhaseLayerFilter {
    masks: Vec<u32>,
}

impl ObjectVsBroadPhaseLayerFilter {
    pub fn should_collide(&self, layer: ObjectLayer, broad_phase: BroadPhaseLayer) -> bool {
        self.masks
            .get(layer.index())
            .map(|mask| mask & broad_phase.bit() != 0)
            .unwrap_or(false)
    }
}

/// Rapier hooks running the object-layer pair filter
pub(crate) struct LayerPairHooks {
    pub(crate) filter: ObjectLayerPairFilter,
}

impl LayerPairHooks {
    fn allows(
        &self,
        colliders: &rapier::ColliderSet,
        h1: rapier::ColliderHandle,
        h2: rapier::ColliderHandle,
    ) -> bool {
        match (colliders.get(h1), colliders.get(h2)) {
            (Some(c1), Some(c2)) => {
                let l1 = crate::world::ColliderTag::from_user_data(c1.user_data).layer;
                let l2 = crate::world::ColliderTag::from_user_data(c2.user_data).layer;
                self.filter.should_collide(l1, l2)
            }
            _ => false,
        }
    }
}

impl rapier::PhysicsHooks for LayerPairHooks {
    fn filter_contact_pair(&self, context: &rapier::PairFilterContext) -> Option<rapier::SolverFlags> {
        if self.allows(context.colliders, context.collider1, context.collider2) {
            Some(rapier::SolverFlags::COMPUTE_IMPULSES)
        } else {
            None
        }
    }

    fn filter_intersection_pair(&self, context: &rapier::PairFilterContext) -> bool {
        self.allows(context.colliders, context.collider1, context.collider2)
    }
}
