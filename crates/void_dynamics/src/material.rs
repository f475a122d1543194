//! Surface materials for rigid bodies

use rapier3d::prelude as rapier;
use serde::{Deserialize, Serialize};

/// Friction, restitution and density of a body's collider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsMaterial {
    /// Friction coefficient (0 = frictionless)
    pub friction: f32,
    /// Bounciness (0 = none, 1 = perfectly elastic)
    pub restitution: f32,
    /// Density used to derive mass (kg/m³)
    pub density: f32,
    pub friction_combine: CombineRule,
    pub restitution_combine: CombineRule,
}

impl Default for PhysicsMaterial {
    fn default() -> Self {
        Self {
            friction: 0.2,
            restitution: 0.0,
            density: 1000.0,
            friction_combine: CombineRule::Average,
            restitution_combine: CombineRule::Average,
        }
    }
}

impl PhysicsMaterial {
    pub fn new(friction: f32, restitution: f32) -> Self {
        Self {
            friction,
            restitution,
            ..Default::default()
        }
    }

    /// Low friction
    pub fn ice() -> Self {
        Self::new(0.02, 0.05).with_friction_combine(CombineRule::Min)
    }

    /// High restitution
    pub fn rubber() -> Self {
        Self::new(0.9, 0.8).with_restitution_combine(CombineRule::Max)
    }

    pub fn with_friction(mut self, friction: f32) -> Self {
        self.friction = friction.max(0.0);
        self
    }

    pub fn with_restitution(mut self, restitution: f32) -> Self {
        self.restitution = restitution.clamp(0.0, 1.0);
        self
    }

    pub fn with_density(mut self, density: f32) -> Self {
        self.density = density.max(1.0e-3);
        self
    }

    pub fn with_friction_combine(mut self, rule: CombineRule) -> Self {
        self.friction_combine = rule;
        self
    }

    pub fn with_restitution_combine(mut self, rule: CombineRule) -> Self {
        self.restitution_combine = rule;
        self
    }

    /// Effective friction between two materials, as the solver computes it
    pub fn combined_friction(&self, other: &Self) -> f32 {
        self.friction_combine
            .max(other.friction_combine)
            .combine(self.friction, other.friction)
    }

    /// Effective restitution between two materials
    pub fn combined_restitution(&self, other: &Self) -> f32 {
        self.restitution_combine
            .max(other.restitution_combine)
            .combine(self.restitution, other.restitution)
    }

    /// Apply the material to a collider under construction
    pub(crate) fn apply(&self, builder: rapier::ColliderBuilder) -> rapier::ColliderBuilder {
        builder
            .friction(self.friction)
            .restitution(self.restitution)
            .density(self.density)
            .friction_combine_rule(self.friction_combine.into())
            .restitution_combine_rule(self.restitution_combine.into())
    }
}

/// How a property is combined between two touching colliders.
///
/// When the two sides disagree, the rule declared later wins
/// (`Average < Min < Multiply < Max`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CombineRule {
    #[default]
    Average,
    Min,
    Multiply,
    Max,
}

impl CombineRule {
    pub fn combine(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Average => (a + b) * 0.5,
            Self::Min => a.min(b),
            Self::Multiply => a * b,
            Self::Max => a.max(b),
        }
    }
}

impl From<CombineRule> for rapier::CoefficientCombineRule {
    fn from(rule: CombineRule) -> Self {
        match rule {
            CombineRule::Average => Self::Average,
            CombineRule::Min => Self::Min,
            CombineRule::Multiply => Self::Multiply,
            CombineRule::Max => Self::Max,
        }
    }
}
