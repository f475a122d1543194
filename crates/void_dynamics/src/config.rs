//! Physics configuration

use crate::error::{PhysicsError, Result};
use crate::layers::LayerTable;
use serde::{Deserialize, Serialize};

/// Physics world configuration, read once when the driver initializes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Gravity vector in engine space (default: -9.81 in Y)
    pub gravity: [f32; 3],

    /// Fixed timestep consumed by the accumulator
    pub fixed_step: f32,

    /// Native sub-steps per fixed step
    pub collision_steps: u32,

    /// Maximum number of bodies the native world may hold
    pub max_bodies: usize,

    /// Maximum number of broad-phase body pairs per step
    pub max_body_pairs: usize,

    /// Maximum number of touching contact manifolds per step
    pub max_contact_constraints: usize,

    /// Maximum number of concurrently alive job barriers
    pub max_barriers: usize,

    /// Worker threads for the default executor (0 = one per core)
    pub worker_threads: usize,

    /// Half extent of plane shapes that don't specify one
    pub default_plane_half_extent: f32,

    /// Thickness of the slab backing plane shapes
    pub default_plane_thickness: f32,

    /// Enable continuous collision detection on dynamic bodies
    pub ccd_enabled: bool,

    /// Solver iterations for velocity
    pub velocity_iterations: usize,

    /// Enable sleeping for inactive bodies
    pub sleeping_enabled: bool,

    /// Object layers, broad-phase mapping and collision matrix
    pub layers: LayerTable,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, -9.81, 0.0],
            fixed_step: 1.0 / 60.0,
            collision_steps: 1,
            max_bodies: 10_240,
            max_body_pairs: 65_536,
            max_contact_constraints: 10_240,
            max_barriers: 8,
            worker_threads: 0,
            default_plane_half_extent: 1000.0,
            default_plane_thickness: 1.0,
            ccd_enabled: false,
            velocity_iterations: 4,
            sleeping_enabled: true,
            layers: LayerTable::default(),
        }
    }
}

impl PhysicsConfig {
    /// Parse a configuration from JSON; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every limit and step parameter is usable
    pub fn validate(&self) -> Result<()> {
        if !(self.fixed_step.is_finite() && self.fixed_step > 0.0) {
            return Err(PhysicsError::InvalidConfig(format!(
                "fixed_step must be positive, got {}",
                self.fixed_step
            )));
        }
        if self.collision_steps == 0 {
            return Err(PhysicsError::InvalidConfig("collision_steps must be at least 1".into()));
        }
        if self.max_bodies == 0 || self.max_body_pairs == 0 || self.max_contact_constraints == 0 {
            return Err(PhysicsError::InvalidConfig("capacity limits must be non-zero".into()));
        }
        if self.max_barriers == 0 {
            return Err(PhysicsError::InvalidConfig("max_barriers must be at least 1".into()));
        }
        if self.velocity_iterations == 0 {
            return Err(PhysicsError::InvalidConfig("velocity_iterations must be at least 1".into()));
        }
        if self.gravity.iter().any(|g| !g.is_finite()) {
            return Err(PhysicsError::InvalidConfig("gravity must be finite".into()));
        }
        if self.default_plane_half_extent <= 0.0 || self.default_plane_thickness <= 0.0 {
            return Err(PhysicsError::InvalidConfig("plane dimensions must be positive".into()));
        }
        self.layers.validate()
    }

    /// Set gravity
    pub fn with_gravity(mut self, x: f32, y: f32, z: f32) -> Self {
        self.gravity = [x, y, z];
        self
    }

    /// Set the fixed step and native sub-step count
    pub fn with_fixed_step(mut self, fixed_step: f32, collision_steps: u32) -> Self {
        self.fixed_step = fixed_step;
        self.collision_steps = collision_steps;
        self
    }

    /// Set the native world capacity limits
    pub fn with_capacity(mut self, max_bodies: usize, max_body_pairs: usize, max_contact_constraints: usize) -> Self {
        self.max_bodies = max_bodies;
        self.max_body_pairs = max_body_pairs;
        self.max_contact_constraints = max_contact_constraints;
        self
    }

    /// Set the layer table
    pub fn with_layers(mut self, layers: LayerTable) -> Self {
        self.layers = layers;
        self
    }
}
