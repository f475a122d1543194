//! Error types for the physics integration layer

use thiserror::Error;

/// Which native world capacity limit was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    /// Number of bodies in the world
    Bodies,
    /// Number of broad-phase body pairs
    BodyPairs,
    /// Number of contact constraints (touching manifolds)
    ContactConstraints,
}

impl std::fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bodies => write!(f, "max bodies"),
            Self::BodyPairs => write!(f, "max body pairs"),
            Self::ContactConstraints => write!(f, "max contact constraints"),
        }
    }
}

/// Physics system errors
#[derive(Debug, Error)]
pub enum PhysicsError {
    /// Invalid configuration
    #[error("Invalid physics configuration: {0}")]
    InvalidConfig(String),

    /// Transform could not be decomposed into a physics pose
    #[error("Transform not convertible: {0}")]
    TransformConversion(String),

    /// Shape creation failed
    #[error("Failed to create collision shape: {0}")]
    ShapeConversion(String),

    /// A native world capacity limit was exceeded during a step
    #[error("Physics capacity exceeded: {kind} (limit {limit}, got {actual})")]
    CapacityExceeded {
        kind: CapacityKind,
        limit: usize,
        actual: usize,
    },

    /// Operation needs a driver or native world that is not available
    #[error("Missing dependency: {0}")]
    MissingDependency(&'static str),

    /// The native body referenced by a component no longer exists
    #[error("Native body not found")]
    BodyNotFound,

    /// The native character referenced by a controller no longer exists
    #[error("Native character not found")]
    CharacterNotFound,

    /// Something was initialized twice
    #[error("Already initialized: {0}")]
    AlreadyInitialized(&'static str),

    /// Job creation or queuing failed
    #[error("Job system failure: {0}")]
    JobSystem(String),

    /// Errors reported by a character contact delegate
    #[error("Character contact delegate reported {} error(s): {}", .0.len(), .0.join("; "))]
    Delegate(Vec<String>),

    /// Configuration could not be parsed
    #[error("Failed to parse physics configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl PhysicsError {
    /// Errors that resolve themselves once prerequisite state shows up.
    /// The driver logs these and retries on the next update.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransformConversion(_))
    }

    /// Configuration-capacity errors; not worth retrying.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Result type for physics operations
pub type Result<T> = std::result::Result<T, PhysicsError>;

/// Error type user delegates report back through contact callbacks
pub type DelegateError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for contact delegate callbacks
pub type DelegateResult<T> = std::result::Result<T, DelegateError>;
