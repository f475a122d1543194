//! Void Dynamics - Rapier 3D integration for Void Engine scenes
//!
//! This crate binds a Rapier simulation to an entity scene: a fixed-step
//! driver running its steps as jobs, rigid body and virtual character
//! components that create their native objects lazily, and a collision
//! pipeline publishing Enter/Stay/Exit events.
//!
//! # Features
//!
//! - Fixed-step accumulator with per-step updaters
//! - Rigid bodies (static, dynamic, kinematic) with deferred creation
//! - Virtual characters with ground detection and contact delegates
//! - Object and broad-phase layer filtering
//! - Raycasts and overlap queries in engine space
//! - Capacity limits enforced every step
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                   PhysicsSystem                   │
//! │  ┌────────────┐  ┌────────────┐  ┌─────────────┐  │
//! │  │ JobSystem  │  │ Accumulator│  │   Tracker   │  │
//! │  └────────────┘  └────────────┘  └─────────────┘  │
//! │  ┌─────────────────────────────────────────────┐  │
//! │  │      Arc<Mutex<PhysicsWorld>> (Rapier)      │  │
//! │  └─────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────┘
//!                  │ Weak           │ Weak
//!                  ▼                ▼
//!           ┌─────────────┐  ┌─────────────────────┐
//!           │ PhysicsBody │  │ CharacterController │
//!           └─────────────┘  └─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use void_dynamics::prelude::*;
//!
//! let mut scene = Scene::new();
//! let mut physics = PhysicsSystem::new(PhysicsConfig::default());
//! physics.init(&mut scene)?;
//!
//! scene.spawn((
//!     Transform::from_translation(Vec3::new(0.0, 10.0, 0.0)),
//!     PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5))),
//! ));
//!
//! // Once per frame
//! physics.update(&mut scene, 1.0 / 60.0)?;
//! ```

pub mod body;
pub mod character;
pub mod config;
pub mod convert;
pub mod error;
pub mod events;
pub mod jobs;
pub mod layers;
pub mod material;
pub mod query;
pub mod scene;
pub mod shape;
pub mod system;
pub mod world;

pub mod prelude {
    //! Common imports for physics functionality
    pub use crate::body::{AxisLocks, BodyDefinition, BodyState, CharacterBodyDef, MotionType, PhysicsBody, RigidBodyDef};
    pub use crate::character::{
        CharacterContact, CharacterContactDelegate, CharacterController, CharacterDef, ContactDelegate,
        ContactSettings, GroundInfo, GroundState,
    };
    pub use crate::config::PhysicsConfig;
    pub use crate::convert::{convert_transform, Bounds, PhysicsTransform};
    pub use crate::error::{DelegateError, DelegateResult, PhysicsError, Result};
    pub use crate::events::{CollisionEvent, CollisionEventKind, CollisionListener, CollisionManifold, EventCollector};
    pub use crate::jobs::{InlineExecutor, JobSystem, RayonExecutor, TaskExecutor};
    pub use crate::layers::{BroadPhaseLayer, LayerMask, LayerTable, ObjectLayer};
    pub use crate::material::{CombineRule, PhysicsMaterial};
    pub use crate::query::{RaycastHit, RaycastOptions};
    pub use crate::scene::{EntityTransform, Parent, Scene, Transform};
    pub use crate::shape::ShapeDesc;
    pub use crate::system::{FrameStats, ListenerId, PhysicsSystem, PhysicsUpdater, UpdaterId};
    pub use crate::world::{BodyId, CharacterHandle, PhysicsWorld, WorldStats};
    pub use glam::{Mat4, Quat, Vec3};
}

pub use prelude::*;
