//! # Kindred Core
//!
//! Entity/component storage core for real-time engines:
//! - Size-class block allocation for components, no per-component heap traffic
//! - Capability-mask families kept current incrementally
//! - Timeline-scheduled systems over access-scoped family bindings
//!
//! ## Architecture Rules
//!
//! 1. **One destruction path** - components are dropped only through the
//!    type registry's destructor thunks
//! 2. **Membership settles before systems run** - families change only in
//!    the refresh phase of a step
//! 3. **Steps are isolated** - structural changes made by systems apply at
//!    the start of the next step
//!
//! ## Example
//!
//! ```rust,ignore
//! use kindred_core::{World, WorldConfig};
//!
//! let mut world = World::new(WorldConfig::default());
//! let entity = world.create_entity();
//! world.add_component(entity, Health(100))?;
//! world.step("fixed", 1.0 / 60.0)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod ecs;
pub mod error;
pub mod memory;

pub use config::{SystemDeclaration, SystemFactory, SystemManifest, WorldConfig};
pub use ecs::{
    Component, ComponentId, ComponentMask, EntityId, EntityInfo, EntityState, EntityView, Family,
    FamilyEvent, FamilyId, ListenerId, Query, QueryItem, Read, StepContext, StepReport, System,
    SystemId, TypeRegistry, World, Write,
};
pub use error::{EcsError, EcsResult};
pub use memory::{BlockHandle, BucketStats, PooledComponent, SizeClassBucket, SizeClassPool};
