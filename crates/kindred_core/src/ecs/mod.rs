//! # Entity Component System
//!
//! Type-erased component storage with capability-based subscriptions.
//!
//! ## Design Philosophy
//!
//! - Component types are registered once and identified by dense ids
//! - Component values live in size-class blocks and are only ever dropped
//!   through the registry's destructor thunks
//! - Families are interned by capability mask and kept current by refreshing
//!   dirty entities once per step, never by rescanning
//! - Systems see a family through an access-scoped binding and mutate the
//!   world only through deferred commands

mod commands;
mod component;
mod entity;
mod family;
mod mask;
mod query;
mod registry;
mod system;
mod world;

pub use component::{Component, ComponentId};
pub use entity::{EntityId, EntityInfo, EntityRecord, EntityState, EntityView};
pub use family::{Family, FamilyCallback, FamilyEvent, FamilyId, ListenerId};
pub use mask::{ComponentMask, MaskHandle, MaskIter, MaskTable};
pub use query::{Access, FamilyBinding, Query, QueryParam, Read, Write};
pub use registry::{ComponentInfo, Destructor, TypeRegistry};
pub use system::{BindingInfo, QueryItem, StepContext, System, SystemId};
pub use world::{StepPhase, StepReport, World};
