//! # Error Types
//!
//! Every logic error the storage core can detect. Allocation failure is not
//! represented here: running out of memory aborts through
//! [`std::alloc::handle_alloc_error`].

use thiserror::Error;

use crate::ecs::{ComponentId, EntityId};

/// Errors raised by the storage, lifecycle and scheduling core.
#[derive(Error, Debug)]
pub enum EcsError {
    /// A component type was added twice to one entity.
    #[error("entity {entity:?} already has component {component}")]
    DuplicateComponent {
        /// The entity that already owns the component.
        entity: EntityId,
        /// Registered name of the component type.
        component: &'static str,
    },

    /// A component was removed or read but is not installed on the entity.
    #[error("entity {entity:?} has no component {component}")]
    MissingComponent {
        /// The entity that was queried.
        entity: EntityId,
        /// Registered name of the component type.
        component: &'static str,
    },

    /// A component id that was never handed out by the registry.
    #[error("component id {0:?} was never registered")]
    UnknownComponent(ComponentId),

    /// A component type that was never registered.
    #[error("component type {0} was never registered")]
    UnregisteredType(&'static str),

    /// A component name from a manifest that matches no registered type.
    #[error("no registered component is named {0:?}")]
    UnknownComponentName(String),

    /// First-time registration after the registry was frozen.
    #[error("type registry is frozen, cannot register {0}")]
    RegistryFrozen(&'static str),

    /// The component needs a stricter alignment than allocator blocks provide.
    #[error("component {component} requires alignment {align}, blocks are aligned to {max}")]
    UnsupportedAlignment {
        /// Registered name of the component type.
        component: &'static str,
        /// Alignment the type requires.
        align: usize,
        /// Alignment every block guarantees.
        max: usize,
    },

    /// A component was touched outside the declared read/write masks.
    #[error("access to component {component} is outside the declared read/write masks")]
    AccessViolation {
        /// Registered name of the component type.
        component: &'static str,
    },

    /// One query named the same component twice.
    #[error("component {component} appears more than once in a query")]
    ConflictingAccess {
        /// Registered name of the component type.
        component: &'static str,
    },

    /// The handle is stale, the sentinel, or was never spawned.
    #[error("entity {0:?} does not exist")]
    EntityNotFound(EntityId),

    /// The entity is already marked dead.
    #[error("entity {0:?} is no longer alive")]
    EntityNotAlive(EntityId),

    /// An allocator handle that does not address a live block.
    #[error("block {slot} in size class {size} is not a live allocation")]
    InvalidBlock {
        /// Byte size of the bucket.
        size: usize,
        /// Slot index inside the bucket.
        slot: u32,
    },

    /// A block was released twice.
    #[error("block {slot} in size class {size} was released twice")]
    DoubleRelease {
        /// Byte size of the bucket.
        size: usize,
        /// Slot index inside the bucket.
        slot: u32,
    },

    /// A timeline that was never declared.
    #[error("unknown timeline {0:?}")]
    UnknownTimeline(String),

    /// A system handle that is not installed.
    #[error("unknown system {0}")]
    UnknownSystem(u32),

    /// A manifest names a system the factory has no constructor for.
    #[error("no constructor registered for system {0:?}")]
    UnknownSystemName(String),

    /// A failure reported by a system's own logic.
    #[error("{0}")]
    System(String),

    /// A step was aborted; progress made before the failure is kept.
    #[error("step aborted on timeline {timeline:?} during {phase} ({origin}): {source}")]
    StepAborted {
        /// Timeline being stepped.
        timeline: String,
        /// Phase that failed.
        phase: &'static str,
        /// System name or command that failed.
        origin: String,
        /// The underlying failure.
        #[source]
        source: Box<EcsError>,
    },

    /// Configuration or manifest text is not valid TOML for its schema.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] toml::de::Error),

    /// Configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl EcsError {
    /// Builds a [`EcsError::System`] failure from a message.
    #[must_use]
    pub fn system(message: impl Into<String>) -> Self {
        Self::System(message.into())
    }
}

/// Result type for storage core operations.
pub type EcsResult<T> = Result<T, EcsError>;
