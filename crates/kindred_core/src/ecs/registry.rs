//! # Type Registry
//!
//! Maps each component type to a dense [`ComponentId`] and to the metadata the
//! type-erased storage needs: byte size for routing allocations, and the
//! destructor thunk that is the only way a component is ever dropped.
//!
//! The registry is an explicit value owned by the world. It can be filled
//! from a closed list at startup and then frozen, or filled lazily the first
//! time each type is used.

// SAFETY: Destructor thunks drop values in place through raw block pointers.
#![allow(unsafe_code)]

use std::any::TypeId;
use std::collections::HashMap;
use std::ptr::NonNull;

use super::component::{Component, ComponentId};
use crate::error::{EcsError, EcsResult};
use crate::memory::BLOCK_ALIGN;

/// A type-erased destructor for one registered component type.
#[derive(Clone, Copy, Debug)]
pub struct Destructor(unsafe fn(NonNull<u8>));

impl Destructor {
    /// Drops the component stored at `ptr` in place.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized value of the type this destructor
    /// was registered for, and that value must not be used or dropped again.
    #[inline]
    pub unsafe fn run(self, ptr: NonNull<u8>) {
        // SAFETY: forwarded to the caller.
        unsafe { (self.0)(ptr) }
    }
}

/// Drops a `T` in place.
unsafe fn drop_thunk<T>(ptr: NonNull<u8>) {
    // SAFETY: the registry only pairs this thunk with blocks holding a `T`.
    unsafe { std::ptr::drop_in_place(ptr.cast::<T>().as_ptr()) }
}

/// Metadata recorded for one component type.
#[derive(Clone, Copy, Debug)]
pub struct ComponentInfo {
    /// Dense id, also the mask bit.
    pub id: ComponentId,
    /// Stable name from [`Component::NAME`].
    pub name: &'static str,
    /// Rust type identity.
    pub type_id: TypeId,
    /// Size in bytes, used to pick the size class.
    pub size: usize,
    /// Alignment in bytes.
    pub align: usize,
    /// Destructor thunk.
    pub destructor: Destructor,
}

impl ComponentInfo {
    /// Builds the record for `T`.
    fn of<T: Component>(id: ComponentId) -> Self {
        Self {
            id,
            name: T::NAME,
            type_id: TypeId::of::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            destructor: Destructor(drop_thunk::<T>),
        }
    }
}

/// Process-independent table of component types.
///
/// # Example
///
/// ```rust,ignore
/// let mut registry = TypeRegistry::new();
/// let position = registry.register::<Position>()?;
/// assert_eq!(registry.register::<Position>()?, position); // idempotent
/// registry.freeze();
/// ```
#[derive(Default)]
pub struct TypeRegistry {
    /// Records indexed by component id.
    infos: Vec<ComponentInfo>,
    /// Rust type to id.
    by_type: HashMap<TypeId, ComponentId>,
    /// Stable name to id.
    by_name: HashMap<&'static str, ComponentId>,
    /// Rejects first-time registrations when set.
    frozen: bool,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`, returning its id.
    ///
    /// Calling this again for the same type returns the same id and does
    /// nothing else.
    ///
    /// # Errors
    ///
    /// - [`EcsError::RegistryFrozen`] on first registration after [`freeze`](Self::freeze)
    /// - [`EcsError::UnsupportedAlignment`] if `T` needs more than block alignment
    pub fn register<T: Component>(&mut self) -> EcsResult<ComponentId> {
        if let Some(&id) = self.by_type.get(&TypeId::of::<T>()) {
            return Ok(id);
        }

        if self.frozen {
            return Err(EcsError::RegistryFrozen(T::NAME));
        }

        let align = std::mem::align_of::<T>();
        if align > BLOCK_ALIGN {
            return Err(EcsError::UnsupportedAlignment {
                component: T::NAME,
                align,
                max: BLOCK_ALIGN,
            });
        }

        let index = u32::try_from(self.infos.len()).map_err(|_| EcsError::RegistryFrozen(T::NAME))?;
        let id = ComponentId::new(index);
        let info = ComponentInfo::of::<T>(id);

        if self.by_name.insert(T::NAME, id).is_some() {
            tracing::warn!(name = T::NAME, "component name registered by two types");
        }
        self.by_type.insert(info.type_id, id);
        self.infos.push(info);

        tracing::debug!(name = T::NAME, id = index, size = info.size, "component registered");
        Ok(id)
    }

    /// Prevents any further first-time registration.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Returns `true` once [`freeze`](Self::freeze) was called.
    #[inline]
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns the id of `T` if it is registered.
    #[must_use]
    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Returns the id of `T`.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnregisteredType`] if `T` was never registered.
    pub fn require<T: Component>(&self) -> EcsResult<ComponentId> {
        self.id_of::<T>().ok_or(EcsError::UnregisteredType(T::NAME))
    }

    /// Looks up a component id by its stable name.
    #[must_use]
    pub fn id_by_name(&self, name: &str) -> Option<ComponentId> {
        self.by_name.get(name).copied()
    }

    /// Returns the record for `id`.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownComponent`] if the id was never handed out.
    pub fn info(&self, id: ComponentId) -> EcsResult<&ComponentInfo> {
        self.infos.get(id.index()).ok_or(EcsError::UnknownComponent(id))
    }

    /// Returns the destructor registered for `id`.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownComponent`] if the id was never handed out.
    pub fn destructor_for(&self, id: ComponentId) -> EcsResult<Destructor> {
        self.info(id).map(|info| info.destructor)
    }

    /// Returns the byte size registered for `id`.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownComponent`] if the id was never handed out.
    pub fn size_for(&self, id: ComponentId) -> EcsResult<usize> {
        self.info(id).map(|info| info.size)
    }

    /// Returns the registered name for `id`, or `"<unknown>"`.
    #[must_use]
    pub fn name_of(&self, id: ComponentId) -> &'static str {
        self.infos.get(id.index()).map_or("<unknown>", |info| info.name)
    }

    /// Returns the number of registered types.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Returns `true` if nothing is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Iterates over every record in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.iter()
    }
}
