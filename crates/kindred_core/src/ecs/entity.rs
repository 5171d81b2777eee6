//! # Entity Management
//!
//! Entities are identifiers consisting of:
//! - An index into the entity table
//! - A generation counter for safe reuse
//!
//! Each live index owns an [`EntityRecord`]: its ordered component list, the
//! interned capability mask derived from it, and the dirty/alive state the
//! world's refresh pass works from.

// SAFETY: EntityView dereferences component blocks owned by the record it borrows.
#![allow(unsafe_code)]

use super::component::{Component, ComponentId};
use super::mask::{ComponentMask, MaskHandle};
use super::registry::TypeRegistry;
use crate::error::{EcsError, EcsResult};
use crate::memory::{BlockHandle, SizeClassPool};

/// Unique identifier for an entity.
///
/// The ID is split into two parts:
/// - Lower 32 bits: Index into the entity table
/// - Upper 32 bits: Generation counter for detecting stale references
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Creates a new entity ID from index and generation.
    ///
    /// # Arguments
    ///
    /// * `index` - The index into the entity table
    /// * `generation` - The generation counter
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64))
    }

    /// Returns the index portion of the entity ID.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Returns the generation portion of the entity ID.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Placeholder for an entity that was never spawned.
    pub const NULL: Self = Self(u64::MAX);

    /// Checks if this entity ID is the placeholder.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::NULL
    }
}

/// Lifecycle state of an entity record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityState {
    /// Created, not yet integrated into any family.
    Pending,
    /// Integrated; member of zero or more families.
    Active,
    /// Marked for destruction, awaiting removal.
    Dead,
}

/// Storage-side state of one entity.
///
/// Opaque outside the crate; queries receive it to fetch their blocks.
pub struct EntityRecord {
    /// The entity's own handle.
    pub(crate) id: EntityId,
    /// Lifecycle state.
    pub(crate) state: EntityState,
    /// Set when the component list changed since the last refresh.
    pub(crate) dirty: bool,
    /// Installed components in insertion order. Type ids are unique.
    pub(crate) components: Vec<(ComponentId, BlockHandle)>,
    /// Interned mask as of the last refresh.
    pub(crate) mask: MaskHandle,
}

impl EntityRecord {
    /// Creates a pending record with no components.
    #[must_use]
    pub(crate) fn new(id: EntityId) -> Self {
        Self {
            id,
            state: EntityState::Pending,
            dirty: false,
            components: Vec::new(),
            mask: MaskHandle::EMPTY,
        }
    }

    /// Returns `true` unless the entity is marked dead.
    #[inline]
    #[must_use]
    pub(crate) fn is_alive(&self) -> bool {
        self.state != EntityState::Dead
    }

    /// Returns the block of component `id`, if installed.
    #[inline]
    #[must_use]
    pub(crate) fn block_of(&self, id: ComponentId) -> Option<BlockHandle> {
        self.components
            .iter()
            .find_map(|&(cid, handle)| (cid == id).then_some(handle))
    }

    /// OR of the bits of every installed component.
    #[must_use]
    pub(crate) fn compute_mask(&self) -> ComponentMask {
        self.components.iter().map(|&(cid, _)| cid).collect()
    }
}

/// Hands out entity indices and tracks their generations.
///
/// Kept apart from the record table so deferred spawns can reserve ids while
/// records are borrowed for iteration.
#[derive(Default)]
pub(crate) struct EntityAllocator {
    /// Current generation per index.
    generations: Vec<u32>,
    /// Indices free for reuse.
    free_indices: Vec<u32>,
}

impl EntityAllocator {
    /// Pre-reserves room for `capacity` indices.
    #[must_use]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            generations: Vec::with_capacity(capacity),
            free_indices: Vec::new(),
        }
    }

    /// Reserves a fresh id.
    pub(crate) fn reserve(&mut self) -> EntityId {
        if let Some(index) = self.free_indices.pop() {
            return EntityId::new(index, self.generations[index as usize]);
        }
        let index = u32::try_from(self.generations.len())
            .ok()
            .filter(|&i| i != u32::MAX)
            .unwrap_or_else(|| unreachable!("entity index space exhausted"));
        self.generations.push(0);
        EntityId::new(index, 0)
    }

    /// Invalidates `id` and makes its index reusable.
    pub(crate) fn release(&mut self, id: EntityId) {
        let index = id.index() as usize;
        if self.generations.get(index) == Some(&id.generation()) {
            // Increment generation to invalidate old references
            self.generations[index] = id.generation().wrapping_add(1);
            self.free_indices.push(id.index());
        }
    }
}

/// Records indexed by entity index.
#[derive(Default)]
pub(crate) struct EntityTable {
    slots: Vec<Option<EntityRecord>>,
    len: usize,
}

impl EntityTable {
    /// Pre-reserves `capacity` slots.
    #[must_use]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            len: 0,
        }
    }

    /// Stores a record at its id's index.
    pub(crate) fn insert(&mut self, record: EntityRecord) {
        let index = record.id.index() as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        if self.slots[index].replace(record).is_none() {
            self.len += 1;
        }
    }

    /// Returns the record if `id` is current.
    #[must_use]
    pub(crate) fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        if id.is_null() {
            return None;
        }
        self.slots
            .get(id.index() as usize)?
            .as_ref()
            .filter(|record| record.id == id)
    }

    /// Returns the record mutably if `id` is current.
    pub(crate) fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        if id.is_null() {
            return None;
        }
        self.slots
            .get_mut(id.index() as usize)?
            .as_mut()
            .filter(|record| record.id == id)
    }

    /// Takes the record out of the table.
    pub(crate) fn remove(&mut self, id: EntityId) -> Option<EntityRecord> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.as_ref().is_some_and(|record| record.id == id) {
            self.len -= 1;
            slot.take()
        } else {
            None
        }
    }

    /// Iterates over every stored record.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Takes every record out of the table.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = EntityRecord> + '_ {
        self.len = 0;
        self.slots.drain(..).flatten()
    }

    /// Number of stored records, in any state.
    #[inline]
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// Read-only typed access to one entity's components.
///
/// Views handed to a system's notifications are scoped to the binding's
/// declared read/write masks; touching anything else is an
/// [`EcsError::AccessViolation`].
pub struct EntityView<'w> {
    record: &'w EntityRecord,
    pool: &'w SizeClassPool,
    registry: &'w TypeRegistry,
    allowed: Option<&'w ComponentMask>,
}

impl<'w> EntityView<'w> {
    /// Creates a view; `allowed` restricts which components may be read.
    pub(crate) fn new(
        record: &'w EntityRecord,
        pool: &'w SizeClassPool,
        registry: &'w TypeRegistry,
        allowed: Option<&'w ComponentMask>,
    ) -> Self {
        Self {
            record,
            pool,
            registry,
            allowed,
        }
    }

    /// Returns the entity handle.
    #[inline]
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.record.id
    }

    /// Returns the lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> EntityState {
        self.record.state
    }

    /// Returns `true` if `T` is installed (and visible through this view).
    #[must_use]
    pub fn has<T: Component>(&self) -> bool {
        self.registry.id_of::<T>().is_some_and(|id| {
            self.allowed.map_or(true, |mask| mask.contains(id)) && self.record.block_of(id).is_some()
        })
    }

    /// Reads component `T`.
    ///
    /// # Errors
    ///
    /// - [`EcsError::UnregisteredType`] if `T` was never registered
    /// - [`EcsError::AccessViolation`] if `T` is outside this view's masks
    /// - [`EcsError::MissingComponent`] if the entity has no `T`
    pub fn get<T: Component>(&self) -> EcsResult<&'w T> {
        let id = self.registry.require::<T>()?;
        if let Some(mask) = self.allowed {
            if !mask.contains(id) {
                return Err(EcsError::AccessViolation { component: T::NAME });
            }
        }
        let handle = self.record.block_of(id).ok_or(EcsError::MissingComponent {
            entity: self.record.id,
            component: T::NAME,
        })?;
        let ptr = self.pool.block_ptr(handle)?;
        // SAFETY: the block holds the T registered under `id`, and it cannot be
        // released while the record is borrowed.
        Ok(unsafe { &*ptr.cast::<T>().as_ptr() })
    }

    /// Returns the installed component ids in insertion order.
    pub fn component_ids(&self) -> impl Iterator<Item = ComponentId> + 'w {
        self.record.components.iter().map(|&(id, _)| id)
    }
}

/// Snapshot of an entity for inspectors and tooling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityInfo {
    /// The entity handle.
    pub id: EntityId,
    /// Lifecycle state.
    pub state: EntityState,
    /// Whether a refresh is pending.
    pub dirty: bool,
    /// Installed component names in insertion order.
    pub components: Vec<&'static str>,
}
