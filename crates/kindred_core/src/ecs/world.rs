//! # ECS World
//!
//! Owns every entity, the interned families, and the per-timeline system
//! lists, and drives the step state machine:
//!
//! 1. **SpawnPending**: apply commands recorded last step, then activate
//!    entities created since the previous step
//! 2. **Refresh**: recompute dirty masks, update family membership and fire
//!    notifications
//! 3. **Update**: run the timeline's systems in registration order
//! 4. **DestroyPending**: destroy dead entities' components and recycle ids
//!
//! Family membership only changes in phase 2, so every system of a step
//! sees the same membership.

// SAFETY: components are dropped through registry destructor thunks and
// handed out as references into pool blocks owned by entity records.
#![allow(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, debug_span, trace, warn};

use super::commands::{Command, CommandQueue};
use super::component::{Component, ComponentId};
use super::entity::{
    EntityAllocator, EntityId, EntityInfo, EntityRecord, EntityState, EntityTable, EntityView,
};
use super::family::{Family, FamilyEvent, FamilyId, ListenerId, ListenerTarget};
use super::mask::{ComponentMask, MaskHandle, MaskTable};
use super::query::{Access, FamilyBinding, Query};
use super::registry::TypeRegistry;
use super::system::{AnySystem, BindingInfo, BoundSystem, StepContext, System, SystemId};
use crate::config::{SystemFactory, SystemManifest, WorldConfig};
use crate::error::{EcsError, EcsResult};
use crate::memory::{BlockHandle, PooledComponent, SizeClassPool};

/// Phases of one [`World::step`], in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPhase {
    /// Deferred commands and newly created entities are integrated.
    SpawnPending,
    /// Dirty masks are recomputed and family membership settles.
    Refresh,
    /// Systems run.
    Update,
    /// Dead entities are destroyed.
    DestroyPending,
}

impl StepPhase {
    /// Returns the phase name used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SpawnPending => "SpawnPending",
            Self::Refresh => "Refresh",
            Self::Update => "Update",
            Self::DestroyPending => "DestroyPending",
        }
    }
}

/// Counters from one completed step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Step number, starting at 1.
    pub step: u64,
    /// Deferred commands applied.
    pub commands: usize,
    /// Entities moved from pending to active.
    pub spawned: usize,
    /// Dirty entities refreshed.
    pub refreshed: usize,
    /// Family joins.
    pub added: usize,
    /// Family departures.
    pub removed: usize,
    /// Members whose mask changed but still match.
    pub modified: usize,
    /// Systems run.
    pub systems: usize,
    /// Entities physically destroyed.
    pub destroyed: usize,
}

/// A membership change waiting to be dispatched.
#[derive(Clone, Copy, Debug)]
struct Notification {
    family: FamilyId,
    event: FamilyEvent,
    entity: EntityId,
}

/// An installed system and what it registered.
struct SystemSlot {
    timeline: String,
    system: Box<dyn AnySystem>,
    listeners: [ListenerId; 2],
}

/// The container for all entity state and the systems that update it.
///
/// # Example
///
/// ```rust,ignore
/// let mut world = World::new(WorldConfig::default());
///
/// let entity = world.create_entity();
/// world.add_component(entity, Position::default())?;
/// world.add_system("fixed", Integrate)?;
///
/// world.step("fixed", 1.0 / 60.0)?;
/// ```
pub struct World {
    config: WorldConfig,
    registry: TypeRegistry,
    pool: Arc<SizeClassPool>,
    masks: MaskTable,

    // =========================================================================
    // Entities
    // =========================================================================
    ids: EntityAllocator,
    entities: EntityTable,
    /// Created, waiting for the next SpawnPending phase.
    pending: Vec<EntityId>,
    /// Waiting for the next refresh. Each entity appears once.
    dirty: Vec<EntityId>,
    /// Dead and out of every family, waiting for DestroyPending.
    graveyard: Vec<EntityId>,

    // =========================================================================
    // Families
    // =========================================================================
    families: Vec<Family>,
    family_index: HashMap<MaskHandle, FamilyId>,
    next_listener: u64,

    // =========================================================================
    // Scheduling
    // =========================================================================
    timelines: HashMap<String, Vec<SystemId>>,
    systems: Vec<Option<SystemSlot>>,
    commands: CommandQueue,
    step_count: u64,
}

impl World {
    /// Creates a world with a fresh registry.
    #[must_use]
    pub fn new(config: WorldConfig) -> Self {
        Self::with_registry(config, TypeRegistry::new())
    }

    /// Creates a world around a pre-filled registry.
    ///
    /// The registry is frozen when `config.freeze_registry` is set.
    ///
    /// # Panics
    ///
    /// Panics if `config.blocks_per_page` is zero.
    #[must_use]
    pub fn with_registry(config: WorldConfig, mut registry: TypeRegistry) -> Self {
        if config.freeze_registry {
            registry.freeze();
        }

        let timelines = config
            .timelines
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        debug!(
            blocks_per_page = config.blocks_per_page,
            entity_capacity = config.entity_capacity,
            components = registry.len(),
            "world created"
        );

        Self {
            pool: Arc::new(SizeClassPool::new(config.blocks_per_page)),
            registry,
            masks: MaskTable::new(),
            ids: EntityAllocator::with_capacity(config.entity_capacity),
            entities: EntityTable::with_capacity(config.entity_capacity),
            pending: Vec::new(),
            dirty: Vec::new(),
            graveyard: Vec::new(),
            families: Vec::new(),
            family_index: HashMap::new(),
            next_listener: 0,
            timelines,
            systems: Vec::new(),
            commands: CommandQueue::default(),
            step_count: 0,
            config,
        }
    }

    /// Returns the configuration the world was built with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Returns the type registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Registers component type `T`.
    ///
    /// # Errors
    ///
    /// See [`TypeRegistry::register`].
    pub fn register<T: Component>(&mut self) -> EcsResult<ComponentId> {
        self.registry.register::<T>()
    }

    /// Closes the registry to new component types.
    pub fn freeze_registry(&mut self) {
        self.registry.freeze();
    }

    /// Returns a shared handle to the component pool, for building
    /// [`PooledComponent`]s on other threads.
    #[must_use]
    pub fn pool(&self) -> Arc<SizeClassPool> {
        Arc::clone(&self.pool)
    }

    /// Returns the number of steps started so far.
    #[inline]
    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Declares a timeline. Returns `false` if it already existed.
    pub fn add_timeline(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.timelines.contains_key(&name) {
            return false;
        }
        self.timelines.insert(name, Vec::new());
        true
    }

    /// Checks whether a timeline is declared.
    #[must_use]
    pub fn has_timeline(&self, name: &str) -> bool {
        self.timelines.contains_key(name)
    }

    // =========================================================================
    // Entity lifecycle
    // =========================================================================

    /// Creates an entity in the pending state.
    ///
    /// Components can be added right away; the entity joins families during
    /// the next step.
    pub fn create_entity(&mut self) -> EntityId {
        let entity = self.ids.reserve();
        self.spawn_reserved(entity);
        entity
    }

    /// Creates the record for an id reserved by a step context.
    pub(crate) fn spawn_reserved(&mut self, entity: EntityId) {
        self.entities.insert(EntityRecord::new(entity));
        self.pending.push(entity);
        trace!(?entity, "entity created");
    }

    /// Marks an entity dead.
    ///
    /// It leaves every family at the next refresh and its components are
    /// destroyed right after the notifications fire.
    ///
    /// # Errors
    ///
    /// - [`EcsError::EntityNotFound`] for a stale or unknown handle
    /// - [`EcsError::EntityNotAlive`] if it is already dead
    pub fn destroy_entity(&mut self, entity: EntityId) -> EcsResult<()> {
        let record = self
            .entities
            .get_mut(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        if !record.is_alive() {
            return Err(EcsError::EntityNotAlive(entity));
        }
        record.state = EntityState::Dead;
        mark_dirty(record, &mut self.dirty);
        trace!(?entity, "entity marked dead");
        Ok(())
    }

    /// Applies a recorded destroy. An entity already marked dead, by this or
    /// an earlier command of the same batch, is left as it is.
    pub(crate) fn destroy_deferred(&mut self, entity: EntityId) -> EcsResult<()> {
        match self.destroy_entity(entity) {
            Err(EcsError::EntityNotAlive(_)) => {
                trace!(?entity, "entity already marked dead");
                Ok(())
            }
            result => result,
        }
    }

    /// Returns `true` if the handle is current and not marked dead.
    #[must_use]
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.get(entity).is_some_and(EntityRecord::is_alive)
    }

    /// Returns the number of entities not marked dead, pending included.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.iter().filter(|record| record.is_alive()).count()
    }

    /// Adds `value` to `entity`, registering `T` on first use.
    ///
    /// # Errors
    ///
    /// - [`EcsError::EntityNotFound`] / [`EcsError::EntityNotAlive`]
    /// - [`EcsError::DuplicateComponent`] if `T` is already installed
    /// - registry errors for a first-time `T`
    pub fn add_component<T: Component>(&mut self, entity: EntityId, value: T) -> EcsResult<()> {
        let id = self.prepare_insert::<T>(entity)?;
        let handle = PooledComponent::new_in(&self.pool, value)?.into_handle();
        self.install(entity, id, handle, T::NAME)
    }

    /// Installs a component built ahead of time, possibly on another thread.
    ///
    /// # Errors
    ///
    /// As [`add_component`](Self::add_component), plus
    /// [`EcsError::InvalidBlock`] if the block came from another world's pool.
    pub fn insert_pooled<T: Component>(
        &mut self,
        entity: EntityId,
        component: PooledComponent<T>,
    ) -> EcsResult<()> {
        let id = self.prepare_insert::<T>(entity)?;
        if !self.pool.owns(component.bucket()) {
            let handle = component.handle();
            return Err(EcsError::InvalidBlock {
                size: handle.size(),
                slot: handle.slot(),
            });
        }
        let handle = component.into_handle();
        self.install(entity, id, handle, T::NAME)
    }

    /// Removes component `T` from `entity`, dropping it immediately.
    ///
    /// # Errors
    ///
    /// - [`EcsError::UnregisteredType`] if `T` was never registered
    /// - [`EcsError::EntityNotFound`] / [`EcsError::EntityNotAlive`]
    /// - [`EcsError::MissingComponent`] if `T` is not installed
    pub fn remove_component<T: Component>(&mut self, entity: EntityId) -> EcsResult<()> {
        let id = self.registry.require::<T>()?;
        self.remove_component_by_id(entity, id)
    }

    /// Type-erased [`remove_component`](Self::remove_component).
    ///
    /// # Errors
    ///
    /// As [`remove_component`](Self::remove_component), with
    /// [`EcsError::UnknownComponent`] for an id never handed out.
    pub fn remove_component_by_id(&mut self, entity: EntityId, id: ComponentId) -> EcsResult<()> {
        let destructor = self.registry.destructor_for(id)?;
        let record = self
            .entities
            .get_mut(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        if !record.is_alive() {
            return Err(EcsError::EntityNotAlive(entity));
        }
        let position = record
            .components
            .iter()
            .position(|&(cid, _)| cid == id)
            .ok_or_else(|| EcsError::MissingComponent {
                entity,
                component: self.registry.name_of(id),
            })?;

        let (_, handle) = record.components[position];
        let ptr = self.pool.block_ptr(handle)?;
        record.components.remove(position);
        // SAFETY: the block holds the component registered under `id`, and it
        // was just unlinked from its only owner.
        unsafe { destructor.run(ptr) };
        self.pool.release(handle)?;

        mark_dirty(record, &mut self.dirty);
        trace!(?entity, component = self.registry.name_of(id), "component removed");
        Ok(())
    }

    /// Reads component `T` of `entity`.
    ///
    /// # Errors
    ///
    /// - [`EcsError::EntityNotFound`] for a stale handle
    /// - [`EcsError::UnregisteredType`] / [`EcsError::MissingComponent`]
    pub fn get_component<T: Component>(&self, entity: EntityId) -> EcsResult<&T> {
        self.entity(entity)?.get::<T>()
    }

    /// Mutates component `T` of `entity` in place.
    ///
    /// # Errors
    ///
    /// As [`get_component`](Self::get_component).
    pub fn get_component_mut<T: Component>(&mut self, entity: EntityId) -> EcsResult<&mut T> {
        let id = self.registry.require::<T>()?;
        let record = self
            .entities
            .get(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        let handle = record.block_of(id).ok_or(EcsError::MissingComponent {
            entity,
            component: T::NAME,
        })?;
        let ptr = self.pool.block_ptr(handle)?;
        // SAFETY: the block holds a T, and `&mut self` rules out other borrows.
        Ok(unsafe { &mut *ptr.cast::<T>().as_ptr() })
    }

    /// Returns an unrestricted read-only view of `entity`.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] for a stale or unknown handle.
    pub fn entity(&self, entity: EntityId) -> EcsResult<EntityView<'_>> {
        let record = self
            .entities
            .get(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        Ok(EntityView::new(record, &self.pool, &self.registry, None))
    }

    /// Snapshots an entity for inspectors.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] for a stale or unknown handle.
    pub fn inspect(&self, entity: EntityId) -> EcsResult<EntityInfo> {
        let record = self
            .entities
            .get(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        Ok(EntityInfo {
            id: record.id,
            state: record.state,
            dirty: record.dirty,
            components: record
                .components
                .iter()
                .map(|&(id, _)| self.registry.name_of(id))
                .collect(),
        })
    }

    /// Capability mask of `entity` as of the last refresh.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] for a stale or unknown handle.
    pub fn entity_mask(&self, entity: EntityId) -> EcsResult<&ComponentMask> {
        let record = self
            .entities
            .get(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        Ok(self.masks.get(record.mask))
    }

    /// Liveness and duplicate checks shared by both insert paths.
    fn prepare_insert<T: Component>(&mut self, entity: EntityId) -> EcsResult<ComponentId> {
        let record = self
            .entities
            .get(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        if !record.is_alive() {
            return Err(EcsError::EntityNotAlive(entity));
        }
        let id = self.registry.register::<T>()?;
        if record.block_of(id).is_some() {
            return Err(EcsError::DuplicateComponent {
                entity,
                component: T::NAME,
            });
        }
        Ok(id)
    }

    /// Links an initialized block to a checked entity.
    fn install(
        &mut self,
        entity: EntityId,
        id: ComponentId,
        handle: BlockHandle,
        name: &'static str,
    ) -> EcsResult<()> {
        let record = self
            .entities
            .get_mut(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        record.components.push((id, handle));
        mark_dirty(record, &mut self.dirty);
        trace!(?entity, component = name, "component added");
        Ok(())
    }

    // =========================================================================
    // Families
    // =========================================================================

    /// Returns the family for `mask`, creating it on first request.
    ///
    /// A new family is seeded from every active entity. Structurally equal
    /// masks always return the same family.
    pub fn get_family(&mut self, mask: &ComponentMask) -> &Family {
        let id = self.family_for(mask.clone());
        &self.families[id.index()]
    }

    /// Returns the family for `mask` if one exists.
    #[must_use]
    pub fn find_family(&self, mask: &ComponentMask) -> Option<&Family> {
        let handle = self.masks.lookup(mask)?;
        let id = self.family_index.get(&handle)?;
        self.families.get(id.index())
    }

    /// Returns a family by handle.
    #[must_use]
    pub fn family(&self, id: FamilyId) -> Option<&Family> {
        self.families.get(id.index())
    }

    /// Iterates over every family.
    pub fn families(&self) -> impl Iterator<Item = &Family> {
        self.families.iter()
    }

    /// Registers a callback for membership changes of the family for `mask`.
    ///
    /// The callback receives an unrestricted view; for removals of dead
    /// entities every component is still readable.
    pub fn add_family_listener<F>(
        &mut self,
        mask: &ComponentMask,
        event: FamilyEvent,
        callback: F,
    ) -> ListenerId
    where
        F: FnMut(&EntityView<'_>) + 'static,
    {
        let family = self.family_for(mask.clone());
        let listener = self.next_listener_id();
        self.families[family.index()].add_listener(
            listener,
            event,
            ListenerTarget::Callback(Box::new(callback)),
        );
        listener
    }

    /// Unregisters a listener. Returns `false` if it was not registered.
    pub fn remove_family_listener(&mut self, listener: ListenerId) -> bool {
        self.families
            .iter_mut()
            .any(|family| family.remove_listener(listener))
    }

    fn family_for(&mut self, mask: ComponentMask) -> FamilyId {
        let handle = self.masks.intern(mask);
        if let Some(&id) = self.family_index.get(&handle) {
            return id;
        }

        let index = u32::try_from(self.families.len())
            .unwrap_or_else(|_| unreachable!("more than u32::MAX families"));
        let id = FamilyId(index);
        let mut family = Family::new(id, handle, self.masks.get(handle).clone());

        for record in self.entities.iter() {
            if record.state == EntityState::Active && family.matches(self.masks.get(record.mask)) {
                family.insert(record.id);
            }
        }

        debug!(family = index, members = family.len(), "family created");
        self.families.push(family);
        self.family_index.insert(handle, id);
        id
    }

    fn next_listener_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        ListenerId(self.next_listener)
    }

    // =========================================================================
    // Systems
    // =========================================================================

    /// Installs `system` on `timeline`, declaring exactly the components its
    /// query names.
    ///
    /// # Errors
    ///
    /// As [`add_system_with_access`](Self::add_system_with_access).
    pub fn add_system<S: System>(&mut self, timeline: &str, system: S) -> EcsResult<SystemId> {
        let state = <S::Query as Query>::init(&mut self.registry)?;
        let access = <S::Query as Query>::access(&state)?;
        self.add_system_with_access(timeline, system, access.reads, access.writes)
    }

    /// Installs `system` on `timeline` with explicit read/write masks.
    ///
    /// The system is bound to the family of `reads ∪ writes` and immediately
    /// told about every current member through `on_added`.
    ///
    /// # Errors
    ///
    /// - [`EcsError::UnknownTimeline`] if the timeline was never declared
    /// - [`EcsError::ConflictingAccess`] / [`EcsError::AccessViolation`] if
    ///   the query does not fit the masks
    pub fn add_system_with_access<S: System>(
        &mut self,
        timeline: &str,
        system: S,
        reads: ComponentMask,
        writes: ComponentMask,
    ) -> EcsResult<SystemId> {
        if !self.timelines.contains_key(timeline) {
            return Err(EcsError::UnknownTimeline(timeline.to_string()));
        }
        let declared = Access { reads, writes };
        let state = FamilyBinding::<S::Query>::validate(&mut self.registry, &declared)?;

        let index = u32::try_from(self.systems.len())
            .unwrap_or_else(|_| unreachable!("more than u32::MAX systems"));
        let id = SystemId(index);
        let family_id = self.family_for(declared.inclusion());
        let listeners = [self.next_listener_id(), self.next_listener_id()];

        let family = &mut self.families[family_id.index()];
        family.add_listener(listeners[0], FamilyEvent::Added, ListenerTarget::Binding(id));
        family.add_listener(listeners[1], FamilyEvent::Removed, ListenerTarget::Binding(id));

        let binding = FamilyBinding::new(state, declared, family_id, family.mask());
        let mut bound = BoundSystem::new(system, binding);
        for &entity in family.members() {
            if let Some(record) = self.entities.get(entity) {
                bound.notify(FamilyEvent::Added, record, &self.pool, &self.registry);
            }
        }

        debug!(
            system = bound.name(),
            timeline,
            family = family_id.index(),
            members = family.len(),
            "system added"
        );

        self.systems.push(Some(SystemSlot {
            timeline: timeline.to_string(),
            system: Box::new(bound),
            listeners,
        }));
        if let Some(list) = self.timelines.get_mut(timeline) {
            list.push(id);
        }
        Ok(id)
    }

    /// Uninstalls a system and unregisters its binding's listeners.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownSystem`] if the id is not installed.
    pub fn remove_system(&mut self, id: SystemId) -> EcsResult<()> {
        let slot = self
            .systems
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(EcsError::UnknownSystem(id.0))?;

        if let Some(family) = self.families.get_mut(slot.system.family().index()) {
            for listener in slot.listeners {
                family.remove_listener(listener);
            }
        }
        if let Some(list) = self.timelines.get_mut(&slot.timeline) {
            list.retain(|&system| system != id);
        }

        debug!(system = slot.system.name(), "system removed");
        Ok(())
    }

    /// Describes an installed system's binding.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownSystem`] if the id is not installed.
    pub fn binding_info(&self, id: SystemId) -> EcsResult<BindingInfo> {
        let slot = self
            .systems
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(EcsError::UnknownSystem(id.0))?;
        Ok(BindingInfo {
            system: id,
            name: slot.system.name().to_string(),
            timeline: slot.timeline.clone(),
            family: slot.system.family(),
            reads: slot.system.reads().clone(),
            writes: slot.system.writes().clone(),
        })
    }

    /// Returns the systems of `timeline` in run order.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownTimeline`] if the timeline was never declared.
    pub fn timeline_systems(&self, timeline: &str) -> EcsResult<&[SystemId]> {
        self.timelines
            .get(timeline)
            .map(Vec::as_slice)
            .ok_or_else(|| EcsError::UnknownTimeline(timeline.to_string()))
    }

    /// Installs every system a manifest declares, in manifest order.
    ///
    /// Component names must already be registered. Names, constructors,
    /// timelines and every query's fit to its declared masks are checked
    /// before the first system is installed, so a failing manifest installs
    /// nothing.
    ///
    /// # Errors
    ///
    /// - [`EcsError::UnknownComponentName`] for an unregistered name
    /// - [`EcsError::UnknownSystemName`] for a name the factory lacks
    /// - [`EcsError::UnknownTimeline`] for an undeclared timeline
    /// - [`EcsError::ConflictingAccess`] / [`EcsError::AccessViolation`] if a
    ///   query does not fit its declared masks
    pub fn load_systems(
        &mut self,
        manifest: &SystemManifest,
        factory: &mut SystemFactory,
    ) -> EcsResult<Vec<SystemId>> {
        let mut resolved = Vec::with_capacity(manifest.len());
        for declaration in &manifest.systems {
            if !factory.contains(&declaration.name) {
                return Err(EcsError::UnknownSystemName(declaration.name.clone()));
            }
            if !self.has_timeline(&declaration.timeline) {
                return Err(EcsError::UnknownTimeline(declaration.timeline.clone()));
            }
            let reads = self.resolve_names(&declaration.reads)?;
            let writes = self.resolve_names(&declaration.writes)?;
            let declared = Access { reads, writes };
            factory.validate(&mut self.registry, &declaration.name, &declared)?;
            resolved.push((declaration, declared.reads, declared.writes));
        }

        let mut installed = Vec::with_capacity(resolved.len());
        for (declaration, reads, writes) in resolved {
            let id = factory.install(self, &declaration.name, &declaration.timeline, reads, writes)?;
            installed.push(id);
        }
        debug!(systems = installed.len(), "manifest loaded");
        Ok(installed)
    }

    fn resolve_names(&self, names: &[String]) -> EcsResult<ComponentMask> {
        names
            .iter()
            .map(|name| {
                self.registry
                    .id_by_name(name)
                    .ok_or_else(|| EcsError::UnknownComponentName(name.clone()))
            })
            .collect()
    }

    // =========================================================================
    // Step
    // =========================================================================

    /// Runs one step of `timeline`.
    ///
    /// # Errors
    ///
    /// - [`EcsError::UnknownTimeline`] before anything runs
    /// - [`EcsError::StepAborted`] if a deferred command or a system fails;
    ///   work done before the failure is kept, dead entities not yet
    ///   destroyed are destroyed by the next step
    pub fn step(&mut self, timeline: &str, delta_time: f32) -> EcsResult<StepReport> {
        let systems = self
            .timelines
            .get(timeline)
            .cloned()
            .ok_or_else(|| EcsError::UnknownTimeline(timeline.to_string()))?;

        self.step_count += 1;
        let span = debug_span!("step", timeline, step = self.step_count);
        let _enter = span.enter();

        let mut report = StepReport {
            step: self.step_count,
            ..StepReport::default()
        };

        report.commands = self.apply_commands(timeline)?;
        report.spawned = self.integrate_pending();
        debug!(
            phase = StepPhase::SpawnPending.name(),
            commands = report.commands,
            spawned = report.spawned
        );

        self.refresh(&mut report);
        debug!(
            phase = StepPhase::Refresh.name(),
            refreshed = report.refreshed,
            added = report.added,
            removed = report.removed,
            modified = report.modified
        );

        for id in systems {
            self.run_system(id, timeline, delta_time)?;
            report.systems += 1;
        }
        debug!(phase = StepPhase::Update.name(), systems = report.systems);

        report.destroyed = self.destroy_pending(timeline)?;
        debug!(phase = StepPhase::DestroyPending.name(), destroyed = report.destroyed);

        Ok(report)
    }

    /// Applies recorded commands in order. The first failure discards the rest.
    fn apply_commands(&mut self, timeline: &str) -> EcsResult<usize> {
        let mut commands = self.commands.drain();
        let mut applied = 0;

        while let Some(command) = commands.next() {
            let origin = command.describe();
            if let Err(err) = command.apply(self) {
                let mut discarded = 0;
                for rest in commands {
                    if let Command::Spawn(entity) = rest {
                        self.ids.release(entity);
                    }
                    discarded += 1;
                }
                warn!(%err, origin = %origin, discarded, "deferred command failed");
                return Err(aborted(timeline, StepPhase::SpawnPending, origin, err));
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Activates pending entities and queues them for refresh.
    fn integrate_pending(&mut self) -> usize {
        let mut spawned = 0;
        for entity in std::mem::take(&mut self.pending) {
            let Some(record) = self.entities.get_mut(entity) else {
                continue;
            };
            if record.state == EntityState::Pending {
                record.state = EntityState::Active;
                spawned += 1;
            }
            mark_dirty(record, &mut self.dirty);
        }
        spawned
    }

    /// Recomputes dirty masks, updates membership, then notifies listeners.
    fn refresh(&mut self, report: &mut StepReport) {
        let mut events = Vec::new();
        let mut deferred = Vec::new();

        for entity in std::mem::take(&mut self.dirty) {
            let Some(record) = self.entities.get_mut(entity) else {
                continue;
            };
            if !record.dirty {
                continue;
            }
            if record.state == EntityState::Pending {
                deferred.push(entity);
                continue;
            }
            record.dirty = false;
            report.refreshed += 1;

            if record.state == EntityState::Dead {
                for family in &mut self.families {
                    if family.remove(entity) {
                        events.push(Notification {
                            family: family.id(),
                            event: FamilyEvent::Removed,
                            entity,
                        });
                    }
                }
                self.graveyard.push(entity);
                continue;
            }

            let previous = record.mask;
            let handle = self.masks.intern(record.compute_mask());
            record.mask = handle;
            let mask = self.masks.get(handle);

            for family in &mut self.families {
                let event = match (family.contains(entity), family.matches(mask)) {
                    (false, true) => {
                        family.insert(entity);
                        FamilyEvent::Added
                    }
                    (true, false) => {
                        family.remove(entity);
                        FamilyEvent::Removed
                    }
                    (true, true) if previous != handle => FamilyEvent::Modified,
                    _ => continue,
                };
                events.push(Notification {
                    family: family.id(),
                    event,
                    entity,
                });
            }
        }
        self.dirty = deferred;

        for note in &events {
            match note.event {
                FamilyEvent::Added => report.added += 1,
                FamilyEvent::Removed => report.removed += 1,
                FamilyEvent::Modified => report.modified += 1,
            }
        }
        self.dispatch(&events);
    }

    /// Delivers notifications to every matching listener.
    fn dispatch(&mut self, events: &[Notification]) {
        for note in events {
            let Some(record) = self.entities.get(note.entity) else {
                continue;
            };
            let family = &mut self.families[note.family.index()];
            for listener in family.listeners.iter_mut() {
                if listener.event != note.event {
                    continue;
                }
                match &mut listener.target {
                    ListenerTarget::Callback(callback) => {
                        callback(&EntityView::new(record, &self.pool, &self.registry, None));
                    }
                    ListenerTarget::Binding(system) => {
                        if let Some(Some(slot)) = self.systems.get_mut(system.index()) {
                            slot.system.notify(note.event, record, &self.pool, &self.registry);
                        }
                    }
                }
                trace!(
                    family = note.family.index(),
                    event = ?note.event,
                    entity = ?note.entity,
                    "family notification"
                );
            }
        }
    }

    /// Runs one system over its family.
    fn run_system(&mut self, id: SystemId, timeline: &str, delta_time: f32) -> EcsResult<()> {
        let Some(mut slot) = self.systems.get_mut(id.index()).and_then(Option::take) else {
            return Ok(());
        };

        let members = self
            .families
            .get(slot.system.family().index())
            .map_or(&[][..], Family::members);
        let mut ctx = StepContext::new(
            timeline,
            delta_time,
            self.step_count,
            &mut self.commands,
            &mut self.ids,
        );
        let result = slot.system.run(&mut ctx, members, &self.entities, &self.pool);

        let outcome = result.map_err(|err| {
            let origin = slot.system.name().to_string();
            warn!(%err, system = %origin, "system failed");
            aborted(timeline, StepPhase::Update, origin, err)
        });
        self.systems[id.index()] = Some(slot);
        outcome
    }

    /// Destroys every entity in the graveyard.
    fn destroy_pending(&mut self, timeline: &str) -> EcsResult<usize> {
        let mut destroyed = 0;
        let mut first_error = None;

        for entity in std::mem::take(&mut self.graveyard) {
            let Some(record) = self.entities.remove(entity) else {
                continue;
            };
            if let Err(err) = release_components(&self.registry, &self.pool, &record.components) {
                first_error.get_or_insert((entity, err));
            }
            self.ids.release(entity);
            destroyed += 1;
        }

        match first_error {
            Some((entity, err)) => Err(aborted(
                timeline,
                StepPhase::DestroyPending,
                format!("destroy {entity:?}"),
                err,
            )),
            None => Ok(destroyed),
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new(WorldConfig::default())
    }
}

impl Drop for World {
    fn drop(&mut self) {
        let remaining = self.entities.len();
        for record in self.entities.drain() {
            if let Err(err) = release_components(&self.registry, &self.pool, &record.components) {
                warn!(%err, entity = ?record.id, "failed to release components on drop");
            }
        }
        trace!(entities = remaining, "world dropped");
    }
}

/// Flags a record for the next refresh, queueing it once.
fn mark_dirty(record: &mut EntityRecord, queue: &mut Vec<EntityId>) {
    if !record.dirty {
        record.dirty = true;
        queue.push(record.id);
    }
}

/// Drops every component through its registered destructor and frees the
/// blocks. Keeps going past failures and reports the first one.
fn release_components(
    registry: &TypeRegistry,
    pool: &SizeClassPool,
    components: &[(ComponentId, BlockHandle)],
) -> EcsResult<()> {
    let mut first_error = None;
    for &(id, handle) in components {
        let result = registry.destructor_for(id).and_then(|destructor| {
            let ptr = pool.block_ptr(handle)?;
            // SAFETY: the block holds the component registered under `id` and
            // its record has been unlinked.
            unsafe { destructor.run(ptr) };
            pool.release(handle)
        });
        if let Err(err) = result {
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn aborted(timeline: &str, phase: StepPhase, origin: String, source: EcsError) -> EcsError {
    EcsError::StepAborted {
        timeline: timeline.to_string(),
        phase: phase.name(),
        origin,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{QueryItem, Read, Write};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, PartialEq)]
    struct Position(f32);
    impl Component for Position {
        const NAME: &'static str = "Position";
    }

    #[derive(Debug, PartialEq)]
    struct Velocity(f32);
    impl Component for Velocity {
        const NAME: &'static str = "Velocity";
    }

    struct Integrate;

    impl System for Integrate {
        type Query = (Write<Position>, Read<Velocity>);

        fn update(
            &mut self,
            ctx: &mut StepContext<'_>,
            _entity: EntityId,
            item: QueryItem<'_, Self::Query>,
        ) -> EcsResult<()> {
            let (position, velocity) = item;
            position.0 += velocity.0 * ctx.delta_time();
            Ok(())
        }
    }

    fn world() -> World {
        World::new(WorldConfig::default())
    }

    #[test]
    fn test_create_entity_is_pending_until_step() {
        let mut world = world();
        let entity = world.create_entity();
        assert_eq!(world.inspect(entity).unwrap().state, EntityState::Pending);
        assert_eq!(world.entity_count(), 1);

        let report = world.step("fixed", 0.0).unwrap();
        assert_eq!(report.spawned, 1);
        assert_eq!(world.inspect(entity).unwrap().state, EntityState::Active);
    }

    #[test]
    fn test_duplicate_and_missing_components() {
        let mut world = world();
        let entity = world.create_entity();
        world.add_component(entity, Position(0.0)).unwrap();

        assert!(matches!(
            world.add_component(entity, Position(1.0)),
            Err(EcsError::DuplicateComponent { component: "Position", .. })
        ));
        assert!(matches!(
            world.remove_component::<Velocity>(entity),
            Err(EcsError::UnregisteredType("Velocity"))
        ));

        world.register::<Velocity>().unwrap();
        assert!(matches!(
            world.remove_component::<Velocity>(entity),
            Err(EcsError::MissingComponent { component: "Velocity", .. })
        ));
        assert_eq!(world.get_component::<Position>(entity).unwrap(), &Position(0.0));
    }

    #[test]
    fn test_destroy_twice_fails() {
        let mut world = world();
        let entity = world.create_entity();
        world.destroy_entity(entity).unwrap();
        assert!(matches!(world.destroy_entity(entity), Err(EcsError::EntityNotAlive(_))));
        assert!(matches!(
            world.add_component(entity, Position(0.0)),
            Err(EcsError::EntityNotAlive(_))
        ));

        world.step("fixed", 0.0).unwrap();
        assert!(matches!(world.destroy_entity(entity), Err(EcsError::EntityNotFound(_))));
        assert!(!world.is_alive(entity));
    }

    #[test]
    fn test_deferred_destroy_ignores_dead_entity() {
        let mut world = world();
        let entity = world.create_entity();
        world.destroy_deferred(entity).unwrap();
        world.destroy_deferred(entity).unwrap();
        assert!(!world.is_alive(entity));

        world.step("fixed", 0.0).unwrap();
        assert!(matches!(world.destroy_deferred(entity), Err(EcsError::EntityNotFound(_))));
    }

    #[test]
    fn test_unknown_timeline() {
        let mut world = world();
        assert!(matches!(world.step("physics", 0.0), Err(EcsError::UnknownTimeline(_))));
        assert!(matches!(
            world.add_system("physics", Integrate),
            Err(EcsError::UnknownTimeline(_))
        ));
        assert_eq!(world.step_count(), 0);

        assert!(world.add_timeline("physics"));
        assert!(!world.add_timeline("physics"));
        assert!(world.step("physics", 0.0).is_ok());
    }

    #[test]
    fn test_system_updates_members() {
        let mut world = world();
        let moving = world.create_entity();
        world.add_component(moving, Position(1.0)).unwrap();
        world.add_component(moving, Velocity(2.0)).unwrap();
        let still = world.create_entity();
        world.add_component(still, Position(5.0)).unwrap();

        let system = world.add_system("fixed", Integrate).unwrap();
        let report = world.step("fixed", 0.5).unwrap();
        assert_eq!(report.systems, 1);

        assert_eq!(world.get_component::<Position>(moving).unwrap(), &Position(2.0));
        assert_eq!(world.get_component::<Position>(still).unwrap(), &Position(5.0));

        let info = world.binding_info(system).unwrap();
        assert_eq!(info.timeline, "fixed");
        assert_eq!(info.writes.len(), 1);
        assert_eq!(info.reads.len(), 1);
        assert_eq!(world.family(info.family).unwrap().members(), &[moving]);
    }

    #[test]
    fn test_family_identity_and_seeding() {
        let mut world = world();
        let entity = world.create_entity();
        world.add_component(entity, Position(0.0)).unwrap();
        world.step("fixed", 0.0).unwrap();

        let position = world.registry().id_of::<Position>().unwrap();
        let mask = ComponentMask::from_ids(&[position]);
        let first = world.get_family(&mask).id();
        assert!(world.get_family(&mask).contains(entity));
        assert_eq!(world.get_family(&ComponentMask::new().with(position)).id(), first);
        assert_eq!(world.families().count(), 1);
    }

    #[test]
    fn test_find_family_does_not_create() {
        let mut world = world();
        let position = world.register::<Position>().unwrap();
        let mask = ComponentMask::from_ids(&[position]);
        assert!(world.find_family(&mask).is_none());
        assert!(world.get_family(&mask).is_empty());
        assert!(world.find_family(&mask).is_some());
    }

    #[test]
    fn test_modified_fires_for_still_matching_member() {
        let mut world = world();
        let position = world.register::<Position>().unwrap();
        let entity = world.create_entity();
        world.add_component(entity, Position(0.0)).unwrap();
        world.step("fixed", 0.0).unwrap();

        let modified = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&modified);
        world.add_family_listener(
            &ComponentMask::from_ids(&[position]),
            FamilyEvent::Modified,
            move |view| sink.borrow_mut().push(view.id()),
        );

        world.add_component(entity, Velocity(1.0)).unwrap();
        let report = world.step("fixed", 0.0).unwrap();
        assert_eq!(report.modified, 1);
        assert_eq!(*modified.borrow(), vec![entity]);
    }

    #[test]
    fn test_remove_listener() {
        let mut world = world();
        let position = world.register::<Position>().unwrap();
        let mask = ComponentMask::from_ids(&[position]);
        let listener = world.add_family_listener(&mask, FamilyEvent::Added, |_| {});
        assert_eq!(world.find_family(&mask).unwrap().listener_count(), 1);
        assert!(world.remove_family_listener(listener));
        assert!(!world.remove_family_listener(listener));
    }

    #[test]
    fn test_remove_system_unregisters_listeners() {
        let mut world = world();
        let system = world.add_system("fixed", Integrate).unwrap();
        let family = world.binding_info(system).unwrap().family;
        assert_eq!(world.family(family).unwrap().listener_count(), 2);

        world.remove_system(system).unwrap();
        assert_eq!(world.family(family).unwrap().listener_count(), 0);
        assert!(world.timeline_systems("fixed").unwrap().is_empty());
        assert!(matches!(world.remove_system(system), Err(EcsError::UnknownSystem(0))));
    }

    #[test]
    fn test_get_component_mut() {
        let mut world = world();
        let entity = world.create_entity();
        world.add_component(entity, Velocity(1.0)).unwrap();
        world.get_component_mut::<Velocity>(entity).unwrap().0 = 4.0;
        assert_eq!(world.get_component::<Velocity>(entity).unwrap(), &Velocity(4.0));
        assert_eq!(world.inspect(entity).unwrap().components, vec!["Velocity"]);
    }

    #[test]
    fn test_entity_mask_follows_refresh() {
        let mut world = world();
        let entity = world.create_entity();
        world.add_component(entity, Position(0.0)).unwrap();
        assert!(world.entity_mask(entity).unwrap().is_empty());
        assert!(world.inspect(entity).unwrap().dirty);

        world.step("fixed", 0.0).unwrap();
        let position = world.registry().id_of::<Position>().unwrap();
        assert_eq!(world.entity_mask(entity).unwrap(), &ComponentMask::from_ids(&[position]));
        assert!(!world.inspect(entity).unwrap().dirty);
    }
}
