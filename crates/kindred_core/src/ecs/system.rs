//! # Systems
//!
//! Per-step update logic. A system names the components it touches through
//! its [`Query`](super::query::Query); the world binds it to the family of
//! entities carrying those components and calls [`System::update`] once per
//! member on the system's timeline.
//!
//! Systems never mutate the world directly. Structural changes go through the
//! [`StepContext`] and are applied at the start of the next step.

use super::commands::{Command, CommandQueue};
use super::component::Component;
use super::entity::{EntityAllocator, EntityId, EntityRecord, EntityTable, EntityView};
use super::family::{FamilyEvent, FamilyId};
use super::mask::ComponentMask;
use super::query::{FamilyBinding, Query};
use super::registry::TypeRegistry;
use super::World;
use crate::error::EcsResult;
use crate::memory::SizeClassPool;

/// Handle of an installed system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemId(pub(crate) u32);

impl SystemId {
    /// Returns the raw index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Typed record a system's query yields for one entity.
pub type QueryItem<'w, Q> = <Q as Query>::Item<'w>;

/// Update logic bound to one family.
///
/// # Example
///
/// ```rust,ignore
/// struct Integrate;
///
/// impl System for Integrate {
///     type Query = (Write<Position>, Read<Velocity>);
///
///     fn update(
///         &mut self,
///         ctx: &mut StepContext<'_>,
///         _entity: EntityId,
///         item: QueryItem<'_, Self::Query>,
///     ) -> EcsResult<()> {
///         let (position, velocity) = item;
///         position.x += velocity.x * ctx.delta_time();
///         Ok(())
///     }
/// }
/// ```
pub trait System: 'static {
    /// Components this system reads and writes.
    type Query: Query;

    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once per family member during the update phase.
    ///
    /// # Errors
    ///
    /// Any error aborts the current step for this timeline.
    fn update(
        &mut self,
        ctx: &mut StepContext<'_>,
        entity: EntityId,
        item: QueryItem<'_, Self::Query>,
    ) -> EcsResult<()>;

    /// Called when an entity joins the bound family.
    ///
    /// The view only exposes the components in the binding's masks.
    fn on_added(&mut self, _entity: &EntityView<'_>) {}

    /// Called when an entity leaves the bound family, before a dead entity's
    /// components are destroyed.
    fn on_removed(&mut self, _entity: &EntityView<'_>) {}
}

/// Per-step context handed to every [`System::update`] call.
pub struct StepContext<'a> {
    timeline: &'a str,
    delta_time: f32,
    step: u64,
    commands: &'a mut CommandQueue,
    ids: &'a mut EntityAllocator,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        timeline: &'a str,
        delta_time: f32,
        step: u64,
        commands: &'a mut CommandQueue,
        ids: &'a mut EntityAllocator,
    ) -> Self {
        Self {
            timeline,
            delta_time,
            step,
            commands,
            ids,
        }
    }

    /// Returns the timeline being stepped.
    #[inline]
    #[must_use]
    pub fn timeline(&self) -> &str {
        self.timeline
    }

    /// Returns the delta time passed to [`World::step`](super::World::step).
    #[inline]
    #[must_use]
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    /// Returns the step counter, starting at 1 for the first step.
    #[inline]
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Reserves an entity now and creates it at the start of the next step.
    ///
    /// The returned id can be used with [`insert`](Self::insert) right away.
    pub fn spawn(&mut self) -> EntityId {
        let entity = self.ids.reserve();
        self.commands.push(Command::Spawn(entity));
        entity
    }

    /// Queues adding `value` to `entity`.
    pub fn insert<T: Component>(&mut self, entity: EntityId, value: T) {
        self.commands.push(Command::Insert {
            entity,
            component: T::NAME,
            apply: Box::new(move |world: &mut World, entity: EntityId| {
                world.add_component(entity, value)
            }),
        });
    }

    /// Queues removing component `T` from `entity`.
    pub fn remove<T: Component>(&mut self, entity: EntityId) {
        self.commands.push(Command::Remove {
            entity,
            component: T::NAME,
            apply: remove_thunk::<T>,
        });
    }

    /// Queues destroying `entity`.
    ///
    /// Destroying an entity another command already marked dead is a no-op.
    pub fn destroy(&mut self, entity: EntityId) {
        self.commands.push(Command::Destroy(entity));
    }

    /// Number of commands recorded so far this step.
    #[inline]
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }
}

fn remove_thunk<T: Component>(world: &mut World, entity: EntityId) -> EcsResult<()> {
    world.remove_component::<T>(entity)
}

/// Declared masks and bound family of an installed system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingInfo {
    /// The system handle.
    pub system: SystemId,
    /// [`System::name`].
    pub name: String,
    /// Timeline the system runs on.
    pub timeline: String,
    /// Family the binding iterates.
    pub family: FamilyId,
    /// Declared read mask.
    pub reads: ComponentMask,
    /// Declared write mask.
    pub writes: ComponentMask,
}

/// Object-safe face of a bound system, stored by the world.
pub(crate) trait AnySystem {
    fn name(&self) -> &str;

    fn family(&self) -> FamilyId;

    fn reads(&self) -> &ComponentMask;

    fn writes(&self) -> &ComponentMask;

    /// Runs `update` over `members`, stopping at the first error.
    fn run(
        &mut self,
        ctx: &mut StepContext<'_>,
        members: &[EntityId],
        entities: &EntityTable,
        pool: &SizeClassPool,
    ) -> EcsResult<()>;

    /// Delivers a membership notification through an access-scoped view.
    fn notify(
        &mut self,
        event: FamilyEvent,
        record: &EntityRecord,
        pool: &SizeClassPool,
        registry: &TypeRegistry,
    );
}

/// A system together with its family binding.
pub(crate) struct BoundSystem<S: System> {
    system: S,
    binding: FamilyBinding<S::Query>,
}

impl<S: System> BoundSystem<S> {
    pub(crate) fn new(system: S, binding: FamilyBinding<S::Query>) -> Self {
        Self { system, binding }
    }
}

impl<S: System> AnySystem for BoundSystem<S> {
    fn name(&self) -> &str {
        self.system.name()
    }

    fn family(&self) -> FamilyId {
        self.binding.family()
    }

    fn reads(&self) -> &ComponentMask {
        self.binding.reads()
    }

    fn writes(&self) -> &ComponentMask {
        self.binding.writes()
    }

    fn run(
        &mut self,
        ctx: &mut StepContext<'_>,
        members: &[EntityId],
        entities: &EntityTable,
        pool: &SizeClassPool,
    ) -> EcsResult<()> {
        let system = &mut self.system;
        self.binding
            .for_each(members, entities, pool, |entity, item| system.update(ctx, entity, item))
    }

    fn notify(
        &mut self,
        event: FamilyEvent,
        record: &EntityRecord,
        pool: &SizeClassPool,
        registry: &TypeRegistry,
    ) {
        let view = EntityView::new(record, pool, registry, Some(self.binding.visible()));
        match event {
            FamilyEvent::Added => self.system.on_added(&view),
            FamilyEvent::Removed => self.system.on_removed(&view),
            FamilyEvent::Modified => {}
        }
    }
}
