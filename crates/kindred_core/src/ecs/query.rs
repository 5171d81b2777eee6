//! # Queries and Family Bindings
//!
//! A [`Query`] is a tuple of [`Read`] / [`Write`] markers naming the
//! components one system touches. A [`FamilyBinding`] pairs a query with the
//! family it iterates and the read/write masks the system declared, and turns
//! the family's type-erased member list into strongly typed records:
//!
//! ```rust,ignore
//! type Motion = (Write<Position>, Read<Velocity>);
//! // items are (&mut Position, &Velocity)
//! ```
//!
//! Only the components named by the query are ever exposed, which is how the
//! declared access contract is enforced at the boundary.

// SAFETY: fetch turns block pointers into references. Exclusivity rests on
// three rules checked here: a query never names one component twice, each
// entity is visited once per pass, and the world holds no other component
// borrow while a binding iterates.
#![allow(unsafe_code)]

use std::marker::PhantomData;

use super::component::{Component, ComponentId};
use super::entity::{EntityId, EntityRecord, EntityTable};
use super::family::FamilyId;
use super::mask::{ComponentMask, MaskHandle};
use super::registry::TypeRegistry;
use crate::error::{EcsError, EcsResult};
use crate::memory::SizeClassPool;

/// Read and write masks of one query or system.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Access {
    /// Components read.
    pub reads: ComponentMask,
    /// Components written.
    pub writes: ComponentMask,
}

impl Access {
    /// Records a read of `id`.
    ///
    /// # Errors
    ///
    /// [`EcsError::ConflictingAccess`] if `id` is already recorded.
    pub fn add_read(&mut self, id: ComponentId, name: &'static str) -> EcsResult<()> {
        self.check_unique(id, name)?;
        self.reads.insert(id);
        Ok(())
    }

    /// Records a write of `id`.
    ///
    /// # Errors
    ///
    /// [`EcsError::ConflictingAccess`] if `id` is already recorded.
    pub fn add_write(&mut self, id: ComponentId, name: &'static str) -> EcsResult<()> {
        self.check_unique(id, name)?;
        self.writes.insert(id);
        Ok(())
    }

    /// Union of reads and writes: the family inclusion mask.
    #[must_use]
    pub fn inclusion(&self) -> ComponentMask {
        self.reads.union(&self.writes)
    }

    fn check_unique(&self, id: ComponentId, name: &'static str) -> EcsResult<()> {
        if self.reads.contains(id) || self.writes.contains(id) {
            return Err(EcsError::ConflictingAccess { component: name });
        }
        Ok(())
    }
}

/// Shared read of component `T`.
pub struct Read<T>(PhantomData<fn() -> T>);

/// Exclusive write of component `T`.
pub struct Write<T>(PhantomData<fn() -> T>);

/// One element of a query tuple.
pub trait QueryParam: 'static {
    /// Reference type produced for each entity.
    type Item<'w>;

    /// Registers the component and returns its id.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    fn init(registry: &mut TypeRegistry) -> EcsResult<ComponentId>;

    /// Records this parameter's access.
    ///
    /// # Errors
    ///
    /// [`EcsError::ConflictingAccess`] if the component is already named.
    fn declare(id: ComponentId, access: &mut Access) -> EcsResult<()>;

    /// Produces the reference for one entity.
    ///
    /// # Safety
    ///
    /// No other reference to this entity's block for `id` may be live for `'w`.
    unsafe fn fetch<'w>(
        id: ComponentId,
        record: &'w EntityRecord,
        pool: &'w SizeClassPool,
    ) -> EcsResult<Self::Item<'w>>;
}

/// Resolves the block pointer of `id` on `record`.
fn block_ptr<T: Component>(
    id: ComponentId,
    record: &EntityRecord,
    pool: &SizeClassPool,
) -> EcsResult<std::ptr::NonNull<T>> {
    let handle = record.block_of(id).ok_or(EcsError::MissingComponent {
        entity: record.id,
        component: T::NAME,
    })?;
    Ok(pool.block_ptr(handle)?.cast::<T>())
}

impl<T: Component> QueryParam for Read<T> {
    type Item<'w> = &'w T;

    fn init(registry: &mut TypeRegistry) -> EcsResult<ComponentId> {
        registry.register::<T>()
    }

    fn declare(id: ComponentId, access: &mut Access) -> EcsResult<()> {
        access.add_read(id, T::NAME)
    }

    unsafe fn fetch<'w>(
        id: ComponentId,
        record: &'w EntityRecord,
        pool: &'w SizeClassPool,
    ) -> EcsResult<Self::Item<'w>> {
        let ptr = block_ptr::<T>(id, record, pool)?;
        // SAFETY: block holds an initialized T; no writer aliases it (caller).
        Ok(unsafe { &*ptr.as_ptr() })
    }
}

impl<T: Component> QueryParam for Write<T> {
    type Item<'w> = &'w mut T;

    fn init(registry: &mut TypeRegistry) -> EcsResult<ComponentId> {
        registry.register::<T>()
    }

    fn declare(id: ComponentId, access: &mut Access) -> EcsResult<()> {
        access.add_write(id, T::NAME)
    }

    unsafe fn fetch<'w>(
        id: ComponentId,
        record: &'w EntityRecord,
        pool: &'w SizeClassPool,
    ) -> EcsResult<Self::Item<'w>> {
        let ptr = block_ptr::<T>(id, record, pool)?;
        // SAFETY: block holds an initialized T; access is exclusive (caller).
        Ok(unsafe { &mut *ptr.as_ptr() })
    }
}

/// A set of component accesses, implemented for tuples of up to six
/// [`QueryParam`]s.
pub trait Query: 'static {
    /// Typed record produced for each entity.
    type Item<'w>;
    /// Resolved component ids.
    type State: 'static;

    /// Registers every component and resolves ids.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    fn init(registry: &mut TypeRegistry) -> EcsResult<Self::State>;

    /// Computes the read/write masks.
    ///
    /// # Errors
    ///
    /// [`EcsError::ConflictingAccess`] if a component is named twice.
    fn access(state: &Self::State) -> EcsResult<Access>;

    /// Produces the typed record for one entity.
    ///
    /// # Safety
    ///
    /// No other reference to the fetched blocks may be live for `'w`.
    unsafe fn fetch<'w>(
        state: &Self::State,
        record: &'w EntityRecord,
        pool: &'w SizeClassPool,
    ) -> EcsResult<Self::Item<'w>>;
}

macro_rules! impl_query_tuple {
    ($($param:ident => $idx:tt),+) => {
        impl<$($param: QueryParam),+> Query for ($($param,)+) {
            type Item<'w> = ($($param::Item<'w>,)+);
            type State = ($(impl_query_tuple!(@id $param),)+);

            fn init(registry: &mut TypeRegistry) -> EcsResult<Self::State> {
                Ok(($($param::init(registry)?,)+))
            }

            fn access(state: &Self::State) -> EcsResult<Access> {
                let mut access = Access::default();
                $($param::declare(state.$idx, &mut access)?;)+
                Ok(access)
            }

            unsafe fn fetch<'w>(
                state: &Self::State,
                record: &'w EntityRecord,
                pool: &'w SizeClassPool,
            ) -> EcsResult<Self::Item<'w>> {
                // SAFETY: ids are pairwise distinct (checked by `access`), the
                // rest is forwarded to the caller.
                Ok(($(unsafe { $param::fetch(state.$idx, record, pool)? },)+))
            }
        }
    };
    (@id $param:ident) => { ComponentId };
}

impl_query_tuple!(A => 0);
impl_query_tuple!(A => 0, B => 1);
impl_query_tuple!(A => 0, B => 1, C => 2);
impl_query_tuple!(A => 0, B => 1, C => 2, D => 3);
impl_query_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4);
impl_query_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

/// Typed, access-scoped view of one family for one system.
pub struct FamilyBinding<Q: Query> {
    /// Family iterated by this binding.
    family: FamilyId,
    /// Interned inclusion mask.
    mask: MaskHandle,
    /// Declared masks.
    declared: Access,
    /// reads ∪ writes, the components visible through this binding.
    visible: ComponentMask,
    /// Resolved ids of the query.
    state: Q::State,
}

impl<Q: Query> FamilyBinding<Q> {
    /// Resolves the query and checks it against the declared masks.
    ///
    /// # Errors
    ///
    /// - [`EcsError::ConflictingAccess`] if the query names a component twice
    /// - [`EcsError::AccessViolation`] if the query reads a component outside
    ///   reads ∪ writes, or writes one outside writes
    pub(crate) fn validate(registry: &mut TypeRegistry, declared: &Access) -> EcsResult<Q::State> {
        let state = Q::init(registry)?;
        let used = Q::access(&state)?;
        let visible = declared.inclusion();

        if let Some(id) = used.writes.iter().find(|&id| !declared.writes.contains(id)) {
            return Err(EcsError::AccessViolation {
                component: registry.name_of(id),
            });
        }
        if let Some(id) = used.reads.iter().find(|&id| !visible.contains(id)) {
            return Err(EcsError::AccessViolation {
                component: registry.name_of(id),
            });
        }
        Ok(state)
    }

    /// Binds a validated query to its family.
    pub(crate) fn new(state: Q::State, declared: Access, family: FamilyId, mask: MaskHandle) -> Self {
        let visible = declared.inclusion();
        Self {
            family,
            mask,
            declared,
            visible,
            state,
        }
    }

    /// Returns the bound family.
    #[inline]
    #[must_use]
    pub fn family(&self) -> FamilyId {
        self.family
    }

    /// Returns the interned inclusion mask.
    #[inline]
    #[must_use]
    pub fn mask(&self) -> MaskHandle {
        self.mask
    }

    /// Returns the declared read mask.
    #[inline]
    #[must_use]
    pub fn reads(&self) -> &ComponentMask {
        &self.declared.reads
    }

    /// Returns the declared write mask.
    #[inline]
    #[must_use]
    pub fn writes(&self) -> &ComponentMask {
        &self.declared.writes
    }

    /// Returns reads ∪ writes.
    #[inline]
    #[must_use]
    pub fn visible(&self) -> &ComponentMask {
        &self.visible
    }

    /// Calls `f` with the typed record of every member, in member order.
    ///
    /// Stops at the first error.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns, or [`EcsError::EntityNotFound`] if a member has
    /// no record.
    pub(crate) fn for_each<'w, F>(
        &self,
        members: &[EntityId],
        entities: &'w EntityTable,
        pool: &'w SizeClassPool,
        mut f: F,
    ) -> EcsResult<()>
    where
        F: FnMut(EntityId, Q::Item<'w>) -> EcsResult<()>,
    {
        for &entity in members {
            let record = entities.get(entity).ok_or(EcsError::EntityNotFound(entity))?;
            // SAFETY: each member appears once, the query's ids are distinct,
            // and the world lends no other component reference during a pass.
            let item = unsafe { Q::fetch(&self.state, record, pool)? };
            f(entity, item)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Position;
    impl Component for Position {
        const NAME: &'static str = "Position";
    }

    struct Velocity;
    impl Component for Velocity {
        const NAME: &'static str = "Velocity";
    }

    fn declared(registry: &TypeRegistry, reads: &[&str], writes: &[&str]) -> Access {
        let ids = |names: &[&str]| {
            names
                .iter()
                .map(|name| registry.id_by_name(name).unwrap())
                .collect::<ComponentMask>()
        };
        Access {
            reads: ids(reads),
            writes: ids(writes),
        }
    }

    #[test]
    fn test_query_access_masks() {
        let mut registry = TypeRegistry::new();
        let state = <(Write<Position>, Read<Velocity>)>::init(&mut registry).unwrap();
        let access = <(Write<Position>, Read<Velocity>)>::access(&state).unwrap();

        let position = registry.id_of::<Position>().unwrap();
        let velocity = registry.id_of::<Velocity>().unwrap();
        assert!(access.writes.contains(position));
        assert!(access.reads.contains(velocity));
        assert_eq!(access.inclusion().len(), 2);
    }

    #[test]
    fn test_duplicate_component_in_query() {
        let mut registry = TypeRegistry::new();
        let state = <(Read<Position>, Write<Position>)>::init(&mut registry).unwrap();
        assert!(matches!(
            <(Read<Position>, Write<Position>)>::access(&state),
            Err(EcsError::ConflictingAccess { component: "Position" })
        ));
    }

    #[test]
    fn test_binding_rejects_undeclared_write() {
        let mut registry = TypeRegistry::new();
        registry.register::<Position>().unwrap();
        registry.register::<Velocity>().unwrap();

        // Position declared read-only, but the query writes it.
        let access = declared(&registry, &["Position", "Velocity"], &[]);
        let result = FamilyBinding::<(Write<Position>, Read<Velocity>)>::validate(&mut registry, &access);
        assert!(matches!(result, Err(EcsError::AccessViolation { component: "Position" })));
    }

    #[test]
    fn test_binding_accepts_read_of_written_component() {
        let mut registry = TypeRegistry::new();
        registry.register::<Position>().unwrap();
        registry.register::<Velocity>().unwrap();

        let access = declared(&registry, &["Velocity"], &["Position"]);
        let state = FamilyBinding::<(Read<Position>, Read<Velocity>)>::validate(&mut registry, &access).unwrap();
        let binding = FamilyBinding::<(Read<Position>, Read<Velocity>)>::new(
            state,
            access,
            FamilyId(0),
            MaskHandle::EMPTY,
        );
        assert_eq!(binding.visible().len(), 2);
        assert_eq!(binding.writes().len(), 1);
    }
}
