//! # Families
//!
//! A family is a subscription keyed by a required capability mask. It owns
//! the list of entities whose mask is a superset of the requirement, and the
//! listeners told about membership changes.
//!
//! Membership only changes during the world's refresh phase, so a member list
//! is stable for the whole update phase of a step.

use std::collections::HashMap;
use std::fmt;

use super::entity::{EntityId, EntityView};
use super::mask::{ComponentMask, MaskHandle};
use super::system::SystemId;

/// Handle to a family owned by a world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FamilyId(pub(crate) u32);

impl FamilyId {
    /// Returns the raw index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Membership change kinds a listener can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FamilyEvent {
    /// The entity started matching the family.
    Added,
    /// The entity stopped matching, or died.
    Removed,
    /// The entity still matches but its component set changed.
    Modified,
}

/// Handle returned when a listener is registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Callback signature for free-standing family listeners.
pub type FamilyCallback = Box<dyn FnMut(&EntityView<'_>)>;

/// Who receives a notification.
pub(crate) enum ListenerTarget {
    /// A plain callback.
    Callback(FamilyCallback),
    /// A system through its family binding.
    Binding(SystemId),
}

/// One entry in a family's listener list.
pub(crate) struct Listener {
    pub(crate) id: ListenerId,
    pub(crate) event: FamilyEvent,
    pub(crate) target: ListenerTarget,
}

/// A subscription over entities matching a required mask.
pub struct Family {
    /// This family's handle.
    id: FamilyId,
    /// Interned inclusion mask.
    mask: MaskHandle,
    /// The inclusion mask itself.
    required: ComponentMask,
    /// Current members.
    members: Vec<EntityId>,
    /// Position of each member in `members`.
    positions: HashMap<EntityId, usize>,
    /// Registered listeners.
    pub(crate) listeners: Vec<Listener>,
}

impl Family {
    /// Creates an empty family.
    pub(crate) fn new(id: FamilyId, mask: MaskHandle, required: ComponentMask) -> Self {
        Self {
            id,
            mask,
            required,
            members: Vec::new(),
            positions: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Returns the family handle.
    #[inline]
    #[must_use]
    pub fn id(&self) -> FamilyId {
        self.id
    }

    /// Returns the interned inclusion mask.
    #[inline]
    #[must_use]
    pub fn mask(&self) -> MaskHandle {
        self.mask
    }

    /// Returns the inclusion mask.
    #[inline]
    #[must_use]
    pub fn required(&self) -> &ComponentMask {
        &self.required
    }

    /// Returns the current members.
    #[inline]
    #[must_use]
    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    /// Checks membership.
    #[inline]
    #[must_use]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.positions.contains_key(&entity)
    }

    /// Returns the number of members.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if nothing matches.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns the number of registered listeners.
    #[inline]
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Checks whether an entity mask satisfies this family.
    #[inline]
    #[must_use]
    pub fn matches(&self, mask: &ComponentMask) -> bool {
        mask.is_superset_of(&self.required)
    }

    /// Adds a member. Returns `false` if already present.
    pub(crate) fn insert(&mut self, entity: EntityId) -> bool {
        if self.positions.contains_key(&entity) {
            return false;
        }
        self.positions.insert(entity, self.members.len());
        self.members.push(entity);
        true
    }

    /// Removes a member. Returns `false` if absent.
    pub(crate) fn remove(&mut self, entity: EntityId) -> bool {
        let Some(position) = self.positions.remove(&entity) else {
            return false;
        };
        self.members.swap_remove(position);
        if let Some(&moved) = self.members.get(position) {
            self.positions.insert(moved, position);
        }
        true
    }

    /// Registers a listener.
    pub(crate) fn add_listener(&mut self, id: ListenerId, event: FamilyEvent, target: ListenerTarget) {
        self.listeners.push(Listener { id, event, target });
    }

    /// Unregisters a listener. Returns `true` if it was present.
    pub(crate) fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.id != id);
        self.listeners.len() != before
    }
}

impl fmt::Debug for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Family")
            .field("id", &self.id)
            .field("mask", &self.mask)
            .field("members", &self.members.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::ComponentId;

    fn family() -> Family {
        Family::new(
            FamilyId(0),
            MaskHandle::EMPTY,
            ComponentMask::from_ids(&[ComponentId::new(1)]),
        )
    }

    #[test]
    fn test_insert_remove_keeps_positions() {
        let mut family = family();
        let a = EntityId::new(0, 0);
        let b = EntityId::new(1, 0);
        let c = EntityId::new(2, 0);

        assert!(family.insert(a));
        assert!(family.insert(b));
        assert!(family.insert(c));
        assert!(!family.insert(b));

        assert!(family.remove(a));
        assert!(!family.remove(a));
        assert_eq!(family.len(), 2);
        assert!(family.contains(b));
        assert!(family.contains(c));

        assert!(family.remove(c));
        assert_eq!(family.members(), &[b]);
    }

    #[test]
    fn test_matches() {
        let family = family();
        assert!(family.matches(&ComponentMask::from_ids(&[ComponentId::new(0), ComponentId::new(1)])));
        assert!(!family.matches(&ComponentMask::from_ids(&[ComponentId::new(0)])));
    }

    #[test]
    fn test_listener_registration() {
        let mut family = family();
        family.add_listener(ListenerId(1), FamilyEvent::Added, ListenerTarget::Binding(SystemId(0)));
        family.add_listener(ListenerId(2), FamilyEvent::Removed, ListenerTarget::Callback(Box::new(|_| {})));
        assert_eq!(family.listener_count(), 2);

        assert!(family.remove_listener(ListenerId(1)));
        assert!(!family.remove_listener(ListenerId(1)));
        assert_eq!(family.listener_count(), 1);
    }
}
