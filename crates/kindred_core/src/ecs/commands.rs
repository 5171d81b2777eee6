//! # Deferred Commands
//!
//! Structural changes recorded by systems during the update phase. The world
//! applies them in recording order at the start of the next step, so no
//! system ever observes a family changed by an action of the same step.

use super::entity::EntityId;
use super::World;
use crate::error::EcsResult;

/// Installs a captured component value on an entity.
pub(crate) type InsertFn = Box<dyn FnOnce(&mut World, EntityId) -> EcsResult<()>>;

/// One recorded structural change.
pub(crate) enum Command {
    /// Create the record for an id reserved during the step.
    Spawn(EntityId),
    /// Mark an entity dead. Repeats are ignored.
    Destroy(EntityId),
    /// Add a component.
    Insert {
        entity: EntityId,
        component: &'static str,
        apply: InsertFn,
    },
    /// Remove a component.
    Remove {
        entity: EntityId,
        component: &'static str,
        apply: fn(&mut World, EntityId) -> EcsResult<()>,
    },
}

impl Command {
    /// Applies the command to `world`.
    pub(crate) fn apply(self, world: &mut World) -> EcsResult<()> {
        match self {
            Self::Spawn(entity) => {
                world.spawn_reserved(entity);
                Ok(())
            }
            Self::Destroy(entity) => world.destroy_deferred(entity),
            Self::Insert { entity, apply, .. } => apply(world, entity),
            Self::Remove { entity, apply, .. } => apply(world, entity),
        }
    }

    /// Short label used in logs and abort reports.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Spawn(entity) => format!("spawn {entity:?}"),
            Self::Destroy(entity) => format!("destroy {entity:?}"),
            Self::Insert { entity, component, .. } => format!("insert {component} on {entity:?}"),
            Self::Remove { entity, component, .. } => format!("remove {component} from {entity:?}"),
        }
    }
}

/// FIFO of recorded commands.
#[derive(Default)]
pub(crate) struct CommandQueue {
    commands: Vec<Command>,
}

impl CommandQueue {
    pub(crate) fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    /// Takes every recorded command, leaving the queue empty.
    pub(crate) fn drain(&mut self) -> std::vec::IntoIter<Command> {
        std::mem::take(&mut self.commands).into_iter()
    }
}
