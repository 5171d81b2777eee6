//! # Configuration
//!
//! World construction settings and the system-declaration manifest, both
//! read from TOML once at startup.
//!
//! ```toml
//! blocks_per_page = 128
//! timelines = ["fixed", "render"]
//!
//! [[system]]
//! name = "integrate"
//! timeline = "fixed"
//! reads = ["Velocity"]
//! writes = ["Position"]
//! ```
//!
//! A manifest only names systems; a [`SystemFactory`] supplies the code.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ecs::{Access, ComponentMask, FamilyBinding, System, SystemId, TypeRegistry, World};
use crate::error::{EcsError, EcsResult};

/// Default allocator page granularity, in blocks.
pub const DEFAULT_BLOCKS_PER_PAGE: usize = 64;

/// Default number of pre-reserved entity slots.
pub const DEFAULT_ENTITY_CAPACITY: usize = 1024;

/// Settings for [`World::new`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Blocks carved from each allocator page.
    pub blocks_per_page: usize,
    /// Entity slots reserved up front.
    pub entity_capacity: usize,
    /// Timelines systems may be registered on.
    pub timelines: Vec<String>,
    /// Reject first-time component registration once the world is built.
    pub freeze_registry: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            blocks_per_page: DEFAULT_BLOCKS_PER_PAGE,
            entity_capacity: DEFAULT_ENTITY_CAPACITY,
            timelines: vec!["fixed".into(), "variable".into(), "render".into()],
            freeze_registry: false,
        }
    }
}

impl WorldConfig {
    /// Parses a config from TOML text. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// [`EcsError::InvalidConfig`] on malformed TOML or mistyped keys.
    pub fn from_toml_str(text: &str) -> EcsResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a config file.
    ///
    /// # Errors
    ///
    /// [`EcsError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> EcsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// One `[[system]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDeclaration {
    /// Key into the [`SystemFactory`].
    pub name: String,
    /// Timeline to install the system on.
    pub timeline: String,
    /// Component names the system reads.
    #[serde(default)]
    pub reads: Vec<String>,
    /// Component names the system writes.
    #[serde(default)]
    pub writes: Vec<String>,
}

/// Ordered list of system declarations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemManifest {
    /// Declarations in installation order.
    #[serde(default, rename = "system")]
    pub systems: Vec<SystemDeclaration>,
}

impl SystemManifest {
    /// Parses a manifest from TOML text.
    ///
    /// # Errors
    ///
    /// [`EcsError::InvalidConfig`] on malformed TOML or missing fields.
    pub fn from_toml_str(text: &str) -> EcsResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// [`EcsError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> EcsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Returns the number of declarations.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    /// Returns `true` if nothing is declared.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

/// Installs one system with resolved masks.
type Installer = Box<dyn FnMut(&mut World, &str, ComponentMask, ComponentMask) -> EcsResult<SystemId>>;

/// Checks a system's query against declared masks without building it.
type Validator = fn(&mut TypeRegistry, &Access) -> EcsResult<()>;

/// Constructor and query check registered under one name.
struct Entry {
    validate: Validator,
    install: Installer,
}

/// Maps manifest names to system constructors.
#[derive(Default)]
pub struct SystemFactory {
    entries: HashMap<String, Entry>,
}

impl SystemFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `make` under `name`. A later registration replaces an
    /// earlier one.
    pub fn register<S, F>(&mut self, name: impl Into<String>, mut make: F) -> &mut Self
    where
        S: System,
        F: FnMut() -> S + 'static,
    {
        let install: Installer = Box::new(
            move |world: &mut World, timeline: &str, reads: ComponentMask, writes: ComponentMask| {
                world.add_system_with_access(timeline, make(), reads, writes)
            },
        );
        let entry = Entry {
            validate: validate_query::<S>,
            install,
        };
        self.entries.insert(name.into(), entry);
        self
    }

    /// Returns `true` if `name` has a constructor.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Checks the query of the system registered as `name` against the
    /// declared masks.
    pub(crate) fn validate(
        &self,
        registry: &mut TypeRegistry,
        name: &str,
        declared: &Access,
    ) -> EcsResult<()> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| EcsError::UnknownSystemName(name.to_string()))?;
        (entry.validate)(registry, declared)
    }

    /// Builds and installs the system declared as `name`.
    pub(crate) fn install(
        &mut self,
        world: &mut World,
        name: &str,
        timeline: &str,
        reads: ComponentMask,
        writes: ComponentMask,
    ) -> EcsResult<SystemId> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| EcsError::UnknownSystemName(name.to_string()))?;
        (entry.install)(world, timeline, reads, writes)
    }
}

fn validate_query<S: System>(registry: &mut TypeRegistry, declared: &Access) -> EcsResult<()> {
    FamilyBinding::<S::Query>::validate(registry, declared).map(|_| ())
}
