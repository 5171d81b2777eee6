//! # Component System
//!
//! Components are plain data records with no behavior. The storage core never
//! knows their concrete type once installed; it reaches them through the
//! [`TypeRegistry`](super::TypeRegistry) by [`ComponentId`].

/// Marker trait for ECS components.
///
/// Components must be:
/// - `Send + Sync`: blocks may be allocated on background threads
/// - `'static`: the registry keys types by `TypeId`
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Debug, Default)]
/// struct Position {
///     x: f32,
///     y: f32,
///     z: f32,
/// }
///
/// impl Component for Position {
///     const NAME: &'static str = "Position";
/// }
/// ```
pub trait Component: Send + Sync + 'static {
    /// Stable name of this component type.
    ///
    /// System manifests refer to components by this name.
    const NAME: &'static str;
}

/// Dense identifier of a registered component type.
///
/// Ids are assigned in registration order starting at zero and double as the
/// bit index in a [`ComponentMask`](super::ComponentMask).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ComponentId(u32);

impl ComponentId {
    /// Creates an id from its raw index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index, which is also the mask bit.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}
