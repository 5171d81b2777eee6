//! # Pooled Components
//!
//! A typed, owned block. Lets worker threads build component values directly
//! in pool storage and hand them to the world later.

// SAFETY: writes and drops a `T` through a block pointer owned by the handle.
#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;

use super::arena::BLOCK_ALIGN;
use super::pool::{BlockHandle, SizeClassBucket, SizeClassPool};
use crate::ecs::Component;
use crate::error::{EcsError, EcsResult};

/// A component value living in a size-class block.
///
/// Dropping a `PooledComponent` that was never installed drops the value and
/// releases the block.
///
/// # Example
///
/// ```rust,ignore
/// let pool = world.pool();
/// let handle = std::thread::spawn(move || PooledComponent::new_in(&pool, Mesh::load("rock")))
///     .join()
///     .unwrap()?;
/// world.insert_pooled(entity, handle)?;
/// ```
pub struct PooledComponent<T: Component> {
    /// Bucket the block came from.
    bucket: Arc<SizeClassBucket>,
    /// The block holding the value.
    handle: BlockHandle,
    /// Marker for T.
    _phantom: PhantomData<T>,
}

impl<T: Component> PooledComponent<T> {
    /// Moves `value` into a freshly allocated block.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnsupportedAlignment`] if `T` needs more than block alignment.
    pub fn new_in(pool: &SizeClassPool, value: T) -> EcsResult<Self> {
        let align = std::mem::align_of::<T>();
        if align > BLOCK_ALIGN {
            return Err(EcsError::UnsupportedAlignment {
                component: T::NAME,
                align,
                max: BLOCK_ALIGN,
            });
        }

        let bucket = pool.bucket_for(std::mem::size_of::<T>());
        let handle = bucket.allocate();
        let ptr = bucket.block_ptr(handle)?;

        // SAFETY: the block is freshly allocated, at least size_of::<T>() bytes,
        // and BLOCK_ALIGN-aligned, which covers align_of::<T>().
        unsafe { ptr.cast::<T>().as_ptr().write(value) };

        Ok(Self {
            bucket,
            handle,
            _phantom: PhantomData,
        })
    }

    /// Returns the block handle.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> BlockHandle {
        self.handle
    }

    /// Returns the bucket the block came from.
    #[inline]
    pub(crate) fn bucket(&self) -> &Arc<SizeClassBucket> {
        &self.bucket
    }

    /// Reads the value.
    #[must_use]
    pub fn get(&self) -> &T {
        let ptr = self
            .bucket
            .block_ptr(self.handle)
            .unwrap_or_else(|err| unreachable!("pooled block went stale: {err}"));
        // SAFETY: the block holds an initialized T owned by self.
        unsafe { &*ptr.cast::<T>().as_ptr() }
    }

    /// Mutates the value.
    pub fn get_mut(&mut self) -> &mut T {
        let ptr = self
            .bucket
            .block_ptr(self.handle)
            .unwrap_or_else(|err| unreachable!("pooled block went stale: {err}"));
        // SAFETY: the block holds an initialized T and self is borrowed mutably.
        unsafe { &mut *ptr.cast::<T>().as_ptr() }
    }

    /// Gives up ownership of the block without dropping the value.
    ///
    /// The caller becomes responsible for running the registered destructor
    /// and releasing the block.
    #[must_use]
    pub(crate) fn into_handle(self) -> BlockHandle {
        let handle = self.handle;
        std::mem::forget(self);
        handle
    }
}

impl<T: Component> Drop for PooledComponent<T> {
    fn drop(&mut self) {
        if let Ok(ptr) = self.bucket.block_ptr(self.handle) {
            // SAFETY: the block still holds the value this handle owns.
            unsafe { std::ptr::drop_in_place(ptr.cast::<T>().as_ptr()) };
        }
        if let Err(err) = self.bucket.release(self.handle) {
            tracing::warn!(%err, component = T::NAME, "failed to release pooled block");
        }
    }
}

// SAFETY: the value is owned exclusively; T: Component is Send + Sync.
unsafe impl<T: Component> Send for PooledComponent<T> {}
// SAFETY: shared access only hands out &T, and T: Sync.
unsafe impl<T: Component> Sync for PooledComponent<T> {}
