//! # Page Arena
//!
//! Fixed-size zeroed pages that back the size-class buckets.
//!
//! A page is allocated once and never moves or shrinks, so any block carved
//! out of it keeps a stable address until the owning bucket is dropped.

// SAFETY: Pages hand out raw block pointers. Every pointer is derived from the
// leaked page allocation and bounds-checked against the page length.
#![allow(unsafe_code)]

use std::alloc::{handle_alloc_error, Layout};
use std::ptr::NonNull;

use bytemuck::{Pod, Zeroable};

/// Alignment and granularity of every block, in bytes.
pub const BLOCK_ALIGN: usize = 16;

/// One allocation unit. Blocks span a whole number of chunks.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(16))]
pub(crate) struct Chunk([u8; BLOCK_ALIGN]);

/// Number of chunks needed to hold `size` bytes.
#[inline]
#[must_use]
pub(crate) const fn chunks_for(size: usize) -> usize {
    (size + BLOCK_ALIGN - 1) / BLOCK_ALIGN
}

/// A zero-initialized run of chunks owned by one bucket.
///
/// # Thread Safety
///
/// A page does no locking of its own. The bucket that owns it serializes
/// slot bookkeeping, and a block is only written through the handle that
/// owns it.
pub(crate) struct Page {
    /// Start of the leaked `Box<[Chunk]>`.
    chunks: NonNull<Chunk>,
    /// Length in chunks.
    len: usize,
}

impl Page {
    /// Allocates a zeroed page of `len` chunks.
    ///
    /// Allocation failure is fatal.
    #[must_use]
    pub(crate) fn zeroed(len: usize) -> Self {
        assert!(len > 0, "Page length must be greater than zero");

        let boxed: Box<[Chunk]> = match bytemuck::allocation::try_zeroed_slice_box(len) {
            Ok(boxed) => boxed,
            Err(()) => {
                let layout = Layout::array::<Chunk>(len).unwrap_or_else(|_| Layout::new::<Chunk>());
                tracing::error!(chunks = len, bytes = layout.size(), "page allocation failed");
                handle_alloc_error(layout)
            }
        };

        let chunks = NonNull::from(Box::leak(boxed)).cast::<Chunk>();
        Self { chunks, len }
    }

    /// Returns the page length in chunks.
    #[inline]
    #[must_use]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Returns the address of the chunk at `offset`.
    #[inline]
    #[must_use]
    pub(crate) fn chunk_ptr(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.len, "chunk offset out of bounds");
        // SAFETY: offset < len, so the result stays inside the allocation.
        unsafe { NonNull::new_unchecked(self.chunks.as_ptr().add(offset)).cast() }
    }

    /// Zeroes `count` chunks starting at `offset`.
    pub(crate) fn scrub(&mut self, offset: usize, count: usize) {
        assert!(offset + count <= self.len, "scrub range out of bounds");
        // SAFETY: range checked above; the caller owns the block exclusively.
        unsafe {
            std::ptr::write_bytes(self.chunks.as_ptr().add(offset), 0, count);
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // SAFETY: `chunks`/`len` came from `Box::leak` of a `Box<[Chunk]>`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.chunks.as_ptr(),
                self.len,
            )));
        }
    }
}

// SAFETY: Page owns its allocation outright.
unsafe impl Send for Page {}
// SAFETY: shared access only computes addresses; writes go through block owners.
unsafe impl Sync for Page {}
