//! # Size-Class Pool
//!
//! Free-list allocators keyed by byte size, for component storage.
//!
//! Each distinct component size gets its own [`SizeClassBucket`]. Buckets are
//! created lazily, cached, and never shrink: released blocks go back on the
//! bucket's free list and are only ever reused for the same size class.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::arena::{chunks_for, Chunk, Page};
use crate::error::{EcsError, EcsResult};

/// Handle to one block inside a size class.
///
/// The generation changes every time the slot is released, so a handle kept
/// past its release is rejected instead of aliasing the next occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    /// Byte size of the owning bucket.
    size: usize,
    /// Slot index inside the bucket.
    slot: u32,
    /// Slot generation at allocation time.
    generation: u32,
}

impl BlockHandle {
    /// Returns the size class this block belongs to.
    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        self.size
    }

    /// Returns the slot index inside the bucket.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Returns the slot generation.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Allocation counters for one bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketStats {
    /// Byte size served by the bucket.
    pub block_size: usize,
    /// Number of slots ever created. Never decreases.
    pub high_water_mark: usize,
    /// Blocks currently handed out.
    pub live_blocks: usize,
    /// Blocks waiting on the free list.
    pub free_blocks: usize,
    /// Backing pages allocated.
    pub pages: usize,
}

/// Slot bookkeeping guarded by the bucket lock.
struct Slots {
    pages: Vec<Page>,
    generations: Vec<u32>,
    occupied: Vec<bool>,
    free_list: Vec<u32>,
    live: usize,
}

/// A free-list allocator for one fixed block size.
///
/// # Thread Safety
///
/// Allocation and release lock the bucket, so background threads may
/// allocate while the main thread steps the world.
pub struct SizeClassBucket {
    /// Bytes per block as requested.
    block_size: usize,
    /// Chunks per block (zero for zero-sized components).
    chunks_per_block: usize,
    /// Blocks carved out of each page.
    blocks_per_page: usize,
    /// Slot state.
    slots: Mutex<Slots>,
}

impl SizeClassBucket {
    /// Creates an empty bucket. No memory is reserved until the first allocation.
    ///
    /// # Arguments
    ///
    /// * `block_size` - Bytes per block
    /// * `blocks_per_page` - How many blocks each backing page holds
    #[must_use]
    pub fn new(block_size: usize, blocks_per_page: usize) -> Self {
        assert!(blocks_per_page > 0, "Blocks per page must be greater than zero");

        Self {
            block_size,
            chunks_per_block: chunks_for(block_size),
            blocks_per_page,
            slots: Mutex::new(Slots {
                pages: Vec::new(),
                generations: Vec::new(),
                occupied: Vec::new(),
                free_list: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Returns the byte size served by this bucket.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocates a zeroed block.
    ///
    /// O(1): pops the free list, or appends a slot (adding a page when the
    /// last one is full).
    pub fn allocate(&self) -> BlockHandle {
        let mut slots = self.slots.lock();

        let slot = if let Some(slot) = slots.free_list.pop() {
            slot
        } else {
            let slot = slots.generations.len();
            if self.chunks_per_block > 0 && slot % self.blocks_per_page == 0 {
                slots
                    .pages
                    .push(Page::zeroed(self.blocks_per_page * self.chunks_per_block));
                tracing::trace!(
                    size = self.block_size,
                    pages = slots.pages.len(),
                    "size class grew by one page"
                );
            }
            slots.generations.push(0);
            slots.occupied.push(false);
            u32::try_from(slot).unwrap_or_else(|_| {
                tracing::error!(size = self.block_size, "size class exhausted its slot space");
                std::alloc::handle_alloc_error(std::alloc::Layout::new::<Chunk>())
            })
        };

        let index = slot as usize;
        slots.occupied[index] = true;
        slots.live += 1;

        BlockHandle {
            size: self.block_size,
            slot,
            generation: slots.generations[index],
        }
    }

    /// Returns a block to the free list.
    ///
    /// The block is zeroed and its generation bumped. The caller must already
    /// have dropped whatever value lived in it.
    ///
    /// # Errors
    ///
    /// [`EcsError::DoubleRelease`] if the block is already free,
    /// [`EcsError::InvalidBlock`] for a foreign or stale handle.
    pub fn release(&self, handle: BlockHandle) -> EcsResult<()> {
        let mut slots = self.slots.lock();
        let index = self.validate_slot(&slots, handle)?;

        if !slots.occupied[index] {
            return Err(EcsError::DoubleRelease {
                size: self.block_size,
                slot: handle.slot,
            });
        }

        if self.chunks_per_block > 0 {
            let (page, offset) = self.locate(index);
            slots.pages[page].scrub(offset, self.chunks_per_block);
        }

        slots.occupied[index] = false;
        slots.generations[index] = slots.generations[index].wrapping_add(1);
        slots.free_list.push(handle.slot);
        slots.live -= 1;

        Ok(())
    }

    /// Resolves a live handle to its block address.
    ///
    /// The address stays valid until the block is released.
    ///
    /// # Errors
    ///
    /// [`EcsError::InvalidBlock`] if the handle does not address a live block.
    pub fn block_ptr(&self, handle: BlockHandle) -> EcsResult<NonNull<u8>> {
        let slots = self.slots.lock();
        let index = self.validate_slot(&slots, handle)?;

        if !slots.occupied[index] {
            return Err(EcsError::InvalidBlock {
                size: self.block_size,
                slot: handle.slot,
            });
        }

        if self.chunks_per_block == 0 {
            return Ok(NonNull::<Chunk>::dangling().cast());
        }

        let (page, offset) = self.locate(index);
        Ok(slots.pages[page].chunk_ptr(offset))
    }

    /// Returns the allocation counters.
    #[must_use]
    pub fn stats(&self) -> BucketStats {
        let slots = self.slots.lock();
        BucketStats {
            block_size: self.block_size,
            high_water_mark: slots.generations.len(),
            live_blocks: slots.live,
            free_blocks: slots.free_list.len(),
            pages: slots.pages.len(),
        }
    }

    /// Page index and chunk offset of a slot.
    #[inline]
    fn locate(&self, index: usize) -> (usize, usize) {
        (
            index / self.blocks_per_page,
            (index % self.blocks_per_page) * self.chunks_per_block,
        )
    }

    /// Checks that a handle belongs to this bucket and is current.
    fn validate_slot(&self, slots: &Slots, handle: BlockHandle) -> EcsResult<usize> {
        let index = handle.slot as usize;
        let current = slots.generations.get(index).copied();

        if handle.size != self.block_size || current.is_none() {
            return Err(EcsError::InvalidBlock {
                size: handle.size,
                slot: handle.slot,
            });
        }

        if current != Some(handle.generation) {
            // The slot moved on since this handle was issued. If it was
            // released exactly once and not reused, this is a double release.
            let released_once = current == Some(handle.generation.wrapping_add(1));
            if released_once && !slots.occupied[index] {
                return Err(EcsError::DoubleRelease {
                    size: self.block_size,
                    slot: handle.slot,
                });
            }
            return Err(EcsError::InvalidBlock {
                size: self.block_size,
                slot: handle.slot,
            });
        }

        Ok(index)
    }
}

/// The dictionary of buckets, keyed by byte size.
///
/// Lookups take a read lock; only the first request for a new size takes the
/// write lock.
pub struct SizeClassPool {
    /// Buckets by block size.
    buckets: RwLock<HashMap<usize, Arc<SizeClassBucket>>>,
    /// Page granularity handed to new buckets.
    blocks_per_page: usize,
}

impl SizeClassPool {
    /// Creates an empty pool.
    ///
    /// # Arguments
    ///
    /// * `blocks_per_page` - Page granularity for every bucket
    #[must_use]
    pub fn new(blocks_per_page: usize) -> Self {
        assert!(blocks_per_page > 0, "Blocks per page must be greater than zero");
        Self {
            buckets: RwLock::new(HashMap::new()),
            blocks_per_page,
        }
    }

    /// Returns the bucket for `size`, creating it on first use.
    pub fn bucket_for(&self, size: usize) -> Arc<SizeClassBucket> {
        if let Some(bucket) = self.buckets.read().get(&size) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(size).or_insert_with(|| {
            tracing::debug!(size, "new size class");
            Arc::new(SizeClassBucket::new(size, self.blocks_per_page))
        });
        Arc::clone(bucket)
    }

    /// Allocates a block of `size` bytes.
    pub fn allocate(&self, size: usize) -> BlockHandle {
        self.bucket_for(size).allocate()
    }

    /// Releases a block to its bucket.
    ///
    /// # Errors
    ///
    /// See [`SizeClassBucket::release`].
    pub fn release(&self, handle: BlockHandle) -> EcsResult<()> {
        self.existing(handle)?.release(handle)
    }

    /// Resolves a handle to its block address.
    ///
    /// # Errors
    ///
    /// See [`SizeClassBucket::block_ptr`].
    pub fn block_ptr(&self, handle: BlockHandle) -> EcsResult<NonNull<u8>> {
        self.existing(handle)?.block_ptr(handle)
    }

    /// Returns counters for every bucket, ordered by block size.
    #[must_use]
    pub fn stats(&self) -> Vec<BucketStats> {
        let mut stats: Vec<BucketStats> =
            self.buckets.read().values().map(|bucket| bucket.stats()).collect();
        stats.sort_by_key(|s| s.block_size);
        stats
    }

    /// Returns counters for one size class, if it exists.
    #[must_use]
    pub fn stats_for(&self, size: usize) -> Option<BucketStats> {
        self.buckets.read().get(&size).map(|bucket| bucket.stats())
    }

    /// Returns `true` if `bucket` is this pool's bucket for its size.
    #[must_use]
    pub fn owns(&self, bucket: &Arc<SizeClassBucket>) -> bool {
        self.buckets
            .read()
            .get(&bucket.block_size())
            .is_some_and(|own| Arc::ptr_eq(own, bucket))
    }

    /// Looks up the bucket a handle came from without creating one.
    fn existing(&self, handle: BlockHandle) -> EcsResult<Arc<SizeClassBucket>> {
        self.buckets
            .read()
            .get(&handle.size)
            .cloned()
            .ok_or(EcsError::InvalidBlock {
                size: handle.size,
                slot: handle.slot,
            })
    }
}

impl Default for SizeClassPool {
    fn default() -> Self {
        Self::new(64)
    }
}
