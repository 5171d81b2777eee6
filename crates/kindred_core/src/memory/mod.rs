//! # Memory Management
//!
//! Size-class pools for component storage.
//!
//! ## Design Philosophy
//!
//! Component blocks come from per-size free lists instead of the general
//! allocator:
//! - No per-component heap allocation once a size class is warm
//! - Freed blocks are reused for the same size only, never returned
//! - Handles are generation-checked, so stale or doubled releases are caught

mod arena;
mod pool;
mod pooled;

pub use arena::BLOCK_ALIGN;
pub use pool::{BlockHandle, BucketStats, SizeClassBucket, SizeClassPool};
pub use pooled::PooledComponent;
