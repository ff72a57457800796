//! A sub-allocator for GPU-visible device memory.
//!
//! Native memory allocation calls are expensive and subject to hard per-process count limits
//! (often as low as 4096 allocations), so any non-trivial renderer has to batch many logical
//! resource allocations into few physical ones. This crate carves small, frequently
//! created/destroyed resource-memory requests out of a small number of large *blocks* of native
//! memory instead of issuing one native allocation per resource.
//!
//! # Blocks and suballocations
//!
//! A [block] is one native memory object together with a free-list that partitions its byte range
//! into suballocations. The [`Allocator`] owns one block list per native memory type, plus any
//! number of caller-created [memory pools] with independent sizing policy. Requests that are
//! oversized, or explicitly marked dedicated, bypass the block lists and receive a whole native
//! memory object of their own.
//!
//! # Lost allocations
//!
//! Transient resources (streaming buffers, per-frame scratch) can opt into eviction by being
//! created with `can_become_lost`. Such allocations must be [touched] every frame they are used;
//! under memory pressure the allocator reclaims the memory of any lost-able allocation whose
//! frame stamp lags the current frame by more than the configured `frame_in_use_count`. Touching
//! and eviction are lock-free compare-and-swap loops so that parallel command recording never
//! blocks on the allocator.
//!
//! # Defragmentation
//!
//! Long-lived block lists fragment. [`DefragmentationContext`] plans a bounded set of relocations
//! (the actual data copies are delegated to the caller, which typically records them into a
//! transfer command buffer), then either commits the pass, repointing every moved allocation and
//! freeing emptied blocks, or aborts it without any partial state.
//!
//! The native graphics API is abstracted behind the [`MemoryDevice`] trait; an implementation for
//! Vulkan through [`ash`] is provided behind the `vulkan` cargo feature (enabled by default).
//!
//! [block]: self#blocks-and-suballocations
//! [memory pools]: MemoryPool
//! [touched]: Allocator::touch
//! [`MemoryDevice`]: device::MemoryDevice
//! [`DefragmentationContext`]: defrag::DefragmentationContext

pub mod defrag;
pub mod device;
pub mod layout;
#[cfg(feature = "vulkan")]
pub mod vulkan;

mod allocation;
mod allocator;
mod block;
mod block_list;
mod pool;
mod suballocator;
#[cfg(test)]
mod tests;

pub use self::{
    allocation::Allocation,
    allocator::{AllocationCreateInfo, Allocator, AllocatorCreateInfo},
    pool::{MemoryPool, PoolCreateInfo},
    suballocator::AllocationType,
};
use crate::device::NativeError;
use std::{
    error::Error,
    fmt::{self, Display},
};

/// Represents a size or offset in device memory, in bytes.
pub type DeviceSize = u64;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = std::num::NonZeroU64;

/// Error that can be returned by any of the allocator's operations.
///
/// `OutOfDeviceMemory` and `FragmentationTooHigh` are recoverable: the caller can free something,
/// trigger defragmentation, and retry. `InvalidUsage` indicates a programming error.
/// `NativeApi` wraps an error code of the underlying API verbatim; this layer never retries
/// native calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocatorError {
    /// The native allocation failed and no block or pool could be grown or evicted.
    OutOfDeviceMemory,

    /// Enough free space exists in aggregate, but no single contiguous region satisfies the
    /// request. Defragmentation is likely to help.
    FragmentationTooHigh,

    /// The operation violates the allocator's usage contract.
    InvalidUsage(UsageError),

    /// The underlying API returned an error that is passed through unmodified.
    NativeApi(NativeError),
}

impl Error for AllocatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidUsage(err) => Some(err),
            Self::NativeApi(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDeviceMemory => f.write_str("out of device memory"),
            Self::FragmentationTooHigh => {
                f.write_str("no contiguous free region large enough despite sufficient free space")
            }
            Self::InvalidUsage(_) => f.write_str("invalid usage"),
            Self::NativeApi(_) => f.write_str("the native API returned an error"),
        }
    }
}

impl From<UsageError> for AllocatorError {
    fn from(err: UsageError) -> Self {
        Self::InvalidUsage(err)
    }
}

impl From<NativeError> for AllocatorError {
    fn from(err: NativeError) -> Self {
        Self::NativeApi(err)
    }
}

/// A violation of the allocator's usage contract. These are programming errors, not runtime
/// conditions, and are surfaced as [`AllocatorError::InvalidUsage`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsageError {
    /// The allocation has already been disposed.
    Disposed,

    /// The allocation's memory was reclaimed by the allocator because it went untouched for more
    /// than `frame_in_use_count` frames.
    Lost,

    /// The map refcount would overflow.
    MapCountOverflow,

    /// `unmap` was called more times than `map`.
    UnmapUnderflow,

    /// The allocation's memory type is not host-visible, so it cannot be mapped, flushed or
    /// invalidated.
    NotHostVisible,

    /// A dedicated allocation can never become lost.
    DedicatedCannotBecomeLost,

    /// Memory pools place every allocation in a block; they cannot serve dedicated allocations.
    DedicatedInPool,

    /// The given memory type index is out of bounds of the device's memory types.
    InvalidMemoryTypeIndex,

    /// The pool still has live allocations.
    PoolAllocationsOutstanding,

    /// The allocator still has live allocations.
    AllocationsOutstanding(usize),
}

impl Error for UsageError {}

impl Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed => f.write_str("the allocation has been disposed"),
            Self::Lost => f.write_str("the allocation's memory has been reclaimed"),
            Self::MapCountOverflow => f.write_str("the map refcount would overflow"),
            Self::UnmapUnderflow => f.write_str("`unmap` was called without a matching `map`"),
            Self::NotHostVisible => f.write_str("the memory type is not host-visible"),
            Self::DedicatedCannotBecomeLost => {
                f.write_str("a dedicated allocation can never become lost")
            }
            Self::DedicatedInPool => {
                f.write_str("memory pools cannot serve dedicated allocations")
            }
            Self::InvalidMemoryTypeIndex => f.write_str("no such memory type"),
            Self::PoolAllocationsOutstanding => {
                f.write_str("the pool still has live allocations")
            }
            Self::AllocationsOutstanding(count) => {
                write!(f, "{count} allocations are still outstanding")
            }
        }
    }
}
