//! Caller-created memory pools with their own sizing and eviction policy.

use crate::{
    allocation::Allocation,
    allocator::AllocationCreateInfo,
    block::NativeBudget,
    block_list::{BlockList, BlockListConfig},
    defrag::{DefragmentationContext, DefragmentationInfo},
    device::MemoryDevice,
    AllocatorError, DeviceSize, UsageError,
};
use std::sync::{atomic::AtomicU64, Arc};

/// Parameters to create a [`MemoryPool`].
#[derive(Clone, Copy, Debug)]
pub struct PoolCreateInfo {
    /// The index of the memory type the pool allocates from.
    ///
    /// The default value is `0`.
    pub memory_type_index: u32,

    /// The size of the pool's blocks. A value of `0` uses the owning allocator's preferred block
    /// size.
    ///
    /// The default value is `0`.
    pub block_size: DeviceSize,

    /// The number of blocks allocated up front and never freed, even when empty.
    ///
    /// The default value is `0`.
    pub min_block_count: usize,

    /// The maximum number of blocks the pool may hold at once.
    ///
    /// The default value is `usize::MAX`.
    pub max_block_count: usize,

    /// How many frames back an allocation must have gone untouched before it can be reclaimed,
    /// for lost-able allocations placed in this pool.
    ///
    /// The default value is `0`.
    pub frame_in_use_count: u32,
}

impl Default for PoolCreateInfo {
    fn default() -> Self {
        PoolCreateInfo {
            memory_type_index: 0,
            block_size: 0,
            min_block_count: 0,
            max_block_count: usize::MAX,
            frame_in_use_count: 0,
        }
    }
}

/// A set of blocks of one memory type with sizing policy independent of the owning allocator's
/// default lists.
///
/// Pools are created with [`Allocator::create_pool`] and torn down with
/// [`Allocator::destroy_pool`]; allocations made from a pool are freed through the owning
/// allocator like any other.
///
/// [`Allocator::create_pool`]: crate::Allocator::create_pool
/// [`Allocator::destroy_pool`]: crate::Allocator::destroy_pool
#[derive(Debug)]
pub struct MemoryPool {
    list: Arc<BlockList>,
}

impl MemoryPool {
    pub(crate) fn new(
        device: Arc<dyn MemoryDevice>,
        config: BlockListConfig,
        current_frame: Arc<AtomicU64>,
        budget: Arc<NativeBudget>,
    ) -> Result<Arc<Self>, AllocatorError> {
        let list = BlockList::new(device, config, current_frame, budget)?;

        Ok(Arc::new(MemoryPool { list }))
    }

    /// The index of the memory type this pool allocates from.
    pub fn memory_type_index(&self) -> u32 {
        self.list.memory_type_index()
    }

    /// The number of allocations that have been made from this pool and not freed yet.
    pub fn allocation_count(&self) -> usize {
        self.list.allocation_count()
    }

    /// The number of blocks the pool currently holds.
    pub fn block_count(&self) -> usize {
        self.list.lock_blocks().len()
    }

    /// Places an allocation in this pool.
    ///
    /// `create_info.dedicated` must be `false`: pools place every allocation in a block.
    pub fn allocate(
        &self,
        create_info: &AllocationCreateInfo,
    ) -> Result<Arc<Allocation>, AllocatorError> {
        if create_info.dedicated {
            return Err(UsageError::DedicatedInPool.into());
        }

        self.list.allocate(
            create_info.layout,
            create_info.allocation_type,
            create_info.can_become_lost,
            create_info.mapped,
        )
    }

    /// Starts a defragmentation pass over this pool's blocks. Every other operation on the pool
    /// blocks until the returned context is committed, aborted or dropped.
    pub fn begin_defragmentation(&self, info: &DefragmentationInfo) -> DefragmentationContext<'_> {
        DefragmentationContext::new(&self.list, info)
    }
}
