//! Lists of blocks serving one memory type, with growth, eviction and retirement policy.

use crate::{
    allocation::{Allocation, BlockPosition},
    block::{Block, NativeBudget},
    device::MemoryDevice,
    layout::{DeviceAlignment, DeviceLayout},
    suballocator::{AllocationType, SlotId, SuballocatorError},
    AllocatorError, DeviceSize, UsageError,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};

/// Sizing and eviction policy of one block list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockListConfig {
    pub memory_type_index: u32,
    pub preferred_block_size: DeviceSize,
    pub min_block_count: usize,
    pub max_block_count: usize,
    pub frame_in_use_count: u32,
}

/// The set of blocks serving one memory type, either for the allocator's default per-type lists
/// or for a caller-created pool.
///
/// All structural changes (placement, growth, freeing, defragmentation) serialize on the block
/// vector's mutex; `touch` and `make_lost` on individual allocations stay lock-free.
#[derive(Debug)]
pub(crate) struct BlockList {
    device: Arc<dyn MemoryDevice>,
    config: BlockListConfig,
    current_frame: Arc<AtomicU64>,
    budget: Arc<NativeBudget>,
    blocks: Mutex<Vec<Arc<Block>>>,
    allocation_count: AtomicUsize,
}

impl BlockList {
    pub(crate) fn new(
        device: Arc<dyn MemoryDevice>,
        config: BlockListConfig,
        current_frame: Arc<AtomicU64>,
        budget: Arc<NativeBudget>,
    ) -> Result<Arc<Self>, AllocatorError> {
        let mut blocks = Vec::with_capacity(config.min_block_count);

        for _ in 0..config.min_block_count {
            let block = Block::new(
                device.clone(),
                config.memory_type_index,
                config.preferred_block_size,
                budget.clone(),
            )
            .map_err(|_| AllocatorError::OutOfDeviceMemory)?;
            blocks.push(block);
        }

        Ok(Arc::new(BlockList {
            device,
            config,
            current_frame,
            budget,
            blocks: Mutex::new(blocks),
            allocation_count: AtomicUsize::new(0),
        }))
    }

    pub(crate) fn memory_type_index(&self) -> u32 {
        self.config.memory_type_index
    }

    pub(crate) fn min_block_count(&self) -> usize {
        self.config.min_block_count
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::Acquire)
    }

    pub(crate) fn lock_blocks(&self) -> MutexGuard<'_, Vec<Arc<Block>>> {
        self.blocks.lock()
    }

    /// Places an allocation in this list, trying in order: existing blocks, a new block, and an
    /// eviction sweep of lost-able allocations followed by a retry.
    pub(crate) fn allocate(
        self: &Arc<Self>,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        can_become_lost: bool,
        mapped: bool,
    ) -> Result<Arc<Allocation>, AllocatorError> {
        let size = layout.size();
        let alignment = layout.alignment();

        let mut blocks = self.blocks.lock();
        let mut saw_fragmented = false;

        if let Some((block, offset, id)) =
            try_existing(&mut blocks, size, alignment, allocation_type, &mut saw_fragmented)
        {
            return self.finish(block, offset, id, layout, allocation_type, can_become_lost, mapped);
        }

        if blocks.len() < self.config.max_block_count {
            if let Ok(block) = self.grow(&mut blocks, size) {
                if let Ok((offset, id)) = block.allocate(size, alignment, allocation_type) {
                    return self.finish(
                        block,
                        offset,
                        id,
                        layout,
                        allocation_type,
                        can_become_lost,
                        mapped,
                    );
                }
            }
        }

        if self.evict(&blocks) {
            if let Some((block, offset, id)) =
                try_existing(&mut blocks, size, alignment, allocation_type, &mut saw_fragmented)
            {
                return self.finish(
                    block,
                    offset,
                    id,
                    layout,
                    allocation_type,
                    can_become_lost,
                    mapped,
                );
            }
        }

        Err(if saw_fragmented {
            AllocatorError::FragmentationTooHigh
        } else {
            AllocatorError::OutOfDeviceMemory
        })
    }

    /// Returns an allocation's range to its block and retires the block if the list now holds
    /// more than one empty block above the configured minimum.
    pub(crate) fn free(&self, allocation: &Allocation) {
        let map_refs = allocation.take_map_refs();
        let mut blocks = self.blocks.lock();

        if let Some(position) = allocation.take_position() {
            // Rebalance the block's shared mapping for the references this handle still held.
            for _ in 0..map_refs {
                position.block.unmap();
            }

            position.block.release(position.id);
            self.maybe_retire(&mut blocks, &position.block);
        }

        drop(blocks);
        let prev = self.allocation_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    fn finish(
        self: &Arc<Self>,
        block: Arc<Block>,
        offset: DeviceSize,
        id: SlotId,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        can_become_lost: bool,
        mapped: bool,
    ) -> Result<Arc<Allocation>, AllocatorError> {
        if mapped && !block.host_visible() {
            block.release(id);
            return Err(UsageError::NotHostVisible.into());
        }

        let allocation = Allocation::new_block(
            Arc::downgrade(self),
            BlockPosition {
                block: block.clone(),
                offset,
                id,
            },
            layout.size(),
            layout.alignment(),
            allocation_type,
            can_become_lost,
            self.current_frame.load(Ordering::Acquire),
        );

        if mapped {
            match block.map() {
                Ok(_) => allocation.set_persistently_mapped(),
                Err(err) => {
                    allocation.mark_disposed();
                    if let Some(position) = allocation.take_position() {
                        position.block.release(position.id);
                    }
                    return Err(err.into());
                }
            }
        }

        self.allocation_count.fetch_add(1, Ordering::AcqRel);

        Ok(allocation)
    }

    /// Adds a new block, halving the preferred size on native failure up to three times but never
    /// going below the requested size.
    fn grow(
        &self,
        blocks: &mut Vec<Arc<Block>>,
        size: DeviceSize,
    ) -> Result<Arc<Block>, AllocatorError> {
        let preferred = self.config.preferred_block_size.max(size);

        for i in 0..4 {
            let block_size = (preferred >> i).max(size);

            match Block::new(
                self.device.clone(),
                self.config.memory_type_index,
                block_size,
                self.budget.clone(),
            ) {
                Ok(block) => {
                    blocks.push(block.clone());
                    return Ok(block);
                }
                Err(err) => {
                    log::debug!(
                        "failed to grow memory type {} by a {block_size} byte block: {err}",
                        self.config.memory_type_index,
                    );

                    if block_size == size {
                        break;
                    }
                }
            }
        }

        Err(AllocatorError::OutOfDeviceMemory)
    }

    /// Reclaims every lost-able allocation in the list that went untouched for more than
    /// `frame_in_use_count` frames. Mapped allocations are never reclaimed.
    fn evict(&self, blocks: &[Arc<Block>]) -> bool {
        let current_frame = self.current_frame.load(Ordering::Acquire);
        let mut evicted = 0u32;

        for block in blocks {
            for node in block.occupied_nodes() {
                let Some(owner) = node.owner.as_ref().and_then(Weak::upgrade) else {
                    continue;
                };

                if !owner.can_become_lost() || owner.is_mapped() {
                    continue;
                }

                if owner.make_lost(current_frame, self.config.frame_in_use_count) {
                    if let Some(position) = owner.take_position() {
                        position.block.release(position.id);
                        evicted += 1;
                    }
                }
            }
        }

        if evicted > 0 {
            log::debug!(
                "reclaimed {evicted} lost allocations from memory type {}",
                self.config.memory_type_index,
            );
        }

        evicted > 0
    }

    pub(crate) fn maybe_retire(&self, blocks: &mut Vec<Arc<Block>>, block: &Arc<Block>) {
        if !block.is_empty() || blocks.len() <= self.config.min_block_count {
            return;
        }

        // Keep one empty block around to absorb allocate/free churn.
        let empty_count = blocks.iter().filter(|block| block.is_empty()).count();

        if empty_count > 1 {
            if let Some(index) = blocks.iter().position(|other| Arc::ptr_eq(other, block)) {
                blocks.remove(index);
            }
        }
    }
}

/// Tries every existing block that has enough free space in aggregate, emptiest-last so that
/// fuller blocks are packed tighter first.
fn try_existing(
    blocks: &mut [Arc<Block>],
    size: DeviceSize,
    alignment: DeviceAlignment,
    allocation_type: AllocationType,
    saw_fragmented: &mut bool,
) -> Option<(Arc<Block>, DeviceSize, SlotId)> {
    blocks.sort_by_key(|block| block.free_size());

    let from = match blocks.binary_search_by_key(&size, |block| block.free_size()) {
        Ok(index) => index,
        Err(index) => index,
    };

    for block in &blocks[from..] {
        match block.allocate(size, alignment, allocation_type) {
            Ok((offset, id)) => return Some((block.clone(), offset, id)),
            Err(SuballocatorError::FragmentedRegion) => *saw_fragmented = true,
            Err(SuballocatorError::OutOfRegionMemory) => {}
        }
    }

    None
}
