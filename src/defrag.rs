//! Defragmentation of block lists.
//!
//! A pass is a three-step protocol. [`DefragmentationContext::new`] *plans* a bounded set of
//! relocations and reserves their destination ranges, holding the list's lock so that no other
//! structural change can interleave. The caller then performs the actual data *copies* (usually
//! by recording them into a transfer command buffer and waiting for it). Finally the pass is
//! either *committed*, repointing every moved allocation and freeing emptied blocks, or aborted,
//! releasing the reservations and leaving every allocation exactly where it was.
//!
//! Mapped and lost allocations are never moved.

use crate::{
    allocation::{Allocation, BlockPosition},
    block::Block,
    block_list::BlockList,
    device::MemoryHandle,
    suballocator::SlotId,
    DeviceSize,
};
use parking_lot::MutexGuard;
use smallvec::SmallVec;
use std::{
    cmp::Reverse,
    sync::{Arc, Weak},
};

/// Budget limits of one defragmentation pass.
#[derive(Clone, Copy, Debug)]
pub struct DefragmentationInfo {
    /// The maximum number of bytes the pass may relocate.
    ///
    /// The default value is `DeviceSize::MAX`.
    pub max_bytes_to_move: DeviceSize,

    /// The maximum number of allocations the pass may relocate.
    ///
    /// The default value is `usize::MAX`.
    pub max_allocations_to_move: usize,
}

impl Default for DefragmentationInfo {
    fn default() -> Self {
        DefragmentationInfo {
            max_bytes_to_move: DeviceSize::MAX,
            max_allocations_to_move: usize::MAX,
        }
    }
}

/// What one committed pass accomplished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DefragmentationStats {
    pub bytes_moved: DeviceSize,
    pub allocations_moved: usize,
    pub bytes_freed: DeviceSize,
    pub blocks_freed: usize,
}

/// One relocation the caller must copy before committing the pass.
///
/// The source range stays valid (and the destination range reserved) until the pass is committed
/// or aborted.
#[derive(Clone, Debug)]
pub struct DefragmentationMove {
    pub allocation: Arc<Allocation>,
    pub src_memory: MemoryHandle,
    pub src_offset: DeviceSize,
    pub dst_memory: MemoryHandle,
    pub dst_offset: DeviceSize,
    pub size: DeviceSize,
}

struct PlannedMove {
    allocation: Arc<Allocation>,
    src_block: Arc<Block>,
    src_id: SlotId,
    dst_block: Arc<Block>,
    dst_offset: DeviceSize,
    dst_id: SlotId,
}

/// An in-progress defragmentation pass over one block list.
///
/// Holds the list's lock for its whole lifetime: every allocate and free on the list blocks until
/// the pass ends. Dropping the context aborts the pass.
pub struct DefragmentationContext<'a> {
    list: &'a BlockList,
    blocks: MutexGuard<'a, Vec<Arc<Block>>>,
    planned: Vec<PlannedMove>,
    moves: Vec<DefragmentationMove>,
}

impl<'a> DefragmentationContext<'a> {
    /// Locks the list and plans the pass.
    ///
    /// Sources are drained emptiest-first and their allocations placed largest-first into the
    /// fullest block that can take them, so that the fewest moved bytes empty whole blocks. A
    /// block never serves as both source and destination within one pass.
    pub(crate) fn new(list: &'a BlockList, info: &DefragmentationInfo) -> Self {
        let blocks = list.lock_blocks();
        let mut planned = Vec::new();
        let mut moves = Vec::new();

        let mut source_order: SmallVec<[usize; 8]> = (0..blocks.len()).collect();
        source_order.sort_by_key(|&index| Reverse(blocks[index].free_size()));

        let mut is_source = vec![false; blocks.len()];
        let mut is_destination = vec![false; blocks.len()];
        let mut bytes_planned = 0;

        'sources: for &src_index in &source_order {
            let src_block = &blocks[src_index];

            if is_destination[src_index] || src_block.is_empty() {
                continue;
            }

            let mut nodes = src_block.occupied_nodes();
            nodes.sort_by_key(|node| Reverse(node.size));

            for node in nodes {
                if planned.len() >= info.max_allocations_to_move {
                    break 'sources;
                }

                let Some(allocation) = node.owner.as_ref().and_then(Weak::upgrade) else {
                    continue;
                };
                if allocation.is_mapped() || allocation.is_lost() {
                    continue;
                }
                if bytes_planned + node.size > info.max_bytes_to_move {
                    continue;
                }

                let mut dst_order: SmallVec<[usize; 8]> = (0..blocks.len()).collect();
                dst_order.sort_by_key(|&index| blocks[index].free_size());

                for &dst_index in &dst_order {
                    if dst_index == src_index || is_source[dst_index] {
                        continue;
                    }

                    let dst_block = &blocks[dst_index];

                    if let Ok((dst_offset, dst_id)) = dst_block.allocate(
                        node.size,
                        allocation.alignment(),
                        allocation.allocation_type(),
                    ) {
                        is_source[src_index] = true;
                        is_destination[dst_index] = true;
                        bytes_planned += node.size;

                        moves.push(DefragmentationMove {
                            allocation: allocation.clone(),
                            src_memory: src_block.memory(),
                            src_offset: node.offset,
                            dst_memory: dst_block.memory(),
                            dst_offset,
                            size: node.size,
                        });
                        planned.push(PlannedMove {
                            allocation,
                            src_block: src_block.clone(),
                            src_id: node.id,
                            dst_block: dst_block.clone(),
                            dst_offset,
                            dst_id,
                        });

                        break;
                    }
                }
            }
        }

        DefragmentationContext {
            list,
            blocks,
            planned,
            moves,
        }
    }

    /// The relocations the caller must copy (source to destination) before committing.
    pub fn moves(&self) -> &[DefragmentationMove] {
        &self.moves
    }

    /// Commits the pass: repoints every moved allocation at its destination, releases the source
    /// ranges, and frees blocks the pass emptied (down to the list's minimum block count).
    ///
    /// The caller must have finished copying every planned move, device-side included, before
    /// calling this.
    pub fn commit(mut self) -> DefragmentationStats {
        let mut stats = DefragmentationStats::default();

        for planned in self.planned.drain(..) {
            planned
                .dst_block
                .set_owner(planned.dst_id, Arc::downgrade(&planned.allocation));

            let old = planned.allocation.set_position(BlockPosition {
                block: planned.dst_block,
                offset: planned.dst_offset,
                id: planned.dst_id,
            });
            debug_assert!(old.is_some());

            planned.src_block.release(planned.src_id);

            stats.bytes_moved += planned.allocation.size();
            stats.allocations_moved += 1;
        }

        let min_block_count = self.list.min_block_count();
        let mut index = 0;
        while self.blocks.len() > min_block_count && index < self.blocks.len() {
            if self.blocks[index].is_empty() {
                let block = self.blocks.remove(index);
                stats.bytes_freed += block.size();
                stats.blocks_freed += 1;
            } else {
                index += 1;
            }
        }

        log::debug!(
            "defragmented memory type {}: moved {} allocations ({} bytes), freed {} blocks ({} bytes)",
            self.list.memory_type_index(),
            stats.allocations_moved,
            stats.bytes_moved,
            stats.blocks_freed,
            stats.bytes_freed,
        );

        stats
    }

    /// Aborts the pass, releasing the destination reservations. No allocation is touched.
    pub fn abort(self) {}
}

impl Drop for DefragmentationContext<'_> {
    fn drop(&mut self) {
        // Commit drains the plan; anything left means the pass was aborted.
        for planned in self.planned.drain(..) {
            planned.dst_block.release(planned.dst_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::NativeBudget,
        block_list::BlockListConfig,
        device::MemoryDevice,
        layout::DeviceLayout,
        suballocator::AllocationType,
        tests::{mock_device, MockDevice, HOST_COHERENT_TYPE},
    };
    use std::sync::atomic::AtomicU64;

    fn fragmented_list() -> (Arc<MockDevice>, Arc<BlockList>, Vec<Arc<Allocation>>) {
        let device = mock_device();
        let list = BlockList::new(
            device.clone(),
            BlockListConfig {
                memory_type_index: HOST_COHERENT_TYPE,
                preferred_block_size: 1000,
                min_block_count: 0,
                max_block_count: usize::MAX,
                frame_in_use_count: 0,
            },
            Arc::new(AtomicU64::new(0)),
            NativeBudget::new(4096),
        )
        .unwrap();

        let layout = DeviceLayout::from_size_alignment(250, 1).unwrap();
        let allocs: Vec<_> = (0..8)
            .map(|_| {
                list.allocate(layout, AllocationType::Linear, false, false)
                    .unwrap()
            })
            .collect();
        assert_eq!(list.lock_blocks().len(), 2);

        // Free half of each block, leaving two half-empty blocks.
        list.free(&allocs[1]);
        list.free(&allocs[3]);
        list.free(&allocs[4]);
        list.free(&allocs[6]);

        let survivors = vec![
            allocs[0].clone(),
            allocs[2].clone(),
            allocs[5].clone(),
            allocs[7].clone(),
        ];

        (device, list, survivors)
    }

    #[test]
    fn two_half_empty_blocks_collapse_into_one() {
        let (_device, list, survivors) = fragmented_list();

        let context = DefragmentationContext::new(&list, &DefragmentationInfo::default());
        assert_eq!(context.moves().len(), 2);

        let stats = context.commit();
        assert_eq!(stats.allocations_moved, 2);
        assert_eq!(stats.bytes_moved, 500);
        assert_eq!(stats.blocks_freed, 1);
        assert_eq!(stats.bytes_freed, 1000);
        assert_eq!(list.lock_blocks().len(), 1);

        // All survivors now live in the one remaining block.
        let memory = list.lock_blocks()[0].memory();
        for allocation in &survivors {
            assert_eq!(allocation.memory().unwrap(), memory);
        }

        for allocation in &survivors {
            list.free(allocation);
        }
    }

    #[test]
    fn abort_leaves_everything_in_place() {
        let (_device, list, survivors) = fragmented_list();

        let before: Vec<_> = survivors
            .iter()
            .map(|a| (a.memory().unwrap(), a.offset().unwrap()))
            .collect();
        let free_sizes: Vec<_> = list.lock_blocks().iter().map(|b| b.free_size()).collect();

        let context = DefragmentationContext::new(&list, &DefragmentationInfo::default());
        assert!(!context.moves().is_empty());
        context.abort();

        let after: Vec<_> = survivors
            .iter()
            .map(|a| (a.memory().unwrap(), a.offset().unwrap()))
            .collect();
        assert_eq!(before, after);
        assert_eq!(
            list.lock_blocks().iter().map(|b| b.free_size()).collect::<Vec<_>>(),
            free_sizes,
        );

        for allocation in &survivors {
            list.free(allocation);
        }
    }

    #[test]
    fn budgets_cap_the_pass() {
        let (_device, list, survivors) = fragmented_list();

        let context = DefragmentationContext::new(
            &list,
            &DefragmentationInfo {
                max_allocations_to_move: 1,
                ..Default::default()
            },
        );
        assert_eq!(context.moves().len(), 1);
        context.abort();

        let context = DefragmentationContext::new(
            &list,
            &DefragmentationInfo {
                max_bytes_to_move: 250,
                ..Default::default()
            },
        );
        assert_eq!(context.moves().len(), 1);
        context.abort();

        for allocation in &survivors {
            list.free(allocation);
        }
    }

    #[test]
    fn mapped_allocations_are_not_moved() {
        let (_device, list, survivors) = fragmented_list();

        for allocation in &survivors {
            allocation.map().unwrap();
        }

        let context = DefragmentationContext::new(&list, &DefragmentationInfo::default());
        assert!(context.moves().is_empty());
        context.abort();

        for allocation in &survivors {
            allocation.unmap().unwrap();
            list.free(allocation);
        }
    }

    #[test]
    fn copied_data_survives_a_pass() {
        let (device, list, survivors) = fragmented_list();

        // Stamp each allocation with a distinct pattern, unmapped again so the pass can move it.
        for (i, allocation) in survivors.iter().enumerate() {
            let ptr = allocation.map().unwrap();
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr().cast::<u8>(), i as u8 + 1, 250);
            }
            allocation.unmap().unwrap();
        }

        let context = DefragmentationContext::new(&list, &DefragmentationInfo::default());
        for mv in context.moves() {
            unsafe {
                let src = device.map_memory(mv.src_memory).unwrap();
                let dst = device.map_memory(mv.dst_memory).unwrap();
                std::ptr::copy(
                    src.as_ptr().cast::<u8>().add(mv.src_offset as usize),
                    dst.as_ptr().cast::<u8>().add(mv.dst_offset as usize),
                    mv.size as usize,
                );
                device.unmap_memory(mv.src_memory);
                device.unmap_memory(mv.dst_memory);
            }
        }
        context.commit();

        for (i, allocation) in survivors.iter().enumerate() {
            let ptr = allocation.map().unwrap();
            let bytes =
                unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast::<u8>(), 250) };
            assert!(bytes.iter().all(|&byte| byte == i as u8 + 1));
            allocation.unmap().unwrap();
        }

        for allocation in &survivors {
            list.free(allocation);
        }
    }
}
