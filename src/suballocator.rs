//! The free-list metadata that partitions a block's byte range into suballocations.
//!
//! Every [block] owns one [`FreeListState`]. The state stores suballocation nodes in a host-side
//! slot pool and keeps a free-list of them sorted by size, so a best-fit is found in
//! *O*(log(*n*)) time in the common case. When an allocation is released, the state coalesces it
//! with adjacent free neighbors, which upholds the structural invariant: the ordered node chain
//! exactly partitions `[0, block_size)` with no gaps, no overlaps and no two adjacent free nodes.
//!
//! [block]: crate::block::Block

pub(crate) use self::host::SlotId;
use crate::{
    allocation::Allocation,
    layout::{align_down, align_up, is_aligned, DeviceAlignment},
    DeviceSize,
};
use std::sync::Weak;

/// Tells the allocator what type of resource will be bound to an allocation, so that it can pack
/// memory tightly while still respecting the buffer-image granularity: a buffer and an image must
/// not share a granularity-sized page unless the native API guarantees that's safe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// The type of resource is unknown, it might be either linear or non-linear. Allocations
    /// created with this type are always separated from their neighbors by the buffer-image
    /// granularity.
    Unknown = 0,

    /// The resource is linear, e.g. buffers, linear images. A linear allocation following another
    /// linear allocation never needs to be aligned to the buffer-image granularity.
    Linear = 1,

    /// The resource is non-linear, e.g. optimal images.
    NonLinear = 2,
}

/// Tells us if a suballocation is free, and if not, what was bound to it. This is needed in order
/// to be able to respect the buffer-image granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SuballocationType {
    Unknown,
    Linear,
    NonLinear,
    Free,
}

impl From<AllocationType> for SuballocationType {
    fn from(ty: AllocationType) -> Self {
        match ty {
            AllocationType::Unknown => SuballocationType::Unknown,
            AllocationType::Linear => SuballocationType::Linear,
            AllocationType::NonLinear => SuballocationType::NonLinear,
        }
    }
}

/// Error returned when a block can't satisfy a placement request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SuballocatorError {
    /// There is no more space available in the block.
    OutOfRegionMemory,

    /// The block has enough free space in aggregate to satisfy the request, but no single
    /// contiguous free region does.
    FragmentedRegion,
}

/// One occupied-or-free byte range inside a block.
#[derive(Debug)]
pub(crate) struct SuballocationNode {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    offset: DeviceSize,
    size: DeviceSize,
    ty: SuballocationType,
    /// The handle that owns this range, present on occupied nodes created through the block list.
    /// The eviction sweep and the defragmentation planner walk these.
    owner: Option<Weak<Allocation>>,
}

/// An occupied node as reported to the eviction sweep and the defragmentation planner.
#[derive(Clone, Debug)]
pub(crate) struct OccupiedNode {
    pub id: SlotId,
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub owner: Option<Weak<Allocation>>,
}

#[derive(Debug)]
pub(crate) struct FreeListState {
    size: DeviceSize,
    free_size: DeviceSize,
    nodes: host::SlotAllocator<SuballocationNode>,
    // Free suballocations sorted by size in ascending order, so a best-fit is a binary search
    // away and iterating from it visits candidates smallest-first.
    free_list: Vec<SlotId>,
    // First node of the chain, kept up to date across splits and coalesces.
    head: SlotId,
}

impl FreeListState {
    pub(crate) fn new(size: DeviceSize) -> Self {
        const AVERAGE_ALLOCATION_SIZE: DeviceSize = 64 * 1024;

        let capacity = (size / AVERAGE_ALLOCATION_SIZE) as usize;
        let mut nodes = host::SlotAllocator::new(capacity + 64);
        let mut free_list = Vec::with_capacity(capacity / 16 + 16);
        let root_id = nodes.allocate(SuballocationNode {
            prev: None,
            next: None,
            offset: 0,
            size,
            ty: SuballocationType::Free,
            owner: None,
        });
        free_list.push(root_id);

        FreeListState {
            size,
            free_size: size,
            nodes,
            free_list,
            head: root_id,
        }
    }

    pub(crate) fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    /// Whether the whole range is a single free node.
    pub(crate) fn is_empty(&self) -> bool {
        self.free_size == self.size
    }

    /// Finds and claims a free range of `size` bytes aligned to `alignment`, respecting the
    /// buffer-image granularity with respect to both neighbors.
    ///
    /// The returned offset is the start of the claimed range; the [`SlotId`] identifies it for a
    /// later [`release`](Self::release).
    pub(crate) fn allocate(
        &mut self,
        size: DeviceSize,
        alignment: DeviceAlignment,
        allocation_type: AllocationType,
        buffer_image_granularity: DeviceAlignment,
    ) -> Result<(DeviceSize, SlotId), SuballocatorError> {
        fn has_granularity_conflict(ty: SuballocationType, other: AllocationType) -> bool {
            match ty {
                SuballocationType::Free => false,
                SuballocationType::Unknown => true,
                _ => ty != other.into(),
            }
        }

        match self.free_list.last() {
            Some(&last) if self.nodes.get(last).size >= size => {
                let start = match self
                    .free_list
                    .binary_search_by_key(&size, |&id| self.nodes.get(id).size)
                {
                    // Exact fit.
                    Ok(index) => index,
                    // Next-best fit. `index == free_list.len()` can't happen because we checked
                    // that the free-list contains a node that is big enough.
                    Err(index) => index,
                };

                for (index, &id) in self.free_list.iter().enumerate().skip(start) {
                    let node = self.nodes.get(id);
                    let (node_offset, node_size) = (node.offset, node.size);
                    let (prev, next) = (node.prev, node.next);

                    // Offsets are constrained by the block size, which can't exceed
                    // `DeviceLayout::MAX_SIZE`, so this can't overflow.
                    let mut offset = align_up(node_offset, alignment);
                    debug_assert!(is_aligned(offset, alignment));

                    if let Some(prev_id) = prev {
                        let prev = self.nodes.get(prev_id);

                        if are_blocks_on_same_page(
                            prev.offset,
                            prev.size,
                            offset,
                            buffer_image_granularity,
                        ) && has_granularity_conflict(prev.ty, allocation_type)
                        {
                            offset = align_up(offset, buffer_image_granularity);
                        }
                    }

                    if offset + size > node_offset + node_size {
                        // Not enough space in this node once aligned; try the next candidate.
                        continue;
                    }

                    if let Some(next_id) = next {
                        let next = self.nodes.get(next_id);

                        if are_blocks_on_same_page(
                            offset,
                            size,
                            next.offset,
                            buffer_image_granularity,
                        ) && has_granularity_conflict(next.ty, allocation_type)
                        {
                            continue;
                        }
                    }

                    self.free_list.remove(index);
                    self.split(id, offset, size);
                    self.nodes.get_mut(id).ty = allocation_type.into();
                    self.free_size -= size;

                    return Ok((offset, id));
                }

                // There is not enough space due to alignment requirements.
                Err(SuballocatorError::OutOfRegionMemory)
            }
            // There would be enough space if the block wasn't so fragmented.
            Some(_) if self.free_size >= size => Err(SuballocatorError::FragmentedRegion),
            Some(_) => Err(SuballocatorError::OutOfRegionMemory),
            None => Err(SuballocatorError::OutOfRegionMemory),
        }
    }

    /// Returns an occupied range to the free-list, coalescing with adjacent free neighbors so
    /// that no two adjacent free nodes ever exist.
    pub(crate) fn release(&mut self, node_id: SlotId) {
        let size = {
            let node = self.nodes.get_mut(node_id);
            debug_assert!(node.ty != SuballocationType::Free);

            node.ty = SuballocationType::Free;
            node.owner = None;
            node.size
        };

        // Sizes are constrained by the block size, so they can't overflow when added up.
        self.free_size += size;

        self.coalesce(node_id);
        self.insert_free(node_id);
    }

    pub(crate) fn set_owner(&mut self, node_id: SlotId, owner: Weak<Allocation>) {
        let node = self.nodes.get_mut(node_id);
        debug_assert!(node.ty != SuballocationType::Free);
        node.owner = Some(owner);
    }

    /// Collects the occupied nodes in offset order.
    pub(crate) fn occupied_nodes(&self) -> Vec<OccupiedNode> {
        let mut occupied = Vec::new();
        let mut cursor = Some(self.head);

        while let Some(id) = cursor {
            let node = self.nodes.get(id);
            if node.ty != SuballocationType::Free {
                occupied.push(OccupiedNode {
                    id,
                    offset: node.offset,
                    size: node.size,
                    owner: node.owner.clone(),
                });
            }
            cursor = node.next;
        }

        occupied
    }

    /// The node chain as `(offset, size, is_free)` triples, for checking the partition invariant.
    #[cfg(test)]
    pub(crate) fn segments(&self) -> Vec<(DeviceSize, DeviceSize, bool)> {
        let mut segments = Vec::new();
        let mut cursor = Some(self.head);

        while let Some(id) = cursor {
            let node = self.nodes.get(id);
            segments.push((node.offset, node.size, node.ty == SuballocationType::Free));
            cursor = node.next;
        }

        segments
    }

    /// Fits a suballocation inside the target free node, trimming the ends back into the
    /// free-list if required. The target must already have been removed from the free-list.
    fn split(&mut self, node_id: SlotId, offset: DeviceSize, size: DeviceSize) {
        let (node_prev, node_next, node_offset, node_size) = {
            let node = self.nodes.get(node_id);
            (node.prev, node.next, node.offset, node.size)
        };

        debug_assert!(self.nodes.get(node_id).ty == SuballocationType::Free);
        debug_assert!(offset >= node_offset);
        debug_assert!(offset + size <= node_offset + node_size);

        let padding_front = offset - node_offset;
        let padding_back = node_offset + node_size - offset - size;

        if padding_front > 0 {
            let padding_id = self.nodes.allocate(SuballocationNode {
                prev: node_prev,
                next: Some(node_id),
                offset: node_offset,
                size: padding_front,
                ty: SuballocationType::Free,
                owner: None,
            });

            if let Some(prev_id) = node_prev {
                self.nodes.get_mut(prev_id).next = Some(padding_id);
            }
            if self.head == node_id {
                self.head = padding_id;
            }

            let node = self.nodes.get_mut(node_id);
            node.prev = Some(padding_id);
            node.offset = offset;
            node.size -= padding_front;

            self.insert_free(padding_id);
        }

        if padding_back > 0 {
            let padding_id = self.nodes.allocate(SuballocationNode {
                prev: Some(node_id),
                next: node_next,
                offset: offset + size,
                size: padding_back,
                ty: SuballocationType::Free,
                owner: None,
            });

            if let Some(next_id) = node_next {
                self.nodes.get_mut(next_id).prev = Some(padding_id);
            }

            let node = self.nodes.get_mut(node_id);
            node.next = Some(padding_id);
            node.size -= padding_back;

            self.insert_free(padding_id);
        }
    }

    /// Coalesces the target free node with adjacent nodes that are also free.
    fn coalesce(&mut self, node_id: SlotId) {
        debug_assert!(self.nodes.get(node_id).ty == SuballocationType::Free);

        if let Some(prev_id) = self.nodes.get(node_id).prev {
            let prev = self.nodes.get(prev_id);

            if prev.ty == SuballocationType::Free {
                let (prev_prev, prev_offset, prev_size) = (prev.prev, prev.offset, prev.size);

                self.remove_free(prev_id);

                let node = self.nodes.get_mut(node_id);
                node.prev = prev_prev;
                node.offset = prev_offset;
                node.size += prev_size;

                if let Some(prev_id) = prev_prev {
                    self.nodes.get_mut(prev_id).next = Some(node_id);
                }
                if self.head == prev_id {
                    self.head = node_id;
                }

                self.nodes.free(prev_id);
            }
        }

        if let Some(next_id) = self.nodes.get(node_id).next {
            let next = self.nodes.get(next_id);

            if next.ty == SuballocationType::Free {
                let (next_next, next_size) = (next.next, next.size);

                self.remove_free(next_id);

                let node = self.nodes.get_mut(node_id);
                node.next = next_next;
                node.size += next_size;

                if let Some(next_id) = next_next {
                    self.nodes.get_mut(next_id).prev = Some(node_id);
                }

                self.nodes.free(next_id);
            }
        }
    }

    /// Inserts the target free node into the free-list, keeping it sorted by size.
    fn insert_free(&mut self, node_id: SlotId) {
        debug_assert!(!self.free_list.contains(&node_id));

        let size = self.nodes.get(node_id).size;
        let (Ok(index) | Err(index)) = self
            .free_list
            .binary_search_by_key(&size, |&id| self.nodes.get(id).size);
        self.free_list.insert(index, node_id);
    }

    /// Removes the target node from the free-list.
    fn remove_free(&mut self, node_id: SlotId) {
        let size = self.nodes.get(node_id).size;

        match self
            .free_list
            .binary_search_by_key(&size, |&id| self.nodes.get(id).size)
        {
            Ok(index) => {
                // If there are multiple free nodes with the same size, the search might have
                // returned any one, so we need to find the one corresponding to the target ID.
                if self.free_list[index] == node_id {
                    self.free_list.remove(index);
                    return;
                }

                // Check all previous indices that point to nodes with the same size.
                {
                    let mut index = index;
                    loop {
                        index = index.wrapping_sub(1);
                        if let Some(&id) = self.free_list.get(index) {
                            if id == node_id {
                                self.free_list.remove(index);
                                return;
                            }
                            if self.nodes.get(id).size != size {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }

                // Check all next indices that point to nodes with the same size.
                {
                    let mut index = index;
                    loop {
                        index += 1;
                        if let Some(&id) = self.free_list.get(index) {
                            if id == node_id {
                                self.free_list.remove(index);
                                return;
                            }
                            if self.nodes.get(id).size != size {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }

                unreachable!();
            }
            Err(_) => unreachable!(),
        }
    }
}

/// Checks if ranges A and B share a page of the given size.
///
/// > **Note**: Assumes `a_offset + a_size > 0` and `a_offset + a_size <= b_offset`.
fn are_blocks_on_same_page(
    a_offset: DeviceSize,
    a_size: DeviceSize,
    b_offset: DeviceSize,
    page_size: DeviceAlignment,
) -> bool {
    debug_assert!(a_offset + a_size > 0);
    debug_assert!(a_offset + a_size <= b_offset);

    let a_end = a_offset + a_size - 1;
    let a_end_page = align_down(a_end, page_size);
    let b_start_page = align_down(b_offset, page_size);

    a_end_page == b_start_page
}

mod host {
    use std::num::NonZeroUsize;

    /// Allocates objects from a pool on the host, which has the following benefits:
    ///
    /// - Allocation is much faster because there is no need to consult the global allocator each
    ///   time a small object needs to be created.
    /// - Freeing is extremely fast, because the whole pool can be dropped at once. This is
    ///   particularly useful for linked structures, whose nodes would otherwise need to be freed
    ///   one-by-one by traversing the whole structure.
    /// - Cache locality is somewhat improved for linked structures with few nodes.
    ///
    /// The allocator doesn't hand out pointers but rather IDs that are relative to the pool. This
    /// simplifies the logic because the pool can easily be moved and hence also resized, but the
    /// downside is that the whole pool must be copied when it runs out of memory. It is therefore
    /// best to start out with a safely large capacity.
    #[derive(Debug)]
    pub(crate) struct SlotAllocator<T> {
        pool: Vec<T>,
        // Unsorted list of free slots.
        free_list: Vec<SlotId>,
    }

    impl<T> SlotAllocator<T> {
        pub fn new(capacity: usize) -> Self {
            debug_assert!(capacity > 0);

            SlotAllocator {
                pool: Vec::with_capacity(capacity),
                free_list: Vec::new(),
            }
        }

        /// Allocates a slot and initializes it with the provided value. Returns the ID of the
        /// slot.
        pub fn allocate(&mut self, val: T) -> SlotId {
            if let Some(id) = self.free_list.pop() {
                self.pool[id.0.get() - 1] = val;

                id
            } else {
                self.pool.push(val);

                // SAFETY: the pool is non-empty after the push.
                SlotId(unsafe { NonZeroUsize::new_unchecked(self.pool.len()) })
            }
        }

        /// Returns the slot with the given ID to the allocator to be reused. The ID must not be
        /// used to access the slot again afterward.
        pub fn free(&mut self, id: SlotId) {
            debug_assert!(!self.free_list.contains(&id));
            self.free_list.push(id);
        }

        /// Returns a reference to the slot with the given ID.
        pub fn get(&self, id: SlotId) -> &T {
            debug_assert!(!self.free_list.contains(&id));

            &self.pool[id.0.get() - 1]
        }

        /// Returns a mutable reference to the slot with the given ID.
        pub fn get_mut(&mut self, id: SlotId) -> &mut T {
            debug_assert!(!self.free_list.contains(&id));

            &mut self.pool[id.0.get() - 1]
        }
    }

    /// ID of a slot in the pool of the `host::SlotAllocator`. This is used to limit the
    /// visibility of the actual index to this module, making it easier to reason about the
    /// bookkeeping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct SlotId(NonZeroUsize);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_queue::ArrayQueue;
    use parking_lot::Mutex;
    use std::thread;

    const GRANULARITY_1: DeviceAlignment = match DeviceAlignment::new(1) {
        Some(alignment) => alignment,
        None => unreachable!(),
    };

    fn assert_partitions(state: &FreeListState, size: DeviceSize) {
        let segments = state.segments();
        let mut expected_offset = 0;
        let mut prev_free = false;

        for &(offset, segment_size, is_free) in &segments {
            assert_eq!(offset, expected_offset, "gap or overlap in the node chain");
            assert!(segment_size > 0);
            assert!(
                !(prev_free && is_free),
                "two adjacent free nodes were not coalesced",
            );
            expected_offset += segment_size;
            prev_free = is_free;
        }

        assert_eq!(expected_offset, size, "the chain doesn't span the block");
    }

    #[test]
    fn free_list_capacity() {
        const THREADS: DeviceSize = 12;
        const ALLOCATIONS_PER_THREAD: DeviceSize = 100;
        const ALLOCATION_STEP: DeviceSize = 117;
        const REGION_SIZE: DeviceSize =
            (ALLOCATION_STEP * (THREADS + 1) * THREADS / 2) * ALLOCATIONS_PER_THREAD;

        let state = Mutex::new(FreeListState::new(REGION_SIZE));
        let allocs = ArrayQueue::new((ALLOCATIONS_PER_THREAD * THREADS) as usize);

        // Using threads to randomize allocation order.
        thread::scope(|scope| {
            for i in 1..=THREADS {
                let (state, allocs) = (&state, &allocs);

                scope.spawn(move || {
                    for _ in 0..ALLOCATIONS_PER_THREAD {
                        let (_, id) = state
                            .lock()
                            .allocate(
                                i * ALLOCATION_STEP,
                                DeviceAlignment::MIN,
                                AllocationType::Unknown,
                                GRANULARITY_1,
                            )
                            .unwrap();
                        allocs.push(id).unwrap();
                    }
                });
            }
        });

        let mut state = state.into_inner();

        assert!(state
            .allocate(1, DeviceAlignment::MIN, AllocationType::Unknown, GRANULARITY_1)
            .is_err());
        assert_eq!(state.free_size(), 0);
        assert_partitions(&state, REGION_SIZE);

        while let Some(id) = allocs.pop() {
            state.release(id);
        }

        assert_eq!(state.free_size(), REGION_SIZE);
        assert!(state.is_empty());
        assert_partitions(&state, REGION_SIZE);

        let (_, id) = state
            .allocate(
                REGION_SIZE,
                DeviceAlignment::MIN,
                AllocationType::Unknown,
                GRANULARITY_1,
            )
            .unwrap();
        state.release(id);
    }

    #[test]
    fn free_list_respects_alignment() {
        const REGION_SIZE: DeviceSize = 10 * 256;

        let alignment = DeviceAlignment::new(256).unwrap();
        let mut state = FreeListState::new(REGION_SIZE);
        let mut allocs = Vec::with_capacity(10);

        for _ in 0..10 {
            let (offset, id) = state
                .allocate(1, alignment, AllocationType::Unknown, GRANULARITY_1)
                .unwrap();
            assert_eq!(offset % 256, 0);
            allocs.push(id);
        }

        assert!(state
            .allocate(1, alignment, AllocationType::Unknown, GRANULARITY_1)
            .is_err());
        assert_eq!(state.free_size(), REGION_SIZE - 10);

        for id in allocs.drain(..) {
            state.release(id);
        }

        assert!(state.is_empty());
    }

    #[test]
    fn free_list_respects_granularity() {
        const GRANULARITY: DeviceSize = 16;
        const REGION_SIZE: DeviceSize = 2 * GRANULARITY;

        let granularity = DeviceAlignment::new(GRANULARITY).unwrap();
        let mut state = FreeListState::new(REGION_SIZE);
        let mut linear_allocs = Vec::new();
        let mut nonlinear_allocs = Vec::new();

        for i in 0..REGION_SIZE {
            if i % 2 == 0 {
                linear_allocs.push(
                    state
                        .allocate(1, DeviceAlignment::MIN, AllocationType::Linear, granularity)
                        .unwrap()
                        .1,
                );
            } else {
                nonlinear_allocs.push(
                    state
                        .allocate(1, DeviceAlignment::MIN, AllocationType::NonLinear, granularity)
                        .unwrap()
                        .1,
                );
            }
        }

        assert!(state
            .allocate(1, DeviceAlignment::MIN, AllocationType::Linear, granularity)
            .is_err());
        assert_eq!(state.free_size(), 0);

        for id in linear_allocs.drain(..) {
            state.release(id);
        }

        // A whole page is free now, but an `Unknown` allocation can't share the other page.
        let (_, id) = state
            .allocate(GRANULARITY, DeviceAlignment::MIN, AllocationType::Unknown, granularity)
            .unwrap();
        state.release(id);

        let (_, id) = state
            .allocate(1, DeviceAlignment::MIN, AllocationType::Unknown, granularity)
            .unwrap();
        assert!(state
            .allocate(1, DeviceAlignment::MIN, AllocationType::Unknown, granularity)
            .is_err());
        assert!(state
            .allocate(1, DeviceAlignment::MIN, AllocationType::Linear, granularity)
            .is_err());
        state.release(id);

        for id in nonlinear_allocs.drain(..) {
            state.release(id);
        }

        assert!(state.is_empty());
    }

    #[test]
    fn free_then_allocate_round_trips() {
        const REGION_SIZE: DeviceSize = 1024;

        let mut state = FreeListState::new(REGION_SIZE);

        let (_, a) = state
            .allocate(100, DeviceAlignment::MIN, AllocationType::Unknown, GRANULARITY_1)
            .unwrap();
        let (_, b) = state
            .allocate(200, DeviceAlignment::MIN, AllocationType::Unknown, GRANULARITY_1)
            .unwrap();

        let before = state.segments();

        let (_, c) = state
            .allocate(300, DeviceAlignment::MIN, AllocationType::Unknown, GRANULARITY_1)
            .unwrap();
        state.release(c);

        // Freeing restores the exact free-region boundaries.
        assert_eq!(state.segments(), before);
        assert_partitions(&state, REGION_SIZE);

        state.release(a);
        state.release(b);
        assert!(state.is_empty());
        assert_partitions(&state, REGION_SIZE);
    }

    #[test]
    fn fragmented_region_is_reported() {
        const REGION_SIZE: DeviceSize = 1000;

        let mut state = FreeListState::new(REGION_SIZE);
        let mut allocs = Vec::new();

        for _ in 0..10 {
            allocs.push(
                state
                    .allocate(100, DeviceAlignment::MIN, AllocationType::Unknown, GRANULARITY_1)
                    .unwrap()
                    .1,
            );
        }

        // Free every other allocation: 500 bytes free in aggregate, largest hole 100 bytes.
        for id in allocs.iter().copied().step_by(2) {
            state.release(id);
        }

        assert_eq!(
            state.allocate(300, DeviceAlignment::MIN, AllocationType::Unknown, GRANULARITY_1),
            Err(SuballocatorError::FragmentedRegion),
        );
        assert_eq!(
            state.allocate(600, DeviceAlignment::MIN, AllocationType::Unknown, GRANULARITY_1),
            Err(SuballocatorError::OutOfRegionMemory),
        );
        assert_partitions(&state, REGION_SIZE);
    }
}
