//! The allocator root: default per-memory-type block lists, dedicated allocations, pools and the
//! frame counter.

use crate::{
    allocation::{Allocation, DedicatedMemory},
    block::{MappingState, NativeBudget},
    block_list::{BlockList, BlockListConfig},
    defrag::{DefragmentationContext, DefragmentationInfo, DefragmentationMove, DefragmentationStats},
    device::{MemoryDevice, NativeError},
    layout::DeviceLayout,
    pool::{MemoryPool, PoolCreateInfo},
    suballocator::AllocationType,
    AllocatorError, DeviceSize, UsageError,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

/// Parameters to create an [`Allocator`].
#[derive(Clone, Copy, Debug)]
pub struct AllocatorCreateInfo {
    /// The size that blocks of the default per-memory-type lists are created with. Requests
    /// larger than this are served by dedicated allocations instead, unless they opted into
    /// eviction.
    ///
    /// The default value is 256 MiB.
    pub preferred_block_size: DeviceSize,

    /// How many frames back an allocation must have gone untouched before it can be reclaimed,
    /// for lost-able allocations placed in the default lists.
    ///
    /// The default value is `0`: anything not touched in the current frame is up for eviction.
    pub frame_in_use_count: u32,

    /// The maximum number of blocks each default list may hold at once.
    ///
    /// The default value is `usize::MAX`.
    pub max_block_count: usize,
}

impl Default for AllocatorCreateInfo {
    fn default() -> Self {
        AllocatorCreateInfo {
            preferred_block_size: 256 * 1024 * 1024,
            frame_in_use_count: 0,
            max_block_count: usize::MAX,
        }
    }
}

/// Parameters of one allocation request.
#[derive(Clone, Copy, Debug)]
pub struct AllocationCreateInfo {
    /// The size and alignment of the request.
    pub layout: DeviceLayout,

    /// What kind of resource the memory will be bound to.
    ///
    /// [`AllocationCreateInfo::new`] sets [`AllocationType::Unknown`].
    pub allocation_type: AllocationType,

    /// Forces a whole native memory object for this request, bypassing the block lists. Requests
    /// larger than the preferred block size are promoted to dedicated automatically.
    ///
    /// [`AllocationCreateInfo::new`] sets `false`.
    pub dedicated: bool,

    /// Opts the allocation into frame-based eviction. It must then be touched every frame it is
    /// used, and the resource recreated if it was lost. Incompatible with `dedicated`.
    ///
    /// [`AllocationCreateInfo::new`] sets `false`.
    pub can_become_lost: bool,

    /// Keeps the allocation persistently mapped for its whole lifetime. Requires a host-visible
    /// memory type.
    ///
    /// [`AllocationCreateInfo::new`] sets `false`.
    pub mapped: bool,
}

impl AllocationCreateInfo {
    pub fn new(layout: DeviceLayout) -> Self {
        AllocationCreateInfo {
            layout,
            allocation_type: AllocationType::Unknown,
            dedicated: false,
            can_become_lost: false,
            mapped: false,
        }
    }
}

/// The top-level sub-allocator over one device.
///
/// Owns one [`BlockList`] per native memory type, a registry of caller-created [`MemoryPool`]s,
/// and the dedicated-allocation path. All allocations made through it (pools included) are freed
/// with [`free`](Self::free); [`shutdown`](Self::shutdown) verifies none are left.
#[derive(Debug)]
pub struct Allocator {
    device: Arc<dyn MemoryDevice>,
    preferred_block_size: DeviceSize,
    default_lists: Vec<Arc<BlockList>>,
    pools: Mutex<Vec<Arc<MemoryPool>>>,
    dedicated_count: AtomicUsize,
    current_frame: Arc<AtomicU64>,
    budget: Arc<NativeBudget>,
}

impl Allocator {
    pub fn new(
        device: Arc<dyn MemoryDevice>,
        create_info: &AllocatorCreateInfo,
    ) -> Result<Self, AllocatorError> {
        let properties = device.memory_properties();
        let budget = NativeBudget::new(properties.max_memory_allocation_count);
        let current_frame = Arc::new(AtomicU64::new(0));

        let mut default_lists = Vec::with_capacity(properties.memory_types.len());
        for memory_type_index in 0..properties.memory_types.len() as u32 {
            default_lists.push(BlockList::new(
                device.clone(),
                BlockListConfig {
                    memory_type_index,
                    preferred_block_size: create_info.preferred_block_size,
                    min_block_count: 0,
                    max_block_count: create_info.max_block_count,
                    frame_in_use_count: create_info.frame_in_use_count,
                },
                current_frame.clone(),
                budget.clone(),
            )?);
        }

        log::debug!(
            "created an allocator over {} memory types with {} byte preferred blocks",
            default_lists.len(),
            create_info.preferred_block_size,
        );

        Ok(Allocator {
            device,
            preferred_block_size: create_info.preferred_block_size,
            default_lists,
            pools: Mutex::new(Vec::new()),
            dedicated_count: AtomicUsize::new(0),
            current_frame,
            budget,
        })
    }

    /// Allocates memory of the given memory type.
    ///
    /// The request is served from the memory type's default block list, unless it is marked
    /// `dedicated` or is larger than the preferred block size and can't become lost, in which
    /// case it receives a whole native memory object.
    pub fn allocate(
        &self,
        memory_type_index: u32,
        create_info: &AllocationCreateInfo,
    ) -> Result<Arc<Allocation>, AllocatorError> {
        let properties = self.device.memory_properties();

        if memory_type_index as usize >= properties.memory_types.len() {
            return Err(UsageError::InvalidMemoryTypeIndex.into());
        }
        if create_info.dedicated && create_info.can_become_lost {
            return Err(UsageError::DedicatedCannotBecomeLost.into());
        }

        let size = create_info.layout.size();
        let dedicated = create_info.dedicated
            || (size > self.preferred_block_size && !create_info.can_become_lost);

        if dedicated {
            self.allocate_dedicated(memory_type_index, create_info)
        } else {
            self.default_lists[memory_type_index as usize].allocate(
                create_info.layout,
                create_info.allocation_type,
                create_info.can_become_lost,
                create_info.mapped,
            )
        }
    }

    /// Frees an allocation, returning its range to its block (or freeing its dedicated memory
    /// object). Idempotent: freeing twice is a no-op, and the handle's accessors fail with
    /// [`UsageError::Disposed`] afterwards.
    pub fn free(&self, allocation: &Allocation) {
        if allocation.mark_disposed() {
            return;
        }

        match allocation.block_list() {
            Some(list) => match list.upgrade() {
                Some(list) => list.free(allocation),
                // The owning list is gone; the block is kept alive by the position alone.
                None => {
                    let map_refs = allocation.take_map_refs();

                    if let Some(position) = allocation.take_position() {
                        for _ in 0..map_refs {
                            position.block.unmap();
                        }
                        position.block.release(position.id);
                    }
                }
            },
            None => {
                allocation.take_map_refs();
                drop(allocation.take_dedicated());
                let prev = self.dedicated_count.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev > 0);
            }
        }
    }

    /// Advances the allocator's frame counter. Frame indices must be monotonically increasing;
    /// a stale index is ignored.
    pub fn begin_frame(&self, frame_index: u64) {
        debug_assert!(frame_index != crate::allocation::FRAME_INDEX_LOST);
        log::trace!("beginning frame {frame_index}");
        self.current_frame.fetch_max(frame_index, Ordering::AcqRel);
    }

    /// The frame index last passed to [`begin_frame`](Self::begin_frame).
    pub fn current_frame(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Stamps the allocation as used in the current frame, shielding it from eviction for the
    /// next `frame_in_use_count` frames. Returns `false` if it was already lost, in which case
    /// the resource must be recreated.
    pub fn touch(&self, allocation: &Allocation) -> bool {
        allocation.touch(self.current_frame())
    }

    /// Creates a memory pool with its own sizing and eviction policy.
    pub fn create_pool(
        &self,
        create_info: &PoolCreateInfo,
    ) -> Result<Arc<MemoryPool>, AllocatorError> {
        let properties = self.device.memory_properties();

        if create_info.memory_type_index as usize >= properties.memory_types.len() {
            return Err(UsageError::InvalidMemoryTypeIndex.into());
        }

        let block_size = if create_info.block_size == 0 {
            self.preferred_block_size
        } else {
            create_info.block_size
        };

        let pool = MemoryPool::new(
            self.device.clone(),
            BlockListConfig {
                memory_type_index: create_info.memory_type_index,
                preferred_block_size: block_size,
                min_block_count: create_info.min_block_count,
                max_block_count: create_info.max_block_count,
                frame_in_use_count: create_info.frame_in_use_count,
            },
            self.current_frame.clone(),
            self.budget.clone(),
        )?;

        self.pools.lock().push(pool.clone());

        Ok(pool)
    }

    /// Destroys a pool, freeing its blocks. Fails if any of its allocations are still live.
    pub fn destroy_pool(&self, pool: &Arc<MemoryPool>) -> Result<(), AllocatorError> {
        let mut pools = self.pools.lock();

        if pool.allocation_count() > 0 {
            return Err(UsageError::PoolAllocationsOutstanding.into());
        }

        if let Some(index) = pools.iter().position(|other| Arc::ptr_eq(other, pool)) {
            pools.remove(index);
        }

        Ok(())
    }

    /// Starts a manual defragmentation pass over one memory type's default block list.
    pub fn begin_defragmentation(
        &self,
        memory_type_index: u32,
        info: &DefragmentationInfo,
    ) -> Result<DefragmentationContext<'_>, AllocatorError> {
        let list = self
            .default_lists
            .get(memory_type_index as usize)
            .ok_or(UsageError::InvalidMemoryTypeIndex)?;

        Ok(DefragmentationContext::new(list, info))
    }

    /// Runs a whole defragmentation pass over one memory type's default block list: plans the
    /// moves, has `copy` perform them, and commits. If `copy` fails the pass is aborted and
    /// nothing changes.
    pub fn defragment_memory_type(
        &self,
        memory_type_index: u32,
        info: &DefragmentationInfo,
        copy: impl FnOnce(&[DefragmentationMove]) -> Result<(), NativeError>,
    ) -> Result<DefragmentationStats, AllocatorError> {
        let context = self.begin_defragmentation(memory_type_index, info)?;

        run_defragmentation(context, copy)
    }

    /// Like [`defragment_memory_type`](Self::defragment_memory_type), over a pool.
    pub fn defragment_pool(
        &self,
        pool: &MemoryPool,
        info: &DefragmentationInfo,
        copy: impl FnOnce(&[DefragmentationMove]) -> Result<(), NativeError>,
    ) -> Result<DefragmentationStats, AllocatorError> {
        run_defragmentation(pool.begin_defragmentation(info), copy)
    }

    /// The number of allocations made through this allocator that have not been freed yet.
    pub fn outstanding_allocations(&self) -> usize {
        let mut count = self.dedicated_count.load(Ordering::Acquire);

        for list in &self.default_lists {
            count += list.allocation_count();
        }
        for pool in self.pools.lock().iter() {
            count += pool.allocation_count();
        }

        count
    }

    /// Tears the allocator down, verifying that every allocation was freed first. On error the
    /// allocator is still dropped; the outstanding allocations keep their blocks alive until
    /// their handles are dropped too.
    pub fn shutdown(self) -> Result<(), AllocatorError> {
        let outstanding = self.outstanding_allocations();

        if outstanding > 0 {
            return Err(UsageError::AllocationsOutstanding(outstanding).into());
        }

        Ok(())
    }

    fn allocate_dedicated(
        &self,
        memory_type_index: u32,
        create_info: &AllocationCreateInfo,
    ) -> Result<Arc<Allocation>, AllocatorError> {
        let properties = self.device.memory_properties();
        let flags = properties.memory_types[memory_type_index as usize].property_flags;
        let atom_size = (flags.host_visible && !flags.host_coherent)
            .then_some(properties.non_coherent_atom_size);

        if create_info.mapped && !flags.host_visible {
            return Err(UsageError::NotHostVisible.into());
        }

        if self.budget.reserve().is_err() {
            return Err(AllocatorError::OutOfDeviceMemory);
        }

        let size = create_info.layout.size();
        let memory = match self.device.allocate_memory(memory_type_index, size) {
            Ok(memory) => memory,
            Err(_) => {
                self.budget.unreserve();
                return Err(AllocatorError::OutOfDeviceMemory);
            }
        };

        log::debug!("allocated a {size} byte dedicated object from memory type {memory_type_index}");

        let mut mapping = MappingState::new();
        if create_info.mapped {
            match unsafe { self.device.map_memory(memory) } {
                Ok(ptr) => {
                    mapping.ptr = Some(ptr);
                    mapping.ref_count = 1;
                }
                Err(err) => {
                    unsafe { self.device.free_memory(memory) };
                    self.budget.unreserve();
                    return Err(err.into());
                }
            }
        }

        let allocation = Allocation::new_dedicated(
            DedicatedMemory {
                device: self.device.clone(),
                memory,
                mapping,
                budget: self.budget.clone(),
            },
            size,
            create_info.layout.alignment(),
            create_info.allocation_type,
            memory_type_index,
            flags.host_visible,
            atom_size,
        );

        if create_info.mapped {
            allocation.set_persistently_mapped();
        }

        self.dedicated_count.fetch_add(1, Ordering::AcqRel);

        Ok(allocation)
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let outstanding = self.outstanding_allocations();

        if outstanding > 0 {
            log::error!("allocator dropped with {outstanding} allocations outstanding");
        }
    }
}

fn run_defragmentation(
    context: DefragmentationContext<'_>,
    copy: impl FnOnce(&[DefragmentationMove]) -> Result<(), NativeError>,
) -> Result<DefragmentationStats, AllocatorError> {
    if !context.moves().is_empty() {
        if let Err(err) = copy(context.moves()) {
            context.abort();
            return Err(err.into());
        }
    }

    Ok(context.commit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mock_allocator, mock_device, DEVICE_LOCAL_TYPE, HOST_COHERENT_TYPE};

    const MIB: DeviceSize = 1 << 20;

    fn layout(size: DeviceSize) -> DeviceLayout {
        DeviceLayout::from_size_alignment(size, 1).unwrap()
    }

    #[test]
    fn oversized_requests_are_promoted_to_dedicated() {
        let allocator = mock_allocator();

        let small = allocator
            .allocate(HOST_COHERENT_TYPE, &AllocationCreateInfo::new(layout(MIB / 2)))
            .unwrap();
        assert!(!small.is_dedicated());

        let big = allocator
            .allocate(HOST_COHERENT_TYPE, &AllocationCreateInfo::new(layout(4 * MIB)))
            .unwrap();
        assert!(big.is_dedicated());
        assert_eq!(big.offset().unwrap(), 0);

        // An oversized lost-able request stays in the block list: dedicated allocations can
        // never become lost.
        let transient = allocator
            .allocate(
                HOST_COHERENT_TYPE,
                &AllocationCreateInfo {
                    can_become_lost: true,
                    ..AllocationCreateInfo::new(layout(4 * MIB))
                },
            )
            .unwrap();
        assert!(!transient.is_dedicated());

        allocator.free(&small);
        allocator.free(&big);
        allocator.free(&transient);
        allocator.shutdown().unwrap();
    }

    #[test]
    fn contract_violations_are_rejected() {
        let allocator = mock_allocator();

        assert_eq!(
            allocator
                .allocate(99, &AllocationCreateInfo::new(layout(256)))
                .unwrap_err(),
            AllocatorError::InvalidUsage(UsageError::InvalidMemoryTypeIndex),
        );

        assert_eq!(
            allocator
                .allocate(
                    HOST_COHERENT_TYPE,
                    &AllocationCreateInfo {
                        dedicated: true,
                        can_become_lost: true,
                        ..AllocationCreateInfo::new(layout(256))
                    },
                )
                .unwrap_err(),
            AllocatorError::InvalidUsage(UsageError::DedicatedCannotBecomeLost),
        );

        // Mapping requires a host-visible memory type.
        assert_eq!(
            allocator
                .allocate(
                    DEVICE_LOCAL_TYPE,
                    &AllocationCreateInfo {
                        mapped: true,
                        ..AllocationCreateInfo::new(layout(256))
                    },
                )
                .unwrap_err(),
            AllocatorError::InvalidUsage(UsageError::NotHostVisible),
        );

        allocator.shutdown().unwrap();
    }

    #[test]
    fn free_is_idempotent() {
        let allocator = mock_allocator();

        let allocation = allocator
            .allocate(HOST_COHERENT_TYPE, &AllocationCreateInfo::new(layout(256)))
            .unwrap();

        allocator.free(&allocation);
        allocator.free(&allocation);

        assert_eq!(
            allocation.memory().unwrap_err(),
            AllocatorError::InvalidUsage(UsageError::Disposed),
        );
        assert_eq!(allocator.outstanding_allocations(), 0);
        allocator.shutdown().unwrap();
    }

    #[test]
    fn shutdown_reports_leaked_allocations() {
        let allocator = mock_allocator();

        let _leaked = allocator
            .allocate(HOST_COHERENT_TYPE, &AllocationCreateInfo::new(layout(256)))
            .unwrap();

        assert_eq!(
            allocator.shutdown().unwrap_err(),
            AllocatorError::InvalidUsage(UsageError::AllocationsOutstanding(1)),
        );
    }

    #[test]
    fn frame_counter_is_monotonic() {
        let allocator = mock_allocator();

        allocator.begin_frame(5);
        allocator.begin_frame(3);
        assert_eq!(allocator.current_frame(), 5);

        let transient = allocator
            .allocate(
                HOST_COHERENT_TYPE,
                &AllocationCreateInfo {
                    can_become_lost: true,
                    ..AllocationCreateInfo::new(layout(256))
                },
            )
            .unwrap();
        assert!(allocator.touch(&transient));

        allocator.free(&transient);
        allocator.shutdown().unwrap();
    }

    #[test]
    fn pools_have_independent_policy() {
        let allocator = mock_allocator();

        let pool = allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: HOST_COHERENT_TYPE,
                block_size: MIB,
                min_block_count: 1,
                max_block_count: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pool.block_count(), 1);

        let allocation = pool
            .allocate(&AllocationCreateInfo::new(layout(256)))
            .unwrap();
        assert_eq!(pool.allocation_count(), 1);
        assert_eq!(allocator.outstanding_allocations(), 1);

        assert_eq!(
            pool.allocate(&AllocationCreateInfo {
                dedicated: true,
                ..AllocationCreateInfo::new(layout(256))
            })
            .unwrap_err(),
            AllocatorError::InvalidUsage(UsageError::DedicatedInPool),
        );

        assert_eq!(
            allocator.destroy_pool(&pool).unwrap_err(),
            AllocatorError::InvalidUsage(UsageError::PoolAllocationsOutstanding),
        );

        allocator.free(&allocation);
        allocator.destroy_pool(&pool).unwrap();
        allocator.shutdown().unwrap();
    }

    #[test]
    fn dedicated_allocations_release_native_memory_on_free() {
        let device = mock_device();
        let allocator = Allocator::new(device.clone(), &AllocatorCreateInfo {
            preferred_block_size: MIB,
            ..Default::default()
        })
        .unwrap();

        let live_before = device.live_allocations();
        let allocation = allocator
            .allocate(
                HOST_COHERENT_TYPE,
                &AllocationCreateInfo {
                    mapped: true,
                    ..AllocationCreateInfo::new(layout(4 * MIB))
                },
            )
            .unwrap();
        assert!(allocation.is_dedicated());
        assert!(allocation.mapped_ptr().is_some());
        assert_eq!(device.live_allocations(), live_before + 1);

        allocator.free(&allocation);
        assert!(allocation.mapped_ptr().is_none());
        assert_eq!(device.live_allocations(), live_before);

        allocator.shutdown().unwrap();
    }
}
