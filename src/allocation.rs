//! The allocation handle returned to callers.
//!
//! An [`Allocation`] is either a suballocation of a [block] or a dedicated native memory object.
//! The handle stays valid after its memory is reclaimed (lost) or freed (disposed); operations on
//! it then fail with [`UsageError::Lost`] or [`UsageError::Disposed`] instead of touching freed
//! memory.
//!
//! Touching and losing are lock-free so that parallel command recording never blocks on the
//! allocator: the frame stamp is a single atomic driven by compare-and-swap loops, with
//! [`FRAME_INDEX_LOST`] as the reclaimed sentinel.
//!
//! [block]: crate::block::Block

use crate::{
    block::{Block, MappingState},
    block_list::BlockList,
    device::{MappedRange, MemoryDevice, MemoryHandle},
    layout::{align_down, align_up, DeviceAlignment},
    suballocator::{AllocationType, SlotId},
    AllocatorError, DeviceSize, UsageError,
};
use parking_lot::Mutex;
use std::{
    ffi::c_void,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// The frame-stamp value of an allocation whose memory has been reclaimed.
pub(crate) const FRAME_INDEX_LOST: u64 = u64::MAX;

// Bit 31 of the map word marks a persistently mapped allocation; the low 31 bits count `map`
// calls that have not been balanced by `unmap` yet.
const PERSISTENT_MAP: u32 = 1 << 31;
const MAP_COUNT_MASK: u32 = PERSISTENT_MAP - 1;

/// Where an allocation's bytes currently live inside a block.
#[derive(Debug)]
pub(crate) struct BlockPosition {
    pub(crate) block: Arc<Block>,
    pub(crate) offset: DeviceSize,
    pub(crate) id: SlotId,
}

/// A dedicated allocation's native memory object, dropped (and thereby freed) when the
/// allocation is disposed.
#[derive(Debug)]
pub(crate) struct DedicatedMemory {
    pub(crate) device: Arc<dyn MemoryDevice>,
    pub(crate) memory: MemoryHandle,
    pub(crate) mapping: MappingState,
    pub(crate) budget: Arc<crate::block::NativeBudget>,
}

impl Drop for DedicatedMemory {
    fn drop(&mut self) {
        if self.mapping.ptr.take().is_some() {
            unsafe { self.device.unmap_memory(self.memory) };
        }

        unsafe { self.device.free_memory(self.memory) };
        self.budget.unreserve();
    }
}

#[derive(Debug)]
enum AllocationInner {
    Block {
        list: Weak<BlockList>,
        position: Mutex<Option<BlockPosition>>,
    },
    Dedicated {
        memory: Mutex<Option<DedicatedMemory>>,
    },
}

/// One logical memory allocation handed out by the [allocator].
///
/// Handles are freed explicitly through [`Allocator::free`]; dropping the last `Arc` of an
/// unfreed allocation leaks its range until the owning allocator is torn down.
///
/// [allocator]: crate::Allocator
/// [`Allocator::free`]: crate::Allocator::free
#[derive(Debug)]
pub struct Allocation {
    size: DeviceSize,
    alignment: DeviceAlignment,
    allocation_type: AllocationType,
    memory_type_index: u32,
    host_visible: bool,
    atom_size: Option<DeviceAlignment>,
    can_become_lost: bool,
    last_use_frame: AtomicU64,
    map_state: AtomicU32,
    user_data: AtomicU64,
    disposed: AtomicBool,
    inner: AllocationInner,
}

// SAFETY: the only non-`Send` state is the mapped pointer of a dedicated allocation, which lives
// behind a mutex and points at device memory; synchronizing access to that memory is the caller's
// responsibility.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    pub(crate) fn new_block(
        list: Weak<BlockList>,
        position: BlockPosition,
        size: DeviceSize,
        alignment: DeviceAlignment,
        allocation_type: AllocationType,
        can_become_lost: bool,
        current_frame: u64,
    ) -> Arc<Self> {
        let block = &position.block;
        let allocation = Arc::new(Allocation {
            size,
            alignment,
            allocation_type,
            memory_type_index: block.memory_type_index(),
            host_visible: block.host_visible(),
            atom_size: block.atom_size(),
            can_become_lost,
            last_use_frame: AtomicU64::new(if can_become_lost { current_frame } else { 0 }),
            map_state: AtomicU32::new(0),
            user_data: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            inner: AllocationInner::Block {
                list,
                position: Mutex::new(Some(position)),
            },
        });

        if let AllocationInner::Block { position, .. } = &allocation.inner {
            let position = position.lock();
            let position = position.as_ref().unwrap();
            position
                .block
                .set_owner(position.id, Arc::downgrade(&allocation));
        }

        allocation
    }

    pub(crate) fn new_dedicated(
        memory: DedicatedMemory,
        size: DeviceSize,
        alignment: DeviceAlignment,
        allocation_type: AllocationType,
        memory_type_index: u32,
        host_visible: bool,
        atom_size: Option<DeviceAlignment>,
    ) -> Arc<Self> {
        Arc::new(Allocation {
            size,
            alignment,
            allocation_type,
            memory_type_index,
            host_visible,
            atom_size,
            can_become_lost: false,
            last_use_frame: AtomicU64::new(0),
            map_state: AtomicU32::new(0),
            user_data: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            inner: AllocationInner::Dedicated {
                memory: Mutex::new(Some(memory)),
            },
        })
    }

    /// The size of the allocation in bytes.
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    /// The index of the memory type this allocation was placed in.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Whether this allocation opted into frame-based eviction at creation.
    pub fn can_become_lost(&self) -> bool {
        self.can_become_lost
    }

    /// Whether this allocation owns a whole native memory object.
    pub fn is_dedicated(&self) -> bool {
        matches!(self.inner, AllocationInner::Dedicated { .. })
    }

    /// An arbitrary caller-owned tag, typically the key of the resource bound to this memory.
    /// Zero until set.
    pub fn user_data(&self) -> u64 {
        self.user_data.load(Ordering::Relaxed)
    }

    pub fn set_user_data(&self, user_data: u64) {
        self.user_data.store(user_data, Ordering::Relaxed);
    }

    /// Whether the allocation's memory has been reclaimed by the allocator.
    pub fn is_lost(&self) -> bool {
        self.last_use_frame.load(Ordering::Acquire) == FRAME_INDEX_LOST
    }

    pub(crate) fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.map_state.load(Ordering::Acquire) != 0
    }

    /// The native memory object backing this allocation.
    pub fn memory(&self) -> Result<MemoryHandle, AllocatorError> {
        self.check_live()?;

        match &self.inner {
            AllocationInner::Block { position, .. } => {
                let position = position.lock();
                let position = position.as_ref().ok_or(UsageError::Disposed)?;

                Ok(position.block.memory())
            }
            AllocationInner::Dedicated { memory } => {
                let memory = memory.lock();
                let memory = memory.as_ref().ok_or(UsageError::Disposed)?;

                Ok(memory.memory)
            }
        }
    }

    /// The byte offset of this allocation within its memory object. Always zero for dedicated
    /// allocations.
    ///
    /// Defragmentation can change the offset (and the memory object); callers must re-query after
    /// committing a pass.
    pub fn offset(&self) -> Result<DeviceSize, AllocatorError> {
        self.check_live()?;

        match &self.inner {
            AllocationInner::Block { position, .. } => {
                let position = position.lock();
                let position = position.as_ref().ok_or(UsageError::Disposed)?;

                Ok(position.offset)
            }
            AllocationInner::Dedicated { memory } => {
                let memory = memory.lock();
                memory.as_ref().ok_or(UsageError::Disposed)?;

                Ok(0)
            }
        }
    }

    /// Stamps the allocation as used in `current_frame`, preventing its eviction for the next
    /// `frame_in_use_count` frames. Returns `false` if the allocation was already lost, in which
    /// case its memory is gone and the resource must be recreated.
    ///
    /// Allocations that can't become lost are stamped all the same and always return `true`;
    /// their stamp can never reach the lost sentinel.
    pub(crate) fn touch(&self, current_frame: u64) -> bool {
        let mut stamp = self.last_use_frame.load(Ordering::Acquire);

        loop {
            if stamp == FRAME_INDEX_LOST {
                return false;
            }
            if stamp >= current_frame {
                return true;
            }

            match self.last_use_frame.compare_exchange_weak(
                stamp,
                current_frame,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => stamp = actual,
            }
        }
    }

    /// Tries to reclaim the allocation. Succeeds only if it hasn't been touched within the last
    /// `frame_in_use_count` frames. Loses the race against any concurrent `touch`.
    pub(crate) fn make_lost(&self, current_frame: u64, frame_in_use_count: u32) -> bool {
        debug_assert!(self.can_become_lost);
        if !self.can_become_lost {
            return false;
        }

        let mut stamp = self.last_use_frame.load(Ordering::Acquire);

        loop {
            if stamp == FRAME_INDEX_LOST {
                return false;
            }
            if stamp.saturating_add(u64::from(frame_in_use_count)) >= current_frame {
                return false;
            }

            match self.last_use_frame.compare_exchange_weak(
                stamp,
                FRAME_INDEX_LOST,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => stamp = actual,
            }
        }
    }

    /// Maps the allocation into host address space and returns a pointer to its first byte.
    ///
    /// Mapping is refcounted: each successful `map` must be balanced by one [`unmap`]. Mapping
    /// the same memory object from multiple allocations is fine; the underlying object is mapped
    /// once and shared.
    ///
    /// [`unmap`]: Self::unmap
    pub fn map(&self) -> Result<NonNull<c_void>, AllocatorError> {
        if !self.host_visible {
            return Err(UsageError::NotHostVisible.into());
        }
        self.check_live()?;

        self.map_state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state & MAP_COUNT_MASK != MAP_COUNT_MASK).then(|| state + 1)
            })
            .map_err(|_| UsageError::MapCountOverflow)?;

        match self.map_inner() {
            Ok(ptr) => Ok(ptr),
            Err(err) => {
                self.map_state.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Releases one map reference, unmapping the underlying object when the last reference to it
    /// anywhere is gone.
    pub fn unmap(&self) -> Result<(), AllocatorError> {
        self.map_state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state & MAP_COUNT_MASK != 0).then(|| state - 1)
            })
            .map_err(|_| UsageError::UnmapUnderflow)?;

        self.unmap_inner();

        Ok(())
    }

    /// The pointer to the allocation's first byte, if it is currently mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        if self.map_state.load(Ordering::Acquire) == 0 {
            return None;
        }

        match &self.inner {
            AllocationInner::Block { position, .. } => {
                let position = position.lock();
                let position = position.as_ref()?;
                let base = position.block.mapped_ptr()?;

                // The offset is in bounds of the mapped object.
                NonNull::new(unsafe { base.as_ptr().cast::<u8>().add(position.offset as usize) })
                    .map(NonNull::cast)
            }
            AllocationInner::Dedicated { memory } => memory.lock().as_ref()?.mapping.ptr,
        }
    }

    /// Flushes the host cache for `[offset, offset + size)` of this allocation, making host
    /// writes visible to the device on non-coherent memory. A no-op on coherent memory types.
    ///
    /// # Panics
    ///
    /// - Panics if the range is out of bounds of the allocation.
    pub fn flush(&self, offset: DeviceSize, size: DeviceSize) -> Result<(), AllocatorError> {
        self.cache_control(offset, size, true)
    }

    /// Invalidates the host cache for `[offset, offset + size)` of this allocation, making
    /// device writes visible to the host on non-coherent memory. A no-op on coherent memory
    /// types.
    ///
    /// # Panics
    ///
    /// - Panics if the range is out of bounds of the allocation.
    pub fn invalidate(&self, offset: DeviceSize, size: DeviceSize) -> Result<(), AllocatorError> {
        self.cache_control(offset, size, false)
    }

    fn cache_control(
        &self,
        offset: DeviceSize,
        size: DeviceSize,
        flush: bool,
    ) -> Result<(), AllocatorError> {
        assert!(offset <= self.size);
        assert!(size <= self.size - offset);

        if !self.host_visible {
            return Err(UsageError::NotHostVisible.into());
        }
        self.check_live()?;

        // Coherent memory needs no cache management.
        let Some(atom_size) = self.atom_size else {
            return Ok(());
        };

        if size == 0 {
            return Ok(());
        }

        let (device, range) = match &self.inner {
            AllocationInner::Block { position, .. } => {
                let position = position.lock();
                let position = position.as_ref().ok_or(UsageError::Disposed)?;
                let start = align_down(position.offset + offset, atom_size);
                let end = align_up(position.offset + offset + size, atom_size)
                    .min(position.block.size());

                (
                    position.block.device().clone(),
                    MappedRange {
                        memory: position.block.memory(),
                        offset: start,
                        size: end - start,
                    },
                )
            }
            AllocationInner::Dedicated { memory } => {
                let memory = memory.lock();
                let memory = memory.as_ref().ok_or(UsageError::Disposed)?;
                let start = align_down(offset, atom_size);
                let end = align_up(offset + size, atom_size).min(self.size);

                (
                    memory.device.clone(),
                    MappedRange {
                        memory: memory.memory,
                        offset: start,
                        size: end - start,
                    },
                )
            }
        };

        unsafe {
            if flush {
                device.flush_ranges(&[range])?;
            } else {
                device.invalidate_ranges(&[range])?;
            }
        }

        Ok(())
    }

    fn map_inner(&self) -> Result<NonNull<c_void>, AllocatorError> {
        match &self.inner {
            AllocationInner::Block { position, .. } => {
                let position = position.lock();
                let position = position.as_ref().ok_or(UsageError::Disposed)?;
                let base = position.block.map()?;

                // SAFETY: the offset is in bounds of the mapped object, so the pointer can't
                // wrap to null.
                let ptr = unsafe {
                    NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(position.offset as usize))
                };

                Ok(ptr.cast())
            }
            AllocationInner::Dedicated { memory } => {
                let mut memory = memory.lock();
                let memory = memory.as_mut().ok_or(UsageError::Disposed)?;

                let ptr = match memory.mapping.ptr {
                    Some(ptr) => ptr,
                    None => {
                        let ptr = unsafe { memory.device.map_memory(memory.memory) }?;
                        memory.mapping.ptr = Some(ptr);
                        ptr
                    }
                };
                memory.mapping.ref_count += 1;

                Ok(ptr)
            }
        }
    }

    fn unmap_inner(&self) {
        match &self.inner {
            AllocationInner::Block { position, .. } => {
                let position = position.lock();
                if let Some(position) = position.as_ref() {
                    position.block.unmap();
                }
            }
            AllocationInner::Dedicated { memory } => {
                let mut memory = memory.lock();
                if let Some(memory) = memory.as_mut() {
                    debug_assert!(memory.mapping.ref_count > 0);
                    memory.mapping.ref_count -= 1;

                    if memory.mapping.ref_count == 0 {
                        memory.mapping.ptr = None;
                        unsafe { memory.device.unmap_memory(memory.memory) };
                    }
                }
            }
        }
    }

    fn check_live(&self) -> Result<(), UsageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(UsageError::Disposed);
        }
        if self.is_lost() {
            return Err(UsageError::Lost);
        }

        Ok(())
    }

    /// Marks the allocation disposed. Returns `true` if it already was, making `free` idempotent.
    pub(crate) fn mark_disposed(&self) -> bool {
        self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Marks the allocation persistently mapped. Used at creation time only; takes one map
    /// reference that is released at disposal.
    pub(crate) fn set_persistently_mapped(&self) {
        let prev = self.map_state.fetch_or(PERSISTENT_MAP, Ordering::AcqRel);
        debug_assert_eq!(prev, 0);
    }

    /// Takes the map word, returning how many references to the underlying object's mapping this
    /// handle still holds. Used at disposal to rebalance the block's shared mapping.
    pub(crate) fn take_map_refs(&self) -> u32 {
        let state = self.map_state.swap(0, Ordering::AcqRel);

        (state & MAP_COUNT_MASK) + u32::from(state & PERSISTENT_MAP != 0)
    }

    /// The block list this allocation was placed in, if it is a block allocation.
    pub(crate) fn block_list(&self) -> Option<Weak<BlockList>> {
        match &self.inner {
            AllocationInner::Block { list, .. } => Some(list.clone()),
            AllocationInner::Dedicated { .. } => None,
        }
    }

    /// Detaches the allocation from its block. The caller is responsible for releasing the
    /// returned range.
    pub(crate) fn take_position(&self) -> Option<BlockPosition> {
        match &self.inner {
            AllocationInner::Block { position, .. } => position.lock().take(),
            AllocationInner::Dedicated { .. } => None,
        }
    }

    /// Repoints the allocation at a new position after a defragmentation move.
    pub(crate) fn set_position(&self, new_position: BlockPosition) -> Option<BlockPosition> {
        match &self.inner {
            AllocationInner::Block { position, .. } => position.lock().replace(new_position),
            AllocationInner::Dedicated { .. } => unreachable!(),
        }
    }

    /// Detaches a dedicated allocation's native memory object; dropping the returned value frees
    /// it.
    pub(crate) fn take_dedicated(&self) -> Option<DedicatedMemory> {
        match &self.inner {
            AllocationInner::Block { .. } => None,
            AllocationInner::Dedicated { memory } => memory.lock().take(),
        }
    }
}
