//! One native memory block: a device memory object paired with the free-list that partitions it.

use crate::{
    allocation::Allocation,
    device::{MemoryDevice, MemoryHandle, NativeError},
    layout::DeviceAlignment,
    suballocator::{
        AllocationType, FreeListState, OccupiedNode, SlotId, SuballocatorError,
    },
    DeviceSize,
};
use parking_lot::Mutex;
use std::{
    cmp,
    ffi::c_void,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// Caps the number of live native memory objects, shared between every block list and the
/// dedicated-allocation path of one allocator.
#[derive(Debug)]
pub(crate) struct NativeBudget {
    count: AtomicU32,
    max: u32,
}

impl NativeBudget {
    pub(crate) fn new(max: u32) -> Arc<Self> {
        Arc::new(NativeBudget {
            count: AtomicU32::new(0),
            max,
        })
    }

    /// Claims one native allocation slot, failing if the device limit is reached.
    pub(crate) fn reserve(&self) -> Result<(), ()> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max).then(|| count + 1)
            })
            .map(|_| ())
            .map_err(|_| ())
    }

    pub(crate) fn unreserve(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

/// The mapped-pointer state of one native memory object. Mapping is always done for the whole
/// object; suballocations derive their pointers by offsetting into it and share the mapping
/// through the refcount.
#[derive(Debug)]
pub(crate) struct MappingState {
    pub(crate) ptr: Option<NonNull<c_void>>,
    pub(crate) ref_count: u32,
}

impl MappingState {
    pub(crate) fn new() -> Self {
        MappingState {
            ptr: None,
            ref_count: 0,
        }
    }
}

/// One block of a [block list]: a native memory object whose byte range is partitioned by a
/// [`FreeListState`].
///
/// The free size is mirrored into an atomic so that block ordering inside the list doesn't need
/// to take every block's state lock.
///
/// [block list]: crate::block_list::BlockList
#[derive(Debug)]
pub(crate) struct Block {
    device: Arc<dyn MemoryDevice>,
    memory: MemoryHandle,
    memory_type_index: u32,
    size: DeviceSize,
    buffer_image_granularity: DeviceAlignment,
    atom_size: Option<DeviceAlignment>,
    host_visible: bool,
    free_size: AtomicU64,
    state: Mutex<FreeListState>,
    mapping: Mutex<MappingState>,
    budget: Arc<NativeBudget>,
}

// SAFETY: the mapped pointer lives behind the mapping mutex and refers to device memory;
// synchronizing access to the memory it points at is the caller's responsibility.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Allocates a new native memory object of `size` bytes and wraps it in an empty block.
    pub(crate) fn new(
        device: Arc<dyn MemoryDevice>,
        memory_type_index: u32,
        size: DeviceSize,
        budget: Arc<NativeBudget>,
    ) -> Result<Arc<Block>, NativeError> {
        let properties = device.memory_properties();
        let flags = properties.memory_types[memory_type_index as usize].property_flags;
        let buffer_image_granularity = properties.buffer_image_granularity;
        let atom_size = (flags.host_visible && !flags.host_coherent)
            .then_some(properties.non_coherent_atom_size);

        if budget.reserve().is_err() {
            // Device allocation-count limit reached; report it the way the device would.
            return Err(NativeError(-2));
        }

        let memory = match device.allocate_memory(memory_type_index, size) {
            Ok(memory) => memory,
            Err(err) => {
                budget.unreserve();
                return Err(err);
            }
        };

        log::debug!("allocated a {size} byte block from memory type {memory_type_index}");

        Ok(Arc::new(Block {
            device,
            memory,
            memory_type_index,
            size,
            buffer_image_granularity,
            atom_size,
            host_visible: flags.host_visible,
            free_size: AtomicU64::new(size),
            state: Mutex::new(FreeListState::new(size)),
            mapping: Mutex::new(MappingState::new()),
            budget,
        }))
    }

    pub(crate) fn memory(&self) -> MemoryHandle {
        self.memory
    }

    pub(crate) fn size(&self) -> DeviceSize {
        self.size
    }

    pub(crate) fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub(crate) fn atom_size(&self) -> Option<DeviceAlignment> {
        self.atom_size
    }

    pub(crate) fn host_visible(&self) -> bool {
        self.host_visible
    }

    pub(crate) fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    pub(crate) fn free_size(&self) -> DeviceSize {
        self.free_size.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.free_size() == self.size
    }

    /// Claims a range from the block's free-list.
    ///
    /// On non-coherent memory the alignment is raised to the atom size so that no two
    /// suballocations share an atom; a flush or invalidate of one allocation, rounded outward to
    /// atom bounds, must never cover a neighbor's bytes.
    pub(crate) fn allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceAlignment,
        allocation_type: AllocationType,
    ) -> Result<(DeviceSize, SlotId), SuballocatorError> {
        let alignment = cmp::max(alignment, self.atom_size.unwrap_or(DeviceAlignment::MIN));
        let mut state = self.state.lock();
        let result = state.allocate(size, alignment, allocation_type, self.buffer_image_granularity);
        self.free_size.store(state.free_size(), Ordering::Release);

        result
    }

    /// Returns a previously claimed range to the free-list.
    pub(crate) fn release(&self, id: SlotId) {
        let mut state = self.state.lock();
        state.release(id);
        self.free_size.store(state.free_size(), Ordering::Release);
    }

    pub(crate) fn set_owner(&self, id: SlotId, owner: Weak<Allocation>) {
        self.state.lock().set_owner(id, owner);
    }

    pub(crate) fn occupied_nodes(&self) -> Vec<OccupiedNode> {
        self.state.lock().occupied_nodes()
    }

    /// Acquires one reference to the block's shared mapping, mapping the whole object on the
    /// first reference. Returns the base pointer of the object.
    pub(crate) fn map(&self) -> Result<NonNull<c_void>, NativeError> {
        debug_assert!(self.host_visible);

        let mut mapping = self.mapping.lock();

        let ptr = match mapping.ptr {
            Some(ptr) => ptr,
            None => {
                let ptr = unsafe { self.device.map_memory(self.memory) }?;
                mapping.ptr = Some(ptr);
                ptr
            }
        };
        mapping.ref_count += 1;

        Ok(ptr)
    }

    /// Releases one reference to the shared mapping, unmapping the object on the last one.
    pub(crate) fn unmap(&self) {
        let mut mapping = self.mapping.lock();
        debug_assert!(mapping.ref_count > 0);

        mapping.ref_count -= 1;

        if mapping.ref_count == 0 {
            mapping.ptr = None;
            unsafe { self.device.unmap_memory(self.memory) };
        }
    }

    /// The base pointer, if the block is currently mapped.
    pub(crate) fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.mapping.lock().ptr
    }

    #[cfg(test)]
    pub(crate) fn segments(&self) -> Vec<(DeviceSize, DeviceSize, bool)> {
        self.state.lock().segments()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let mapping = self.mapping.get_mut();

        if mapping.ptr.take().is_some() {
            unsafe { self.device.unmap_memory(self.memory) };
        }

        unsafe { self.device.free_memory(self.memory) };
        self.budget.unreserve();

        log::debug!(
            "freed a {} byte block from memory type {}",
            self.size,
            self.memory_type_index,
        );
    }
}
