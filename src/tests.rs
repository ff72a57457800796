//! Test doubles and helpers shared by the unit tests.

use crate::{
    allocator::{Allocator, AllocatorCreateInfo},
    device::{
        MappedRange, MemoryDevice, MemoryHandle, MemoryHeap, MemoryProperties, MemoryPropertyFlags,
        MemoryType, NativeError,
    },
    layout::{is_aligned, DeviceAlignment},
    DeviceSize,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    ffi::c_void,
    fmt,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

pub(crate) const DEVICE_LOCAL_TYPE: u32 = 0;
pub(crate) const HOST_COHERENT_TYPE: u32 = 1;
pub(crate) const HOST_CACHED_TYPE: u32 = 2;

/// A `MemoryDevice` backed by host memory, so that mapped pointers are real and the full
/// allocator can run without a GPU.
pub(crate) struct MockDevice {
    properties: MemoryProperties,
    state: Mutex<MockState>,
    fail_next: AtomicU32,
}

#[derive(Debug)]
struct MockState {
    next_handle: u64,
    live: HashMap<u64, MockMemory>,
}

struct MockMemory {
    data: Box<[u8]>,
    mapped: bool,
}

impl fmt::Debug for MockMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockMemory")
            .field("size", &self.data.len())
            .field("mapped", &self.mapped)
            .finish()
    }
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDevice")
            .field("live", &self.state.lock().live.len())
            .finish()
    }
}

impl MockDevice {
    pub(crate) fn new() -> Arc<Self> {
        let properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags {
                        device_local: true,
                        ..Default::default()
                    },
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags {
                        host_visible: true,
                        host_coherent: true,
                        ..Default::default()
                    },
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags {
                        host_visible: true,
                        host_cached: true,
                        ..Default::default()
                    },
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap { size: 256 << 20 },
                MemoryHeap { size: 256 << 20 },
            ],
            buffer_image_granularity: DeviceAlignment::new(1024).unwrap(),
            non_coherent_atom_size: DeviceAlignment::new(64).unwrap(),
            max_memory_allocation_count: 4096,
        };

        Arc::new(MockDevice {
            properties,
            state: Mutex::new(MockState {
                next_handle: 1,
                live: HashMap::new(),
            }),
            fail_next: AtomicU32::new(0),
        })
    }

    /// Makes the next `count` calls to `allocate_memory` fail.
    pub(crate) fn fail_next_allocations(&self, count: u32) {
        self.fail_next.store(count, Ordering::Release);
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    fn check_range(&self, state: &MockState, range: &MappedRange) {
        let memory = state.live.get(&range.memory.0).expect("range of freed memory");
        assert!(memory.mapped, "range of unmapped memory");

        let atom_size = self.properties.non_coherent_atom_size;
        let end = range.offset + range.size;
        assert!(end <= memory.data.len() as DeviceSize, "range out of bounds");
        assert!(is_aligned(range.offset, atom_size), "range start not on an atom");
        assert!(
            is_aligned(end, atom_size) || end == memory.data.len() as DeviceSize,
            "range end not on an atom",
        );
    }
}

impl MemoryDevice for MockDevice {
    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<MemoryHandle, NativeError> {
        assert!((memory_type_index as usize) < self.properties.memory_types.len());

        if self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .is_ok()
        {
            return Err(NativeError(-2));
        }

        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.live.insert(
            handle,
            MockMemory {
                data: vec![0; size as usize].into_boxed_slice(),
                mapped: false,
            },
        );

        Ok(MemoryHandle(handle))
    }

    unsafe fn free_memory(&self, memory: MemoryHandle) {
        let mut state = self.state.lock();
        let removed = state.live.remove(&memory.0).expect("double free");
        assert!(!removed.mapped, "freed while mapped");
    }

    unsafe fn map_memory(&self, memory: MemoryHandle) -> Result<NonNull<c_void>, NativeError> {
        let mut state = self.state.lock();
        let memory = state.live.get_mut(&memory.0).expect("mapped freed memory");
        assert!(!memory.mapped, "double map");
        memory.mapped = true;

        // The data box never moves while the handle is live; the pointer stays valid across
        // the `HashMap`'s own reallocations.
        Ok(NonNull::new(memory.data.as_mut_ptr().cast()).unwrap())
    }

    unsafe fn unmap_memory(&self, memory: MemoryHandle) {
        let mut state = self.state.lock();
        let memory = state.live.get_mut(&memory.0).expect("unmapped freed memory");
        assert!(memory.mapped, "unmap without map");
        memory.mapped = false;
    }

    unsafe fn flush_ranges(&self, ranges: &[MappedRange]) -> Result<(), NativeError> {
        let state = self.state.lock();
        for range in ranges {
            self.check_range(&state, range);
        }

        Ok(())
    }

    unsafe fn invalidate_ranges(&self, ranges: &[MappedRange]) -> Result<(), NativeError> {
        let state = self.state.lock();
        for range in ranges {
            self.check_range(&state, range);
        }

        Ok(())
    }

    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }
}

pub(crate) fn mock_device() -> Arc<MockDevice> {
    MockDevice::new()
}

pub(crate) fn mock_allocator() -> Allocator {
    Allocator::new(
        mock_device(),
        &AllocatorCreateInfo {
            preferred_block_size: 1 << 20,
            ..Default::default()
        },
    )
    .unwrap()
}
