//! The native-API binding layer consumed by the allocator.
//!
//! The allocator itself never issues graphics-API calls. Everything it needs from the native API
//! is expressed by the [`MemoryDevice`] trait: coarse memory allocation and freeing, whole-object
//! mapping, cache management for non-coherent memory, and the memory-type/heap property queries
//! that drive placement decisions. The `vulkan` feature provides an implementation on top of
//! [`ash`]; tests use a host-side double.
//!
//! [`ash`]: https://docs.rs/ash

use crate::{layout::DeviceAlignment, DeviceSize};
use std::{
    error::Error,
    ffi::c_void,
    fmt::{self, Debug, Display},
    ptr::NonNull,
};

/// An opaque handle to one native memory object.
///
/// The allocator only ever stores and forwards these; their meaning is defined by the
/// [`MemoryDevice`] implementation that produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub u64);

/// An error code of the underlying native API, passed through verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeError(pub i32);

impl Error for NativeError {}

impl Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native API error code {}", self.0)
    }
}

/// Properties of a memory type, as reported by the native API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryPropertyFlags {
    /// The memory resides on the device and is fastest for device access.
    pub device_local: bool,

    /// The memory can be mapped into host address space.
    pub host_visible: bool,

    /// Host writes and device reads (and vice versa) do not require explicit cache management.
    pub host_coherent: bool,

    /// Host reads from the memory are cached.
    pub host_cached: bool,

    /// The memory may be committed lazily by the implementation.
    pub lazily_allocated: bool,
}

/// One memory type of the device.
#[derive(Clone, Copy, Debug)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

/// One memory heap of the device.
#[derive(Clone, Copy, Debug)]
pub struct MemoryHeap {
    pub size: DeviceSize,
}

/// The memory-related properties of a device, queried once at allocator creation.
#[derive(Clone, Debug)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,

    /// The page granularity at which linear (buffer) and non-linear (optimal image) resources
    /// must be separated within one memory object.
    pub buffer_image_granularity: DeviceAlignment,

    /// The alignment of flushed/invalidated ranges for host-visible, non-coherent memory.
    pub non_coherent_atom_size: DeviceAlignment,

    /// The hard per-process limit on live native memory objects.
    pub max_memory_allocation_count: u32,
}

/// A range of one native memory object, used for flush and invalidate calls.
#[derive(Clone, Copy, Debug)]
pub struct MappedRange {
    pub memory: MemoryHandle,
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

/// The native memory operations the allocator is built on.
///
/// Implementations must be safe to call from multiple threads; the allocator serializes
/// structural operations per block list but different lists may call into the device
/// concurrently.
pub trait MemoryDevice: Debug + Send + Sync {
    /// Allocates one native memory object of `size` bytes from the given memory type.
    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<MemoryHandle, NativeError>;

    /// Frees a native memory object.
    ///
    /// # Safety
    ///
    /// - `memory` must have been returned by [`allocate_memory`] on `self` and not freed since.
    ///
    /// [`allocate_memory`]: Self::allocate_memory
    unsafe fn free_memory(&self, memory: MemoryHandle);

    /// Maps the whole of a native memory object into host address space.
    ///
    /// # Safety
    ///
    /// - `memory` must be live, belong to a host-visible memory type, and not be mapped already.
    unsafe fn map_memory(&self, memory: MemoryHandle) -> Result<NonNull<c_void>, NativeError>;

    /// Unmaps a native memory object.
    ///
    /// # Safety
    ///
    /// - `memory` must be live and currently mapped.
    unsafe fn unmap_memory(&self, memory: MemoryHandle);

    /// Flushes the host cache for the given ranges of non-coherent memory.
    ///
    /// # Safety
    ///
    /// - Every range must be in bounds of a live, mapped memory object and aligned to the
    ///   non-coherent atom size (the end may instead coincide with the end of the object).
    unsafe fn flush_ranges(&self, ranges: &[MappedRange]) -> Result<(), NativeError>;

    /// Invalidates the host cache for the given ranges of non-coherent memory.
    ///
    /// # Safety
    ///
    /// - Same as [`flush_ranges`](Self::flush_ranges).
    unsafe fn invalidate_ranges(&self, ranges: &[MappedRange]) -> Result<(), NativeError>;

    /// Returns the memory properties of the device.
    fn memory_properties(&self) -> &MemoryProperties;
}
