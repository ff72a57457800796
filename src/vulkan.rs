//! The [`MemoryDevice`] implementation over a Vulkan device, through [`ash`].

use crate::{
    device::{
        MappedRange, MemoryDevice, MemoryHandle, MemoryHeap, MemoryProperties,
        MemoryPropertyFlags, MemoryType, NativeError,
    },
    layout::DeviceAlignment,
    DeviceSize,
};
use ash::vk::{self, Handle};
use smallvec::SmallVec;
use std::{ffi::c_void, fmt, ptr::NonNull};

/// Adapts an [`ash::Device`] to the [`MemoryDevice`] trait.
///
/// The wrapper doesn't own the device; the caller must keep it alive (and not destroy it) for as
/// long as the allocator built on top exists.
pub struct VulkanMemoryDevice {
    device: ash::Device,
    properties: MemoryProperties,
}

impl VulkanMemoryDevice {
    /// Wraps a logical device.
    ///
    /// `memory_properties` and `limits` must be those of the physical device that `device` was
    /// created from.
    pub fn new(
        device: ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        limits: &vk::PhysicalDeviceLimits,
    ) -> Self {
        let memory_types = memory_properties.memory_types
            [..memory_properties.memory_type_count as usize]
            .iter()
            .map(|memory_type| MemoryType {
                property_flags: convert_property_flags(memory_type.property_flags),
                heap_index: memory_type.heap_index,
            })
            .collect();
        let memory_heaps = memory_properties.memory_heaps
            [..memory_properties.memory_heap_count as usize]
            .iter()
            .map(|heap| MemoryHeap { size: heap.size })
            .collect();

        VulkanMemoryDevice {
            device,
            properties: MemoryProperties {
                memory_types,
                memory_heaps,
                buffer_image_granularity: alignment_from_limit(limits.buffer_image_granularity),
                non_coherent_atom_size: alignment_from_limit(limits.non_coherent_atom_size),
                max_memory_allocation_count: limits.max_memory_allocation_count,
            },
        }
    }
}

impl fmt::Debug for VulkanMemoryDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanMemoryDevice")
            .field("device", &self.device.handle())
            .field("properties", &self.properties)
            .finish()
    }
}

impl MemoryDevice for VulkanMemoryDevice {
    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<MemoryHandle, NativeError> {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }
            .map_err(into_native)?;

        Ok(MemoryHandle(memory.as_raw()))
    }

    unsafe fn free_memory(&self, memory: MemoryHandle) {
        self.device
            .free_memory(vk::DeviceMemory::from_raw(memory.0), None);
    }

    unsafe fn map_memory(&self, memory: MemoryHandle) -> Result<NonNull<c_void>, NativeError> {
        let ptr = self
            .device
            .map_memory(
                vk::DeviceMemory::from_raw(memory.0),
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
            .map_err(into_native)?;

        NonNull::new(ptr).ok_or(NativeError(vk::Result::ERROR_MEMORY_MAP_FAILED.as_raw()))
    }

    unsafe fn unmap_memory(&self, memory: MemoryHandle) {
        self.device
            .unmap_memory(vk::DeviceMemory::from_raw(memory.0));
    }

    unsafe fn flush_ranges(&self, ranges: &[MappedRange]) -> Result<(), NativeError> {
        let ranges: SmallVec<[_; 4]> = ranges.iter().map(convert_range).collect();

        self.device
            .flush_mapped_memory_ranges(&ranges)
            .map_err(into_native)
    }

    unsafe fn invalidate_ranges(&self, ranges: &[MappedRange]) -> Result<(), NativeError> {
        let ranges: SmallVec<[_; 4]> = ranges.iter().map(convert_range).collect();

        self.device
            .invalidate_mapped_memory_ranges(&ranges)
            .map_err(into_native)
    }

    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }
}

fn convert_property_flags(flags: vk::MemoryPropertyFlags) -> MemoryPropertyFlags {
    MemoryPropertyFlags {
        device_local: flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL),
        host_visible: flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
        host_coherent: flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
        host_cached: flags.contains(vk::MemoryPropertyFlags::HOST_CACHED),
        lazily_allocated: flags.contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED),
    }
}

fn convert_range(range: &MappedRange) -> vk::MappedMemoryRange<'static> {
    vk::MappedMemoryRange::default()
        .memory(vk::DeviceMemory::from_raw(range.memory.0))
        .offset(range.offset)
        .size(range.size)
}

// The limits are powers of two on conformant implementations; round up if one isn't.
fn alignment_from_limit(limit: DeviceSize) -> DeviceAlignment {
    DeviceAlignment::new(limit.max(1).next_power_of_two()).unwrap_or(DeviceAlignment::MIN)
}

fn into_native(result: vk::Result) -> NativeError {
    NativeError(result.as_raw())
}
