//! Buffer management for vertex, index, uniform and staging data
//!
//! Every allocation is padded up to the device's minimum uniform buffer
//! offset alignment regardless of usage, so any buffer can be bound as a
//! dynamic uniform range without re-checking.

use std::sync::Arc;

use ash::vk::{self, Handle};

use crate::render::api::{GpuDevice, MemoryAllocation, RenderContext, VulkanError, VulkanResult};
use crate::render::commands::CommandBuffer;

/// Round `value` up to a multiple of `alignment` (a power of two, or zero for no alignment)
pub const fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment == 0 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Parameters for [`Buffer::from_description`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescription {
    /// Debug name attached to the handle
    pub debug_name: String,
    /// Buffer usage
    pub usage: vk::BufferUsageFlags,
    /// Required memory properties
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Requested size in bytes, before padding
    pub size: vk::DeviceSize,
}

impl Default for BufferDescription {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory_properties: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            size: 0,
        }
    }
}

/// Buffer wrapper with memory management
pub struct Buffer {
    device: Arc<dyn GpuDevice>,
    buffer: vk::Buffer,
    allocation: Option<MemoryAllocation>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

impl Buffer {
    /// Create a buffer, optionally filled with `initial_data`
    ///
    /// Initial data is written synchronously: mapped, copied, flushed when the
    /// memory is not host-coherent, and unmapped before returning.
    pub fn new(
        ctx: &RenderContext,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
        initial_data: Option<&[u8]>,
    ) -> VulkanResult<Self> {
        let device = Arc::clone(ctx.device());
        let size = align_up(size.max(1), ctx.limits().min_uniform_buffer_offset_alignment);

        let buffer = device.create_buffer(size, usage)?;
        let requirements = device.buffer_memory_requirements(buffer);
        let allocation = match device.allocate_memory(&requirements, memory_properties) {
            Ok(allocation) => allocation,
            Err(err) => {
                device.destroy_buffer(buffer);
                return Err(err);
            }
        };

        let created = Self { device, buffer, allocation: Some(allocation), size, usage };
        created.device.bind_buffer_memory(buffer, allocation.memory, 0)?;

        if let Some(data) = initial_data {
            created.write(0, data)?;
        }

        log::debug!("Created buffer {buffer:?} ({size} bytes, {usage:?})");
        Ok(created)
    }

    /// Create a buffer from a description
    pub fn from_description(ctx: &RenderContext, description: &BufferDescription, initial_data: Option<&[u8]>) -> VulkanResult<Self> {
        let buffer = Self::new(ctx, description.usage, description.memory_properties, description.size, initial_data)?;
        if !description.debug_name.is_empty() {
            buffer.device.set_object_name(vk::ObjectType::BUFFER, buffer.buffer.as_raw(), &description.debug_name);
        }
        Ok(buffer)
    }

    /// Create a host-visible buffer holding `data`
    pub fn with_data<T: bytemuck::Pod>(ctx: &RenderContext, usage: vk::BufferUsageFlags, data: &[T]) -> VulkanResult<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self::new(
            ctx,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            bytes.len() as vk::DeviceSize,
            Some(bytes),
        )
    }

    /// Write bytes at `offset`
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        let allocation = self.allocation.ok_or_else(|| VulkanError::invalid("Buffer already destroyed"))?;
        let len = data.len() as vk::DeviceSize;
        if offset + len > self.size {
            return Err(VulkanError::invalid(format!(
                "Write of {len} bytes at offset {offset} exceeds buffer size {}",
                self.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mapped = self.device.map_memory(allocation.memory, offset, len)?;
        // SAFETY: the mapping covers `len` bytes from `offset`, checked against the buffer size above
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped, data.len());
        }
        let flushed = if allocation.needs_flush() {
            self.device.flush_memory(allocation.memory, 0, vk::WHOLE_SIZE)
        } else {
            Ok(())
        };
        self.device.unmap_memory(allocation.memory);
        flushed
    }

    /// Write a slice of plain-old-data values at offset zero
    pub fn write_pod<T: bytemuck::Pod>(&self, data: &[T]) -> VulkanResult<()> {
        self.write(0, bytemuck::cast_slice(data))
    }

    /// Record a copy of `region` into `dst`
    ///
    /// Submission and synchronization are the caller's responsibility.
    pub fn copy_to(&self, dst: &Self, cmd: &CommandBuffer, region: vk::BufferCopy) -> VulkanResult<()> {
        if region.src_offset + region.size > self.size || region.dst_offset + region.size > dst.size {
            return Err(VulkanError::invalid("Buffer copy region out of bounds"));
        }
        cmd.copy_buffer(self.buffer, dst.buffer, &[region]);
        Ok(())
    }

    /// Buffer handle
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Padded size in bytes
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage the buffer was created with
    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Bound memory, `None` once destroyed
    pub const fn memory(&self) -> Option<MemoryAllocation> {
        self.allocation
    }

    /// Descriptor info covering the whole buffer
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo { buffer: self.buffer, offset: 0, range: self.size }
    }

    /// Release the handle and its memory; later calls do nothing
    pub fn destroy(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.device.destroy_buffer(self.buffer);
            self.device.free_memory(allocation.memory);
            self.buffer = vk::Buffer::null();
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}
