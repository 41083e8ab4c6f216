//! Device abstraction used by every GPU-facing component
//!
//! Resource wrappers, pools and the render graph never touch `ash::Device`
//! directly. They go through [`GpuDevice`], implemented by the Vulkan backend
//! for real hardware. Handles are plain `ash::vk` handles so the layer stays
//! zero-cost; only operations that need more than a handle take a small
//! descriptor struct defined here.

use ash::vk;

use super::VulkanResult;

/// Device limits the resource layer depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    /// `minUniformBufferOffsetAlignment`, used to pad every buffer
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    /// `nonCoherentAtomSize`
    pub non_coherent_atom_size: vk::DeviceSize,
    /// Largest supported sampler anisotropy
    pub max_sampler_anisotropy: f32,
}

/// Memory bound to a buffer or image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocation {
    /// Device memory handle
    pub memory: vk::DeviceMemory,
    /// Allocated size in bytes
    pub size: vk::DeviceSize,
    /// Properties of the memory type that was chosen
    pub properties: vk::MemoryPropertyFlags,
}

impl MemoryAllocation {
    /// Whether host writes need an explicit flush
    pub const fn needs_flush(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && !self.properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// One queue submission
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDescription<'a> {
    /// Semaphores waited before execution
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Stage each wait semaphore blocks, same length as `wait_semaphores`
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Command buffers to execute
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores signaled on completion
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Render pass begin parameters
#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    /// Render pass to begin
    pub render_pass: vk::RenderPass,
    /// Target framebuffer
    pub framebuffer: vk::Framebuffer,
    /// Area rendered to
    pub render_area: vk::Rect2D,
    /// One clear value per attachment with a CLEAR load op
    pub clear_values: &'a [vk::ClearValue],
}

/// Swapchain creation request
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    /// Desired extent; clamped to the surface capabilities
    pub extent: vk::Extent2D,
    /// FIFO when true, otherwise the lowest-latency mode available
    pub vsync: bool,
    /// Swapchain being replaced, or null
    pub old_swapchain: vk::SwapchainKHR,
}

/// Result of swapchain creation
#[derive(Debug, Clone)]
pub struct SwapchainImages {
    /// Swapchain handle
    pub handle: vk::SwapchainKHR,
    /// Presentable images owned by the swapchain
    pub images: Vec<vk::Image>,
    /// Image format
    pub format: vk::Format,
    /// Actual extent after clamping
    pub extent: vk::Extent2D,
}

/// Outcome of acquiring a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired; the semaphore will be signaled
    Acquired {
        /// Index into the swapchain images
        index: u32,
        /// The swapchain no longer matches the surface exactly
        suboptimal: bool,
    },
    /// The swapchain must be recreated; nothing was acquired
    OutOfDate,
}

/// Outcome of presenting a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swapchain should be recreated
    Suboptimal,
    /// Not presented; the swapchain must be recreated
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the swapchain should be rebuilt before the next frame
    pub const fn needs_recreate(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// GPU device operations
///
/// Methods mirror the Vulkan entry points they wrap. Creation methods return
/// handles the caller owns and must destroy through the same device. The
/// implementation must be safe to call from several threads: queue access is
/// serialized internally.
pub trait GpuDevice: Send + Sync {
    // --- Device -----------------------------------------------------------

    /// Limits of the physical device
    fn limits(&self) -> DeviceLimits;
    /// Graphics queue
    fn graphics_queue(&self) -> vk::Queue;
    /// Queue used for compute passes
    fn compute_queue(&self) -> vk::Queue;
    /// Graphics queue family index
    fn graphics_queue_family(&self) -> u32;
    /// Family of [`compute_queue`](Self::compute_queue)
    fn compute_queue_family(&self) -> u32;
    /// Family a queue handed out by this device belongs to
    fn queue_family(&self, queue: vk::Queue) -> Option<u32> {
        if queue == self.graphics_queue() {
            Some(self.graphics_queue_family())
        } else if queue == self.compute_queue() {
            Some(self.compute_queue_family())
        } else {
            None
        }
    }
    /// Block until the device is idle
    fn wait_idle(&self) -> VulkanResult<()>;
    /// Block until a queue is idle
    fn queue_wait_idle(&self, queue: vk::Queue) -> VulkanResult<()>;
    /// Attach a debug name to an object; no-op without debug utils
    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str);

    // --- Synchronization --------------------------------------------------

    /// Create a fence
    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait until all fences are signaled
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VulkanResult<()>;
    /// Reset fences to unsignaled
    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()>;
    /// Create a binary semaphore
    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // --- Command pools and buffers ----------------------------------------

    /// Create a command pool
    fn create_command_pool(&self, queue_family: u32, flags: vk::CommandPoolCreateFlags) -> VulkanResult<vk::CommandPool>;
    /// Destroy a command pool and every buffer allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Allocate primary command buffers
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>>;
    /// Return command buffers to their pool
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    /// Begin recording (implicitly resets the buffer)
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> VulkanResult<()>;
    /// End recording
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VulkanResult<()>;
    /// Submit work to a queue
    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDescription<'_>, fence: vk::Fence) -> VulkanResult<()>;

    // --- Recording --------------------------------------------------------

    /// Begin a render pass with inline contents
    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>);
    /// End the current render pass
    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer);
    /// Bind a pipeline
    fn cmd_bind_pipeline(&self, buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);
    /// Bind descriptor sets
    fn cmd_bind_descriptor_sets(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    /// Update push constants
    fn cmd_push_constants(
        &self,
        buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    /// Bind vertex buffers
    fn cmd_bind_vertex_buffers(&self, buffer: vk::CommandBuffer, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]);
    /// Bind an index buffer
    fn cmd_bind_index_buffer(&self, buffer: vk::CommandBuffer, index_buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType);
    /// Set the dynamic viewport
    fn cmd_set_viewport(&self, buffer: vk::CommandBuffer, viewport: vk::Viewport);
    /// Set the dynamic scissor
    fn cmd_set_scissor(&self, buffer: vk::CommandBuffer, scissor: vk::Rect2D);
    /// Non-indexed draw
    fn cmd_draw(&self, buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    /// Indexed draw
    fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    /// Compute dispatch
    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
    /// Image memory barriers between two stages
    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    );
    /// Buffer to buffer copy
    fn cmd_copy_buffer(&self, buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    /// Buffer to image copy
    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    /// Open a debug label region; no-op without debug utils
    fn cmd_begin_label(&self, buffer: vk::CommandBuffer, name: &str);
    /// Close the innermost debug label region
    fn cmd_end_label(&self, buffer: vk::CommandBuffer);

    // --- Memory and buffers -----------------------------------------------

    /// Create a buffer without memory
    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VulkanResult<vk::Buffer>;
    /// Destroy a buffer
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Memory requirements of a buffer
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    /// Allocate memory satisfying `requirements` from a type with `properties`
    fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<MemoryAllocation>;
    /// Free device memory
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Bind memory to a buffer
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VulkanResult<()>;
    /// Map host-visible memory
    fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VulkanResult<*mut u8>;
    /// Unmap memory
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// Flush a mapped range of non-coherent memory
    fn flush_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VulkanResult<()>;

    // --- Images and views -------------------------------------------------

    /// Create an image without memory
    fn create_image(&self, info: &vk::ImageCreateInfo) -> VulkanResult<vk::Image>;
    /// Destroy an image
    fn destroy_image(&self, image: vk::Image);
    /// Memory requirements of an image
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    /// Bind memory to an image
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VulkanResult<()>;
    /// Create an image view
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VulkanResult<vk::ImageView>;
    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Create a sampler
    fn create_sampler(&self, info: &vk::SamplerCreateInfo) -> VulkanResult<vk::Sampler>;
    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);
    /// Create a framebuffer
    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VulkanResult<vk::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    /// Create a render pass
    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VulkanResult<vk::RenderPass>;
    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    // --- Descriptors ------------------------------------------------------

    /// Create a descriptor pool
    fn create_descriptor_pool(&self, info: &vk::DescriptorPoolCreateInfo) -> VulkanResult<vk::DescriptorPool>;
    /// Destroy a descriptor pool and its sets
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Return every set of a pool to it
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()>;
    /// Create a descriptor set layout
    fn create_descriptor_set_layout(&self, info: &vk::DescriptorSetLayoutCreateInfo) -> VulkanResult<vk::DescriptorSetLayout>;
    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    /// Allocate one set per layout; fails with `ERROR_OUT_OF_POOL_MEMORY` when the pool is full
    fn allocate_descriptor_sets(&self, pool: vk::DescriptorPool, layouts: &[vk::DescriptorSetLayout]) -> VulkanResult<Vec<vk::DescriptorSet>>;
    /// Return sets to a pool created with `FREE_DESCRIPTOR_SET`
    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> VulkanResult<()>;
    /// Write descriptor bindings
    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet]);

    // --- Pipelines --------------------------------------------------------

    /// Create a shader module from SPIR-V words
    fn create_shader_module(&self, code: &[u32]) -> VulkanResult<vk::ShaderModule>;
    /// Destroy a shader module
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    /// Create a pipeline layout
    fn create_pipeline_layout(&self, info: &vk::PipelineLayoutCreateInfo) -> VulkanResult<vk::PipelineLayout>;
    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    /// Create a graphics pipeline
    fn create_graphics_pipeline(&self, info: &vk::GraphicsPipelineCreateInfo) -> VulkanResult<vk::Pipeline>;
    /// Create a compute pipeline
    fn create_compute_pipeline(&self, info: &vk::ComputePipelineCreateInfo) -> VulkanResult<vk::Pipeline>;
    /// Destroy a pipeline
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // --- Presentation -----------------------------------------------------

    /// Create (or recreate) the swapchain for the device's surface
    fn create_swapchain(&self, request: &SwapchainRequest) -> VulkanResult<SwapchainImages>;
    /// Destroy a swapchain
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Acquire the next presentable image, signaling `semaphore`
    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, timeout: u64, semaphore: vk::Semaphore) -> VulkanResult<AcquireOutcome>;
    /// Queue an image for presentation after `wait_semaphores`
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VulkanResult<PresentOutcome>;
}
