//! [`GpuDevice`] over a real Vulkan device
//!
//! Owns the instance, surface and logical device. Queue submission and
//! presentation are serialized through one lock so resource uploads from
//! worker threads can race frame submission safely.

use std::ffi::CString;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::render::api::{
    check_result, AcquireOutcome, DeviceLimits, GpuDevice, MemoryAllocation, PresentOutcome, RenderPassBegin,
    SubmitDescription, SwapchainImages, SwapchainRequest, VulkanError, VulkanResult,
};

use super::initialization::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format, LogicalDevice, PhysicalDeviceInfo,
    Surface, VulkanInstance,
};

/// Vulkan implementation of [`GpuDevice`]
pub struct VulkanDevice {
    // drop order: device, surface, instance
    device: LogicalDevice,
    surface: Surface,
    physical: PhysicalDeviceInfo,
    instance: VulkanInstance,
    queue_lock: Mutex<()>,
}

impl VulkanDevice {
    /// Create instance, surface and device for a native window
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(display, app_name, enable_validation)?;
        let surface = Surface::new(&instance, display, window)?;
        let physical = PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface.handle(), surface.loader())?;
        let device = LogicalDevice::new(&instance.instance, &physical)?;
        log::info!(
            "Vulkan device ready: {} (graphics family {}, present family {}, compute queue {}.{})",
            physical.name(),
            physical.graphics_family,
            physical.present_family,
            physical.compute_family,
            physical.compute_queue_index
        );
        Ok(Self { device, surface, physical, instance, queue_lock: Mutex::new(()) })
    }

    /// Selected physical device
    pub const fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    /// Raw `ash` device for code outside the crate's abstractions
    pub const fn raw(&self) -> &ash::Device {
        &self.device.device
    }

    fn queues(&self) -> MutexGuard<'_, ()> {
        self.queue_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<(u32, vk::MemoryPropertyFlags)> {
        let memory = &self.physical.memory_properties;
        memory.memory_types[..memory.memory_type_count as usize]
            .iter()
            .zip(0u32..)
            .find(|&(ty, index)| type_bits & (1 << index) != 0 && ty.property_flags.contains(properties))
            .map(|(ty, index)| (index, ty.property_flags))
    }

    fn sharing_families(&self) -> Vec<u32> {
        if self.physical.graphics_family == self.physical.present_family {
            Vec::new()
        } else {
            vec![self.physical.graphics_family, self.physical.present_family]
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        let limits = &self.physical.properties.limits;
        DeviceLimits {
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            max_sampler_anisotropy: if self.physical.features.sampler_anisotropy == vk::TRUE {
                limits.max_sampler_anisotropy
            } else {
                1.0
            },
        }
    }

    fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    fn compute_queue(&self) -> vk::Queue {
        self.device.compute_queue
    }

    fn graphics_queue_family(&self) -> u32 {
        self.physical.graphics_family
    }

    fn compute_queue_family(&self) -> u32 {
        self.physical.compute_family
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        let _queues = self.queues();
        check_result(unsafe { self.device.device.device_wait_idle() }, "device wait idle")
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VulkanResult<()> {
        let _queues = self.queues();
        check_result(unsafe { self.device.device.queue_wait_idle(queue) }, "queue wait idle")
    }

    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let Some(debug_utils) = &self.instance.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(self.device.device.handle(), &info) } {
            log::debug!("Failed to name object {handle:#x}: {e:?}");
        }
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        check_result(unsafe { self.device.device.create_fence(&info, None) }, "create fence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VulkanResult<()> {
        check_result(unsafe { self.device.device.wait_for_fences(fences, true, timeout) }, "wait for fences")
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()> {
        check_result(unsafe { self.device.device.reset_fences(fences) }, "reset fences")
    }

    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        check_result(unsafe { self.device.device.create_semaphore(&info, None) }, "create semaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(&self, queue_family: u32, flags: vk::CommandPoolCreateFlags) -> VulkanResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder().queue_family_index(queue_family).flags(flags);
        check_result(unsafe { self.device.device.create_command_pool(&info, None) }, "create command pool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        check_result(unsafe { self.device.device.allocate_command_buffers(&info) }, "allocate command buffers")
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.device.free_command_buffers(pool, buffers) };
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> VulkanResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        check_result(unsafe { self.device.device.begin_command_buffer(buffer, &info) }, "begin command buffer")
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VulkanResult<()> {
        check_result(unsafe { self.device.device.end_command_buffer(buffer) }, "end command buffer")
    }

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDescription<'_>, fence: vk::Fence) -> VulkanResult<()> {
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(submit.signal_semaphores)
            .build();
        let _queues = self.queues();
        check_result(unsafe { self.device.device.queue_submit(queue, &[info], fence) }, "queue submit")
    }

    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.render_area)
            .clear_values(begin.clear_values);
        unsafe { self.device.device.cmd_begin_render_pass(buffer, &info, vk::SubpassContents::INLINE) };
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        unsafe { self.device.device.cmd_end_render_pass(buffer) };
    }

    fn cmd_bind_pipeline(&self, buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.device.cmd_bind_pipeline(buffer, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe { self.device.device.cmd_bind_descriptor_sets(buffer, bind_point, layout, first_set, sets, &[]) };
    }

    fn cmd_push_constants(
        &self,
        buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe { self.device.device.cmd_push_constants(buffer, layout, stages, offset, data) };
    }

    fn cmd_bind_vertex_buffers(&self, buffer: vk::CommandBuffer, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        unsafe { self.device.device.cmd_bind_vertex_buffers(buffer, first_binding, buffers, offsets) };
    }

    fn cmd_bind_index_buffer(&self, buffer: vk::CommandBuffer, index_buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe { self.device.device.cmd_bind_index_buffer(buffer, index_buffer, offset, index_type) };
    }

    fn cmd_set_viewport(&self, buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.device.cmd_set_viewport(buffer, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.device.cmd_set_scissor(buffer, 0, &[scissor]) };
    }

    fn cmd_draw(&self, buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe { self.device.device.cmd_draw(buffer, vertex_count, instance_count, first_vertex, first_instance) };
    }

    fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .device
                .cmd_draw_indexed(buffer, index_count, instance_count, first_index, vertex_offset, first_instance);
        }
    }

    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.device.cmd_dispatch(buffer, x, y, z) };
    }

    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_barriers,
            );
        }
    }

    fn cmd_copy_buffer(&self, buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.device.cmd_copy_buffer(buffer, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.device.cmd_copy_buffer_to_image(buffer, src, dst, dst_layout, regions) };
    }

    fn cmd_begin_label(&self, buffer: vk::CommandBuffer, name: &str) {
        let (Some(debug_utils), Ok(name)) = (&self.instance.debug_utils, CString::new(name)) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name);
        unsafe { debug_utils.cmd_begin_debug_utils_label(buffer, &label) };
    }

    fn cmd_end_label(&self, buffer: vk::CommandBuffer) {
        if let Some(debug_utils) = &self.instance.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(buffer) };
        }
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VulkanResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        check_result(unsafe { self.device.device.create_buffer(&info, None) }, "create buffer")
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.device.destroy_buffer(buffer, None) };
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<MemoryAllocation> {
        let Some((type_index, actual)) = self.find_memory_type(requirements.memory_type_bits, properties) else {
            log::error!("No memory type with {properties:?} in mask {:#b}", requirements.memory_type_bits);
            return Err(VulkanError::NoSuitableMemoryType);
        };
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let memory = check_result(unsafe { self.device.device.allocate_memory(&info, None) }, "allocate memory")?;
        Ok(MemoryAllocation { memory, size: requirements.size, properties: actual })
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.device.free_memory(memory, None) };
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VulkanResult<()> {
        check_result(unsafe { self.device.device.bind_buffer_memory(buffer, memory, offset) }, "bind buffer memory")
    }

    fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VulkanResult<*mut u8> {
        let ptr = check_result(
            unsafe { self.device.device.map_memory(memory, offset, size, vk::MemoryMapFlags::empty()) },
            "map memory",
        )?;
        Ok(ptr.cast())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.device.unmap_memory(memory) };
    }

    fn flush_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VulkanResult<()> {
        let range = vk::MappedMemoryRange::builder().memory(memory).offset(offset).size(size).build();
        check_result(unsafe { self.device.device.flush_mapped_memory_ranges(&[range]) }, "flush memory")
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VulkanResult<vk::Image> {
        check_result(unsafe { self.device.device.create_image(info, None) }, "create image")
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.device.destroy_image(image, None) };
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VulkanResult<()> {
        check_result(unsafe { self.device.device.bind_image_memory(image, memory, offset) }, "bind image memory")
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VulkanResult<vk::ImageView> {
        check_result(unsafe { self.device.device.create_image_view(info, None) }, "create image view")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, info: &vk::SamplerCreateInfo) -> VulkanResult<vk::Sampler> {
        check_result(unsafe { self.device.device.create_sampler(info, None) }, "create sampler")
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.device.destroy_sampler(sampler, None) };
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VulkanResult<vk::Framebuffer> {
        check_result(unsafe { self.device.device.create_framebuffer(info, None) }, "create framebuffer")
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VulkanResult<vk::RenderPass> {
        check_result(unsafe { self.device.device.create_render_pass(info, None) }, "create render pass")
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.device.destroy_render_pass(render_pass, None) };
    }

    fn create_descriptor_pool(&self, info: &vk::DescriptorPoolCreateInfo) -> VulkanResult<vk::DescriptorPool> {
        check_result(unsafe { self.device.device.create_descriptor_pool(info, None) }, "create descriptor pool")
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.device.destroy_descriptor_pool(pool, None) };
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()> {
        check_result(
            unsafe { self.device.device.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty()) },
            "reset descriptor pool",
        )
    }

    fn create_descriptor_set_layout(&self, info: &vk::DescriptorSetLayoutCreateInfo) -> VulkanResult<vk::DescriptorSetLayout> {
        check_result(
            unsafe { self.device.device.create_descriptor_set_layout(info, None) },
            "create descriptor set layout",
        )
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn allocate_descriptor_sets(&self, pool: vk::DescriptorPool, layouts: &[vk::DescriptorSetLayout]) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::builder().descriptor_pool(pool).set_layouts(layouts);
        match unsafe { self.device.device.allocate_descriptor_sets(&info) } {
            Ok(sets) => Ok(sets),
            // the pool manager grows on these
            Err(code @ (vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)) => Err(VulkanError::Api(code)),
            Err(code) => check_result(Err(code), "allocate descriptor sets"),
        }
    }

    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
        check_result(unsafe { self.device.device.free_descriptor_sets(pool, sets) }, "free descriptor sets")
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet]) {
        unsafe { self.device.device.update_descriptor_sets(writes, &[]) };
    }

    fn create_shader_module(&self, code: &[u32]) -> VulkanResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        check_result(unsafe { self.device.device.create_shader_module(&info, None) }, "create shader module")
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(&self, info: &vk::PipelineLayoutCreateInfo) -> VulkanResult<vk::PipelineLayout> {
        check_result(unsafe { self.device.device.create_pipeline_layout(info, None) }, "create pipeline layout")
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&self, info: &vk::GraphicsPipelineCreateInfo) -> VulkanResult<vk::Pipeline> {
        let result = unsafe {
            self.device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info), None)
        };
        match result {
            Ok(pipelines) => pipelines
                .into_iter()
                .next()
                .ok_or_else(|| VulkanError::invalid("Driver returned no graphics pipeline")),
            Err((partial, code)) => {
                for pipeline in partial.into_iter().filter(|p| p.as_raw() != 0) {
                    self.destroy_pipeline(pipeline);
                }
                check_result(Err(code), "create graphics pipeline")
            }
        }
    }

    fn create_compute_pipeline(&self, info: &vk::ComputePipelineCreateInfo) -> VulkanResult<vk::Pipeline> {
        let result = unsafe {
            self.device
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info), None)
        };
        match result {
            Ok(pipelines) => pipelines
                .into_iter()
                .next()
                .ok_or_else(|| VulkanError::invalid("Driver returned no compute pipeline")),
            Err((partial, code)) => {
                for pipeline in partial.into_iter().filter(|p| p.as_raw() != 0) {
                    self.destroy_pipeline(pipeline);
                }
                check_result(Err(code), "create compute pipeline")
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.device.destroy_pipeline(pipeline, None) };
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> VulkanResult<SwapchainImages> {
        let physical = self.physical.device;
        let capabilities = self.surface.capabilities(physical)?;
        let format = choose_surface_format(&self.surface.formats(physical)?)
            .ok_or_else(|| VulkanError::InitializationFailed("Surface reports no formats".to_string()))?;
        let present_mode = choose_present_mode(&self.surface.present_modes(physical)?, request.vsync);
        let extent = choose_extent(&capabilities, request.extent);

        let families = self.sharing_families();
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.handle())
            .min_image_count(choose_image_count(&capabilities))
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(if families.is_empty() { vk::SharingMode::EXCLUSIVE } else { vk::SharingMode::CONCURRENT })
            .queue_family_indices(&families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(request.old_swapchain);

        let loader = &self.device.swapchain_loader;
        let handle = check_result(unsafe { loader.create_swapchain(&info, None) }, "create swapchain")?;
        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(code) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return check_result(Err(code), "get swapchain images");
            }
        };
        log::debug!(
            "Swapchain {}x{} with {} images, {:?}, {present_mode:?}",
            extent.width,
            extent.height,
            images.len(),
            format.format
        );
        Ok(SwapchainImages { handle, images, format: format.format, extent })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.device.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, timeout: u64, semaphore: vk::Semaphore) -> VulkanResult<AcquireOutcome> {
        let result = unsafe {
            self.device
                .swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(code) => check_result(Err(code), "acquire next image"),
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VulkanResult<PresentOutcome> {
        // presentation may live on its own family
        let queue = if queue == self.device.graphics_queue { self.device.present_queue } else { queue };
        let swapchains = [swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let _queues = self.queues();
        match unsafe { self.device.swapchain_loader.queue_present(queue, &info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(code) => check_result(Err(code), "queue present"),
        }
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("gpu", &self.physical.name())
            .field("validation", &self.instance.debug_utils.is_some())
            .finish_non_exhaustive()
    }
}
