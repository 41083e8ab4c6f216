//! Recording device used by unit tests
//!
//! Hands out fake handles, keeps a log of the calls that matter for frame
//! scheduling and checks the Vulkan state rules the graph relies on: fences
//! submitted while signaled, semaphores waited without a pending signal or
//! signaled twice, command buffers used outside recording, unbalanced render
//! passes and double destruction. Submissions complete instantly, so a fence
//! is signaled as soon as the work it guards is submitted.

#![allow(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};

use crate::render::api::{
    AcquireOutcome, DeviceLimits, GpuDevice, MemoryAllocation, PresentOutcome, RenderPassBegin,
    SubmitDescription, SwapchainImages, SwapchainRequest, VulkanError, VulkanResult,
};

pub const MIN_UBO_ALIGNMENT: vk::DeviceSize = 256;
const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Write a minimal SPIR-V file the mock accepts; `valid = false` breaks the magic word
pub fn write_spirv(path: &std::path::Path, valid: bool) {
    let magic = if valid { SPIRV_MAGIC } else { 0xdead_beef };
    let words = [magic, 0x0001_0000, 0, 1, 0];
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    std::fs::write(path, bytes).expect("write spirv");
}

/// Calls recorded for assertions
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    WaitFences(Vec<vk::Fence>),
    ResetFences(Vec<vk::Fence>),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Submit {
        queue: vk::Queue,
        waits: Vec<vk::Semaphore>,
        wait_stages: Vec<vk::PipelineStageFlags>,
        command_buffers: Vec<vk::CommandBuffer>,
        signals: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    BeginRenderPass {
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: (i32, i32, u32, u32),
    },
    EndRenderPass(vk::CommandBuffer),
    Draw(vk::CommandBuffer),
    Dispatch(vk::CommandBuffer),
    Barrier { image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout },
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize },
    CopyBufferToImage { dst: vk::Image },
    FlushMemory(vk::DeviceMemory),
    Acquire { semaphore: vk::Semaphore },
    Present { image_index: u32, waits: Vec<vk::Semaphore> },
    CreateSwapchain { width: u32, height: u32 },
    WaitIdle,
    QueueWaitIdle,
    BeginLabel(String),
    EndLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

/// Creation parameters of a fake image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockImage {
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub flags: vk::ImageCreateFlags,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    live: HashMap<u64, vk::ObjectType>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    command_buffers: HashMap<u64, (vk::CommandPool, CommandBufferState)>,
    in_render_pass: HashMap<u64, bool>,
    buffers: HashMap<u64, vk::DeviceSize>,
    images: HashMap<u64, MockImage>,
    framebuffers: HashMap<u64, (u32, u32)>,
    memory: HashMap<u64, (Vec<u8>, vk::MemoryPropertyFlags)>,
    descriptor_pools: HashMap<u64, (u32, u32)>,
    descriptor_sets: HashMap<u64, u64>,
    pool_families: HashMap<u64, u32>,
    compute_family: u32,
    submits_before_failure: Option<usize>,
    image_creates_before_failure: Option<usize>,
    names: HashMap<u64, String>,
    calls: Vec<Call>,
    violations: Vec<String>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    next_image: u32,
    swapchain_image_count: usize,
    swapchain_images: Vec<vk::Image>,
    surface_extent: Option<vk::Extent2D>,
}

impl MockState {
    fn alloc(&mut self, object_type: vk::ObjectType) -> u64 {
        self.next_handle += 1;
        let raw = 0x1000 + self.next_handle;
        if object_type != vk::ObjectType::UNKNOWN {
            self.live.insert(raw, object_type);
        }
        raw
    }

    fn release(&mut self, raw: u64, object_type: vk::ObjectType) {
        if raw == 0 {
            return;
        }
        match self.live.remove(&raw) {
            Some(found) if found == object_type => {}
            Some(found) => self.violations.push(format!("destroyed {raw:#x} as {object_type:?}, created as {found:?}")),
            None => self.violations.push(format!("double destroy of {object_type:?} {raw:#x}")),
        }
    }

    fn require_recording(&mut self, buffer: vk::CommandBuffer, what: &str) {
        let state = self.command_buffers.get(&buffer.as_raw()).map(|(_, s)| *s);
        if state != Some(CommandBufferState::Recording) {
            self.violations.push(format!("{what} on command buffer {buffer:?} in state {state:?}"));
        }
    }

    fn consume_wait(&mut self, semaphore: vk::Semaphore) {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => self.violations.push(format!("wait on {semaphore:?} with no pending signal")),
            None => self.violations.push(format!("wait on unknown semaphore {semaphore:?}")),
        }
    }

    fn signal(&mut self, semaphore: vk::Semaphore) {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if !*signaled => *signaled = true,
            Some(_) => self.violations.push(format!("signal of already signaled {semaphore:?}")),
            None => self.violations.push(format!("signal of unknown semaphore {semaphore:?}")),
        }
    }
}

/// Fake device recording every call of interest
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState { swapchain_image_count: 3, ..MockState::default() }),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.state().violations.clone()
    }

    pub fn assert_no_violations(&self) {
        let violations = self.violations();
        assert!(violations.is_empty(), "device rule violations: {violations:#?}");
    }

    pub fn live_count(&self, object_type: vk::ObjectType) -> usize {
        self.state().live.values().filter(|t| **t == object_type).count()
    }

    pub fn image(&self, image: vk::Image) -> Option<MockImage> {
        self.state().images.get(&image.as_raw()).copied()
    }

    pub fn framebuffer_extent(&self, framebuffer: vk::Framebuffer) -> Option<(u32, u32)> {
        self.state().framebuffers.get(&framebuffer.as_raw()).copied()
    }

    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.state().memory.get(&memory.as_raw()).map(|(bytes, _)| bytes.clone()).unwrap_or_default()
    }

    pub fn object_name(&self, raw: u64) -> Option<String> {
        self.state().names.get(&raw).cloned()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence.as_raw()).copied().unwrap_or(false)
    }

    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state().acquire_script.push_back(outcome);
    }

    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state().present_script.push_back(outcome);
    }

    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state().surface_extent = Some(vk::Extent2D { width, height });
    }

    pub fn set_swapchain_image_count(&self, count: usize) {
        self.state().swapchain_image_count = count;
    }

    /// Report a dedicated family for the compute queue
    pub fn set_compute_family(&self, family: u32) {
        self.state().compute_family = family;
    }

    /// Let `count` more submits through, then fail the next one with `ERROR_DEVICE_LOST`
    pub fn fail_submit_after(&self, count: usize) {
        self.state().submits_before_failure = Some(count);
    }

    /// Let `count` more image creations through, then fail the next one with
    /// `ERROR_OUT_OF_DEVICE_MEMORY`
    pub fn fail_image_create_after(&self, count: usize) {
        self.state().image_creates_before_failure = Some(count);
    }

    /// Descriptor sets allocated and not freed from `pool`
    pub fn descriptor_sets_in_use(&self, pool: vk::DescriptorPool) -> u32 {
        self.state().descriptor_pools.get(&pool.as_raw()).map_or(0, |(_, used)| *used)
    }

    /// Number of fence waits that included `fence`
    pub fn fence_wait_count(&self, fence: vk::Fence) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::WaitFences(fences) if fences.contains(&fence)))
            .count()
    }

    /// Number of fence resets that included `fence`
    pub fn fence_reset_count(&self, fence: vk::Fence) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::ResetFences(fences) if fences.contains(&fence)))
            .count()
    }

    /// Number of times recording began on `buffer`
    pub fn begin_count(&self, buffer: vk::CommandBuffer) -> usize {
        self.calls().iter().filter(|call| **call == Call::BeginCommandBuffer(buffer)).count()
    }

    /// Submissions in call order
    pub fn submissions(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|call| matches!(call, Call::Submit { .. })).collect()
    }
}

impl GpuDevice for MockDevice {
    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            min_uniform_buffer_offset_alignment: MIN_UBO_ALIGNMENT,
            non_coherent_atom_size: 64,
            max_sampler_anisotropy: 16.0,
        }
    }

    fn graphics_queue(&self) -> vk::Queue {
        vk::Queue::from_raw(1)
    }

    fn compute_queue(&self) -> vk::Queue {
        vk::Queue::from_raw(2)
    }

    fn graphics_queue_family(&self) -> u32 {
        0
    }

    fn compute_queue_family(&self) -> u32 {
        self.state().compute_family
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        self.state().calls.push(Call::WaitIdle);
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VulkanResult<()> {
        self.state().calls.push(Call::QueueWaitIdle);
        Ok(())
    }

    fn set_object_name(&self, _object_type: vk::ObjectType, handle: u64, name: &str) {
        self.state().names.insert(handle, name.to_string());
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let mut state = self.state();
        let raw = state.alloc(vk::ObjectType::FENCE);
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        state.release(fence.as_raw(), vk::ObjectType::FENCE);
        state.fences.remove(&fence.as_raw());
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: u64) -> VulkanResult<()> {
        let mut state = self.state();
        state.calls.push(Call::WaitFences(fences.to_vec()));
        if fences.iter().all(|f| state.fences.get(&f.as_raw()).copied().unwrap_or(false)) {
            Ok(())
        } else {
            Err(VulkanError::Api(vk::Result::TIMEOUT))
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()> {
        let mut state = self.state();
        state.calls.push(Call::ResetFences(fences.to_vec()));
        for fence in fences {
            state.fences.insert(fence.as_raw(), false);
        }
        Ok(())
    }

    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore> {
        let mut state = self.state();
        let raw = state.alloc(vk::ObjectType::SEMAPHORE);
        state.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state();
        state.release(semaphore.as_raw(), vk::ObjectType::SEMAPHORE);
        state.semaphores.remove(&semaphore.as_raw());
    }

    fn create_command_pool(&self, queue_family: u32, _flags: vk::CommandPoolCreateFlags) -> VulkanResult<vk::CommandPool> {
        let mut state = self.state();
        let raw = state.alloc(vk::ObjectType::COMMAND_POOL);
        state.pool_families.insert(raw, queue_family);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        state.release(pool.as_raw(), vk::ObjectType::COMMAND_POOL);
        state.pool_families.remove(&pool.as_raw());
        let owned: Vec<u64> = state
            .command_buffers
            .iter()
            .filter(|(_, (p, _))| *p == pool)
            .map(|(raw, _)| *raw)
            .collect();
        for raw in owned {
            state.command_buffers.remove(&raw);
            state.live.remove(&raw);
        }
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state();
        Ok((0..count)
            .map(|_| {
                let raw = state.alloc(vk::ObjectType::COMMAND_BUFFER);
                state.command_buffers.insert(raw, (pool, CommandBufferState::Initial));
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state();
        for buffer in buffers {
            state.release(buffer.as_raw(), vk::ObjectType::COMMAND_BUFFER);
            state.command_buffers.remove(&buffer.as_raw());
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, _flags: vk::CommandBufferUsageFlags) -> VulkanResult<()> {
        let mut state = self.state();
        state.calls.push(Call::BeginCommandBuffer(buffer));
        match state.command_buffers.get_mut(&buffer.as_raw()) {
            Some((_, s)) if *s == CommandBufferState::Recording => {
                state.violations.push(format!("begin on recording command buffer {buffer:?}"));
            }
            Some((_, s)) => *s = CommandBufferState::Recording,
            None => state.violations.push(format!("begin on unknown command buffer {buffer:?}")),
        }
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let mut state = self.state();
        state.calls.push(Call::EndCommandBuffer(buffer));
        state.require_recording(buffer, "end");
        if state.in_render_pass.get(&buffer.as_raw()).copied().unwrap_or(false) {
            state.violations.push(format!("end of {buffer:?} inside a render pass"));
        }
        if let Some((_, s)) = state.command_buffers.get_mut(&buffer.as_raw()) {
            *s = CommandBufferState::Executable;
        }
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDescription<'_>, fence: vk::Fence) -> VulkanResult<()> {
        let mut state = self.state();
        let fail = state.submits_before_failure == Some(0);
        state.submits_before_failure = state.submits_before_failure.and_then(|n| n.checked_sub(1));
        if fail {
            return Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST));
        }
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            state.violations.push("wait semaphore / stage count mismatch".to_string());
        }
        let queue_family = match queue.as_raw() {
            1 => Some(0),
            2 => Some(state.compute_family),
            _ => None,
        };
        for buffer in submit.command_buffers {
            let entry = state.command_buffers.get(&buffer.as_raw()).copied();
            let s = entry.map(|(_, s)| s);
            if s != Some(CommandBufferState::Executable) {
                state.violations.push(format!("submit of {buffer:?} in state {s:?}"));
            }
            let pool_family = entry.and_then(|(pool, _)| state.pool_families.get(&pool.as_raw()).copied());
            if pool_family != queue_family {
                state.violations.push(format!(
                    "submit of {buffer:?} from family {pool_family:?} to queue of family {queue_family:?}"
                ));
            }
        }
        for semaphore in submit.wait_semaphores {
            state.consume_wait(*semaphore);
        }
        for semaphore in submit.signal_semaphores {
            state.signal(*semaphore);
        }
        if fence != vk::Fence::null() {
            match state.fences.get_mut(&fence.as_raw()) {
                Some(signaled) if *signaled => state.violations.push(format!("submit with signaled {fence:?}")),
                Some(signaled) => *signaled = true,
                None => state.violations.push(format!("submit with unknown {fence:?}")),
            }
        }
        state.calls.push(Call::Submit {
            queue,
            waits: submit.wait_semaphores.to_vec(),
            wait_stages: submit.wait_stages.to_vec(),
            command_buffers: submit.command_buffers.to_vec(),
            signals: submit.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        let mut state = self.state();
        state.require_recording(buffer, "begin render pass");
        if state.in_render_pass.insert(buffer.as_raw(), true) == Some(true) {
            state.violations.push(format!("nested render pass on {buffer:?}"));
        }
        let area = begin.render_area;
        state.calls.push(Call::BeginRenderPass {
            command_buffer: buffer,
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
            area: (area.offset.x, area.offset.y, area.extent.width, area.extent.height),
        });
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        let mut state = self.state();
        if state.in_render_pass.insert(buffer.as_raw(), false) != Some(true) {
            state.violations.push(format!("end render pass without begin on {buffer:?}"));
        }
        state.calls.push(Call::EndRenderPass(buffer));
    }

    fn cmd_bind_pipeline(&self, buffer: vk::CommandBuffer, _bind_point: vk::PipelineBindPoint, _pipeline: vk::Pipeline) {
        self.state().require_recording(buffer, "bind pipeline");
    }

    fn cmd_bind_descriptor_sets(
        &self,
        buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        _sets: &[vk::DescriptorSet],
    ) {
        self.state().require_recording(buffer, "bind descriptor sets");
    }

    fn cmd_push_constants(
        &self,
        buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        _data: &[u8],
    ) {
        self.state().require_recording(buffer, "push constants");
    }

    fn cmd_bind_vertex_buffers(&self, buffer: vk::CommandBuffer, _first_binding: u32, _buffers: &[vk::Buffer], _offsets: &[vk::DeviceSize]) {
        self.state().require_recording(buffer, "bind vertex buffers");
    }

    fn cmd_bind_index_buffer(&self, buffer: vk::CommandBuffer, _index_buffer: vk::Buffer, _offset: vk::DeviceSize, _index_type: vk::IndexType) {
        self.state().require_recording(buffer, "bind index buffer");
    }

    fn cmd_set_viewport(&self, buffer: vk::CommandBuffer, _viewport: vk::Viewport) {
        self.state().require_recording(buffer, "set viewport");
    }

    fn cmd_set_scissor(&self, buffer: vk::CommandBuffer, _scissor: vk::Rect2D) {
        self.state().require_recording(buffer, "set scissor");
    }

    fn cmd_draw(&self, buffer: vk::CommandBuffer, _vertex_count: u32, _instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        let mut state = self.state();
        state.require_recording(buffer, "draw");
        state.calls.push(Call::Draw(buffer));
    }

    fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        let mut state = self.state();
        state.require_recording(buffer, "draw indexed");
        state.calls.push(Call::Draw(buffer));
    }

    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, _x: u32, _y: u32, _z: u32) {
        let mut state = self.state();
        state.require_recording(buffer, "dispatch");
        state.calls.push(Call::Dispatch(buffer));
    }

    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        let mut state = self.state();
        state.require_recording(buffer, "pipeline barrier");
        for barrier in image_barriers {
            state.calls.push(Call::Barrier {
                image: barrier.image,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
            });
        }
    }

    fn cmd_copy_buffer(&self, buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        let mut state = self.state();
        state.require_recording(buffer, "copy buffer");
        let size = regions.iter().map(|r| r.size).sum();
        state.calls.push(Call::CopyBuffer { src, dst, size });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        _src: vk::Buffer,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        let mut state = self.state();
        state.require_recording(buffer, "copy buffer to image");
        state.calls.push(Call::CopyBufferToImage { dst });
    }

    fn cmd_begin_label(&self, _buffer: vk::CommandBuffer, name: &str) {
        self.state().calls.push(Call::BeginLabel(name.to_string()));
    }

    fn cmd_end_label(&self, _buffer: vk::CommandBuffer) {
        self.state().calls.push(Call::EndLabel);
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> VulkanResult<vk::Buffer> {
        let mut state = self.state();
        let raw = state.alloc(vk::ObjectType::BUFFER);
        state.buffers.insert(raw, size);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        state.release(buffer.as_raw(), vk::ObjectType::BUFFER);
        state.buffers.remove(&buffer.as_raw());
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state().buffers.get(&buffer.as_raw()).copied().unwrap_or(0);
        vk::MemoryRequirements { size, alignment: MIN_UBO_ALIGNMENT, memory_type_bits: u32::MAX }
    }

    fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<MemoryAllocation> {
        let mut state = self.state();
        let raw = state.alloc(vk::ObjectType::DEVICE_MEMORY);
        let properties = if properties.is_empty() { vk::MemoryPropertyFlags::DEVICE_LOCAL } else { properties };
        let size = usize::try_from(requirements.size).map_err(|_| VulkanError::NoSuitableMemoryType)?;
        state.memory.insert(raw, (vec![0; size], properties));
        Ok(MemoryAllocation { memory: vk::DeviceMemory::from_raw(raw), size: requirements.size, properties })
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state();
        state.release(memory.as_raw(), vk::ObjectType::DEVICE_MEMORY);
        state.memory.remove(&memory.as_raw());
    }

    fn bind_buffer_memory(&self, _buffer: vk::Buffer, _memory: vk::DeviceMemory, _offset: vk::DeviceSize) -> VulkanResult<()> {
        Ok(())
    }

    fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, _size: vk::DeviceSize) -> VulkanResult<*mut u8> {
        let mut state = self.state();
        let Some((bytes, properties)) = state.memory.get_mut(&memory.as_raw()) else {
            return Err(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED));
        };
        if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let offset = usize::try_from(offset).map_err(|_| VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        Ok(bytes.as_mut_ptr().wrapping_add(offset))
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    fn flush_memory(&self, memory: vk::DeviceMemory, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> VulkanResult<()> {
        self.state().calls.push(Call::FlushMemory(memory));
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VulkanResult<vk::Image> {
        let mut state = self.state();
        let fail = state.image_creates_before_failure == Some(0);
        state.image_creates_before_failure = state.image_creates_before_failure.and_then(|n| n.checked_sub(1));
        if fail {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let raw = state.alloc(vk::ObjectType::IMAGE);
        state.images.insert(
            raw,
            MockImage {
                width: info.extent.width,
                height: info.extent.height,
                array_layers: info.array_layers,
                mip_levels: info.mip_levels,
                flags: info.flags,
            },
        );
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state();
        state.release(image.as_raw(), vk::ObjectType::IMAGE);
        state.images.remove(&image.as_raw());
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let image = self.state().images.get(&image.as_raw()).copied();
        let size = image.map_or(0, |i| u64::from(i.width) * u64::from(i.height) * u64::from(i.array_layers) * 4);
        vk::MemoryRequirements { size, alignment: MIN_UBO_ALIGNMENT, memory_type_bits: u32::MAX }
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory, _offset: vk::DeviceSize) -> VulkanResult<()> {
        Ok(())
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo) -> VulkanResult<vk::ImageView> {
        Ok(vk::ImageView::from_raw(self.state().alloc(vk::ObjectType::IMAGE_VIEW)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().release(view.as_raw(), vk::ObjectType::IMAGE_VIEW);
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo) -> VulkanResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.state().alloc(vk::ObjectType::SAMPLER)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state().release(sampler.as_raw(), vk::ObjectType::SAMPLER);
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VulkanResult<vk::Framebuffer> {
        let mut state = self.state();
        let raw = state.alloc(vk::ObjectType::FRAMEBUFFER);
        state.framebuffers.insert(raw, (info.width, info.height));
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state();
        state.release(framebuffer.as_raw(), vk::ObjectType::FRAMEBUFFER);
        state.framebuffers.remove(&framebuffer.as_raw());
    }

    fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo) -> VulkanResult<vk::RenderPass> {
        Ok(vk::RenderPass::from_raw(self.state().alloc(vk::ObjectType::RENDER_PASS)))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state().release(render_pass.as_raw(), vk::ObjectType::RENDER_PASS);
    }

    fn create_descriptor_pool(&self, info: &vk::DescriptorPoolCreateInfo) -> VulkanResult<vk::DescriptorPool> {
        let mut state = self.state();
        let raw = state.alloc(vk::ObjectType::DESCRIPTOR_POOL);
        state.descriptor_pools.insert(raw, (info.max_sets, 0));
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state();
        state.release(pool.as_raw(), vk::ObjectType::DESCRIPTOR_POOL);
        state.descriptor_pools.remove(&pool.as_raw());
        state.descriptor_sets.retain(|_, owner| *owner != pool.as_raw());
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()> {
        let mut state = self.state();
        if let Some((_, used)) = state.descriptor_pools.get_mut(&pool.as_raw()) {
            *used = 0;
        }
        state.descriptor_sets.retain(|_, owner| *owner != pool.as_raw());
        Ok(())
    }

    fn create_descriptor_set_layout(&self, _info: &vk::DescriptorSetLayoutCreateInfo) -> VulkanResult<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(self.state().alloc(vk::ObjectType::DESCRIPTOR_SET_LAYOUT)))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state().release(layout.as_raw(), vk::ObjectType::DESCRIPTOR_SET_LAYOUT);
    }

    fn allocate_descriptor_sets(&self, pool: vk::DescriptorPool, layouts: &[vk::DescriptorSetLayout]) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state();
        let count = u32::try_from(layouts.len()).map_err(|_| VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?;
        let Some((capacity, used)) = state.descriptor_pools.get_mut(&pool.as_raw()) else {
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        if *used + count > *capacity {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        *used += count;
        let sets: Vec<vk::DescriptorSet> =
            layouts.iter().map(|_| vk::DescriptorSet::from_raw(state.alloc(vk::ObjectType::UNKNOWN))).collect();
        for set in &sets {
            state.descriptor_sets.insert(set.as_raw(), pool.as_raw());
        }
        Ok(sets)
    }

    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
        let mut state = self.state();
        for set in sets {
            match state.descriptor_sets.remove(&set.as_raw()) {
                Some(owner) if owner == pool.as_raw() => {
                    if let Some((_, used)) = state.descriptor_pools.get_mut(&owner) {
                        *used = used.saturating_sub(1);
                    }
                }
                Some(_) => state.violations.push(format!("free of {set:?} through a pool that did not allocate it")),
                None => state.violations.push(format!("free of unknown descriptor set {set:?}")),
            }
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, _writes: &[vk::WriteDescriptorSet]) {}

    fn create_shader_module(&self, code: &[u32]) -> VulkanResult<vk::ShaderModule> {
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(VulkanError::Api(vk::Result::ERROR_INVALID_SHADER_NV));
        }
        Ok(vk::ShaderModule::from_raw(self.state().alloc(vk::ObjectType::SHADER_MODULE)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state().release(module.as_raw(), vk::ObjectType::SHADER_MODULE);
    }

    fn create_pipeline_layout(&self, _info: &vk::PipelineLayoutCreateInfo) -> VulkanResult<vk::PipelineLayout> {
        Ok(vk::PipelineLayout::from_raw(self.state().alloc(vk::ObjectType::PIPELINE_LAYOUT)))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state().release(layout.as_raw(), vk::ObjectType::PIPELINE_LAYOUT);
    }

    fn create_graphics_pipeline(&self, _info: &vk::GraphicsPipelineCreateInfo) -> VulkanResult<vk::Pipeline> {
        Ok(vk::Pipeline::from_raw(self.state().alloc(vk::ObjectType::PIPELINE)))
    }

    fn create_compute_pipeline(&self, _info: &vk::ComputePipelineCreateInfo) -> VulkanResult<vk::Pipeline> {
        Ok(vk::Pipeline::from_raw(self.state().alloc(vk::ObjectType::PIPELINE)))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state().release(pipeline.as_raw(), vk::ObjectType::PIPELINE);
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> VulkanResult<SwapchainImages> {
        let mut state = self.state();
        let extent = state.surface_extent.unwrap_or(request.extent);
        let raw = state.alloc(vk::ObjectType::SWAPCHAIN_KHR);
        let count = state.swapchain_image_count;
        let images: Vec<vk::Image> = (0..count).map(|_| vk::Image::from_raw(state.alloc(vk::ObjectType::UNKNOWN))).collect();
        state.swapchain_images.clone_from(&images);
        state.next_image = 0;
        state.calls.push(Call::CreateSwapchain { width: extent.width, height: extent.height });
        Ok(SwapchainImages {
            handle: vk::SwapchainKHR::from_raw(raw),
            images,
            format: vk::Format::B8G8R8A8_SRGB,
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state().release(swapchain.as_raw(), vk::ObjectType::SWAPCHAIN_KHR);
    }

    fn acquire_next_image(&self, _swapchain: vk::SwapchainKHR, _timeout: u64, semaphore: vk::Semaphore) -> VulkanResult<AcquireOutcome> {
        let mut state = self.state();
        state.calls.push(Call::Acquire { semaphore });
        if let Some(outcome) = state.acquire_script.pop_front() {
            if matches!(outcome, AcquireOutcome::Acquired { .. }) {
                state.signal(semaphore);
            }
            return Ok(outcome);
        }
        let count = u32::try_from(state.swapchain_images.len().max(1)).unwrap_or(1);
        let index = state.next_image % count;
        state.next_image = state.next_image.wrapping_add(1);
        state.signal(semaphore);
        Ok(AcquireOutcome::Acquired { index, suboptimal: false })
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VulkanResult<PresentOutcome> {
        let mut state = self.state();
        for semaphore in wait_semaphores {
            state.consume_wait(*semaphore);
        }
        state.calls.push(Call::Present { image_index, waits: wait_semaphores.to_vec() });
        Ok(state.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }
}
