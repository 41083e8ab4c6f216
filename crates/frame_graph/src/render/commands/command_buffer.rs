//! Command buffer recording
//!
//! Thin recording wrapper over a primary command buffer taken from the
//! per-thread pools of the [`RenderContext`]. Render passes are scoped by the
//! [`ActiveRenderPass`] guard, which ends the pass when dropped.

use std::ops::Deref;
use std::sync::Arc;

use ash::vk;

use crate::render::api::{RenderContext, RenderPassBegin, SubmitDescription, VulkanError, VulkanResult};
use crate::render::sync::Fence;

/// Primary command buffer returned to its pool on drop
pub struct CommandBuffer {
    ctx: Arc<RenderContext>,
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    queue_family: u32,
    recording: bool,
}

impl CommandBuffer {
    /// Allocate a single command buffer for the calling thread
    pub fn new(ctx: &Arc<RenderContext>) -> VulkanResult<Self> {
        Self::allocate(ctx, 1)?
            .pop()
            .ok_or_else(|| VulkanError::invalid("command pool returned no buffers"))
    }

    /// Allocate `count` command buffers for the calling thread, submittable to the graphics queue
    pub fn allocate(ctx: &Arc<RenderContext>, count: usize) -> VulkanResult<Vec<Self>> {
        Self::allocate_in_family(ctx, ctx.device().graphics_queue_family(), count)
    }

    /// Allocate `count` command buffers submittable to `queue`
    pub fn allocate_for_queue(ctx: &Arc<RenderContext>, queue: vk::Queue, count: usize) -> VulkanResult<Vec<Self>> {
        let family = ctx
            .device()
            .queue_family(queue)
            .ok_or_else(|| VulkanError::invalid(format!("Queue {queue:?} does not belong to this device")))?;
        Self::allocate_in_family(ctx, family, count)
    }

    fn allocate_in_family(ctx: &Arc<RenderContext>, queue_family: u32, count: usize) -> VulkanResult<Vec<Self>> {
        let (pool, handles) = ctx.command_pools().allocate(queue_family, count)?;
        Ok(handles
            .into_iter()
            .map(|handle| Self { ctx: Arc::clone(ctx), handle, pool, queue_family, recording: false })
            .collect())
    }

    /// Record, submit and wait for a single-use command buffer
    pub fn one_shot<F>(ctx: &Arc<RenderContext>, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&Self) -> VulkanResult<()>,
    {
        let mut cmd = Self::new(ctx)?;
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record(&cmd)?;
        cmd.end()?;

        let fence = Fence::new(Arc::clone(ctx.device()), false)?;
        cmd.submit(ctx.device().graphics_queue(), &[], &[], &[], fence.handle())?;
        fence.wait(u64::MAX)
    }

    /// Raw handle
    pub const fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Whether `begin` was called without a matching `end`
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    /// Queue family the buffer may be submitted to
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Begin recording; resets previous contents
    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> VulkanResult<()> {
        if self.recording {
            return Err(VulkanError::invalid("Command buffer already recording"));
        }
        self.ctx.device().begin_command_buffer(self.handle, flags)?;
        self.recording = true;
        Ok(())
    }

    /// End recording
    pub fn end(&mut self) -> VulkanResult<()> {
        if !self.recording {
            return Err(VulkanError::invalid("Command buffer not recording"));
        }
        self.ctx.device().end_command_buffer(self.handle)?;
        self.recording = false;
        Ok(())
    }

    /// Close a recording that failed part way; the contents are discarded at the next `begin`
    pub fn abandon(&mut self) {
        if !self.recording {
            return;
        }
        if let Err(e) = self.ctx.device().end_command_buffer(self.handle) {
            log::warn!("Ending abandoned command buffer {:?} failed: {e}", self.handle);
        }
        self.recording = false;
    }

    /// Begin a render pass; it ends when the returned guard is dropped
    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) -> VulkanResult<ActiveRenderPass<'_>> {
        if !self.recording {
            return Err(VulkanError::invalid("Command buffer not recording"));
        }
        self.ctx.device().cmd_begin_render_pass(
            self.handle,
            &RenderPassBegin { render_pass, framebuffer, render_area, clear_values },
        );
        Ok(ActiveRenderPass { recorder: self })
    }

    /// Bind a pipeline
    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.ctx.device().cmd_bind_pipeline(self.handle, bind_point, pipeline);
    }

    /// Bind descriptor sets starting at `first_set`
    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.ctx.device().cmd_bind_descriptor_sets(self.handle, bind_point, layout, first_set, sets);
    }

    /// Push raw constant bytes
    pub fn push_constants(&self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        self.ctx.device().cmd_push_constants(self.handle, layout, stages, offset, data);
    }

    /// Push a plain-old-data value as constants
    pub fn push_constants_pod<T: bytemuck::Pod>(&self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, value: &T) {
        self.push_constants(layout, stages, 0, bytemuck::bytes_of(value));
    }

    /// Bind vertex buffers
    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        self.ctx.device().cmd_bind_vertex_buffers(self.handle, first_binding, buffers, offsets);
    }

    /// Bind index buffer
    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        self.ctx.device().cmd_bind_index_buffer(self.handle, buffer, offset, index_type);
    }

    /// Set viewport
    pub fn set_viewport(&self, viewport: vk::Viewport) {
        self.ctx.device().cmd_set_viewport(self.handle, viewport);
    }

    /// Set scissor
    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        self.ctx.device().cmd_set_scissor(self.handle, scissor);
    }

    /// Cover `area` with both viewport and scissor
    #[allow(clippy::cast_precision_loss)]
    pub fn set_viewport_and_scissor(&self, area: vk::Rect2D) {
        self.set_viewport(vk::Viewport {
            x: area.offset.x as f32,
            y: area.offset.y as f32,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        self.set_scissor(area);
    }

    /// Draw
    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.ctx.device().cmd_draw(self.handle, vertex_count, instance_count, first_vertex, first_instance);
    }

    /// Draw indexed
    pub fn draw_indexed(&self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        self.ctx
            .device()
            .cmd_draw_indexed(self.handle, index_count, instance_count, first_index, vertex_offset, first_instance);
    }

    /// Dispatch compute work groups
    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        self.ctx.device().cmd_dispatch(self.handle, x, y, z);
    }

    /// Record image barriers
    pub fn pipeline_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        self.ctx.device().cmd_pipeline_barrier(self.handle, src_stage, dst_stage, image_barriers);
    }

    /// Copy between buffers
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.ctx.device().cmd_copy_buffer(self.handle, src, dst, regions);
    }

    /// Copy a buffer into an image in `dst_layout`
    pub fn copy_buffer_to_image(&self, src: vk::Buffer, dst: vk::Image, dst_layout: vk::ImageLayout, regions: &[vk::BufferImageCopy]) {
        self.ctx.device().cmd_copy_buffer_to_image(self.handle, src, dst, dst_layout, regions);
    }

    /// Open a named debug region
    pub fn begin_label(&self, name: &str) {
        self.ctx.device().cmd_begin_label(self.handle, name);
    }

    /// Close the innermost debug region
    pub fn end_label(&self) {
        self.ctx.device().cmd_end_label(self.handle);
    }

    /// Submit this buffer to `queue`
    ///
    /// `wait_stages` must have one entry per wait semaphore.
    pub fn submit(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VulkanResult<()> {
        if self.recording {
            return Err(VulkanError::invalid("Cannot submit a command buffer that is still recording"));
        }
        if wait_semaphores.len() != wait_stages.len() {
            return Err(VulkanError::invalid("Each wait semaphore needs a wait stage"));
        }
        let command_buffers = [self.handle];
        self.ctx.device().queue_submit(
            queue,
            &SubmitDescription { wait_semaphores, wait_stages, command_buffers: &command_buffers, signal_semaphores },
            fence,
        )
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.recording {
            log::warn!("Command buffer {:?} dropped while recording", self.handle);
            self.abandon();
        }
        self.ctx.command_pools().release(self.pool, self.handle);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("recording", &self.recording)
            .finish_non_exhaustive()
    }
}

/// Render pass scope; ends the pass on drop
pub struct ActiveRenderPass<'a> {
    recorder: &'a CommandBuffer,
}

impl Deref for ActiveRenderPass<'_> {
    type Target = CommandBuffer;

    fn deref(&self) -> &CommandBuffer {
        self.recorder
    }
}

impl Drop for ActiveRenderPass<'_> {
    fn drop(&mut self) {
        self.recorder.ctx.device().cmd_end_render_pass(self.recorder.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::testing::{Call, MockDevice};

    fn context() -> (Arc<MockDevice>, Arc<RenderContext>) {
        let mock = MockDevice::new();
        let ctx = RenderContext::new(mock.clone()).expect("context");
        (mock, ctx)
    }

    #[test]
    fn test_render_pass_guard_ends_pass() {
        let (mock, ctx) = context();
        let mut cmd = CommandBuffer::new(&ctx).expect("command buffer");
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).expect("begin");
        {
            let pass = cmd
                .begin_render_pass(vk::RenderPass::null(), vk::Framebuffer::null(), vk::Rect2D::default(), &[])
                .expect("render pass");
            pass.draw(3, 1, 0, 0);
        }
        cmd.end().expect("end");

        let calls = mock.calls();
        let draw = calls.iter().position(|c| matches!(c, Call::Draw(_))).expect("draw");
        let end_pass = calls.iter().position(|c| matches!(c, Call::EndRenderPass(_))).expect("end pass");
        assert!(draw < end_pass);
        mock.assert_no_violations();
    }

    #[test]
    fn test_recording_state_errors() {
        let (_mock, ctx) = context();
        let mut cmd = CommandBuffer::new(&ctx).expect("command buffer");
        assert!(cmd.end().is_err());
        assert!(cmd
            .begin_render_pass(vk::RenderPass::null(), vk::Framebuffer::null(), vk::Rect2D::default(), &[])
            .is_err());

        cmd.begin(vk::CommandBufferUsageFlags::empty()).expect("begin");
        assert!(cmd.begin(vk::CommandBufferUsageFlags::empty()).is_err());
        assert!(cmd.submit(vk::Queue::null(), &[], &[], &[], vk::Fence::null()).is_err());
        cmd.end().expect("end");
    }

    #[test]
    fn test_abandon_allows_next_begin() {
        let (mock, ctx) = context();
        let mut cmd = CommandBuffer::new(&ctx).expect("command buffer");
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).expect("begin");
        cmd.abandon();
        assert!(!cmd.is_recording());
        cmd.abandon();

        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).expect("begin again");
        cmd.end().expect("end");
        assert_eq!(mock.begin_count(cmd.handle()), 2);
        mock.assert_no_violations();
    }

    #[test]
    fn test_buffers_follow_their_queue_family() {
        let (mock, ctx) = context();
        mock.set_compute_family(1);
        let graphics = CommandBuffer::new(&ctx).expect("graphics");
        let compute = CommandBuffer::allocate_for_queue(&ctx, ctx.device().compute_queue(), 1).expect("compute");
        assert_eq!(graphics.queue_family(), 0);
        assert_eq!(compute[0].queue_family(), 1);
        assert_eq!(ctx.command_pools().pool_count(), 2);
        assert!(CommandBuffer::allocate_for_queue(&ctx, vk::Queue::null(), 1).is_err());
    }

    #[test]
    fn test_one_shot_waits_for_completion() {
        let (mock, ctx) = context();
        CommandBuffer::one_shot(&ctx, |cmd| {
            cmd.dispatch(1, 1, 1);
            Ok(())
        })
        .expect("one shot");

        assert_eq!(mock.submissions().len(), 1);
        assert!(mock.calls().iter().any(|c| matches!(c, Call::WaitFences(_))));
        assert_eq!(ctx.command_pools().in_use(), 0);
        mock.assert_no_violations();
    }
}
