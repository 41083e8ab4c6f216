//! Final pass rendering into the acquired swapchain image
//!
//! The swapchain pass is the last submission of every frame. It owns one
//! framebuffer per swapchain image, built from the image's view plus any extra
//! owned attachments such as depth, and rebuilds them whenever the swapchain
//! generation changes. Command buffers are allocated lazily, one per frame
//! slot.
//!
//! Its submit waits on the frame slot's image-available semaphore and on one
//! semaphore per producer it reads, signals the image's render-finished
//! semaphore for the present, and carries the slot's in-flight fence.

use std::sync::{Arc, PoisonError};
use std::time::Instant;

use ash::vk;

use crate::render::api::{RenderContext, VulkanError, VulkanResult};
use crate::render::commands::CommandBuffer;
use crate::render::pipeline::SharedPipeline;
use crate::render::resources::{Framebuffer, FramebufferAttachment, FramebufferDescription, ImageDescription};
use crate::render::swapchain::Swapchain;

use super::pass::{PassContext, PassExecuteFn, PassStats};
use super::{RenderGraph, RenderGraphError};

/// Name producers use for the swapchain pass in their dependents
pub const SWAPCHAIN_PASS_NAME: &str = "Swapchain";

/// Presentation pass with one framebuffer per swapchain image
///
/// Dependencies declared here are wired into the producers when the pass is
/// installed with [`RenderGraph::set_swapchain`].
pub struct SwapchainPass {
    ctx: Arc<RenderContext>,
    pipeline: SharedPipeline,
    execute: PassExecuteFn,
    clear_values: Vec<vk::ClearValue>,
    extra_attachments: Vec<ImageDescription>,
    framebuffers: Vec<Framebuffer>,
    command_buffers: Vec<CommandBuffer>,
    read_dependencies: Vec<String>,
    generation: Option<u64>,
    stats: PassStats,
}

impl SwapchainPass {
    /// Pass rendering with `pipeline`, whose render pass targets the swapchain format
    pub fn new(
        ctx: &Arc<RenderContext>,
        pipeline: SharedPipeline,
        execute: PassExecuteFn,
        clear_values: Vec<vk::ClearValue>,
    ) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            pipeline,
            execute,
            clear_values,
            extra_attachments: Vec::new(),
            framebuffers: Vec::new(),
            command_buffers: Vec::new(),
            read_dependencies: Vec::new(),
            generation: None,
            stats: PassStats::default(),
        }
    }

    /// Add an owned attachment after the swapchain image, such as depth
    #[must_use]
    pub fn with_attachment(mut self, desc: ImageDescription) -> Self {
        self.extra_attachments.push(desc);
        self
    }

    /// Declare a producer read by the presentation pass
    pub fn add_read_dependency(&mut self, graph: &RenderGraph, name: &str) -> Result<(), RenderGraphError> {
        if graph.find_render_graph_pass(name).is_none() {
            log::error!("Swapchain pass depends on unknown pass '{name}'");
            return Err(RenderGraphError::NotFound(name.to_string()));
        }
        if !self.read_dependencies.iter().any(|dep| dep == name) {
            self.read_dependencies.push(name.to_string());
        }
        Ok(())
    }

    pub(crate) fn push_read_dependency(&mut self, producer: &str) {
        self.read_dependencies.push(producer.to_string());
    }

    pub(crate) fn remove_read_dependency(&mut self, producer: &str) {
        self.read_dependencies.retain(|dep| dep != producer);
    }

    /// Rebuild framebuffers when the swapchain was recreated
    pub(crate) fn prepare(&mut self, swapchain: &Swapchain) -> VulkanResult<()> {
        while self.command_buffers.len() < swapchain.frames_in_flight() {
            self.command_buffers.push(CommandBuffer::new(&self.ctx)?);
        }
        if self.generation == Some(swapchain.generation()) {
            return Ok(());
        }

        let render_pass = self.pipeline.read().unwrap_or_else(PoisonError::into_inner).render_pass();
        if render_pass == vk::RenderPass::null() {
            return Err(VulkanError::invalid("Swapchain pass pipeline has no render pass"));
        }
        let extent = swapchain.extent();
        self.framebuffers.clear();
        for (i, view) in swapchain.image_views().iter().enumerate() {
            let attachments = std::iter::once(FramebufferAttachment::View(*view))
                .chain(self.extra_attachments.iter().cloned().map(FramebufferAttachment::Owned))
                .collect();
            self.framebuffers.push(Framebuffer::new(
                &self.ctx,
                FramebufferDescription {
                    debug_name: format!("{SWAPCHAIN_PASS_NAME} {i}"),
                    render_pass,
                    width: extent.width,
                    height: extent.height,
                    attachments,
                    ..FramebufferDescription::default()
                },
            )?);
        }
        self.generation = Some(swapchain.generation());
        log::debug!("Swapchain pass targets rebuilt ({} framebuffers)", self.framebuffers.len());
        Ok(())
    }

    /// Record and submit into swapchain image `image`
    pub(crate) fn execute(
        &mut self,
        swapchain: &Swapchain,
        frame: usize,
        image: u32,
        waits: &[vk::Semaphore],
    ) -> VulkanResult<()> {
        let index = usize::try_from(image).map_err(|_| VulkanError::invalid("Swapchain image index overflow"))?;
        let framebuffer = self
            .framebuffers
            .get(index)
            .ok_or_else(|| VulkanError::invalid(format!("No framebuffer for swapchain image {image}")))?;
        let slot = frame % self.command_buffers.len().max(1);
        let Some(cmd) = self.command_buffers.get_mut(slot) else {
            return Err(VulkanError::invalid("Swapchain pass has no command buffers"));
        };

        let started = Instant::now();
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        let recorded = {
            let pipeline = self.pipeline.read().unwrap_or_else(PoisonError::into_inner);
            let area = vk::Rect2D { offset: vk::Offset2D::default(), extent: framebuffer.extent() };
            cmd.begin_label(SWAPCHAIN_PASS_NAME);
            let recorded = cmd
                .begin_render_pass(pipeline.render_pass(), framebuffer.handle(), area, &self.clear_values)
                .map(|active| {
                    if pipeline.handle() != vk::Pipeline::null() {
                        active.bind_pipeline(pipeline.bind_point(), pipeline.handle());
                        active.set_viewport_and_scissor(area);
                    }
                    (self.execute)(&PassContext {
                        command_buffer: &*active,
                        frame_index: frame,
                        framebuffer_index: index,
                        render_area: area,
                        pipeline: Some(&*pipeline),
                    });
                });
            cmd.end_label();
            recorded
        };
        if let Err(e) = recorded {
            cmd.abandon();
            log::error!("Recording the swapchain pass failed: {e}");
            return Err(e);
        }
        cmd.end()?;
        self.stats.last_record_time = started.elapsed();

        let mut all_waits = Vec::with_capacity(waits.len() + 1);
        all_waits.push(swapchain.image_available_semaphore(frame)?);
        all_waits.extend_from_slice(waits);
        let stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; all_waits.len()];
        let signal = [swapchain.render_finished_semaphore(image)?];
        cmd.submit(
            self.ctx.device().graphics_queue(),
            &all_waits,
            &stages,
            &signal,
            swapchain.in_flight_fence(frame)?.handle(),
        )?;
        self.stats.executions += 1;
        Ok(())
    }

    /// Declared producers
    pub fn read_dependencies(&self) -> &[String] {
        &self.read_dependencies
    }

    /// Command buffer handle of a frame slot
    pub fn command_buffer(&self, slot: usize) -> Option<vk::CommandBuffer> {
        self.command_buffers.get(slot).map(CommandBuffer::handle)
    }

    /// Framebuffers, one per swapchain image
    pub fn framebuffers(&self) -> &[Framebuffer] {
        &self.framebuffers
    }

    /// Counters
    pub const fn stats(&self) -> &PassStats {
        &self.stats
    }
}

impl std::fmt::Debug for SwapchainPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapchainPass")
            .field("reads", &self.read_dependencies)
            .field("framebuffers", &self.framebuffers.len())
            .finish_non_exhaustive()
    }
}
