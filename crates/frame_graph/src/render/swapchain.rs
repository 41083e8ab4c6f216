//! Swapchain and per-frame presentation synchronization
//!
//! Holds the presentable images with their views, the N-deep per-frame
//! objects (image-available semaphores, in-flight fences) and the per-image
//! render-finished semaphores.
//!
//! # Frame slots and images
//!
//! Frame slots and swapchain images are counted separately. A frame slot `f`
//! owns `image_available[f]` and `in_flight[f]`; the fence is created
//! signaled so the first wait on a slot returns at once. Each image owns a
//! render-finished semaphore, since a present may still wait on it while
//! another slot renders. `images_in_flight` remembers which slot's fence last
//! used each image, so [`Swapchain::begin_frame`] can wait for an image that
//! is acquired again before its earlier frame finished.
//!
//! # Resizing
//!
//! The `resizing` flag is raised by the windowing layer, by a vsync change, by
//! an out-of-date or suboptimal acquire or present, and by an abandoned
//! frame. It is cleared by a successful [`Swapchain::recreate`], which hands
//! the old swapchain to the driver and bumps the generation so dependent
//! framebuffers know to rebuild. Recreation rebuilds the per-image objects;
//! the per-slot objects survive it.

use std::sync::Arc;

use ash::vk::{self, Handle};

use crate::render::api::{
    AcquireOutcome, PresentOutcome, RenderContext, SubmitDescription, SwapchainRequest, VulkanError, VulkanResult,
};
use crate::render::sync::{Fence, Semaphore};

/// Presentable images plus frame-in-flight synchronization
pub struct Swapchain {
    ctx: Arc<RenderContext>,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    vsync: bool,
    image_available: Vec<Semaphore>,
    render_finished: Vec<Semaphore>,
    in_flight: Vec<Fence>,
    images_in_flight: Vec<vk::Fence>,
    resizing: bool,
    requested_extent: vk::Extent2D,
    generation: u64,
}

impl Swapchain {
    /// Create the swapchain and `frames_in_flight` sets of frame objects
    pub fn new(ctx: &Arc<RenderContext>, extent: vk::Extent2D, vsync: bool, frames_in_flight: usize) -> VulkanResult<Self> {
        if frames_in_flight == 0 {
            return Err(VulkanError::invalid("At least one frame in flight is required"));
        }
        let device = ctx.device();
        let image_available = (0..frames_in_flight)
            .map(|_| Semaphore::new(Arc::clone(device)))
            .collect::<VulkanResult<Vec<_>>>()?;
        let in_flight = (0..frames_in_flight)
            .map(|_| Fence::new(Arc::clone(device), true))
            .collect::<VulkanResult<Vec<_>>>()?;

        let mut swapchain = Self {
            ctx: Arc::clone(ctx),
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent,
            vsync,
            image_available,
            render_finished: Vec::new(),
            in_flight,
            images_in_flight: Vec::new(),
            resizing: false,
            requested_extent: extent,
            generation: 0,
        };
        swapchain.build(extent)?;
        log::info!(
            "Created swapchain {}x{} ({} images, {} frames in flight, vsync {})",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            frames_in_flight,
            vsync
        );
        Ok(swapchain)
    }

    fn build(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        let old = self.handle;
        let created = self.ctx.device().create_swapchain(&SwapchainRequest { extent, vsync: self.vsync, old_swapchain: old })?;
        self.release_views();
        if old != vk::SwapchainKHR::null() {
            self.ctx.device().destroy_swapchain(old);
        }

        self.handle = created.handle;
        self.format = created.format;
        self.extent = created.extent;
        self.images = created.images;
        for (i, image) in self.images.iter().enumerate() {
            let info = vk::ImageViewCreateInfo::builder()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = self.ctx.device().create_image_view(&info)?;
            self.ctx.device().set_object_name(vk::ObjectType::IMAGE_VIEW, view.as_raw(), &format!("swapchain view {i}"));
            self.views.push(view);
        }

        // one render-finished semaphore per image: a present may still be waiting on it
        self.render_finished = (0..self.images.len())
            .map(|_| Semaphore::new(Arc::clone(self.ctx.device())))
            .collect::<VulkanResult<Vec<_>>>()?;
        self.images_in_flight = vec![vk::Fence::null(); self.images.len()];
        self.generation += 1;
        Ok(())
    }

    fn release_views(&mut self) {
        for view in self.views.drain(..) {
            self.ctx.device().destroy_image_view(view);
        }
    }

    /// Flag the swapchain for recreation at `extent` on the next update
    pub fn request_resize(&mut self, extent: vk::Extent2D) {
        log::debug!("Swapchain resize requested: {}x{}", extent.width, extent.height);
        self.requested_extent = extent;
        self.resizing = true;
    }

    /// Schedule a recreate, keeping the extent of a resize already pending
    fn schedule_recreate(&mut self) {
        let extent = if self.resizing { self.requested_extent } else { self.extent };
        self.request_resize(extent);
    }

    /// Whether a recreate is pending
    pub const fn is_resizing(&self) -> bool {
        self.resizing
    }

    /// Extent requested by the last resize
    pub const fn requested_extent(&self) -> vk::Extent2D {
        self.requested_extent
    }

    /// Recreate at the requested extent; the caller must have idled the device
    pub fn recreate(&mut self) -> VulkanResult<()> {
        let extent = self.requested_extent;
        self.build(extent)?;
        self.resizing = false;
        log::info!("Recreated swapchain at {}x{}", self.extent.width, self.extent.height);
        Ok(())
    }

    /// Block until frame slot `frame` is free for recording
    pub fn wait_for_frame(&self, frame: usize) -> VulkanResult<()> {
        self.in_flight_fence(frame)?.wait(u64::MAX)
    }

    /// Acquire the next image for frame slot `frame`
    pub fn acquire(&self, frame: usize) -> VulkanResult<AcquireOutcome> {
        let semaphore = self.image_available_semaphore(frame)?;
        match self.ctx.device().acquire_next_image(self.handle, u64::MAX, semaphore) {
            Err(e) if e.is_out_of_date() => Ok(AcquireOutcome::OutOfDate),
            other => other,
        }
    }

    /// Wait for any earlier frame still using `image`, claim it for `frame`
    /// and reset the frame's fence for the coming submission
    pub fn begin_frame(&mut self, frame: usize, image: u32) -> VulkanResult<()> {
        let frame_fence = self.in_flight_fence(frame)?.handle();
        let slot = usize::try_from(image).map_err(|_| VulkanError::invalid("image index overflow"))?;
        let Some(previous) = self.images_in_flight.get_mut(slot) else {
            return Err(VulkanError::invalid(format!("Swapchain image {image} out of range")));
        };
        if *previous != vk::Fence::null() && *previous != frame_fence {
            self.ctx.device().wait_for_fences(&[*previous], u64::MAX)?;
        }
        *previous = frame_fence;
        self.ctx.device().reset_fences(&[frame_fence])
    }

    /// Present `image`; flags a resize when the swapchain no longer matches
    pub fn present(&mut self, image: u32) -> VulkanResult<PresentOutcome> {
        let wait = [self.render_finished_semaphore(image)?];
        let outcome = match self.ctx.device().queue_present(self.ctx.device().graphics_queue(), self.handle, image, &wait) {
            Err(e) if e.is_out_of_date() => PresentOutcome::OutOfDate,
            other => other?,
        };
        if outcome.needs_recreate() {
            log::warn!("Swapchain present reported {outcome:?}; recreating next frame");
            self.schedule_recreate();
        }
        Ok(outcome)
    }

    /// Release frame slot `frame` after its frame failed part way
    ///
    /// Submits an empty batch that waits on `pending`, the semaphores the
    /// frame signaled without a consumer, and signals the slot's fence unless
    /// `fence_submitted` says a successful submit already carries it. A
    /// recreate is scheduled so the acquired image is dropped with the old
    /// swapchain instead of being presented.
    pub fn abandon_frame(&mut self, frame: usize, pending: &[vk::Semaphore], fence_submitted: bool) -> VulkanResult<()> {
        self.schedule_recreate();
        if fence_submitted {
            return Ok(());
        }

        let fence = self.in_flight_fence(frame)?;
        fence.reset()?;
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; pending.len()];
        self.ctx.device().queue_submit(
            self.ctx.device().graphics_queue(),
            &SubmitDescription { wait_semaphores: pending, wait_stages: &wait_stages, command_buffers: &[], signal_semaphores: &[] },
            fence.handle(),
        )?;
        log::warn!("Abandoned frame slot {frame} ({} semaphores released)", pending.len());
        Ok(())
    }

    /// In-flight fence of a frame slot
    pub fn in_flight_fence(&self, frame: usize) -> VulkanResult<&Fence> {
        self.in_flight.get(frame).ok_or_else(|| VulkanError::invalid(format!("Frame slot {frame} out of range")))
    }

    /// Image-available semaphore of a frame slot
    pub fn image_available_semaphore(&self, frame: usize) -> VulkanResult<vk::Semaphore> {
        self.image_available
            .get(frame)
            .map(Semaphore::handle)
            .ok_or_else(|| VulkanError::invalid(format!("Frame slot {frame} out of range")))
    }

    /// Render-finished semaphore of a swapchain image
    pub fn render_finished_semaphore(&self, image: u32) -> VulkanResult<vk::Semaphore> {
        usize::try_from(image)
            .ok()
            .and_then(|i| self.render_finished.get(i))
            .map(Semaphore::handle)
            .ok_or_else(|| VulkanError::invalid(format!("Swapchain image {image} out of range")))
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Swapchain handle
    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    /// Current extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Image format
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Views of the presentable images
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.views
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Incremented on every (re)creation; views from an older generation are stale
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether vsync was requested
    pub const fn vsync(&self) -> bool {
        self.vsync
    }

    /// Change the present mode; takes effect at the next recreate
    pub fn set_vsync(&mut self, vsync: bool) {
        if self.vsync != vsync {
            self.vsync = vsync;
            self.schedule_recreate();
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.release_views();
        if self.handle != vk::SwapchainKHR::null() {
            self.ctx.device().destroy_swapchain(self.handle);
        }
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("extent", &(self.extent.width, self.extent.height))
            .field("images", &self.images.len())
            .field("resizing", &self.resizing)
            .finish_non_exhaustive()
    }
}
