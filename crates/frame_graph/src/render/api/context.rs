//! Device context shared by every renderer component
//!
//! Owns the device handle together with the centralized allocators (command
//! pools, descriptor pools) and the resize pools. Created once at renderer
//! start-up and handed to components as `Arc<RenderContext>`; nothing in the
//! crate reaches for global state.

use std::sync::Arc;

use crate::render::commands::CommandPoolManager;
use crate::render::pools::{FrameBufferPool, ImagePool};
use crate::render::resources::DescriptorPoolManager;

use super::{DeviceLimits, GpuDevice, VulkanResult};

/// Explicitly constructed device context
pub struct RenderContext {
    device: Arc<dyn GpuDevice>,
    limits: DeviceLimits,
    command_pools: CommandPoolManager,
    descriptor_pools: DescriptorPoolManager,
    framebuffer_pool: FrameBufferPool,
    image_pool: ImagePool,
}

impl RenderContext {
    /// Build a context around a device
    pub fn new(device: Arc<dyn GpuDevice>) -> VulkanResult<Arc<Self>> {
        let limits = device.limits();
        log::debug!(
            "Creating render context (min UBO alignment {}, atom size {})",
            limits.min_uniform_buffer_offset_alignment,
            limits.non_coherent_atom_size
        );

        let command_pools = CommandPoolManager::new(Arc::clone(&device));
        let descriptor_pools = DescriptorPoolManager::new(Arc::clone(&device))?;

        Ok(Arc::new(Self {
            device,
            limits,
            command_pools,
            descriptor_pools,
            framebuffer_pool: FrameBufferPool::new(),
            image_pool: ImagePool::new(),
        }))
    }

    /// Device handle
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Cached device limits
    pub const fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Per-thread command pools
    pub const fn command_pools(&self) -> &CommandPoolManager {
        &self.command_pools
    }

    /// Descriptor pools
    pub const fn descriptor_pools(&self) -> &DescriptorPoolManager {
        &self.descriptor_pools
    }

    /// Swapchain-relative framebuffers
    pub const fn framebuffer_pool(&self) -> &FrameBufferPool {
        &self.framebuffer_pool
    }

    /// Swapchain-relative images
    pub const fn image_pool(&self) -> &ImagePool {
        &self.image_pool
    }

    /// Wait for the device and the graphics queue to go idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.device.wait_idle()?;
        self.device.queue_wait_idle(self.device.graphics_queue())
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("limits", &self.limits)
            .field("pooled_framebuffers", &self.framebuffer_pool.len())
            .field("pooled_images", &self.image_pool.len())
            .finish_non_exhaustive()
    }
}
