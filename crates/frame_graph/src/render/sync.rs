//! Synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for fences and binary semaphores. Fences let the CPU observe
//! completion of a submission (frames in flight, pass reuse); semaphores order
//! submissions against each other on the GPU (pass dependencies, image
//! acquisition and presentation).
//!
//! ```text
//! Pass A: [Work] -> signal semaphore ->
//! Pass B:           wait semaphore   -> [Work] -> signal fence -> CPU may reuse B
//! ```

use std::sync::Arc;

use ash::vk;

use crate::render::api::{GpuDevice, VulkanResult};

/// Binary semaphore destroyed on drop
pub struct Semaphore {
    device: Arc<dyn GpuDevice>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(device: Arc<dyn GpuDevice>) -> VulkanResult<Self> {
        let semaphore = device.create_semaphore()?;
        Ok(Self { device, semaphore })
    }

    /// Get semaphore handle
    pub const fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}

/// Fence destroyed on drop
pub struct Fence {
    device: Arc<dyn GpuDevice>,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Arc<dyn GpuDevice>, signaled: bool) -> VulkanResult<Self> {
        let fence = device.create_fence(signaled)?;
        Ok(Self { device, fence })
    }

    /// Wait for fence to be signaled
    pub fn wait(&self, timeout: u64) -> VulkanResult<()> {
        self.device.wait_for_fences(&[self.fence], timeout)
    }

    /// Reset fence to unsignaled state
    pub fn reset(&self) -> VulkanResult<()> {
        self.device.reset_fences(&[self.fence])
    }

    /// Get fence handle
    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.fence).finish()
    }
}
