//! Device-facing API shared by the render graph and the resource layer

mod context;
mod device;
mod error;

pub use context::RenderContext;
pub use device::{
    AcquireOutcome, DeviceLimits, GpuDevice, MemoryAllocation, PresentOutcome, RenderPassBegin,
    SubmitDescription, SwapchainImages, SwapchainRequest,
};
pub use error::{check_result, VulkanError, VulkanResult};
