//! Resize pools
//!
//! Registries of swapchain-relative framebuffers and images. Entries hold
//! weak references: dropping a resource removes it from resizing even if it
//! never deregistered explicitly. Pool keys are generational, so a stale key
//! held by a resource that was removed by name cannot remove a newer entry.
//!
//! Resizing destroys and recreates GPU objects in place. Callers must have
//! waited for the device to go idle first.

mod framebuffer_pool;
mod image_pool;

pub use framebuffer_pool::FrameBufferPool;
pub use image_pool::{ImagePool, ImageResizeCallback};

slotmap::new_key_type! {
    /// Key of a framebuffer pool entry
    pub struct FramebufferPoolKey;
    /// Key of an image pool entry
    pub struct ImagePoolKey;
}

/// Pool lookup errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No entry with the given name
    #[error("No pool entry named '{0}'")]
    NotFound(String),
}
