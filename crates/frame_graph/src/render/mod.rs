//! # Rendering
//!
//! Render graph and frame execution over Vulkan.
//!
//! ## Architecture
//!
//! - **api**: the [`GpuDevice`](api::GpuDevice) seam every device call goes through, plus [`RenderContext`](api::RenderContext)
//! - **backends**: the ash-based device used on real hardware
//! - **resources / pools**: RAII GPU objects and the registries that resize them with the swapchain
//! - **graph**: passes, their dependencies and per-frame submission
//! - **renderer**: the façade applications drive once per frame

pub mod api;

/// Graphics backend implementations
pub mod backends;

pub mod commands;
pub mod graph;
pub mod pipeline;
pub mod pools;
pub mod resources;
pub mod swapchain;
pub mod sync;

mod renderer;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

use crate::config::ConfigError;

pub use api::{RenderContext, VulkanError, VulkanResult};
pub use graph::{PassContext, RenderGraph, RenderGraphError, RenderPassNode, SwapchainPass};
pub use pools::PoolError;
pub use renderer::{ClearPipeline, PipelineSetup, RenderPipeline, Renderer};
pub use swapchain::Swapchain;

/// Errors surfaced by the renderer façade
#[derive(Error, Debug)]
pub enum RenderError {
    /// Device or driver failure
    #[error(transparent)]
    Vulkan(#[from] VulkanError),

    /// Invalid graph configuration or failed frame
    #[error(transparent)]
    Graph(#[from] RenderGraphError),

    /// Resize pool lookup failed
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Settings file could not be read or written
    #[error("Settings error: {0}")]
    Config(#[from] ConfigError),

    /// Configuration values out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for renderer operations
pub type RenderResult<T> = Result<T, RenderError>;
