//! Render graph: passes, their dependencies and per-frame execution
//!
//! # Architecture
//!
//! ```text
//! Shadow  ──┐
//!           ├──> Lighting ──> SwapchainPass ──> present
//! GBuffer ──┘
//! ```
//!
//! A [`RenderPassNode`] owns one command buffer per frame slot, the
//! framebuffers it draws into, an optional pipeline and a fence. Reading
//! another pass's output is declared by name with
//! [`RenderPassNode::add_read_dependency`]; the producer then owns one binary
//! semaphore per consumer, so fan-out never waits twice on a semaphore.
//!
//! [`RenderGraph`] keeps passes in registration order and derives a stable
//! topological execution order from their dependencies. Every arrow above is
//! a semaphore wait; the swapchain pass also waits on the acquired image.
//! Each `update` waits for the frame slot, acquires an image, runs every
//! enabled pass, then hands the frame to the [`SwapchainPass`] for the final
//! submit and present. A failed frame is released through the swapchain so
//! the next update starts from a clean slot.
//!
//! Errors surface as [`RenderGraphError`]; configuration mistakes leave the
//! graph unchanged.

mod pass;
#[allow(clippy::module_inception)]
mod render_graph;
mod swapchain_pass;

use thiserror::Error;

use crate::render::api::VulkanError;

pub use pass::{PassContext, PassExecuteFn, PassStats, RenderPassNode};
pub use render_graph::RenderGraph;
pub use swapchain_pass::{SwapchainPass, SWAPCHAIN_PASS_NAME};

/// Graph configuration and execution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderGraphError {
    /// A pass with this name is already registered
    #[error("Render pass '{0}' already exists")]
    DuplicateName(String),

    /// No pass with this name is registered
    #[error("Render pass '{0}' not found")]
    NotFound(String),

    /// The edge would make a pass depend on itself
    #[error("Dependency of '{consumer}' on '{producer}' would create a cycle")]
    DependencyCycle {
        /// Reading pass
        consumer: String,
        /// Pass being read
        producer: String,
    },

    /// `update` was called before a swapchain pass was set
    #[error("No swapchain pass set")]
    MissingSwapchainPass,

    /// Device failure while executing the graph
    #[error(transparent)]
    Vulkan(#[from] VulkanError),
}
