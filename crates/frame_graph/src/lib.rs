//! # Frame Graph
//!
//! A Vulkan render graph with frame-in-flight synchronization and resizable
//! resource pools.
//!
//! ## Features
//!
//! - **Render graph**: named passes with read dependencies, executed in a stable topological order
//! - **Frame pacing**: per-frame fences and semaphores, N frames in flight
//! - **Resize pools**: swapchain-relative framebuffers and images rebuilt on window resize
//! - **Hot reload**: pipelines rebuilt when their SPIR-V files change
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use frame_graph::prelude::*;
//!
//! fn run<W>(window: &W) -> Result<(), RenderError>
//! where
//!     W: raw_window_handle::HasRawWindowHandle + raw_window_handle::HasRawDisplayHandle,
//! {
//!     frame_graph::foundation::logging::init();
//!     let mut renderer = Renderer::new(window, &RendererConfig::new("Demo"))?;
//!     renderer.set_pipeline(Box::new(ClearPipeline::new([0.1, 0.1, 0.2, 1.0])))?;
//!     loop {
//!         renderer.draw()?;
//!     }
//! }
//! ```

#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod render;
pub mod threading;

/// Common imports for renderer users
pub mod prelude {
    pub use crate::{
        config::{Config, RendererConfig, RendererSettings},
        render::{
            ClearPipeline, PassContext, PipelineSetup, RenderContext, RenderError, RenderGraph, RenderGraphError,
            RenderPassNode, RenderPipeline, RenderResult, Renderer, Swapchain, SwapchainPass,
        },
        threading::ThreadManager,
    };
}
