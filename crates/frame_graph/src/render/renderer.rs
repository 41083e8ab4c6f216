//! Renderer façade
//!
//! Ties the device context, swapchain, pipeline cache and render graph
//! together and drives one graph update per [`Renderer::draw`]. What the
//! graph contains is decided by a [`RenderPipeline`]; [`ClearPipeline`] is
//! installed until the application sets its own.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use crate::config::{Config, RendererConfig, RendererSettings};
use crate::render::api::{GpuDevice, RenderContext};
use crate::render::backends::vulkan::VulkanDevice;
use crate::render::graph::{PassContext, RenderGraph, RenderGraphError, SwapchainPass};
use crate::render::pipeline::{AttachmentDescription, PipelineCache, PipelineDescription, RenderPassDescription};
use crate::render::swapchain::Swapchain;

use super::{RenderError, RenderResult};

/// What a [`RenderPipeline`] may touch while building its passes
pub struct PipelineSetup<'a> {
    /// Device context
    pub ctx: &'a Arc<RenderContext>,
    /// Empty graph to populate; it must end up with a swapchain pass
    pub graph: &'a mut RenderGraph,
    /// Presentation target, for formats and extents
    pub swapchain: &'a Swapchain,
    /// Shared pipeline cache
    pub pipelines: &'a PipelineCache,
    /// Current renderer settings
    pub settings: &'a RendererSettings,
}

/// Builds the passes of a render graph
pub trait RenderPipeline: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Register passes and the swapchain pass into `setup.graph`
    fn init(&mut self, setup: &mut PipelineSetup<'_>) -> RenderResult<()>;

    /// Called after the settings were changed through the renderer
    fn on_settings_changed(&mut self, _settings: &RendererSettings) {}
}

/// Default pipeline: clears the swapchain image and presents it
#[derive(Debug, Clone, Copy)]
pub struct ClearPipeline {
    color: [f32; 4],
}

impl ClearPipeline {
    /// Clear to `color`
    pub const fn new(color: [f32; 4]) -> Self {
        Self { color }
    }
}

impl Default for ClearPipeline {
    fn default() -> Self {
        Self::new([0.0, 0.0, 0.0, 1.0])
    }
}

impl RenderPipeline for ClearPipeline {
    fn name(&self) -> &str {
        "Clear"
    }

    fn init(&mut self, setup: &mut PipelineSetup<'_>) -> RenderResult<()> {
        let render_pass = RenderPassDescription {
            color_attachments: vec![AttachmentDescription::color(
                setup.swapchain.format(),
                vk::ImageLayout::PRESENT_SRC_KHR,
            )],
            depth_attachment: None,
        };
        let pipeline = setup.pipelines.get_or_create(&PipelineDescription::render_pass_only("Clear", render_pass))?;
        let clear = vk::ClearValue { color: vk::ClearColorValue { float32: self.color } };
        let pass = SwapchainPass::new(setup.ctx, pipeline, Box::new(|_: &PassContext<'_>| {}), vec![clear]);
        setup.graph.set_swapchain(pass)?;
        Ok(())
    }
}

/// Owns the per-frame machinery and presents one frame per [`Renderer::draw`]
pub struct Renderer {
    // graph before swapchain: passes reference swapchain semaphores
    graph: RenderGraph,
    swapchain: Swapchain,
    pipelines: PipelineCache,
    pipeline: Box<dyn RenderPipeline>,
    settings: RendererSettings,
    settings_path: PathBuf,
    current_frame: usize,
    ctx: Arc<RenderContext>,
}

impl Renderer {
    /// Create a renderer on a native window
    pub fn new<W>(window: &W, config: &RendererConfig) -> RenderResult<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        config.validate().map_err(RenderError::InvalidConfig)?;
        let device = VulkanDevice::new(
            window.raw_display_handle(),
            window.raw_window_handle(),
            &config.application_name,
            config.validation_enabled(),
        )?;
        Self::with_device(Arc::new(device), config)
    }

    /// Create a renderer on an existing device
    ///
    /// Settings are read from `config.settings_path`, written with defaults
    /// when missing. An unreadable settings file falls back to defaults.
    pub fn with_device(device: Arc<dyn GpuDevice>, config: &RendererConfig) -> RenderResult<Self> {
        config.validate().map_err(RenderError::InvalidConfig)?;
        let settings = match RendererSettings::load_or_create(&config.settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Using default renderer settings, {} unusable: {e}", config.settings_path.display());
                RendererSettings::default()
            }
        };
        settings.validate().map_err(RenderError::InvalidConfig)?;

        let ctx = RenderContext::new(device)?;
        let (width, height) = config.initial_extent;
        let swapchain = Swapchain::new(
            &ctx,
            vk::Extent2D { width, height },
            settings.display.vsync,
            config.max_frames_in_flight,
        )?;
        let pipelines = PipelineCache::new(Arc::clone(ctx.device()));
        let graph = RenderGraph::new(&ctx);

        let mut renderer = Self {
            graph,
            swapchain,
            pipelines,
            pipeline: Box::new(ClearPipeline::new(config.clear_color)),
            settings,
            settings_path: config.settings_path.clone(),
            current_frame: 0,
            ctx,
        };
        renderer.rebuild_graph()?;
        log::info!(
            "Renderer initialized: {}x{}, {} frames in flight",
            renderer.swapchain.extent().width,
            renderer.swapchain.extent().height,
            config.max_frames_in_flight
        );
        Ok(renderer)
    }

    /// Replace the render pipeline and rebuild the graph from it
    ///
    /// On failure the previous pipeline and graph stay in place.
    pub fn set_pipeline(&mut self, pipeline: Box<dyn RenderPipeline>) -> RenderResult<()> {
        let previous = std::mem::replace(&mut self.pipeline, pipeline);
        if let Err(e) = self.rebuild_graph() {
            log::error!("Render pipeline '{}' failed to initialize: {e}", self.pipeline.name());
            self.pipeline = previous;
            return Err(e);
        }
        Ok(())
    }

    fn rebuild_graph(&mut self) -> RenderResult<()> {
        let mut graph = RenderGraph::new(&self.ctx);
        self.pipeline.init(&mut PipelineSetup {
            ctx: &self.ctx,
            graph: &mut graph,
            swapchain: &self.swapchain,
            pipelines: &self.pipelines,
            settings: &self.settings,
        })?;
        if graph.swapchain_pass().is_none() {
            return Err(RenderGraphError::MissingSwapchainPass.into());
        }
        self.ctx.wait_idle()?;
        self.graph = graph;
        self.current_frame = 0;
        log::info!("Render pipeline '{}' built with {} passes", self.pipeline.name(), self.graph.len());
        Ok(())
    }

    /// Render and present one frame
    ///
    /// Returns `false` when the frame was skipped to resize.
    pub fn draw(&mut self) -> RenderResult<bool> {
        Ok(self.graph.update(&mut self.swapchain, &mut self.current_frame)?)
    }

    /// Window framebuffer size changed; the next draw recreates the swapchain
    pub fn on_window_resize(&mut self, width: u32, height: u32) {
        self.swapchain.request_resize(vk::Extent2D { width, height });
    }

    /// Recreate the swapchain and pooled resources immediately
    pub fn resize_buffers(&mut self) -> RenderResult<()> {
        if !self.swapchain.is_resizing() {
            self.swapchain.request_resize(self.swapchain.extent());
        }
        self.graph.resize(&mut self.swapchain)?;
        Ok(())
    }

    /// Rebuild pipelines whose shader files changed, returning how many were rebuilt
    pub fn reload_shaders(&self) -> RenderResult<usize> {
        Ok(self.pipelines.reload_changed()?)
    }

    /// Current settings
    pub const fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    /// Replace the settings; a vsync change recreates the swapchain on the next draw
    pub fn apply_settings(&mut self, settings: RendererSettings) -> RenderResult<()> {
        settings.validate().map_err(RenderError::InvalidConfig)?;
        self.swapchain.set_vsync(settings.display.vsync);
        self.settings = settings;
        self.pipeline.on_settings_changed(&self.settings);
        Ok(())
    }

    /// Write the settings back to their file
    pub fn save_settings(&self) -> RenderResult<()> {
        self.settings.save_to_file(&self.settings_path)?;
        log::info!("Renderer settings saved to {}", self.settings_path.display());
        Ok(())
    }

    /// Device context
    pub const fn context(&self) -> &Arc<RenderContext> {
        &self.ctx
    }

    /// The render graph
    pub const fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    /// The render graph, for adding or removing passes between draws
    pub fn graph_mut(&mut self) -> &mut RenderGraph {
        &mut self.graph
    }

    /// The swapchain
    pub const fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Shared pipeline cache
    pub const fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Frame slot the next draw records into
    pub const fn current_frame(&self) -> usize {
        self.current_frame
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("Failed to idle device during renderer shutdown: {e}");
        }
        log::info!("Renderer shut down after {} frames", self.graph.frame_count());
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("pipeline", &self.pipeline.name())
            .field("graph", &self.graph)
            .field("swapchain", &self.swapchain)
            .field("current_frame", &self.current_frame)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::render::commands::CommandBuffer;
    use crate::render::graph::RenderPassNode;
    use crate::render::resources::{Framebuffer, FramebufferAttachment, FramebufferDescription, ImageDescription};
    use crate::render::testing::{write_spirv, Call, MockDevice};

    fn config(dir: &tempfile::TempDir) -> RendererConfig {
        RendererConfig::new("test")
            .with_initial_extent(800, 600)
            .with_settings_path(dir.path().join("renderer.oxconfig"))
    }

    fn renderer(dir: &tempfile::TempDir) -> (Arc<MockDevice>, Renderer) {
        let mock = MockDevice::new();
        let renderer = Renderer::with_device(mock.clone(), &config(dir)).expect("renderer");
        (mock, renderer)
    }

    /// Offscreen pass feeding the presentation pass
    struct OffscreenPipeline {
        draws: Arc<AtomicUsize>,
    }

    impl RenderPipeline for OffscreenPipeline {
        fn name(&self) -> &str {
            "Offscreen"
        }

        fn init(&mut self, setup: &mut PipelineSetup<'_>) -> RenderResult<()> {
            let target = RenderPassDescription {
                color_attachments: vec![AttachmentDescription::color(
                    vk::Format::R16G16B16A16_SFLOAT,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )],
                depth_attachment: None,
            };
            let pipeline = setup.pipelines.get_or_create(&PipelineDescription::render_pass_only("Scene", target))?;
            let render_pass = pipeline.read().expect("lock").render_pass();
            let extent = setup.swapchain.extent();
            let framebuffer = Framebuffer::create(
                setup.ctx,
                FramebufferDescription {
                    debug_name: "Scene".to_string(),
                    render_pass,
                    width: extent.width,
                    height: extent.height,
                    attachments: vec![FramebufferAttachment::Owned(ImageDescription::render_target(
                        "Scene color",
                        1,
                        1,
                        vk::Format::R16G16B16A16_SFLOAT,
                        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                    ))],
                    resizable: true,
                    ..FramebufferDescription::default()
                },
            )?;
            let draws = Arc::clone(&self.draws);
            let scene = RenderPassNode::new(
                setup.ctx,
                "Scene",
                CommandBuffer::allocate(setup.ctx, 2)?,
                Some(pipeline),
                vec![framebuffer],
                Box::new(move |pass: &PassContext<'_>| {
                    pass.command_buffer.draw(3, 1, 0, 0);
                    draws.fetch_add(1, Ordering::SeqCst);
                }),
                vec![vk::ClearValue::default()],
                setup.ctx.device().graphics_queue(),
            )?;
            setup.graph.add_render_pass(scene)?;

            let mut present = ClearPipeline::default();
            present.init(setup)?;
            setup.graph.add_swapchain_dependency("Scene")?;
            Ok(())
        }
    }

    struct BrokenPipeline;

    impl RenderPipeline for BrokenPipeline {
        fn name(&self) -> &str {
            "Broken"
        }

        fn init(&mut self, _setup: &mut PipelineSetup<'_>) -> RenderResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_pipeline_presents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mock, mut renderer) = renderer(&dir);

        assert!(renderer.draw().expect("draw"));
        assert!(renderer.draw().expect("draw"));
        assert_eq!(renderer.graph().frame_count(), 2);
        assert_eq!(mock.calls().iter().filter(|call| matches!(call, Call::Present { .. })).count(), 2);
        mock.assert_no_violations();
    }

    #[test]
    fn test_missing_settings_file_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_mock, renderer) = renderer(&dir);
        assert!(dir.path().join("renderer.oxconfig").exists());
        assert_eq!(renderer.settings(), &RendererSettings::default());
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_mock, mut renderer) = renderer(&dir);
        let mut settings = renderer.settings().clone();
        settings.bloom.enabled = !settings.bloom.enabled;
        settings.shadows.size = 2048;
        renderer.apply_settings(settings.clone()).expect("apply");
        renderer.save_settings().expect("save");

        let loaded = RendererSettings::load_from_file(dir.path().join("renderer.oxconfig")).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_vsync_change_recreates_swapchain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mock, mut renderer) = renderer(&dir);
        assert!(renderer.draw().expect("draw"));

        let mut settings = renderer.settings().clone();
        settings.display.vsync = !settings.display.vsync;
        renderer.apply_settings(settings).expect("apply");
        assert!(!renderer.draw().expect("resize frame"));
        assert!(renderer.draw().expect("draw"));
        assert_eq!(mock.calls().iter().filter(|call| matches!(call, Call::CreateSwapchain { .. })).count(), 2);
    }

    #[test]
    fn test_vsync_change_keeps_pending_window_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mock, mut renderer) = renderer(&dir);
        assert!(renderer.draw().expect("draw"));

        renderer.on_window_resize(1024, 768);
        let mut settings = renderer.settings().clone();
        settings.display.vsync = !settings.display.vsync;
        renderer.apply_settings(settings).expect("apply");
        assert!(!renderer.draw().expect("resize frame"));

        assert!(mock.calls().contains(&Call::CreateSwapchain { width: 1024, height: 768 }));
        assert!(renderer.draw().expect("draw"));
        mock.assert_no_violations();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config(&dir).with_frames_in_flight(0);
        assert!(matches!(
            Renderer::with_device(MockDevice::new(), &config),
            Err(RenderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_custom_pipeline_feeds_swapchain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mock, mut renderer) = renderer(&dir);
        let draws = Arc::new(AtomicUsize::new(0));
        renderer
            .set_pipeline(Box::new(OffscreenPipeline { draws: Arc::clone(&draws) }))
            .expect("pipeline");

        assert_eq!(renderer.graph().execution_order(), ["Scene".to_string()]);
        assert!(renderer.draw().expect("draw"));
        assert!(renderer.draw().expect("draw"));
        assert_eq!(draws.load(Ordering::SeqCst), 2);
        mock.assert_no_violations();
    }

    #[test]
    fn test_pipeline_without_swapchain_pass_keeps_previous() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_mock, mut renderer) = renderer(&dir);
        let err = renderer.set_pipeline(Box::new(BrokenPipeline)).expect_err("no swapchain pass");
        assert!(matches!(err, RenderError::Graph(RenderGraphError::MissingSwapchainPass)));
        assert!(renderer.graph().swapchain_pass().is_some());
        assert!(renderer.draw().expect("draw"));
    }

    #[test]
    fn test_window_resize_rebuilds_pooled_targets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mock, mut renderer) = renderer(&dir);
        renderer
            .set_pipeline(Box::new(OffscreenPipeline { draws: Arc::new(AtomicUsize::new(0)) }))
            .expect("pipeline");
        assert!(renderer.draw().expect("draw"));

        renderer.on_window_resize(1024, 768);
        assert!(!renderer.draw().expect("resize frame"));
        let scene = renderer.graph().find_render_graph_pass("Scene").expect("scene");
        assert_eq!(scene.framebuffers()[0].read().expect("lock").extent().width, 1024);
        assert!(renderer.draw().expect("draw"));
        mock.assert_no_violations();
    }

    #[test]
    fn test_resize_buffers_idles_device() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mock, mut renderer) = renderer(&dir);
        mock.clear_calls();
        renderer.resize_buffers().expect("resize");
        let calls = mock.calls();
        let idle = calls.iter().position(|call| *call == Call::QueueWaitIdle).expect("queue idle");
        let recreate = calls.iter().position(|call| matches!(call, Call::CreateSwapchain { .. })).expect("recreate");
        assert!(idle < recreate);
        assert!(!renderer.swapchain().is_resizing());
    }

    #[test]
    fn test_reload_shaders_rebuilds_changed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_mock, renderer) = renderer(&dir);
        let vert = dir.path().join("tri.vert.spv");
        let frag = dir.path().join("tri.frag.spv");
        write_spirv(&vert, true);
        write_spirv(&frag, true);

        let present = RenderPassDescription {
            color_attachments: vec![AttachmentDescription::color(
                renderer.swapchain().format(),
                vk::ImageLayout::PRESENT_SRC_KHR,
            )],
            depth_attachment: None,
        };
        let desc = PipelineDescription::graphics("Triangle", &vert, &frag).with_render_pass(present);
        renderer.pipeline_cache().get_or_create(&desc).expect("pipeline");
        assert_eq!(renderer.reload_shaders().expect("reload"), 0);

        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        std::fs::File::options().write(true).open(&frag).expect("open").set_modified(later).expect("touch");
        assert_eq!(renderer.reload_shaders().expect("reload"), 1);
    }
}
