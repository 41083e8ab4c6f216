//! Hashable pipeline descriptions
//!
//! A [`PipelineDescription`] is the cache key for [`PipelineCache`](super::PipelineCache):
//! two equal descriptions share one pipeline object.

use std::path::PathBuf;

use ash::vk;

use crate::render::api::{GpuDevice, VulkanResult};

/// Pipeline bind point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Rasterization pipeline inside a render pass
    Graphics,
    /// Compute pipeline, no render pass
    Compute,
}

/// One shader stage loaded from a SPIR-V file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderStageDescription {
    /// Stage flag
    pub stage: vk::ShaderStageFlags,
    /// SPIR-V file
    pub path: PathBuf,
    /// Entry point name
    pub entry_point: String,
}

impl ShaderStageDescription {
    /// Stage with a `main` entry point
    pub fn new(stage: vk::ShaderStageFlags, path: impl Into<PathBuf>) -> Self {
        Self { stage, path: path.into(), entry_point: "main".to_string() }
    }
}

/// Vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader location
    pub location: u32,
    /// Source binding
    pub binding: u32,
    /// Attribute format
    pub format: vk::Format,
    /// Byte offset within a vertex
    pub offset: u32,
}

/// Vertex buffer binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    /// Binding index
    pub binding: u32,
    /// Bytes between consecutive elements
    pub stride: u32,
    /// Per-vertex or per-instance
    pub input_rate: vk::VertexInputRate,
}

/// Vertex input layout; empty for full-screen passes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    /// Buffer bindings
    pub bindings: Vec<VertexBinding>,
    /// Attributes
    pub attributes: Vec<VertexAttribute>,
}

/// Color blending preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// No blending
    #[default]
    Opaque,
    /// Source-alpha over destination
    Alpha,
    /// Source added to destination
    Additive,
}

/// Depth test state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    /// Enable depth testing
    pub test: bool,
    /// Enable depth writes
    pub write: bool,
    /// Comparison when testing
    pub compare: vk::CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self { test: false, write: false, compare: vk::CompareOp::LESS_OR_EQUAL }
    }
}

impl DepthState {
    /// Test and write with less-or-equal
    pub const fn read_write() -> Self {
        Self { test: true, write: true, compare: vk::CompareOp::LESS_OR_EQUAL }
    }
}

/// Render pass attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDescription {
    /// Attachment format
    pub format: vk::Format,
    /// Load operation
    pub load_op: vk::AttachmentLoadOp,
    /// Store operation
    pub store_op: vk::AttachmentStoreOp,
    /// Layout at render pass begin
    pub initial_layout: vk::ImageLayout,
    /// Layout at render pass end
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDescription {
    /// Cleared and stored color attachment ending in `final_layout`
    pub const fn color(format: vk::Format, final_layout: vk::ImageLayout) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout,
        }
    }

    /// Cleared depth attachment
    pub const fn depth(format: vk::Format) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }
}

/// Single-subpass render pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RenderPassDescription {
    /// Color attachments in framebuffer order
    pub color_attachments: Vec<AttachmentDescription>,
    /// Depth attachment, placed after the color attachments
    pub depth_attachment: Option<AttachmentDescription>,
}

impl RenderPassDescription {
    /// Total attachment count
    pub fn attachment_count(&self) -> usize {
        self.color_attachments.len() + usize::from(self.depth_attachment.is_some())
    }

    /// Create the render pass
    pub fn build(&self, device: &dyn GpuDevice) -> VulkanResult<vk::RenderPass> {
        let attachments: Vec<vk::AttachmentDescription> = self
            .color_attachments
            .iter()
            .chain(self.depth_attachment.iter())
            .map(|a| {
                vk::AttachmentDescription::builder()
                    .format(a.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(a.initial_layout)
                    .final_layout(a.final_layout)
                    .build()
            })
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..self.color_attachments.len())
            .map(|i| vk::AttachmentReference {
                attachment: u32::try_from(i).unwrap_or(u32::MAX),
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: u32::try_from(self.color_attachments.len()).unwrap_or(u32::MAX),
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if self.depth_attachment.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        device.create_render_pass(&info)
    }
}

/// Everything that identifies a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineDescription {
    /// Debug name
    pub name: String,
    /// Graphics or compute
    pub kind: PipelineKind,
    /// Shader stages; empty for a render-pass-only description
    pub shaders: Vec<ShaderStageDescription>,
    /// Vertex input
    pub vertex_layout: VertexLayout,
    /// Blending for every color attachment
    pub blend: BlendMode,
    /// Depth state
    pub depth: DepthState,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Render pass owned by the pipeline (graphics only)
    pub render_pass: Option<RenderPassDescription>,
    /// Descriptor set layouts, in set order
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    /// Push constant block size in bytes, 0 for none
    pub push_constant_size: u32,
    /// Stages that read the push constants
    pub push_constant_stages: vk::ShaderStageFlags,
}

impl PipelineDescription {
    /// Graphics pipeline from a vertex and fragment shader
    pub fn graphics(name: impl Into<String>, vertex: impl Into<PathBuf>, fragment: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Graphics,
            shaders: vec![
                ShaderStageDescription::new(vk::ShaderStageFlags::VERTEX, vertex),
                ShaderStageDescription::new(vk::ShaderStageFlags::FRAGMENT, fragment),
            ],
            vertex_layout: VertexLayout::default(),
            blend: BlendMode::Opaque,
            depth: DepthState::default(),
            cull_mode: vk::CullModeFlags::BACK,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            render_pass: None,
            set_layouts: Vec::new(),
            push_constant_size: 0,
            push_constant_stages: vk::ShaderStageFlags::ALL_GRAPHICS,
        }
    }

    /// Compute pipeline from a single shader
    pub fn compute(name: impl Into<String>, shader: impl Into<PathBuf>) -> Self {
        Self {
            kind: PipelineKind::Compute,
            shaders: vec![ShaderStageDescription::new(vk::ShaderStageFlags::COMPUTE, shader)],
            cull_mode: vk::CullModeFlags::NONE,
            push_constant_stages: vk::ShaderStageFlags::COMPUTE,
            ..Self::graphics(name, PathBuf::new(), PathBuf::new())
        }
    }

    /// Render pass without shaders, for passes that only clear or resolve
    pub fn render_pass_only(name: impl Into<String>, render_pass: RenderPassDescription) -> Self {
        Self { shaders: Vec::new(), render_pass: Some(render_pass), ..Self::graphics(name, PathBuf::new(), PathBuf::new()) }
    }

    /// Set the render pass
    #[must_use]
    pub fn with_render_pass(mut self, render_pass: RenderPassDescription) -> Self {
        self.render_pass = Some(render_pass);
        self
    }

    /// Set the vertex layout
    #[must_use]
    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    /// Set the blend mode
    #[must_use]
    pub const fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    /// Set the depth state
    #[must_use]
    pub const fn with_depth(mut self, depth: DepthState) -> Self {
        self.depth = depth;
        self
    }

    /// Set descriptor set layouts
    #[must_use]
    pub fn with_set_layouts(mut self, layouts: Vec<vk::DescriptorSetLayout>) -> Self {
        self.set_layouts = layouts;
        self
    }

    /// Set the push constant block size
    #[must_use]
    pub const fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    /// Bind point for this pipeline
    pub const fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }
}
